//! # Memoric - A Memory Engine for Autonomous Agents
//!
//! Memoric gives a long-running agent three tiers of memory over one
//! durable substrate:
//! - **Episodic** - an append-only, time-ordered log of experience
//! - **Semantic** - a concept graph with confidence-weighted relationships
//! - **Working** - a bounded, priority-evicted scratchpad with TTL expiry
//!
//! A processing pipeline distills raw experience into knowledge: recurring
//! context/outcome patterns, statistical anomalies, causal links, and
//! compiled inference shortcuts. Every derived fact is keyed by its
//! content, so re-running analysis never duplicates knowledge.
//!
//! ## Quick Start
//!
//! ```ignore
//! use memoric::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Start the engine (in-memory, zero configuration)
//!     let engine = MemoryEngine::start().await?;
//!
//!     // Record experience
//!     let id = engine.append(
//!         ExperienceRecord::new(json!({"reading": 20.5}))
//!             .with_tags(["sensor"])
//!             .with_context("location", json!("hall"))
//!             .with_outcome("nominal"),
//!     ).await?;
//!
//!     // Recall it
//!     let record = engine.recall(id).await?;
//!
//!     // Hold transient state
//!     engine.remember("current_goal", json!("patrol"), 0.9,
//!         Duration::from_secs(600)).await;
//!
//!     // Distill knowledge from everything seen so far
//!     let report = engine.run_pipeline(&AnalysisWindow::All).await?;
//!     println!("derived {} facts", report.total_emitted());
//!
//!     // Ask what follows from a context
//!     let facts = engine.infer(
//!         &InferenceQuery::from_label("location=hall")).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! - [`MemoryEngine::start()`] - Initialize the engine
//! - [`MemoryEngine::append()`] - Record an experience
//! - [`MemoryEngine::recall()`] / [`MemoryEngine::recall_range()`] - Read back
//! - [`MemoryEngine::remember()`] / [`MemoryEngine::recall_working()`] - Scratchpad
//! - [`MemoryEngine::run_pipeline()`] - Distill experience into knowledge
//! - [`MemoryEngine::infer()`] - Bounded-depth inference over the graph
//!
//! ## Architecture
//!
//! Three layers:
//!
//! 1. **Engine API** (`engine`) - the user-facing facade
//! 2. **Memory tiers** (`episodic`, `semantic`, `working`) - the three
//!    stores, plus the `pipeline` that derives one from another
//! 3. **Substrate** (`store`, `persistence`, `cache`) - indexed record
//!    storage, write-ahead journaling, checksummed snapshots, recall cache
//!
//! ## Thread Safety
//!
//! All operations are thread-safe. A `MemoryEngine` clones cheaply and
//! every clone shares the same state:
//!
//! ```ignore
//! let engine = MemoryEngine::start().await?;
//! let handle = engine.clone();
//!
//! tokio::spawn(async move {
//!     handle.append(ExperienceRecord::new(json!(42))).await.unwrap();
//! });
//! ```

mod engine;
mod error;
mod types;

pub mod cache;
pub mod episodic;
pub mod persistence;
pub mod pipeline;
pub mod semantic;
pub mod similarity;
pub mod store;
pub mod working;

// Public API exports
pub use engine::{EngineConfig, EngineStats, MemoryEngine};
pub use error::{MemoryError, MemoryResult};
pub use types::{
    AnomalyMarker, Concept, ConceptId, DerivedFact, ExperienceRecord, MarkerId, RecordId,
    RelationKind, Relationship, RelationshipId, Sequence, SequenceId,
};

// Tier exports
pub use cache::{CacheConfig, CacheStats, RecallCache};
pub use semantic::{DeletePolicy, InferenceQuery, SemanticConfig, SemanticStore};
pub use similarity::{ContextOverlapScorer, SimilarityScorer};
pub use working::{WorkingConfig, WorkingItem, WorkingMemory, WorkingStats};

// Pipeline exports
pub use pipeline::{
    AnalysisWindow, AnomalyConfig, CausalConfig, CompileConfig, PatternConfig, Pipeline,
    PipelineConfig, PipelineReport, PipelineStats, Stage, StageReport, StageStatus,
};

// Persistence exports
pub use persistence::{FileJournal, SnapshotInfo, StoreSnapshot};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use memoric::prelude::*;
/// ```
pub mod prelude {
    pub use crate::engine::{EngineConfig, EngineStats, MemoryEngine};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::types::{
        AnomalyMarker, Concept, ConceptId, DerivedFact, ExperienceRecord, RecordId, RelationKind,
        Relationship, RelationshipId, Sequence, SequenceId,
    };
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};

    pub use crate::pipeline::{AnalysisWindow, PipelineReport, StageStatus};
    pub use crate::semantic::{DeletePolicy, InferenceQuery, SemanticConfig};
    pub use crate::working::{WorkingConfig, WorkingItem};
}
