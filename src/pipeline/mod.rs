/// Processing pipeline: derives higher-order knowledge from raw experience.
///
/// Four independently triggerable stages - pattern detection, anomaly
/// detection, causal analysis, knowledge compilation - each reading a
/// consistent episodic snapshot and writing only through the semantic
/// store's idempotent, identity-keyed upserts. Source records are never
/// mutated.
///
/// Stages fail independently: a failure in one is captured in its
/// [`StageReport`] and never aborts sibling stages or rolls back writes a
/// stage already committed. Re-running any stage over an unchanged window
/// merges into the same derived ids, so overlapping runs are safe to
/// interleave.
pub mod anomalies;
pub mod causal;
pub mod compile;
pub mod patterns;

pub use anomalies::{AnomalyConfig, AnomalyDetector};
pub use causal::{CausalAnalyzer, CausalConfig};
pub use compile::{CompileConfig, KnowledgeCompiler};
pub use patterns::{PatternConfig, PatternDetector};

use crate::episodic::EpisodicStore;
use crate::error::MemoryResult;
use crate::semantic::SemanticStore;
use crate::types::{ExperienceRecord, RecordId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Which episodic records a pipeline run scans.
#[derive(Debug, Clone)]
pub enum AnalysisWindow {
    /// The whole log
    All,
    /// Records with `start <= timestamp <= end`
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Records carrying a tag
    Tag(String),
}

/// The four pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Patterns,
    Anomalies,
    Causal,
    Compilation,
}

impl Stage {
    /// Stable name for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Patterns => "patterns",
            Stage::Anomalies => "anomalies",
            Stage::Causal => "causal",
            Stage::Compilation => "compilation",
        }
    }
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage ran to completion (per-record skips allowed)
    Completed,
    /// The stage aborted; writes it had already committed stand
    Failed(String),
}

/// What one stage did in one run.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Which stage
    pub stage: Stage,
    /// Completed or failed
    pub status: StageStatus,
    /// Derived facts written (concepts + relationships + markers)
    pub emitted: usize,
    /// Records skipped with the reason, never escalated to a failure
    pub skipped: Vec<(RecordId, String)>,
    /// Wall time spent
    pub duration: Duration,
}

/// What a full pipeline run did.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Records in the selected window
    pub records_scanned: usize,
    /// One report per stage, in execution order
    pub stages: Vec<StageReport>,
    /// Total wall time
    pub duration: Duration,
}

impl PipelineReport {
    /// Total derived facts written across stages.
    pub fn total_emitted(&self) -> usize {
        self.stages.iter().map(|s| s.emitted).sum()
    }

    /// Whether every stage completed.
    pub fn all_completed(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status == StageStatus::Completed)
    }
}

/// What a stage produced, before wrapping into a report.
pub(crate) struct StageOutcome {
    pub emitted: usize,
    pub skipped: Vec<(RecordId, String)>,
}

impl StageOutcome {
    pub(crate) fn new() -> Self {
        Self {
            emitted: 0,
            skipped: Vec::new(),
        }
    }
}

/// Pipeline configuration: one section per stage.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub patterns: PatternConfig,
    pub anomalies: AnomalyConfig,
    pub causal: CausalConfig,
    pub compile: CompileConfig,
}

/// Cumulative pipeline counters.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub runs: u64,
    pub patterns_emitted: u64,
    pub anomalies_emitted: u64,
    pub causal_emitted: u64,
    pub compiled_emitted: u64,
}

/// Coordinates the four analysis stages.
pub struct Pipeline {
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,

    patterns: PatternDetector,
    anomalies: AnomalyDetector,
    causal: CausalAnalyzer,
    compiler: KnowledgeCompiler,

    runs: AtomicU64,
    patterns_emitted: AtomicU64,
    anomalies_emitted: AtomicU64,
    causal_emitted: AtomicU64,
    compiled_emitted: AtomicU64,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish()
    }
}

impl Pipeline {
    /// Create a pipeline over the episodic and semantic stores.
    pub fn new(
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            episodic,
            semantic,
            patterns: PatternDetector::new(config.patterns),
            anomalies: AnomalyDetector::new(config.anomalies),
            causal: CausalAnalyzer::new(config.causal),
            compiler: KnowledgeCompiler::new(config.compile),
            runs: AtomicU64::new(0),
            patterns_emitted: AtomicU64::new(0),
            anomalies_emitted: AtomicU64::new(0),
            causal_emitted: AtomicU64::new(0),
            compiled_emitted: AtomicU64::new(0),
        }
    }

    /// Select the records a window covers - one consistent snapshot, used
    /// by every stage of the same run.
    fn select(&self, window: &AnalysisWindow) -> MemoryResult<Vec<Arc<ExperienceRecord>>> {
        match window {
            AnalysisWindow::All => Ok(self.episodic.snapshot()),
            AnalysisWindow::TimeRange { start, end } => Ok(self.episodic.get_range(*start, *end)),
            AnalysisWindow::Tag(tag) => self.episodic.find_by_tag(tag),
        }
    }

    /// Run all four stages over one window snapshot.
    ///
    /// A stage failure is captured in its report; the remaining stages
    /// still run over the same snapshot.
    pub fn run(&self, window: &AnalysisWindow) -> MemoryResult<PipelineReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let records = self.select(window)?;
        self.runs.fetch_add(1, Ordering::Relaxed);

        let stages = vec![
            self.timed(Stage::Patterns, || self.patterns.run(&records, &self.semantic)),
            self.timed(Stage::Anomalies, || self.anomalies.run(&records, &self.semantic)),
            self.timed(Stage::Causal, || self.causal.run(&records, &self.semantic)),
            self.timed(Stage::Compilation, || self.compiler.run(&self.semantic)),
        ];

        let report = PipelineReport {
            started_at,
            records_scanned: records.len(),
            stages,
            duration: clock.elapsed(),
        };
        info!(
            records = report.records_scanned,
            emitted = report.total_emitted(),
            all_completed = report.all_completed(),
            "pipeline run finished"
        );
        Ok(report)
    }

    /// Run only pattern detection.
    pub fn run_patterns(&self, window: &AnalysisWindow) -> MemoryResult<StageReport> {
        let records = self.select(window)?;
        Ok(self.timed(Stage::Patterns, || self.patterns.run(&records, &self.semantic)))
    }

    /// Run only anomaly detection.
    pub fn run_anomalies(&self, window: &AnalysisWindow) -> MemoryResult<StageReport> {
        let records = self.select(window)?;
        Ok(self.timed(Stage::Anomalies, || self.anomalies.run(&records, &self.semantic)))
    }

    /// Run only causal analysis.
    pub fn run_causal(&self, window: &AnalysisWindow) -> MemoryResult<StageReport> {
        let records = self.select(window)?;
        Ok(self.timed(Stage::Causal, || self.causal.run(&records, &self.semantic)))
    }

    /// Run only knowledge compilation (operates on the semantic store, no
    /// episodic window needed).
    pub fn run_compilation(&self) -> MemoryResult<StageReport> {
        Ok(self.timed(Stage::Compilation, || self.compiler.run(&self.semantic)))
    }

    /// Cumulative counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            runs: self.runs.load(Ordering::Relaxed),
            patterns_emitted: self.patterns_emitted.load(Ordering::Relaxed),
            anomalies_emitted: self.anomalies_emitted.load(Ordering::Relaxed),
            causal_emitted: self.causal_emitted.load(Ordering::Relaxed),
            compiled_emitted: self.compiled_emitted.load(Ordering::Relaxed),
        }
    }

    /// Wrap a stage execution: capture failures, record timing and counters.
    fn timed(
        &self,
        stage: Stage,
        run: impl FnOnce() -> MemoryResult<StageOutcome>,
    ) -> StageReport {
        let clock = Instant::now();
        let (status, emitted, skipped) = match run() {
            Ok(outcome) => (StageStatus::Completed, outcome.emitted, outcome.skipped),
            Err(e) => {
                warn!(stage = stage.as_str(), error = %e, "pipeline stage failed");
                (StageStatus::Failed(e.to_string()), 0, Vec::new())
            }
        };

        let counter = match stage {
            Stage::Patterns => &self.patterns_emitted,
            Stage::Anomalies => &self.anomalies_emitted,
            Stage::Causal => &self.causal_emitted,
            Stage::Compilation => &self.compiled_emitted,
        };
        counter.fetch_add(emitted as u64, Ordering::Relaxed);

        StageReport {
            stage,
            status,
            emitted,
            skipped,
            duration: clock.elapsed(),
        }
    }
}

/// Label for the concept derived from a context `(key, value)` pair.
///
/// Shared by the pattern and causal stages so both link the same node.
pub(crate) fn context_label(key: &str, value: &str) -> String {
    format!("{key}={value}")
}
