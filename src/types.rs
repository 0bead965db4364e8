/// Core data types shared across the memory tiers.
///
/// Three families of identity live here:
///
/// - **Episodes** get a random [`RecordId`] (UUID v4) at append time. They are
///   immutable, so a random id is fine - nothing ever needs to re-derive "the
///   same" episode from content.
/// - **Concepts, relationships, and anomaly markers** get content-derived ids
///   (truncated SHA-256). Re-deriving the same knowledge always lands on the
///   same id, which is what makes pipeline upserts idempotent: overlapping
///   analysis runs merge rather than duplicate.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Identifier for an immutable experience record.
pub type RecordId = Uuid;

/// Content-derived identifier for a concept (16 hex chars).
pub type ConceptId = String;

/// Content-derived identifier for a relationship (16 hex chars).
pub type RelationshipId = String;

/// Content-derived identifier for an anomaly marker (16 hex chars).
pub type MarkerId = String;

/// Derive a 16-hex-char content id from an identity string.
pub(crate) fn content_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Render a JSON scalar as an index/grouping key.
///
/// Objects and arrays have no stable scalar key and return `None`; callers
/// skip them rather than guessing.
pub(crate) fn scalar_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// A single unit of experience in the episodic log.
///
/// Immutable once appended. Ordering across the log is `(timestamp, id)` -
/// event time first, id as tie-break - so appends may carry an explicit
/// event-time timestamp and still land in a deterministic total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    /// Unique record id, assigned at construction
    pub id: RecordId,
    /// Event time (defaults to wall clock at construction)
    pub timestamp: DateTime<Utc>,
    /// Opaque content - the engine never interprets this
    pub payload: JsonValue,
    /// Structured tags for index lookup and window selection
    pub tags: Vec<String>,
    /// Situational state at the time of the experience
    pub context: BTreeMap<String, JsonValue>,
    /// Optional result/reward observed for this experience
    pub outcome: Option<String>,
}

impl ExperienceRecord {
    /// Create a record with the given payload, timestamped now.
    pub fn new(payload: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
            tags: Vec::new(),
            context: BTreeMap::new(),
            outcome: None,
        }
    }

    /// Attach tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach one context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attach an outcome.
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Override the event-time timestamp (for out-of-order ingestion).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Total ordering key across the episodic log.
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, RecordId) {
        (self.timestamp, self.id)
    }
}

/// Unique identifier for a named sequence of episodes.
pub type SequenceId = Uuid;

/// A named, ordered grouping of episodic records.
///
/// Sequences hold record ids, never record copies; members stay owned by
/// the episodic log. A record may belong to any number of sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Unique sequence id, assigned at creation
    pub id: SequenceId,
    /// Human-meaningful label (not unique across sequences)
    pub name: String,
    /// Member record ids, in the order they were added
    pub events: Vec<RecordId>,
    /// Opaque caller metadata
    pub metadata: BTreeMap<String, JsonValue>,
}

/// Enumerated relation types between concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    IsA,
    PartOf,
    RelatedTo,
    SimilarTo,
    CoOccursWith,
    Causes,
    Implies,
}

impl RelationKind {
    /// Stable string form, used in content-id derivation and index keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::IsA => "is_a",
            RelationKind::PartOf => "part_of",
            RelationKind::RelatedTo => "related_to",
            RelationKind::SimilarTo => "similar_to",
            RelationKind::CoOccursWith => "co_occurs_with",
            RelationKind::Causes => "causes",
            RelationKind::Implies => "implies",
        }
    }

    /// Kinds that participate in transitive closure during knowledge
    /// compilation (`A -> B -> C` implies `A -> C`).
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            RelationKind::Causes | RelationKind::Implies | RelationKind::IsA
        )
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the semantic concept graph.
///
/// Identity is the label: two upserts of the same label merge into one
/// concept (attribute union, max confidence, example union).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Content-derived id: `sha256("concept:" + label)` truncated
    pub id: ConceptId,
    /// Human-readable label; the identity of the concept
    pub label: String,
    /// Arbitrary attribute map
    pub attributes: BTreeMap<String, JsonValue>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Episodes cited as examples of this concept (references, not ownership)
    pub examples: BTreeSet<RecordId>,
}

impl Concept {
    /// Derive the content id for a label.
    pub fn id_for_label(label: &str) -> ConceptId {
        content_id(&format!("concept:{label}"))
    }

    /// Create a concept with full confidence and no attributes.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: Self::id_for_label(&label),
            label,
            attributes: BTreeMap::new(),
            confidence: 1.0,
            examples: BTreeSet::new(),
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set the confidence (clamped to [0, 1]).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Cite a supporting episode.
    pub fn with_example(mut self, record: RecordId) -> Self {
        self.examples.insert(record);
        self
    }
}

/// A directed edge in the semantic concept graph.
///
/// Identity is `(source, kind, target)`, so re-deriving the same edge from a
/// different analysis run merges (max confidence, evidence union) instead of
/// duplicating. Edges reference concepts by id - never own them - so the
/// graph may be cyclic without ownership cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Content-derived id: `sha256("rel:" + source + ":" + kind + ":" + target)` truncated
    pub id: RelationshipId,
    /// Source concept id
    pub source: ConceptId,
    /// Target concept id
    pub target: ConceptId,
    /// Relation type
    pub kind: RelationKind,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Episodes supporting this edge (references, not ownership)
    pub evidence: BTreeSet<RecordId>,
    /// Set when an endpoint concept was deleted under the orphan-mark
    /// policy; orphaned edges are retained but invisible to `relate`/`infer`.
    #[serde(default)]
    pub orphaned: bool,
}

impl Relationship {
    /// Derive the content id for an edge identity.
    pub fn id_for(source: &str, kind: RelationKind, target: &str) -> RelationshipId {
        content_id(&format!("rel:{source}:{kind}:{target}"))
    }

    /// Create an edge between two concept ids.
    pub fn new(
        source: impl Into<ConceptId>,
        kind: RelationKind,
        target: impl Into<ConceptId>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: Self::id_for(&source, kind, &target),
            source,
            target,
            kind,
            confidence: 1.0,
            evidence: BTreeSet::new(),
            orphaned: false,
        }
    }

    /// Set the confidence (clamped to [0, 1]).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Attach supporting evidence.
    pub fn with_evidence<I: IntoIterator<Item = RecordId>>(mut self, records: I) -> Self {
        self.evidence.extend(records);
        self
    }
}

/// An anomaly annotation attached to an episode by the processing pipeline.
///
/// Anomalies are retained, never deleted: the marker references the flagged
/// record and describes how far the observed feature sat from its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMarker {
    /// Content-derived id over (record, context pair, feature)
    pub id: MarkerId,
    /// The flagged episode
    pub record: RecordId,
    /// The numeric context feature that deviated
    pub feature: String,
    /// Observed feature value
    pub observed: f64,
    /// Baseline mean over the peer group
    pub baseline_mean: f64,
    /// Baseline standard deviation over the peer group
    pub baseline_stddev: f64,
    /// Deviation in standard deviations (z-score magnitude)
    pub deviation: f64,
    /// Context key defining the peer group
    pub context_key: String,
    /// Context value defining the peer group
    pub context_value: String,
    /// When the anomaly was detected
    pub detected_at: DateTime<Utc>,
}

impl AnomalyMarker {
    /// Derive the content id for a marker identity.
    pub fn id_for(
        record: RecordId,
        context_key: &str,
        context_value: &str,
        feature: &str,
    ) -> MarkerId {
        content_id(&format!(
            "anomaly:{record}:{context_key}={context_value}:{feature}"
        ))
    }
}

/// A fact derived by bounded-depth inference over the concept graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedFact {
    /// Starting concept of the best path
    pub source: ConceptId,
    /// Concept the fact is about
    pub target: ConceptId,
    /// Product of edge confidences along the best path
    pub confidence: f64,
    /// Length of the best path in hops
    pub hops: usize,
    /// Relationship ids along the best path, in traversal order
    pub path: Vec<RelationshipId>,
}
