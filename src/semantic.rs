/// Semantic store: the mutable concept/relationship graph.
///
/// Implemented as an arena of nodes and edge records keyed by content id.
/// Relationships reference concept ids - never own concepts - so the graph
/// may be cyclic without any ownership cycle. Adjacency lists are kept per
/// concept for both directions.
///
/// Upserts are keyed by content identity (label for concepts, the
/// `(source, kind, target)` triple for edges), which makes re-derivation
/// from overlapping pipeline runs merge instead of duplicate. Every upsert
/// persists through the record store before the in-memory arena moves, so a
/// vetoed write leaves the graph untouched.
///
/// Anomaly markers also live here: the pipeline writes derived results only
/// into the semantic store, and an anomaly is derived knowledge about an
/// episode, not a mutation of it.
use crate::error::{MemoryError, MemoryResult};
use crate::store::{IndexDef, RecordStore};
use crate::types::{
    AnomalyMarker, Concept, ConceptId, DerivedFact, MarkerId, RelationKind, Relationship,
    RelationshipId,
};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Collection names in the record store.
pub(crate) const CONCEPTS: &str = "concepts";
pub(crate) const RELATIONSHIPS: &str = "relationships";
pub(crate) const ANOMALIES: &str = "anomalies";

/// Index declarations for the concepts collection.
pub(crate) fn concept_index_defs() -> Vec<IndexDef> {
    vec![IndexDef::new("label", "label")]
}

/// Index declarations for the relationships collection.
pub(crate) fn relationship_index_defs() -> Vec<IndexDef> {
    vec![
        IndexDef::new("kind", "kind"),
        IndexDef::new("source", "source"),
        IndexDef::new("target", "target"),
    ]
}

/// Index declarations for the anomalies collection.
pub(crate) fn anomaly_index_defs() -> Vec<IndexDef> {
    vec![IndexDef::new("record", "record")]
}

/// What happens to incident relationships when a concept is deleted.
///
/// The choice is observable through `infer`: cascaded edges are gone,
/// orphan-marked edges are retained on disk but invisible to traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Delete incident relationships along with the concept (default)
    #[default]
    Cascade,
    /// Keep incident relationships but mark them orphaned
    OrphanMark,
}

/// Semantic store configuration.
#[derive(Debug, Clone)]
pub struct SemanticConfig {
    /// Default hop limit for inference traversal
    pub max_hops: usize,
    /// Derived facts below this confidence are suppressed
    pub confidence_floor: f64,
    /// Concept-deletion cascade policy
    pub delete_policy: DeletePolicy,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            max_hops: 3,
            confidence_floor: 0.1,
            delete_policy: DeletePolicy::Cascade,
        }
    }
}

/// Where an inference traversal starts.
#[derive(Debug, Clone)]
enum StartRef {
    Id(ConceptId),
    Label(String),
}

/// A bounded-depth inference query.
///
/// Unset fields fall back to [`SemanticConfig`] defaults.
#[derive(Debug, Clone)]
pub struct InferenceQuery {
    starts: Vec<StartRef>,
    max_hops: Option<usize>,
    kinds: Option<Vec<RelationKind>>,
    floor: Option<f64>,
}

impl InferenceQuery {
    /// Start from a concept label.
    pub fn from_label(label: impl Into<String>) -> Self {
        Self {
            starts: vec![StartRef::Label(label.into())],
            max_hops: None,
            kinds: None,
            floor: None,
        }
    }

    /// Start from a concept id.
    pub fn from_id(id: impl Into<ConceptId>) -> Self {
        Self {
            starts: vec![StartRef::Id(id.into())],
            max_hops: None,
            kinds: None,
            floor: None,
        }
    }

    /// Add another start label.
    pub fn and_label(mut self, label: impl Into<String>) -> Self {
        self.starts.push(StartRef::Label(label.into()));
        self
    }

    /// Add another start id.
    pub fn and_id(mut self, id: impl Into<ConceptId>) -> Self {
        self.starts.push(StartRef::Id(id.into()));
        self
    }

    /// Override the hop limit.
    pub fn with_max_hops(mut self, hops: usize) -> Self {
        self.max_hops = Some(hops);
        self
    }

    /// Follow only these relation kinds.
    pub fn with_kinds<I: IntoIterator<Item = RelationKind>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Override the confidence floor.
    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = Some(floor);
        self
    }
}

/// The concept graph.
pub struct SemanticStore {
    store: Arc<RecordStore>,
    config: SemanticConfig,

    /// Arena of concepts by content id
    concepts: DashMap<ConceptId, Concept>,
    /// Label -> concept id (identity index)
    by_label: DashMap<String, ConceptId>,
    /// Arena of edge records by content id
    relationships: DashMap<RelationshipId, Relationship>,
    /// Adjacency: concept -> outgoing edge ids
    outgoing: DashMap<ConceptId, BTreeSet<RelationshipId>>,
    /// Adjacency: concept -> incoming edge ids
    incoming: DashMap<ConceptId, BTreeSet<RelationshipId>>,
    /// Anomaly annotations by marker id
    anomalies: DashMap<MarkerId, AnomalyMarker>,

    /// Serializes mutations; readers stay lock-free on the DashMaps
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SemanticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticStore")
            .field("concepts", &self.concepts.len())
            .field("relationships", &self.relationships.len())
            .field("anomalies", &self.anomalies.len())
            .finish()
    }
}

impl SemanticStore {
    /// Create a semantic store over the shared substrate.
    ///
    /// The `"concepts"`, `"relationships"`, and `"anomalies"` collections
    /// must already be registered on `store`.
    pub fn new(store: Arc<RecordStore>, config: SemanticConfig) -> Self {
        Self {
            store,
            config,
            concepts: DashMap::new(),
            by_label: DashMap::new(),
            relationships: DashMap::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            anomalies: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a concept, or merge into the existing one with the same label.
    ///
    /// Merge is attribute union (new keys win), max confidence, example
    /// union. Persists before the arena moves.
    pub fn upsert_concept(&self, concept: Concept) -> MemoryResult<ConceptId> {
        let _guard = self.guard();

        // Identity is the label, regardless of what id the caller built
        let id = Concept::id_for_label(&concept.label);
        let merged = match self.concepts.get(&id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.confidence = merged.confidence.max(concept.confidence.clamp(0.0, 1.0));
                merged.attributes.extend(concept.attributes);
                merged.examples.extend(concept.examples);
                merged
            }
            None => {
                let mut fresh = concept;
                fresh.id = id.clone();
                fresh.confidence = fresh.confidence.clamp(0.0, 1.0);
                fresh
            }
        };

        self.store
            .put(CONCEPTS, &id, serde_json::to_value(&merged)?)?;
        self.by_label.insert(merged.label.clone(), id.clone());
        self.concepts.insert(id.clone(), merged);
        Ok(id)
    }

    /// Insert an edge, or merge into the existing one with the same
    /// `(source, kind, target)` identity.
    ///
    /// Both endpoints must exist, checked before any state is touched -
    /// a rejected edge leaves the store unchanged and nothing persisted.
    /// Merge is max confidence plus evidence union; a previously orphaned
    /// edge whose endpoints are live again is un-orphaned.
    pub fn upsert_relationship(&self, relationship: Relationship) -> MemoryResult<RelationshipId> {
        let _guard = self.guard();

        for endpoint in [&relationship.source, &relationship.target] {
            if !self.concepts.contains_key(endpoint) {
                return Err(MemoryError::InvalidEndpoint {
                    relationship: format!(
                        "{} -{}-> {}",
                        relationship.source, relationship.kind, relationship.target
                    ),
                    missing: endpoint.clone(),
                });
            }
        }

        let id = Relationship::id_for(
            &relationship.source,
            relationship.kind,
            &relationship.target,
        );
        let merged = match self.relationships.get(&id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.confidence = merged
                    .confidence
                    .max(relationship.confidence.clamp(0.0, 1.0));
                merged.evidence.extend(relationship.evidence);
                merged.orphaned = false;
                merged
            }
            None => {
                let mut fresh = relationship;
                fresh.id = id.clone();
                fresh.confidence = fresh.confidence.clamp(0.0, 1.0);
                fresh.orphaned = false;
                fresh
            }
        };

        self.store
            .put(RELATIONSHIPS, &id, serde_json::to_value(&merged)?)?;
        self.outgoing
            .entry(merged.source.clone())
            .or_default()
            .insert(id.clone());
        self.incoming
            .entry(merged.target.clone())
            .or_default()
            .insert(id.clone());
        self.relationships.insert(id.clone(), merged);
        Ok(id)
    }

    /// Look up a concept by id.
    pub fn concept(&self, id: &str) -> Option<Concept> {
        self.concepts.get(id).map(|c| c.clone())
    }

    /// Look up a concept by label.
    pub fn concept_by_label(&self, label: &str) -> Option<Concept> {
        let id = self.by_label.get(label)?.clone();
        self.concept(&id)
    }

    /// Look up a relationship by id.
    pub fn relationship(&self, id: &str) -> Option<Relationship> {
        self.relationships.get(id).map(|r| r.clone())
    }

    /// Look up the edge with a given `(source, kind, target)` identity.
    pub fn relationship_between(
        &self,
        source: &str,
        kind: RelationKind,
        target: &str,
    ) -> Option<Relationship> {
        self.relationship(&Relationship::id_for(source, kind, target))
    }

    /// All concepts, unordered.
    pub fn all_concepts(&self) -> Vec<Concept> {
        self.concepts.iter().map(|e| e.value().clone()).collect()
    }

    /// All relationships, unordered (orphaned included).
    pub fn all_relationships(&self) -> Vec<Relationship> {
        self.relationships.iter().map(|e| e.value().clone()).collect()
    }

    /// Incident edges of a concept, in both directions, with the opposite
    /// endpoint. Orphaned edges are excluded. Ordered by edge id.
    pub fn relate(&self, concept_id: &str) -> MemoryResult<Vec<(Relationship, Concept)>> {
        if !self.concepts.contains_key(concept_id) {
            return Err(MemoryError::not_found(CONCEPTS, concept_id));
        }

        let mut edge_ids = BTreeSet::new();
        if let Some(out) = self.outgoing.get(concept_id) {
            edge_ids.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(concept_id) {
            edge_ids.extend(inc.iter().cloned());
        }

        let mut results = Vec::new();
        for edge_id in edge_ids {
            let Some(edge) = self.relationship(&edge_id) else {
                continue;
            };
            if edge.orphaned {
                continue;
            }
            let neighbor_id = if edge.source == concept_id {
                &edge.target
            } else {
                &edge.source
            };
            if let Some(neighbor) = self.concept(neighbor_id) {
                results.push((edge, neighbor));
            }
        }
        Ok(results)
    }

    /// Bounded-depth inference over the graph.
    ///
    /// From the query's start concepts, follows outgoing non-orphaned edges
    /// (optionally kind-filtered) up to the hop limit. Path confidence is
    /// the product of edge confidences; alternative paths to the same
    /// target keep the maximum. Facts below the confidence floor are
    /// suppressed. Results are ordered confidence descending, target id as
    /// tie-break. Start concepts that do not resolve contribute nothing.
    pub fn infer(&self, query: &InferenceQuery) -> MemoryResult<Vec<DerivedFact>> {
        let max_hops = query.max_hops.unwrap_or(self.config.max_hops);
        let floor = query.floor.unwrap_or(self.config.confidence_floor);

        let mut starts = Vec::new();
        for start in &query.starts {
            let resolved = match start {
                StartRef::Id(id) => self.concepts.contains_key(id).then(|| id.clone()),
                StartRef::Label(label) => self.by_label.get(label).map(|id| id.clone()),
            };
            match resolved {
                Some(id) => starts.push(id),
                None => debug!(?start, "inference start did not resolve"),
            }
        }

        let mut best: HashMap<ConceptId, DerivedFact> = HashMap::new();
        for start in starts {
            self.traverse_from(&start, max_hops, floor, query.kinds.as_deref(), &mut best);
        }

        let mut facts: Vec<DerivedFact> = best.into_values().collect();
        facts.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.target.cmp(&b.target))
        });
        Ok(facts)
    }

    /// Best-confidence relaxation from one start concept.
    fn traverse_from(
        &self,
        start: &ConceptId,
        max_hops: usize,
        floor: f64,
        kinds: Option<&[RelationKind]>,
        best: &mut HashMap<ConceptId, DerivedFact>,
    ) {
        // frontier: concept -> (confidence, path) reachable at the current depth
        let mut frontier: HashMap<ConceptId, (f64, Vec<RelationshipId>)> = HashMap::new();
        frontier.insert(start.clone(), (1.0, Vec::new()));

        for hop in 1..=max_hops {
            let mut next: HashMap<ConceptId, (f64, Vec<RelationshipId>)> = HashMap::new();

            for (concept_id, (confidence, path)) in &frontier {
                let Some(edge_ids) = self.outgoing.get(concept_id) else {
                    continue;
                };
                for edge_id in edge_ids.iter() {
                    let Some(edge) = self.relationships.get(edge_id) else {
                        continue;
                    };
                    if edge.orphaned {
                        continue;
                    }
                    if let Some(kinds) = kinds {
                        if !kinds.contains(&edge.kind) {
                            continue;
                        }
                    }

                    let reached = confidence * edge.confidence;
                    // Confidence only shrinks along a path, so anything
                    // under the floor can be pruned immediately
                    if reached < floor {
                        continue;
                    }

                    let mut reached_path = path.clone();
                    reached_path.push(edge.id.clone());
                    let target = edge.target.clone();

                    let improves_best = target != *start
                        && best
                            .get(&target)
                            .is_none_or(|fact| reached > fact.confidence);
                    if improves_best {
                        best.insert(
                            target.clone(),
                            DerivedFact {
                                source: start.clone(),
                                target: target.clone(),
                                confidence: reached,
                                hops: hop,
                                path: reached_path.clone(),
                            },
                        );
                    }

                    let improves_frontier = next
                        .get(&target)
                        .is_none_or(|(existing, _)| reached > *existing);
                    if improves_frontier {
                        next.insert(target, (reached, reached_path));
                    }
                }
            }

            if next.is_empty() {
                break;
            }
            frontier = next;
        }
    }

    /// Delete a concept per the configured [`DeletePolicy`].
    ///
    /// `Cascade` removes incident relationships entirely; `OrphanMark`
    /// retains them marked orphaned, invisible to `relate` and `infer`.
    /// Deterministic either way.
    pub fn delete_concept(&self, concept_id: &str) -> MemoryResult<()> {
        let _guard = self.guard();

        let Some(concept) = self.concepts.get(concept_id).map(|c| c.clone()) else {
            return Err(MemoryError::not_found(CONCEPTS, concept_id));
        };

        let mut incident = BTreeSet::new();
        if let Some(out) = self.outgoing.get(concept_id) {
            incident.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(concept_id) {
            incident.extend(inc.iter().cloned());
        }

        match self.config.delete_policy {
            DeletePolicy::Cascade => {
                for edge_id in &incident {
                    match self.store.delete(RELATIONSHIPS, edge_id) {
                        Ok(_) | Err(MemoryError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                    if let Some((_, edge)) = self.relationships.remove(edge_id) {
                        if let Some(mut out) = self.outgoing.get_mut(&edge.source) {
                            out.remove(edge_id);
                        }
                        if let Some(mut inc) = self.incoming.get_mut(&edge.target) {
                            inc.remove(edge_id);
                        }
                    }
                }
            }
            DeletePolicy::OrphanMark => {
                for edge_id in &incident {
                    if let Some(mut edge) = self.relationships.get_mut(edge_id) {
                        edge.orphaned = true;
                        let stored = serde_json::to_value(&*edge)?;
                        drop(edge);
                        self.store.put(RELATIONSHIPS, edge_id, stored)?;
                    }
                }
            }
        }

        self.store.delete(CONCEPTS, concept_id)?;
        self.concepts.remove(concept_id);
        self.by_label.remove(&concept.label);
        self.outgoing.remove(concept_id);
        self.incoming.remove(concept_id);

        info!(
            concept = %concept.label,
            incident = incident.len(),
            policy = ?self.config.delete_policy,
            "concept deleted"
        );
        Ok(())
    }

    /// Record an anomaly annotation. Idempotent by marker identity.
    pub fn annotate_anomaly(&self, marker: AnomalyMarker) -> MemoryResult<MarkerId> {
        let _guard = self.guard();

        let id = marker.id.clone();
        self.store
            .put(ANOMALIES, &id, serde_json::to_value(&marker)?)?;
        self.anomalies.insert(id.clone(), marker);
        Ok(id)
    }

    /// All anomaly markers, ordered by id.
    pub fn anomalies(&self) -> Vec<AnomalyMarker> {
        let mut markers: Vec<AnomalyMarker> =
            self.anomalies.iter().map(|e| e.value().clone()).collect();
        markers.sort_by(|a, b| a.id.cmp(&b.id));
        markers
    }

    /// Anomaly markers attached to one episode, via the record index.
    pub fn anomalies_for(&self, record: Uuid) -> MemoryResult<Vec<AnomalyMarker>> {
        let ids = self
            .store
            .query_by_index(ANOMALIES, "record", &record.to_string())?;
        Ok(ids
            .iter()
            .filter_map(|id| self.anomalies.get(id).map(|m| m.clone()))
            .collect())
    }

    /// Number of concepts.
    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    /// Number of relationships (orphaned included).
    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Number of anomaly markers.
    pub fn anomaly_count(&self) -> usize {
        self.anomalies.len()
    }

    /// Rebuild the in-memory graph from the persisted collections.
    ///
    /// Validates referential integrity: a non-orphaned edge whose endpoint
    /// does not resolve is structural corruption, and nothing is installed.
    pub fn rebuild_from_store(&self) -> MemoryResult<()> {
        let _guard = self.guard();

        let mut concepts = Vec::new();
        for (id, stored) in self.store.scan(CONCEPTS)? {
            let concept: Concept =
                serde_json::from_value(stored).map_err(|e| MemoryError::Corrupt {
                    reason: format!("undecodable concept '{id}': {e}"),
                })?;
            concepts.push(concept);
        }

        let concept_ids: BTreeSet<ConceptId> = concepts.iter().map(|c| c.id.clone()).collect();

        let mut relationships = Vec::new();
        for (id, stored) in self.store.scan(RELATIONSHIPS)? {
            let edge: Relationship =
                serde_json::from_value(stored).map_err(|e| MemoryError::Corrupt {
                    reason: format!("undecodable relationship '{id}': {e}"),
                })?;
            if !edge.orphaned {
                for endpoint in [&edge.source, &edge.target] {
                    if !concept_ids.contains(endpoint) {
                        return Err(MemoryError::Corrupt {
                            reason: format!(
                                "relationship '{id}' references missing concept '{endpoint}'"
                            ),
                        });
                    }
                }
            }
            relationships.push(edge);
        }

        let mut markers = Vec::new();
        for (id, stored) in self.store.scan(ANOMALIES)? {
            let marker: AnomalyMarker =
                serde_json::from_value(stored).map_err(|e| MemoryError::Corrupt {
                    reason: format!("undecodable anomaly marker '{id}': {e}"),
                })?;
            markers.push(marker);
        }

        // All collections decoded and validated; install wholesale
        self.concepts.clear();
        self.by_label.clear();
        self.relationships.clear();
        self.outgoing.clear();
        self.incoming.clear();
        self.anomalies.clear();

        for concept in concepts {
            self.by_label.insert(concept.label.clone(), concept.id.clone());
            self.concepts.insert(concept.id.clone(), concept);
        }
        for edge in relationships {
            self.outgoing
                .entry(edge.source.clone())
                .or_default()
                .insert(edge.id.clone());
            self.incoming
                .entry(edge.target.clone())
                .or_default()
                .insert(edge.id.clone());
            self.relationships.insert(edge.id.clone(), edge);
        }
        for marker in markers {
            self.anomalies.insert(marker.id.clone(), marker);
        }

        debug!(
            concepts = self.concepts.len(),
            relationships = self.relationships.len(),
            anomalies = self.anomalies.len(),
            "semantic graph rebuilt from store"
        );
        Ok(())
    }
}
