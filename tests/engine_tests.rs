/// End-to-end tests for the memory engine.
///
/// These exercise the public facade across all three tiers, plus
/// durability: journal recovery after restart and snapshot save/restore.
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use memoric::prelude::*;
use memoric::{AnomalyConfig, CausalConfig, CompileConfig, PatternConfig, PipelineConfig};
use std::time::Duration;

fn record(payload: serde_json::Value) -> ExperienceRecord {
    ExperienceRecord::new(payload)
}

#[tokio::test]
async fn test_append_recall_workflow() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    let id = engine
        .append(
            record(json!({"reading": 20.5}))
                .with_tags(["sensor", "temperature"])
                .with_context("location", json!("hall"))
                .with_outcome("nominal"),
        )
        .await?;

    let recalled = engine.recall(id).await?.expect("just appended");
    assert_eq!(recalled.payload["reading"], json!(20.5));
    assert_eq!(recalled.outcome.as_deref(), Some("nominal"));

    // Unknown ids are a miss, not an error
    assert!(engine.recall(RecordId::new_v4()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_recall_range_is_time_ordered() -> Result<()> {
    let engine = MemoryEngine::start().await?;
    let base = Utc::now();

    // Append out of order; recall must come back in event-time order
    for offset in [30i64, 10, 50, 20, 40] {
        engine
            .append(
                record(json!({"offset": offset}))
                    .with_timestamp(base + ChronoDuration::seconds(offset)),
            )
            .await?;
    }

    let all = engine
        .recall_range(base, base + ChronoDuration::seconds(60))
        .await;
    assert_eq!(all.len(), 5);
    for pair in all.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // Inclusive bounds
    let middle = engine
        .recall_range(
            base + ChronoDuration::seconds(20),
            base + ChronoDuration::seconds(40),
        )
        .await;
    assert_eq!(middle.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_tag_and_outcome_recall() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    engine
        .append(record(json!(1)).with_tags(["alpha"]).with_outcome("ok"))
        .await?;
    engine
        .append(record(json!(2)).with_tags(["alpha", "beta"]))
        .await?;
    engine
        .append(record(json!(3)).with_tags(["beta"]).with_outcome("ok"))
        .await?;

    assert_eq!(engine.recall_by_tag("alpha").await?.len(), 2);
    assert_eq!(engine.recall_by_tag("beta").await?.len(), 2);
    assert_eq!(engine.recall_by_tag("gamma").await?.len(), 0);
    assert_eq!(engine.recall_by_outcome("ok").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_find_similar_ranks_by_overlap() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    let query = record(json!({}))
        .with_tags(["sensor", "motion"])
        .with_context("location", json!("hall"));
    engine.append(query.clone()).await?;

    let near = engine
        .append(
            record(json!({}))
                .with_tags(["sensor", "motion"])
                .with_context("location", json!("hall")),
        )
        .await?;
    let far = engine
        .append(record(json!({})).with_tags(["billing"]))
        .await?;

    let similar = engine.find_similar(&query, 2).await;
    assert_eq!(similar.len(), 2);
    assert_eq!(similar[0].0.id, near);
    assert_eq!(similar[1].0.id, far);
    assert!(similar[0].1 > similar[1].1);
    Ok(())
}

#[tokio::test]
async fn test_working_memory_priority_and_ttl() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    engine
        .remember("goal", json!("patrol"), 0.9, Duration::from_secs(600))
        .await;
    engine
        .remember("ephemeral", json!(1), 0.1, Duration::from_millis(20))
        .await;

    assert_eq!(engine.recall_working("goal").await, Some(json!("patrol")));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(engine.recall_working("ephemeral").await, None);
    assert_eq!(engine.recall_working("goal").await, Some(json!("patrol")));

    assert!(engine.reprioritize("goal", 0.2).await);
    let snapshot = engine.working_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert!((snapshot[0].priority - 0.2).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_semantic_graph_and_inference() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    let rain = engine.learn_concept(Concept::new("rain")).await?;
    let wet = engine.learn_concept(Concept::new("wet_ground")).await?;
    let slip = engine.learn_concept(Concept::new("slippery")).await?;
    engine
        .learn_relationship(
            Relationship::new(rain.clone(), RelationKind::Causes, wet.clone())
                .with_confidence(0.9),
        )
        .await?;
    engine
        .learn_relationship(
            Relationship::new(wet, RelationKind::Causes, slip.clone()).with_confidence(0.9),
        )
        .await?;

    let facts = engine
        .infer(&InferenceQuery::from_label("rain"))
        .await?;
    assert_eq!(facts.len(), 2);
    let two_hop = facts.iter().find(|f| f.target == slip).expect("reachable");
    assert_eq!(two_hop.hops, 2);
    assert!((two_hop.confidence - 0.81).abs() < 1e-9);

    // An edge to a concept that was never learned is rejected
    let err = engine
        .learn_relationship(Relationship::new(rain, RelationKind::Causes, "nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::InvalidEndpoint { .. }));
    Ok(())
}

#[tokio::test]
async fn test_journal_recovery_across_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = EngineConfig::durable(dir.path());

    let id = {
        let engine = MemoryEngine::start_with_config(config.clone()).await?;
        let id = engine
            .append(record(json!({"event": "boot"})).with_tags(["lifecycle"]))
            .await?;
        let concept = engine.learn_concept(Concept::new("boot_sequence")).await?;
        engine
            .learn_relationship(Relationship::new(
                concept.clone(),
                RelationKind::RelatedTo,
                concept,
            ))
            .await?;
        id
    };

    // A fresh engine over the same directory replays the journal
    let engine = MemoryEngine::start_with_config(config).await?;
    let recalled = engine.recall(id).await?.expect("survives restart");
    assert_eq!(recalled.payload["event"], json!("boot"));
    assert_eq!(engine.recall_by_tag("lifecycle").await?.len(), 1);
    assert!(engine.concept_by_label("boot_sequence").await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_snapshot_save_and_restore() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("engine.snap");
    let engine = MemoryEngine::start().await?;

    let kept = engine.append(record(json!({"phase": 1}))).await?;
    engine.learn_concept(Concept::new("phase_one")).await?;
    let info = engine.save_snapshot(&path).await?;
    assert_eq!(info.record_count, 2);

    // Mutate past the snapshot point
    let lost = engine.append(record(json!({"phase": 2}))).await?;
    engine
        .remember("scratch", json!(true), 0.5, Duration::from_secs(600))
        .await;

    engine.restore_snapshot(&path).await?;

    assert!(engine.recall(kept).await?.is_some());
    assert!(engine.recall(lost).await?.is_none());
    assert!(engine.concept_by_label("phase_one").await.is_some());
    // Transient tiers are cleared on restore
    assert_eq!(engine.recall_working("scratch").await, None);
    Ok(())
}

#[tokio::test]
async fn test_restore_holds_across_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let snap = dir.path().join("engine.snap");
    let config = EngineConfig::durable(dir.path());

    let (kept, lost, after) = {
        let engine = MemoryEngine::start_with_config(config.clone()).await?;
        let kept = engine.append(record(json!({"phase": 1}))).await?;
        engine.save_snapshot(&snap).await?;
        let lost = engine.append(record(json!({"phase": 2}))).await?;

        engine.restore_snapshot(&snap).await?;
        assert!(engine.recall(lost).await?.is_none());

        // Post-restore writes journal on top of the restored state
        let after = engine.append(record(json!({"phase": 3}))).await?;
        (kept, lost, after)
    };

    // The restart must recover the restore, not the discarded history
    let engine = MemoryEngine::start_with_config(config).await?;
    assert!(engine.recall(kept).await?.is_some());
    assert!(engine.recall(lost).await?.is_none());
    assert_eq!(
        engine.recall(after).await?.expect("post-restore append").payload["phase"],
        json!(3)
    );
    Ok(())
}

#[tokio::test]
async fn test_sequence_grouping_through_facade() -> Result<()> {
    let engine = MemoryEngine::start().await?;

    let open = engine.append(record(json!({"step": "open"}))).await?;
    let close = engine.append(record(json!({"step": "close"}))).await?;
    let unrelated = engine.append(record(json!({"step": "idle"}))).await?;

    let shift = engine.create_sequence("night_shift").await?;
    engine.extend_sequence(shift, open).await?;
    engine.extend_sequence(shift, close).await?;

    let for_open = engine.sequences_for(open).await?;
    assert_eq!(for_open.len(), 1);
    assert_eq!(for_open[0].name, "night_shift");
    assert_eq!(for_open[0].events, vec![open, close]);
    assert!(engine.sequences_for(unrelated).await?.is_empty());
    assert_eq!(engine.stats().sequences, 1);

    // Sequences are persistent state: they ride through snapshot restore
    let dir = tempfile::tempdir()?;
    let snap = dir.path().join("engine.snap");
    engine.save_snapshot(&snap).await?;
    engine.restore_snapshot(&snap).await?;
    assert_eq!(engine.sequences_for(close).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_restore_rejects_corrupt_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("engine.snap");
    let engine = MemoryEngine::start().await?;

    let id = engine.append(record(json!(1))).await?;
    engine.save_snapshot(&path).await?;

    // Flip one byte in the body; the checksum must catch it
    let mut bytes = std::fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes)?;

    let err = engine.restore_snapshot(&path).await.unwrap_err();
    assert!(matches!(err, MemoryError::Corrupt { .. }));
    // Live state is untouched by the failed restore
    assert!(engine.recall(id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_pipeline_through_facade() -> Result<()> {
    let engine = MemoryEngine::start_with_config(EngineConfig {
        pipeline: PipelineConfig {
            patterns: PatternConfig {
                support_threshold: 3,
            },
            anomalies: AnomalyConfig::default(),
            causal: CausalConfig {
                min_samples: 3,
                ..CausalConfig::default()
            },
            compile: CompileConfig::default(),
        },
        ..EngineConfig::default()
    })
    .await?;

    for _ in 0..4 {
        engine
            .append(
                record(json!({}))
                    .with_context("door", json!("open"))
                    .with_outcome("alarm"),
            )
            .await?;
    }

    let report = engine.run_pipeline(&AnalysisWindow::All).await?;
    assert!(report.all_completed());
    assert!(report.total_emitted() > 0);

    let alarm_id = Concept::new("alarm").id;
    let facts = engine
        .infer(&InferenceQuery::from_label("door=open"))
        .await?;
    assert!(facts.iter().any(|f| f.target == alarm_id));

    let stats = engine.stats();
    assert_eq!(stats.episodes, 4);
    assert!(stats.concepts >= 2);
    Ok(())
}
