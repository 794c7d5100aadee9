use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use linkage::{
    AssociationEngine, BatchSizerConfig, EngineConfig, IdentityPath, InMemoryKeyIndex,
    InMemoryMetricsSink, InMemoryModelRegistry, InMemoryStageStore, KeyIndexStore, ModelName, Payload,
    PayloadValue, RawStageRecord, ReferenceId, SourceId, StagePartition,
};

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        poll_interval: Duration::from_millis(10),
        cycle_deadline: Duration::from_secs(5),
        mint_missing: true,
        max_backoff_ticks: 8,
        sizer: BatchSizerConfig::default(),
    }
}

fn standardized_record(code: &str) -> RawStageRecord {
    let mut payload = Payload::new();
    payload.insert(
        "customerCode".to_string(),
        PayloadValue::String(code.to_string()),
    );
    RawStageRecord::new(
        SourceId::new("crm-east"),
        Utc::now(),
        payload,
        StagePartition::Standardized,
    )
}

fn empty_record() -> RawStageRecord {
    RawStageRecord::new(
        SourceId::new("crm-east"),
        Utc::now(),
        Payload::new(),
        StagePartition::Standardized,
    )
}

fn registry_for(models: &[&str]) -> Arc<InMemoryModelRegistry> {
    let registry = InMemoryModelRegistry::new();
    for name in models {
        registry.register(
            ModelName::new(*name),
            vec![IdentityPath::new("customerCode")],
        );
    }
    Arc::new(registry)
}

/// Polls until the condition holds or the timeout elapses.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn end_to_end_keying_with_preseeded_index() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");

    let reference = ReferenceId::new();
    index.insert(&model, "cust-001", reference).unwrap();
    // Divergent spellings of the same identity from two producers.
    stage.seed(&model, standardized_record("cust-001"));
    stage.seed(&model, standardized_record("CUST_001"));

    let engine = AssociationEngine::start(
        stage.clone(),
        index,
        registry_for(&["customer"]),
        sink.clone(),
        fast_config(),
    );

    assert!(wait_until(Duration::from_secs(5), || {
        stage.count(&model, StagePartition::Standardized) == 0
    }));
    engine.shutdown();

    let keyed = stage.records_in(&model, StagePartition::Keyed);
    assert_eq!(keyed.len(), 2);
    for record in &keyed {
        assert_eq!(record.owners.len(), 1);
        assert!(record.owners.contains(&reference));
    }
    assert!(sink.keyed() >= 2);
    assert!(sink.cycles() >= 1);
}

#[test]
fn unresolvable_records_stay_standardized_and_count_skipped() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");

    let resolvable = standardized_record("cust-001");
    let resolvable_id = resolvable.id;
    let unresolvable = empty_record();
    let unresolvable_id = unresolvable.id;
    stage.seed(&model, resolvable);
    stage.seed(&model, unresolvable);

    let engine = AssociationEngine::start(
        stage.clone(),
        index,
        registry_for(&["customer"]),
        sink.clone(),
        fast_config(),
    );

    assert!(wait_until(Duration::from_secs(5), || {
        stage.ids_in(&model, StagePartition::Keyed).contains(&resolvable_id)
    }));
    assert!(wait_until(Duration::from_secs(5), || sink.skipped() >= 1));
    engine.shutdown();

    // Not moved and not lost: still standardized, retried every cycle.
    assert_eq!(
        stage.ids_in(&model, StagePartition::Standardized),
        vec![unresolvable_id]
    );
    assert!(!stage
        .ids_in(&model, StagePartition::Keyed)
        .contains(&unresolvable_id));
}

#[test]
fn minting_converges_records_sharing_candidates() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");
    let registry = InMemoryModelRegistry::new();
    registry.register(
        ModelName::new("customer"),
        vec![
            IdentityPath::new("customerCode"),
            IdentityPath::new("externalId"),
        ],
    );

    // Three unseen records chained by shared candidates:
    //   r1 {a}, r2 {a, b}, r3 {b}
    let r1 = standardized_record("cust-a");
    let mut p2 = Payload::new();
    p2.insert(
        "customerCode".to_string(),
        PayloadValue::String("cust-a".to_string()),
    );
    p2.insert(
        "externalId".to_string(),
        PayloadValue::String("ext-b".to_string()),
    );
    let r2 = RawStageRecord::new(
        SourceId::new("crm-west"),
        Utc::now(),
        p2,
        StagePartition::Standardized,
    );
    let mut p3 = Payload::new();
    p3.insert(
        "externalId".to_string(),
        PayloadValue::String("EXT_B".to_string()),
    );
    let r3 = RawStageRecord::new(
        SourceId::new("crm-west"),
        Utc::now(),
        p3,
        StagePartition::Standardized,
    );
    let (r1_id, r2_id, r3_id) = (r1.id, r2.id, r3.id);
    stage.seed(&model, r1);
    stage.seed(&model, r2);
    stage.seed(&model, r3);

    let engine = AssociationEngine::start(
        stage.clone(),
        index.clone(),
        Arc::new(registry),
        sink,
        fast_config(),
    );
    assert!(wait_until(Duration::from_secs(5), || {
        stage.count(&model, StagePartition::Standardized) == 0
    }));
    engine.shutdown();

    let keyed = stage.records_in(&model, StagePartition::Keyed);
    assert_eq!(keyed.len(), 3);
    let owners_of = |id| {
        keyed
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.owners.clone())
            .expect("record not keyed")
    };

    // Records whose candidate sets intersect end with intersecting owners:
    // r1 and r2 share cust-a, r2 and r3 share ext-b.
    let (o1, o2, o3) = (owners_of(r1_id), owners_of(r2_id), owners_of(r3_id));
    assert!(o1.intersection(&o2).next().is_some());
    assert!(o2.intersection(&o3).next().is_some());
    // Both candidates are bound in the index afterwards.
    assert_eq!(index.entries(&model).len(), 2);
}

#[test]
fn resolution_failure_backs_off_then_recovers() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");

    index.insert(&model, "cust-001", ReferenceId::new()).unwrap();
    stage.seed(&model, standardized_record("cust-001"));
    index.set_fail_lookups(true);

    let engine = AssociationEngine::start(
        stage.clone(),
        index.clone(),
        registry_for(&["customer"]),
        sink,
        fast_config(),
    );

    // While the index is down the record goes nowhere.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(stage.count(&model, StagePartition::Standardized), 1);

    index.set_fail_lookups(false);
    assert!(wait_until(Duration::from_secs(5), || {
        stage.count(&model, StagePartition::Keyed) == 1
    }));
    engine.shutdown();
}

#[test]
fn misconfigured_model_is_isolated_from_healthy_ones() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let broken = ModelName::new("broken");
    let healthy = ModelName::new("customer");

    let registry = InMemoryModelRegistry::new();
    registry.register(ModelName::new("broken"), Vec::new());
    registry.register(
        ModelName::new("customer"),
        vec![IdentityPath::new("customerCode")],
    );

    stage.seed(&broken, standardized_record("b-1"));
    stage.seed(&healthy, standardized_record("cust-001"));

    let engine = AssociationEngine::start(
        stage.clone(),
        index,
        Arc::new(registry),
        sink,
        fast_config(),
    );

    assert!(wait_until(Duration::from_secs(5), || {
        stage.count(&healthy, StagePartition::Keyed) == 1
    }));
    engine.shutdown();

    // The broken model's records sit untouched; nothing was lost.
    assert_eq!(stage.count(&broken, StagePartition::Standardized), 1);
    assert_eq!(stage.count(&broken, StagePartition::Keyed), 0);
}

#[test]
fn shutdown_leaves_every_record_in_exactly_one_stage() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");

    let mut all_ids = Vec::new();
    for i in 0..200 {
        let record = standardized_record(&format!("cust-{i:03}"));
        all_ids.push(record.id);
        stage.seed(&model, record);
    }

    let engine = AssociationEngine::start(
        stage.clone(),
        index,
        registry_for(&["customer"]),
        sink,
        fast_config(),
    );
    // Shut down mid-stream: in-flight cycles finish their transition.
    std::thread::sleep(Duration::from_millis(50));
    engine.shutdown();

    let standardized = stage.ids_in(&model, StagePartition::Standardized);
    let keyed = stage.ids_in(&model, StagePartition::Keyed);
    for id in &all_ids {
        let in_source = standardized.contains(id);
        let in_dest = keyed.contains(id);
        assert!(in_source ^ in_dest, "record {id} lost or duplicated");
    }
}

#[test]
fn zero_owner_records_pass_through_when_minting_is_off() {
    let stage = Arc::new(InMemoryStageStore::new());
    let index = Arc::new(InMemoryKeyIndex::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let model = ModelName::new("customer");
    stage.seed(&model, standardized_record("never-seen"));

    let engine = AssociationEngine::start(
        stage.clone(),
        index.clone(),
        registry_for(&["customer"]),
        sink,
        EngineConfig {
            mint_missing: false,
            ..fast_config()
        },
    );
    assert!(wait_until(Duration::from_secs(5), || {
        stage.count(&model, StagePartition::Keyed) == 1
    }));
    engine.shutdown();

    let keyed = stage.records_in(&model, StagePartition::Keyed);
    assert!(keyed[0].is_unresolved());
    // Nothing was minted into the index.
    assert!(index.entries(&model).is_empty());
}
