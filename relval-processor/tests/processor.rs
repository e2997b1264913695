//! End-to-end processor scenarios against the in-memory store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use relval_base::{PointRef, PointValue, ResultValue, Value};
use relval_processor::batch::{Batch, BatchConfig};
use relval_processor::metadata::{
    InputDef, Metadata, MetadataBuilder, Point, PointDef, ReplicateDef, StoreEntity,
    TransformArg, TransformEntity,
};
use relval_processor::transform::{FailingTransform, PassthroughTransform, Transform};
use relval_processor::{
    MemoryStore, Params, Processor, ProcessorConfig, TransformError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

fn notice(name: &str, seconds: i64, value: f64) -> PointValue {
    PointValue::new(
        PointRef::ByName(name.into()),
        Some(at(seconds)),
        Value::Null,
        Value::Double(value),
    )
}

fn passthrough_entity() -> Arc<TransformEntity> {
    Arc::new(
        TransformEntity::new("passthrough", Arc::new(PassthroughTransform))
            .with_arg(TransformArg::required()),
    )
}

/// Sums the doubles of every filled input.
struct SumTransform;

impl Transform for SumTransform {
    fn name(&self) -> &str {
        "Sum"
    }

    fn apply_to(
        &self,
        result: &ResultValue,
        _batch: &mut Batch,
    ) -> Result<Option<PointValue>, TransformError> {
        let mut sum = 0.0;
        let mut any = false;
        for input in result.inputs() {
            if let Some(value) = input.value().to_double() {
                sum += value;
                any = true;
            }
        }
        if !any {
            return Ok(None);
        }
        Ok(Some(
            PointValue::new(
                result.point_value().point().clone(),
                result.point_value().stamp(),
                Value::Null,
                Value::Double(sum),
            )
            .into_synthesized(),
        ))
    }
}

/// Counts release calls to observe the close hook.
struct ReleasingTransform {
    released: Arc<AtomicUsize>,
}

impl Transform for ReleasingTransform {
    fn name(&self) -> &str {
        "Releasing"
    }

    fn apply_to(
        &self,
        _result: &ResultValue,
        _batch: &mut Batch,
    ) -> Result<Option<PointValue>, TransformError> {
        Ok(None)
    }

    fn release(&self, _point: &Point) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One input point feeding one result point through a passthrough.
fn passthrough_metadata(store: &Arc<StoreEntity>) -> Result<Arc<Metadata>> {
    let mut builder = MetadataBuilder::new();
    let mut input = PointDef::named("i");
    input.store = Some(Arc::clone(store));
    builder.add_point(input)?;

    let mut result = PointDef::named("r");
    result.store = Some(Arc::clone(store));
    result.transform = Some(passthrough_entity());
    result.inputs.push(InputDef::new(PointRef::ByName("i".into())));
    builder.add_point(result)?;
    Ok(Arc::new(builder.build()?))
}

#[tokio::test]
async fn trivial_passthrough_end_to_end() -> Result<()> {
    logging();
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));
    let processor = Processor::new(passthrough_metadata(&store)?);

    let updates = processor
        .process(vec![notice("i", 100, 5.0)])
        .await?
        .expect("no memory pressure");

    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.point().name(), Some("r"));
    assert_eq!(update.stamp(), Some(at(100)));
    assert_eq!(update.value().to_double(), Some(5.0));
    assert!(update.is_synthesized());
    assert!(update.is_frozen());

    // The update also reached the store.
    let stored = memory.updated();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].point().name(), Some("r"));
    Ok(())
}

#[tokio::test]
async fn second_input_is_fetched_from_the_store() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));

    let mut builder = MetadataBuilder::new();
    for name in ["a", "b"] {
        let mut def = PointDef::named(name);
        def.store = Some(Arc::clone(&store));
        builder.add_point(def)?;
    }
    let mut result = PointDef::named("sum");
    result.store = Some(Arc::clone(&store));
    result.transform = Some(Arc::new(
        TransformEntity::new("sum", Arc::new(SumTransform))
            .with_arg(TransformArg::required().multiple()),
    ));
    result.inputs.push(InputDef::new(PointRef::ByName("a".into())));
    result.inputs.push(InputDef::new(PointRef::ByName("b".into())));
    builder.add_point(result)?;
    let metadata = Arc::new(builder.build()?);

    // b@100 exists only in the store: the select phase must fetch it.
    let b = metadata
        .resolve(&PointRef::ByName("b".into()))
        .expect("b is defined");
    memory.seed(PointValue::new(
        PointRef::Resolved {
            idx: b,
            uuid: metadata.point(b).uuid(),
            name: Some("b".into()),
        },
        Some(at(100)),
        Value::Null,
        Value::Double(3.0),
    ));

    let processor = Processor::new(metadata);
    let updates = processor
        .process(vec![notice("a", 100, 2.0)])
        .await?
        .expect("no memory pressure");

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].point().name(), Some("sum"));
    assert_eq!(updates[0].value().to_double(), Some(5.0));
    Ok(())
}

#[tokio::test]
async fn missing_required_input_yields_no_update() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));

    let mut builder = MetadataBuilder::new();
    for name in ["a", "b"] {
        let mut def = PointDef::named(name);
        def.store = Some(Arc::clone(&store));
        builder.add_point(def)?;
    }
    let mut result = PointDef::named("sum");
    result.transform = Some(Arc::new(
        TransformEntity::new("sum", Arc::new(SumTransform))
            .with_arg(TransformArg::required().multiple()),
    ));
    result.inputs.push(InputDef::new(PointRef::ByName("a".into())));
    result.inputs.push(InputDef::new(PointRef::ByName("b".into())));
    builder.add_point(result)?;
    let processor = Processor::new(Arc::new(builder.build()?));

    // b@100 exists nowhere: the required input cannot be selected.
    let updates = processor
        .process(vec![notice("a", 100, 2.0)])
        .await?
        .expect("no memory pressure");
    assert!(updates.is_empty());
    Ok(())
}

#[tokio::test]
async fn chained_results_compute_in_dependency_order() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));

    let mut builder = MetadataBuilder::new();
    let mut base = PointDef::named("base");
    base.store = Some(Arc::clone(&store));
    builder.add_point(base)?;
    for (name, input) in [("derived", "base"), ("further", "derived")] {
        let mut def = PointDef::named(name);
        def.store = Some(Arc::clone(&store));
        def.transform = Some(passthrough_entity());
        def.inputs.push(InputDef::new(PointRef::ByName(input.into())));
        builder.add_point(def)?;
    }
    let metadata = Arc::new(builder.build()?);
    let processor = Processor::new(metadata);

    let updates = processor
        .process(vec![notice("base", 60, 7.5)])
        .await?
        .expect("no memory pressure");

    // Only the direct dependent computes in this batch; its update would
    // come back as a notice for the next one.
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].point().name(), Some("derived"));
    assert_eq!(updates[0].value().to_double(), Some(7.5));

    let next = processor
        .process(updates)
        .await?
        .expect("no memory pressure");
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].point().name(), Some("further"));
    assert_eq!(next[0].value().to_double(), Some(7.5));
    Ok(())
}

#[tokio::test]
async fn replicates_receive_a_copy_of_each_update() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));

    let mut builder = MetadataBuilder::new();
    let mut input = PointDef::named("i");
    input.store = Some(Arc::clone(&store));
    builder.add_point(input)?;
    let mut mirror = PointDef::named("mirror");
    mirror.store = Some(Arc::clone(&store));
    builder.add_point(mirror)?;
    let mut result = PointDef::named("r");
    result.store = Some(Arc::clone(&store));
    result.transform = Some(passthrough_entity());
    result.inputs.push(InputDef::new(PointRef::ByName("i".into())));
    result
        .replicates
        .push(ReplicateDef::new(PointRef::ByName("mirror".into())));
    builder.add_point(result)?;
    let processor = Processor::new(Arc::new(builder.build()?));

    let updates = processor
        .process(vec![notice("i", 100, 1.25)])
        .await?
        .expect("no memory pressure");

    let mut names: Vec<&str> = updates
        .iter()
        .filter_map(|update| update.point().name())
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["mirror", "r"]);
    assert!(updates
        .iter()
        .all(|update| update.value().to_double() == Some(1.25)));
    Ok(())
}

#[tokio::test]
async fn memory_pressure_requests_a_split() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));
    let metadata = passthrough_metadata(&store)?;
    let processor = Processor::with_config(
        metadata,
        ProcessorConfig {
            batch: BatchConfig {
                value_limit: 2,
                ..BatchConfig::default()
            },
        },
    );

    let notices: Vec<PointValue> = (0..5).map(|index| notice("i", index, 1.0)).collect();
    assert!(processor.process(notices.clone()).await?.is_none());

    // Halving the input gets under the limit.
    let (first, second) = notices.split_at(2);
    assert!(processor.process(first.to_vec()).await?.is_some());
    assert!(processor.process(second.to_vec()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn cutoff_suppresses_late_notices() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));
    let mut processor = Processor::new(passthrough_metadata(&store)?);
    processor.set_cutoff(Some(at(100)));

    let updates = processor
        .process(vec![notice("i", 50, 1.0), notice("i", 150, 2.0)])
        .await?
        .expect("no memory pressure");

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].stamp(), Some(at(50)));
    Ok(())
}

#[tokio::test]
async fn failing_transform_is_local_and_may_return_null() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));

    let mut builder = MetadataBuilder::new();
    let mut input = PointDef::named("i");
    input.store = Some(Arc::clone(&store));
    builder.add_point(input)?;

    let failing = Arc::new(
        TransformEntity::new("failing", Arc::new(FailingTransform))
            .with_arg(TransformArg::required()),
    );
    let mut silent = PointDef::named("silent");
    silent.transform = Some(Arc::clone(&failing));
    silent.inputs.push(InputDef::new(PointRef::ByName("i".into())));
    builder.add_point(silent)?;

    let mut nullifying = PointDef::named("nullifying");
    nullifying.transform = Some(failing);
    nullifying.params = Params::new().with("fail_returns_null", true);
    nullifying
        .inputs
        .push(InputDef::new(PointRef::ByName("i".into())));
    builder.add_point(nullifying)?;
    let processor = Processor::new(Arc::new(builder.build()?));

    let updates = processor
        .process(vec![notice("i", 100, 1.0)])
        .await?
        .expect("no memory pressure");

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].point().name(), Some("nullifying"));
    assert!(updates[0].value().is_null());
    Ok(())
}

#[tokio::test]
async fn close_releases_installed_transforms() -> Result<()> {
    let released = Arc::new(AtomicUsize::new(0));
    let entity = Arc::new(
        TransformEntity::new(
            "releasing",
            Arc::new(ReleasingTransform {
                released: Arc::clone(&released),
            }),
        )
        .with_arg(TransformArg::required()),
    );

    let mut builder = MetadataBuilder::new();
    builder.add_point(PointDef::named("i"))?;
    for name in ["first", "second"] {
        let mut def = PointDef::named(name);
        def.transform = Some(Arc::clone(&entity));
        def.inputs.push(InputDef::new(PointRef::ByName("i".into())));
        builder.add_point(def)?;
    }
    let processor = Processor::new(Arc::new(builder.build()?));

    processor.close();
    assert_eq!(released.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn batches_are_deterministic() -> Result<()> {
    let run = || async {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(StoreEntity::new("store", Arc::clone(&memory) as _));
        let processor = Processor::new(passthrough_metadata(&store)?);
        processor
            .process(vec![
                notice("i", 100, 1.0),
                notice("i", 200, 2.0),
                notice("i", 300, 3.0),
            ])
            .await?
            .ok_or_else(|| anyhow::anyhow!("unexpected memory pressure"))
    };

    let first = run().await?;
    let second = run().await?;
    assert_eq!(first.len(), second.len());
    for (mine, theirs) in first.iter().zip(second.iter()) {
        assert_eq!(mine.point().name(), theirs.point().name());
        assert_eq!(mine.stamp(), theirs.stamp());
        assert_eq!(mine.value(), theirs.value());
    }
    Ok(())
}
