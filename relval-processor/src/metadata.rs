//! The point metadata graph.
//!
//! A `MetadataBuilder` assembles point definitions holding lazy references
//! (by UUID or name). `build` tidies the references into arena indices,
//! runs the set-up pass (contents, stores, transforms, behavior chain
//! activation) and assigns dependency levels with cycle detection. The
//! built `Metadata` is immutable and shared across batches.

use crate::behavior::{BehaviorChain, BehaviorEntity, PlanLink, RelationRef, Triggers};
use crate::error::ConfigError;
use crate::params::{Params, PARAM_RECALC_LATEST, PARAM_REQUIRED};
use crate::store::Store;
use crate::transform::Transform;
use relval_base::content::Content;
use relval_base::{PointIdx, PointRef, PointValue, Sync};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

// ─── Entities ─────────────────────────────────────────────────

/// A store as the metadata knows it.
pub struct StoreEntity {
    pub uuid: Uuid,
    pub name: String,
    pub store: Arc<dyn Store>,
}

impl StoreEntity {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            store,
        }
    }

    pub fn null_removes(&self) -> bool {
        self.store.null_removes()
    }
}

pub struct ContentEntity {
    pub name: String,
    pub content: Arc<dyn Content>,
}

impl ContentEntity {
    pub fn new(name: impl Into<String>, content: Arc<dyn Content>) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }
}

/// One argument slot of a transform: what kind of input it consumes and
/// which behaviors it implies.
#[derive(Clone, Default)]
pub struct TransformArg {
    pub required: bool,
    pub multiple: bool,
    pub default_behaviors: Vec<Arc<BehaviorEntity>>,
}

impl TransformArg {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn optional() -> Self {
        Self::default()
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn with_behavior(mut self, behavior: Arc<BehaviorEntity>) -> Self {
        self.default_behaviors.push(behavior);
        self
    }
}

pub struct TransformEntity {
    pub name: String,
    pub transform: Arc<dyn Transform>,
    pub args: Vec<TransformArg>,
    pub params: Params,
}

impl TransformEntity {
    pub fn new(name: impl Into<String>, transform: Arc<dyn Transform>) -> Self {
        Self {
            name: name.into(),
            transform,
            args: Vec::new(),
            params: Params::new(),
        }
    }

    pub fn with_arg(mut self, arg: TransformArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

// ─── Definitions (builder input) ──────────────────────────────

#[derive(Clone, Default)]
pub struct PointDef {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub content: Option<Arc<ContentEntity>>,
    pub store: Option<Arc<StoreEntity>>,
    pub transform: Option<Arc<TransformEntity>>,
    pub sync: Option<Sync>,
    pub params: Params,
    pub inputs: Vec<InputDef>,
    pub replicates: Vec<ReplicateDef>,
    pub volatile: bool,
    pub dropped: bool,
    /// Overrides the store-wide default when set.
    pub null_removes: Option<bool>,
}

impl PointDef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct InputDef {
    pub point: PointRef,
    pub sync: Option<Sync>,
    pub params: Params,
    pub control: bool,
    pub behaviors: Vec<PlanLink>,
}

impl InputDef {
    pub fn new(point: PointRef) -> Self {
        Self {
            point,
            sync: None,
            params: Params::new(),
            control: false,
            behaviors: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ReplicateDef {
    pub point: PointRef,
    pub convert: Option<Arc<TransformEntity>>,
}

impl ReplicateDef {
    pub fn new(point: PointRef) -> Self {
        Self {
            point,
            convert: None,
        }
    }
}

// ─── Built graph ──────────────────────────────────────────────

/// An input relation after tidying: resolved source plus the activated
/// behavior chain.
pub struct PointInput {
    point: PointIdx,
    sync: Option<Sync>,
    params: Params,
    control: bool,
    chain: BehaviorChain,
}

impl PointInput {
    pub fn point(&self) -> PointIdx {
        self.point
    }

    pub fn sync(&self) -> Option<Sync> {
        self.sync
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn is_control(&self) -> bool {
        self.control
    }

    pub fn chain(&self) -> &BehaviorChain {
        &self.chain
    }
}

pub struct Replicate {
    point: PointIdx,
    convert: Option<Arc<TransformEntity>>,
}

impl Replicate {
    pub fn point(&self) -> PointIdx {
        self.point
    }

    pub fn convert(&self) -> Option<&Arc<TransformEntity>> {
        self.convert.as_ref()
    }
}

pub struct Point {
    uuid: Uuid,
    name: Option<String>,
    content: Option<Arc<ContentEntity>>,
    store: Option<Arc<StoreEntity>>,
    transform: Option<Arc<TransformEntity>>,
    sync: Option<Sync>,
    params: Params,
    inputs: Vec<PointInput>,
    results: Vec<PointIdx>,
    replicates: Vec<Replicate>,
    volatile: bool,
    null_removes: bool,
    recalc_latest: bool,
    dropped: bool,
    level: i32,
}

impl Point {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name when there is one, the UUID otherwise.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.uuid.to_string())
    }

    pub fn content(&self) -> Option<&Arc<ContentEntity>> {
        self.content.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<StoreEntity>> {
        self.store.as_ref()
    }

    pub fn transform(&self) -> Option<&Arc<TransformEntity>> {
        self.transform.as_ref()
    }

    pub fn sync(&self) -> Option<Sync> {
        self.sync
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn inputs(&self) -> &[PointInput] {
        &self.inputs
    }

    /// Points having this one as an input.
    pub fn results(&self) -> &[PointIdx] {
        &self.results
    }

    pub fn replicates(&self) -> &[Replicate] {
        &self.replicates
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn null_removes(&self) -> bool {
        self.null_removes
    }

    pub fn recalc_latest(&self) -> bool {
        self.recalc_latest
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

// ─── Builder ──────────────────────────────────────────────────

pub struct MetadataBuilder {
    defs: Vec<PointDef>,
    by_uuid: HashMap<Uuid, PointIdx>,
    by_name: HashMap<String, PointIdx>,
    default_behavior: Arc<BehaviorEntity>,
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self {
            defs: Vec::new(),
            by_uuid: HashMap::new(),
            by_name: HashMap::new(),
            default_behavior: Triggers::entity(),
        }
    }

    /// Replaces the behavior appended to chains missing a primary.
    pub fn with_default_behavior(mut self, behavior: Arc<BehaviorEntity>) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn add_point(&mut self, def: PointDef) -> Result<PointIdx, ConfigError> {
        let idx = PointIdx::new(self.defs.len());
        if self.by_uuid.insert(def.uuid, idx).is_some() {
            return Err(ConfigError::DuplicatePoint(def.uuid.to_string()));
        }
        if let Some(name) = &def.name {
            if self.by_name.insert(name.to_lowercase(), idx).is_some() {
                return Err(ConfigError::DuplicatePoint(name.clone()));
            }
        }
        self.defs.push(def);
        Ok(idx)
    }

    fn resolve(&self, reference: &PointRef) -> Option<PointIdx> {
        match reference {
            PointRef::ByUuid(uuid) => self.by_uuid.get(uuid).copied(),
            PointRef::ByName(name) => self.by_name.get(&name.to_lowercase()).copied(),
            PointRef::Resolved { idx, .. } => Some(*idx),
        }
    }

    pub fn build(self) -> Result<Metadata, ConfigError> {
        let count = self.defs.len();
        let mut results: Vec<Vec<PointIdx>> = vec![Vec::new(); count];
        let mut tidied_inputs: Vec<Vec<(PointIdx, InputDef)>> = vec![Vec::new(); count];
        let mut tidied_replicates: Vec<Vec<Replicate>> = (0..count).map(|_| Vec::new()).collect();

        // Tidy: resolve references, drop relations from dropped points,
        // back-link results.
        for (index, def) in self.defs.iter().enumerate() {
            let display_name = def
                .name
                .clone()
                .unwrap_or_else(|| def.uuid.to_string());
            for input in &def.inputs {
                let source = self
                    .resolve(&input.point)
                    .ok_or_else(|| ConfigError::DanglingReference(input.point.to_string()))?;
                if self.defs[source.index()].dropped {
                    warn!(
                        "dropping input relation of '{}': source point was dropped",
                        display_name
                    );
                    continue;
                }
                tidied_inputs[index].push((source, input.clone()));
                results[source.index()].push(PointIdx::new(index));
            }
            for replicate in &def.replicates {
                let target = self
                    .resolve(&replicate.point)
                    .ok_or_else(|| ConfigError::DanglingReference(replicate.point.to_string()))?;
                if target.index() == index {
                    return Err(ConfigError::SelfReplicate(display_name));
                }
                if self.defs[target.index()].dropped {
                    warn!("dropping replicate of '{}': target point was dropped", display_name);
                    continue;
                }
                tidied_replicates[index].push(Replicate {
                    point: target,
                    convert: replicate.convert.clone(),
                });
            }
        }

        // Set-up pass: per-point plumbing and behavior chain activation.
        let mut points = Vec::with_capacity(count);
        for (index, def) in self.defs.iter().enumerate() {
            let display_name = def
                .name
                .clone()
                .unwrap_or_else(|| def.uuid.to_string());
            let recalc_latest = def
                .transform
                .as_ref()
                .map(|transform| transform.params.get_bool(PARAM_RECALC_LATEST, false))
                .unwrap_or(false);
            let null_removes = def
                .null_removes
                .or_else(|| def.store.as_ref().map(|store| store.null_removes()))
                .unwrap_or(false);

            let args: &[TransformArg] = def
                .transform
                .as_ref()
                .map(|transform| transform.args.as_slice())
                .unwrap_or(&[]);
            let relations = &tidied_inputs[index];

            let mut inputs = Vec::with_capacity(relations.len());
            for (position, (source, input_def)) in relations.iter().enumerate() {
                let arg = match args.get(position) {
                    Some(arg) => Some(arg),
                    None => match args.last() {
                        Some(last) if last.multiple => Some(last),
                        Some(_) => {
                            warn!(
                                "point '{}': input {} has no transform argument slot",
                                display_name, position
                            );
                            None
                        }
                        None => None,
                    },
                };

                let mut links = input_def.behaviors.clone();
                if links.is_empty() {
                    if let Some(arg) = arg {
                        links.extend(
                            arg.default_behaviors
                                .iter()
                                .cloned()
                                .map(PlanLink::inherited),
                        );
                    }
                }
                if !links
                    .iter()
                    .any(|link| link.entity.primary && !link.entity.synchronized)
                {
                    links.push(PlanLink::inherited(Arc::clone(&self.default_behavior)));
                }

                let required = input_def.params.get_bool(
                    PARAM_REQUIRED,
                    arg.map(|arg| arg.required).unwrap_or(true),
                );
                let source_def = &self.defs[source.index()];
                let relation = RelationRef {
                    result_point: PointIdx::new(index),
                    result_uuid: def.uuid,
                    result_name: def.name.clone(),
                    input_point: *source,
                    input_uuid: source_def.uuid,
                    input_name: source_def.name.clone(),
                    input_index: position,
                    sync: input_def.sync,
                    params: input_def.params.clone(),
                    control: input_def.control,
                    required,
                };
                let chain = BehaviorChain::activate(&links, relation)?;
                inputs.push(PointInput {
                    point: *source,
                    sync: input_def.sync,
                    params: input_def.params.clone(),
                    control: input_def.control,
                    chain,
                });
            }

            for (position, arg) in args.iter().enumerate() {
                if arg.required && position >= relations.len() {
                    warn!(
                        "point '{}': required transform argument {} has no input",
                        display_name, position
                    );
                }
            }

            points.push(Point {
                uuid: def.uuid,
                name: def.name.clone(),
                content: def.content.clone(),
                store: def.store.clone(),
                transform: def.transform.clone(),
                sync: def.sync,
                params: def.params.clone(),
                inputs,
                results: std::mem::take(&mut results[index]),
                replicates: std::mem::take(&mut tidied_replicates[index]),
                volatile: def.volatile,
                null_removes,
                recalc_latest,
                dropped: def.dropped,
                level: -1,
            });
        }

        // Level assignment with cycle detection.
        let mut busy = vec![false; count];
        for index in 0..count {
            if points[index].level < 0 {
                points[index].level = 0;
            }
            adjust_level(&mut points, index, &mut busy)?;
        }

        Ok(Metadata {
            points,
            by_uuid: self.by_uuid,
            by_name: self.by_name,
        })
    }
}

/// DFS pushing dependent levels up. Re-entering a busy point means the
/// dependency graph has a cycle.
fn adjust_level(points: &mut [Point], index: usize, busy: &mut [bool]) -> Result<(), ConfigError> {
    if busy[index] {
        return Err(ConfigError::DependencyCycle(points[index].display_name()));
    }
    busy[index] = true;
    let level = points[index].level;
    let results: Vec<usize> = points[index]
        .results
        .iter()
        .map(|result| result.index())
        .collect();
    for result in results {
        if points[result].level <= level {
            points[result].level = level + 1;
            adjust_level(points, result, busy)?;
        }
    }
    busy[index] = false;
    Ok(())
}

// ─── Metadata ─────────────────────────────────────────────────

/// The immutable point graph shared by every batch.
pub struct Metadata {
    points: Vec<Point>,
    by_uuid: HashMap<Uuid, PointIdx>,
    by_name: HashMap<String, PointIdx>,
}

impl Metadata {
    pub fn point(&self, idx: PointIdx) -> &Point {
        &self.points[idx.index()]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PointIdx, &Point)> {
        self.points
            .iter()
            .enumerate()
            .map(|(index, point)| (PointIdx::new(index), point))
    }

    pub fn resolve(&self, reference: &PointRef) -> Option<PointIdx> {
        match reference {
            PointRef::ByUuid(uuid) => self.by_uuid.get(uuid).copied(),
            PointRef::ByName(name) => self.by_name.get(&name.to_lowercase()).copied(),
            PointRef::Resolved { idx, .. } => Some(*idx),
        }
    }

    /// Resolves a value's point reference in place.
    pub fn restore(&self, value: &mut PointValue) -> Result<PointIdx, ConfigError> {
        let idx = self
            .resolve(value.point())
            .ok_or_else(|| ConfigError::UnknownPoint(value.point().to_string()))?;
        let point = self.point(idx);
        value
            .restore(point.uuid, point.name.as_deref(), idx)
            .map_err(|error| ConfigError::ReferenceMismatch(error.to_string()))?;
        Ok(idx)
    }

    /// Point order used by the batch engine: level, then UUID.
    pub fn points_in_order(&self) -> Vec<PointIdx> {
        let mut order: Vec<PointIdx> = (0..self.points.len()).map(PointIdx::new).collect();
        order.sort_by_key(|idx| (self.point(*idx).level, self.point(*idx).uuid));
        order
    }

    /// A value is cacheable only once resolved, and only for points that
    /// are not volatile.
    pub fn is_cacheable(&self, value: &PointValue) -> bool {
        value
            .point()
            .idx()
            .map(|idx| !self.point(idx).volatile)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transform::PassthroughTransform;

    fn entity(store: Arc<MemoryStore>) -> Arc<StoreEntity> {
        Arc::new(StoreEntity::new("test-store", store))
    }

    fn passthrough() -> Arc<TransformEntity> {
        Arc::new(
            TransformEntity::new("passthrough", Arc::new(PassthroughTransform))
                .with_arg(TransformArg::required()),
        )
    }

    fn chained(names: &[&str]) -> Metadata {
        let mut builder = MetadataBuilder::new();
        for (position, name) in names.iter().enumerate() {
            let mut def = PointDef::named(*name);
            if position > 0 {
                def.transform = Some(passthrough());
                def.inputs
                    .push(InputDef::new(PointRef::ByName(names[position - 1].into())));
            }
            builder.add_point(def).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn levels_follow_dependencies() {
        let metadata = chained(&["a", "b", "c"]);
        let a = metadata.resolve(&PointRef::ByName("a".into())).unwrap();
        let b = metadata.resolve(&PointRef::ByName("b".into())).unwrap();
        let c = metadata.resolve(&PointRef::ByName("c".into())).unwrap();
        assert_eq!(metadata.point(a).level(), 0);
        assert_eq!(metadata.point(b).level(), 1);
        assert_eq!(metadata.point(c).level(), 2);
        assert!(metadata.point(b).level() > metadata.point(a).level());

        // Back-links: a knows b as a result.
        assert_eq!(metadata.point(a).results(), [b]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut builder = MetadataBuilder::new();
        for (name, input) in [("p1", "p2"), ("p2", "p3"), ("p3", "p1")] {
            let mut def = PointDef::named(name);
            def.transform = Some(passthrough());
            def.inputs.push(InputDef::new(PointRef::ByName(input.into())));
            builder.add_point(def).unwrap();
        }
        let error = builder.build().err().expect("cycle must fail the load");
        match error {
            ConfigError::DependencyCycle(point) => {
                assert!(["p1", "p2", "p3"].contains(&point.as_str()))
            }
            other => panic!("expected a cycle error, got {other}"),
        }
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let mut builder = MetadataBuilder::new();
        let mut def = PointDef::named("orphan");
        def.inputs
            .push(InputDef::new(PointRef::ByName("missing".into())));
        builder.add_point(def).unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::DanglingReference(_))
        ));
    }

    #[test]
    fn replicate_to_self_is_rejected() {
        let mut builder = MetadataBuilder::new();
        let mut def = PointDef::named("echo");
        def.replicates
            .push(ReplicateDef::new(PointRef::ByName("echo".into())));
        builder.add_point(def).unwrap();
        assert!(matches!(builder.build(), Err(ConfigError::SelfReplicate(_))));
    }

    #[test]
    fn duplicate_primary_behavior_is_rejected() {
        let mut builder = MetadataBuilder::new();
        builder.add_point(PointDef::named("src")).unwrap();
        let mut def = PointDef::named("dst");
        let mut input = InputDef::new(PointRef::ByName("src".into()));
        input.behaviors.push(PlanLink::declared(Triggers::entity()));
        input.behaviors.push(PlanLink::declared(Triggers::entity()));
        def.inputs.push(input);
        builder.add_point(def).unwrap();
        assert!(matches!(
            builder.build(),
            Err(ConfigError::MultiplePrimary { .. })
        ));
    }

    #[test]
    fn null_removes_inherits_from_the_store() {
        let store = entity(Arc::new(MemoryStore::with_null_removes(true)));

        let mut builder = MetadataBuilder::new();
        let mut inheriting = PointDef::named("inheriting");
        inheriting.store = Some(Arc::clone(&store));
        let inheriting = builder.add_point(inheriting).unwrap();
        let mut overriding = PointDef::named("overriding");
        overriding.store = Some(store);
        overriding.null_removes = Some(false);
        let overriding = builder.add_point(overriding).unwrap();
        let metadata = builder.build().unwrap();

        assert!(metadata.point(inheriting).null_removes());
        assert!(!metadata.point(overriding).null_removes());
    }

    #[test]
    fn dropped_source_removes_the_relation() {
        let mut builder = MetadataBuilder::new();
        let mut dropped = PointDef::named("gone");
        dropped.dropped = true;
        builder.add_point(dropped).unwrap();
        let mut def = PointDef::named("kept");
        def.inputs.push(InputDef::new(PointRef::ByName("gone".into())));
        builder.add_point(def).unwrap();
        let metadata = builder.build().unwrap();

        let kept = metadata.resolve(&PointRef::ByName("kept".into())).unwrap();
        assert!(metadata.point(kept).inputs().is_empty());
    }

    #[test]
    fn cacheable_needs_resolution_and_a_stable_point() {
        let mut builder = MetadataBuilder::new();
        let mut jumpy = PointDef::named("jumpy");
        jumpy.volatile = true;
        builder.add_point(jumpy).unwrap();
        builder.add_point(PointDef::named("steady")).unwrap();
        let metadata = builder.build().unwrap();

        let make = |name: &str| {
            let mut value = PointValue::new(
                PointRef::ByName(name.into()),
                Some(chrono::DateTime::from_timestamp(0, 0).unwrap()),
                relval_base::Value::Null,
                relval_base::Value::Null,
            );
            metadata.restore(&mut value).unwrap();
            value
        };
        assert!(metadata.is_cacheable(&make("steady")));
        assert!(!metadata.is_cacheable(&make("jumpy")));

        // Unresolved references are never cacheable.
        let lazy = PointValue::new(
            PointRef::ByName("steady".into()),
            None,
            relval_base::Value::Null,
            relval_base::Value::Null,
        );
        assert!(!metadata.is_cacheable(&lazy));
    }

    #[test]
    fn restore_resolves_and_checks_identity() {
        let metadata = chained(&["a", "b"]);
        let mut value = PointValue::new(
            PointRef::ByName("A".into()),
            Some(chrono::DateTime::from_timestamp(0, 0).unwrap()),
            relval_base::Value::Null,
            relval_base::Value::Null,
        );
        let idx = metadata.restore(&mut value).unwrap();
        assert_eq!(metadata.point(idx).name(), Some("a"));
        assert!(value.point().is_resolved());

        let mut unknown = PointValue::new(
            PointRef::ByName("nobody".into()),
            None,
            relval_base::Value::Null,
            relval_base::Value::Null,
        );
        assert!(matches!(
            metadata.restore(&mut unknown),
            Err(ConfigError::UnknownPoint(_))
        ));
    }
}
