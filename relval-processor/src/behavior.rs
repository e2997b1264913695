//! Per-input behavior chains.
//!
//! At graph time a relation carries only `PlanLink`s: references to
//! behavior entities plus an inherited flag. Activation turns the plan
//! into a `BehaviorChain` of live `Behavior` instances, with the single
//! primary behavior moved to the front. The batch engine only ever sees
//! activated chains.

use crate::batch::Batch;
use crate::error::ConfigError;
use crate::params::Params;
use crate::store::StoreValuesQuery;
use chrono::{DateTime, Utc};
use relval_base::{PointIdx, PointRef, PointValue, ResultValue, Sync, Value};
use std::sync::Arc;
use uuid::Uuid;

// ─── Entities and plans ───────────────────────────────────────

/// Factory producing live behavior instances for an entity.
pub trait BehaviorMaker: Send + std::marker::Sync {
    fn make(&self) -> Box<dyn Behavior>;
}

/// A behavior as the metadata knows it, before activation.
pub struct BehaviorEntity {
    pub name: String,
    pub primary: bool,
    pub synchronized: bool,
    pub maker: Arc<dyn BehaviorMaker>,
}

impl std::fmt::Debug for BehaviorEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorEntity")
            .field("name", &self.name)
            .field("primary", &self.primary)
            .field("synchronized", &self.synchronized)
            .finish()
    }
}

/// One link of a graph-time behavior plan.
#[derive(Clone, Debug)]
pub struct PlanLink {
    pub entity: Arc<BehaviorEntity>,
    pub inherited: bool,
}

impl PlanLink {
    pub fn declared(entity: Arc<BehaviorEntity>) -> Self {
        Self {
            entity,
            inherited: false,
        }
    }

    pub fn inherited(entity: Arc<BehaviorEntity>) -> Self {
        Self {
            entity,
            inherited: true,
        }
    }
}

// ─── Relation context ─────────────────────────────────────────

/// Everything a behavior needs to know about its input relation.
#[derive(Clone, Debug)]
pub struct RelationRef {
    pub result_point: PointIdx,
    pub result_uuid: Uuid,
    pub result_name: Option<String>,
    pub input_point: PointIdx,
    pub input_uuid: Uuid,
    pub input_name: Option<String>,
    /// Position of this relation among the result point's inputs.
    pub input_index: usize,
    pub sync: Option<Sync>,
    pub params: Params,
    pub control: bool,
    pub required: bool,
}

impl RelationRef {
    pub fn result_ref(&self) -> PointRef {
        PointRef::Resolved {
            idx: self.result_point,
            uuid: self.result_uuid,
            name: self.result_name.clone(),
        }
    }

    pub fn input_ref(&self) -> PointRef {
        PointRef::Resolved {
            idx: self.input_point,
            uuid: self.input_uuid,
            name: self.input_name.clone(),
        }
    }
}

// ─── Behavior protocol ────────────────────────────────────────

/// Runtime protocol of an activated behavior.
///
/// The two-phase prepare/act pattern is a convergence protocol: a prepare
/// call may issue store queries and return false; the engine flushes the
/// queries and retries until every prepare returns true.
pub trait Behavior: Send + std::marker::Sync {
    fn name(&self) -> &str;

    fn is_primary(&self) -> bool {
        false
    }

    fn is_synchronized(&self) -> bool {
        false
    }

    /// Whether this behavior was inherited from a transform argument or a
    /// default rather than declared on the relation.
    fn is_inherited(&self) -> bool {
        false
    }

    fn set_up(&mut self, relation: &RelationRef, inherited: bool) -> Result<(), ConfigError>;

    fn prepare_trigger(&self, _notice: &PointValue, _batch: &mut Batch) -> bool {
        true
    }

    fn trigger(&self, _notice: &PointValue, _batch: &mut Batch) {}

    fn prepare_select(&self, _result: &ResultValue, _batch: &mut Batch) -> bool {
        true
    }

    /// Pulls this relation's input into the result. False leaves the
    /// result unfilled.
    fn select(&self, _result: &mut ResultValue, _batch: &mut Batch) -> bool {
        true
    }

    fn is_input_required(&self) -> bool {
        false
    }

    fn is_input_interpolated(&self) -> bool {
        false
    }

    fn is_input_extrapolated(&self) -> bool {
        false
    }

    fn is_input_valid(&self, _input: &PointValue, _result: &ResultValue) -> bool {
        true
    }

    /// Whether the notice already stands for the fetched result value.
    fn is_result_fetched(&self, notice: &PointValue, result: &ResultValue) -> bool {
        notice == result.point_value()
    }

    /// A fresh result value for this relation's result point, when this
    /// behavior specializes the variant.
    fn new_result_value(&self, _stamp: DateTime<Utc>) -> Option<ResultValue> {
        None
    }
}

// ─── Chain ────────────────────────────────────────────────────

/// An activated behavior chain for one input relation. The primary
/// behavior is always first.
pub struct BehaviorChain {
    behaviors: Vec<Box<dyn Behavior>>,
    relation: RelationRef,
}

impl BehaviorChain {
    /// Activates a plan: selects the primary, moves it first, then
    /// instantiates and sets up every link in order.
    pub fn activate(links: &[PlanLink], relation: RelationRef) -> Result<Self, ConfigError> {
        let point = relation
            .result_name
            .clone()
            .unwrap_or_else(|| relation.result_uuid.to_string());

        let mut primary = None;
        for (index, link) in links.iter().enumerate() {
            if !link.entity.synchronized && link.entity.primary {
                if primary.is_some() {
                    return Err(ConfigError::MultiplePrimary {
                        point,
                        input: relation.input_index,
                    });
                }
                primary = Some(index);
            }
        }
        let Some(primary) = primary else {
            return Err(ConfigError::MissingPrimary {
                point,
                input: relation.input_index,
            });
        };

        let mut ordered: Vec<&PlanLink> = Vec::with_capacity(links.len());
        ordered.push(&links[primary]);
        ordered.extend(
            links
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != primary)
                .map(|(_, link)| link),
        );

        let mut behaviors = Vec::with_capacity(ordered.len());
        for link in ordered {
            let mut behavior = link.entity.maker.make();
            behavior.set_up(&relation, link.inherited)?;
            behaviors.push(behavior);
        }
        Ok(Self {
            behaviors,
            relation,
        })
    }

    pub fn relation(&self) -> &RelationRef {
        &self.relation
    }

    pub fn primary(&self) -> &dyn Behavior {
        self.behaviors[0].as_ref()
    }

    pub fn prepare_trigger(&self, notice: &PointValue, batch: &mut Batch) -> bool {
        self.behaviors
            .iter()
            .all(|behavior| behavior.prepare_trigger(notice, batch))
    }

    pub fn trigger(&self, notice: &PointValue, batch: &mut Batch) {
        for behavior in &self.behaviors {
            behavior.trigger(notice, batch);
        }
    }

    pub fn prepare_select(&self, result: &ResultValue, batch: &mut Batch) -> bool {
        self.behaviors
            .iter()
            .all(|behavior| behavior.prepare_select(result, batch))
    }

    /// Runs every behavior's select, then validates the filled input
    /// against the whole chain.
    pub fn select(&self, result: &mut ResultValue, batch: &mut Batch) -> bool {
        for behavior in &self.behaviors {
            if !behavior.select(result, batch) {
                return false;
            }
        }
        if let Some(input) = result.inputs().get(self.relation.input_index) {
            if !input.is_null() && !self.is_input_valid(input, result) {
                if self.is_input_required() {
                    return false;
                }
                let blank = PointValue::null(self.relation.input_ref());
                result.set_input(self.relation.input_index, blank);
            }
        }
        true
    }

    pub fn is_input_required(&self) -> bool {
        self.behaviors
            .iter()
            .any(|behavior| behavior.is_input_required())
    }

    pub fn is_input_valid(&self, input: &PointValue, result: &ResultValue) -> bool {
        self.behaviors
            .iter()
            .all(|behavior| behavior.is_input_valid(input, result))
    }

    pub fn is_result_fetched(&self, notice: &PointValue, result: &ResultValue) -> bool {
        self.behaviors
            .iter()
            .any(|behavior| behavior.is_result_fetched(notice, result))
    }

    pub fn new_result_value(&self, stamp: DateTime<Utc>) -> ResultValue {
        self.behaviors
            .iter()
            .find_map(|behavior| behavior.new_result_value(stamp))
            .unwrap_or_else(|| {
                ResultValue::new(PointValue::new(
                    self.relation.result_ref(),
                    Some(stamp),
                    Value::Null,
                    Value::Null,
                ))
            })
    }
}

impl std::fmt::Debug for BehaviorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.behaviors.iter().map(|behavior| behavior.name()).collect();
        f.debug_struct("BehaviorChain")
            .field("behaviors", &names)
            .finish()
    }
}

// ─── Stock behavior: Triggers ─────────────────────────────────

/// The default primary behavior: a notice on the input triggers the
/// result at the notice stamp, and select pulls the input value at the
/// result stamp.
#[derive(Default)]
pub struct Triggers {
    relation: Option<RelationRef>,
    inherited: bool,
    required: bool,
}

impl Triggers {
    pub fn entity() -> Arc<BehaviorEntity> {
        Arc::new(BehaviorEntity {
            name: "Triggers".to_string(),
            primary: true,
            synchronized: false,
            maker: Arc::new(TriggersMaker),
        })
    }

    fn relation(&self) -> &RelationRef {
        self.relation.as_ref().expect("behavior set up")
    }
}

struct TriggersMaker;

impl BehaviorMaker for TriggersMaker {
    fn make(&self) -> Box<dyn Behavior> {
        Box::<Triggers>::default()
    }
}

impl Behavior for Triggers {
    fn name(&self) -> &str {
        "Triggers"
    }

    fn is_primary(&self) -> bool {
        true
    }

    fn set_up(&mut self, relation: &RelationRef, inherited: bool) -> Result<(), ConfigError> {
        self.required = relation.required;
        self.relation = Some(relation.clone());
        self.inherited = inherited;
        Ok(())
    }

    fn is_inherited(&self) -> bool {
        self.inherited
    }

    fn trigger(&self, notice: &PointValue, batch: &mut Batch) {
        let Some(stamp) = notice.stamp() else { return };
        let result = self.new_result_value(stamp).expect("primary result");
        batch.set_up_result_value(result, self.name());
    }

    fn prepare_select(&self, result: &ResultValue, batch: &mut Batch) -> bool {
        let Some(stamp) = result.point_value().stamp() else {
            return true;
        };
        let relation = self.relation();
        if batch.has_point_value(relation.input_uuid, stamp) {
            return true;
        }
        // Newly queued: wait for the flush. Already answered: give up.
        !batch.add_store_values_query(StoreValuesQuery::at(relation.input_uuid, stamp))
    }

    fn select(&self, result: &mut ResultValue, batch: &mut Batch) -> bool {
        let Some(stamp) = result.point_value().stamp() else {
            return false;
        };
        let relation = self.relation();
        match batch.point_value_at(relation.input_uuid, stamp) {
            Some(input) => {
                result.set_input(relation.input_index, input);
                true
            }
            None if self.required => false,
            None => {
                result.set_input(
                    relation.input_index,
                    PointValue::null(relation.input_ref()),
                );
                true
            }
        }
    }

    fn is_input_required(&self) -> bool {
        self.required
    }

    fn new_result_value(&self, stamp: DateTime<Utc>) -> Option<ResultValue> {
        Some(ResultValue::new(PointValue::new(
            self.relation().result_ref(),
            Some(stamp),
            Value::Null,
            Value::Null,
        )))
    }
}

// ─── Stock behavior: Synchronized ─────────────────────────────

/// Non-primary behavior constraining input stamps to the relation's sync
/// grid.
#[derive(Default)]
pub struct Synchronized {
    relation: Option<RelationRef>,
    inherited: bool,
}

impl Synchronized {
    pub fn entity() -> Arc<BehaviorEntity> {
        Arc::new(BehaviorEntity {
            name: "Synchronized".to_string(),
            primary: false,
            synchronized: true,
            maker: Arc::new(SynchronizedMaker),
        })
    }
}

struct SynchronizedMaker;

impl BehaviorMaker for SynchronizedMaker {
    fn make(&self) -> Box<dyn Behavior> {
        Box::<Synchronized>::default()
    }
}

impl Behavior for Synchronized {
    fn name(&self) -> &str {
        "Synchronized"
    }

    fn is_synchronized(&self) -> bool {
        true
    }

    fn set_up(&mut self, relation: &RelationRef, inherited: bool) -> Result<(), ConfigError> {
        self.relation = Some(relation.clone());
        self.inherited = inherited;
        Ok(())
    }

    fn is_inherited(&self) -> bool {
        self.inherited
    }

    fn is_input_valid(&self, input: &PointValue, _result: &ResultValue) -> bool {
        let sync = self
            .relation
            .as_ref()
            .and_then(|relation| relation.sync);
        match (sync, input.stamp()) {
            (Some(sync), Some(stamp)) => sync.is_in_sync(stamp),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn relation(sync: Option<Sync>) -> RelationRef {
        RelationRef {
            result_point: PointIdx::new(1),
            result_uuid: Uuid::from_u128(1),
            result_name: Some("result".into()),
            input_point: PointIdx::new(0),
            input_uuid: Uuid::from_u128(2),
            input_name: Some("input".into()),
            input_index: 0,
            sync,
            params: Params::new(),
            control: false,
            required: true,
        }
    }

    #[test]
    fn activation_moves_the_primary_first() {
        let links = [
            PlanLink::declared(Synchronized::entity()),
            PlanLink::inherited(Triggers::entity()),
        ];
        let chain = BehaviorChain::activate(&links, relation(None)).unwrap();
        assert!(chain.primary().is_primary());
        assert_eq!(chain.primary().name(), "Triggers");
        assert!(chain.primary().is_inherited());
        assert!(chain.is_input_required());
    }

    #[test]
    fn activation_requires_a_primary() {
        let links = [PlanLink::declared(Synchronized::entity())];
        assert!(matches!(
            BehaviorChain::activate(&links, relation(None)),
            Err(ConfigError::MissingPrimary { .. })
        ));
    }

    #[test]
    fn activation_rejects_duplicate_primaries() {
        let links = [
            PlanLink::declared(Triggers::entity()),
            PlanLink::declared(Triggers::entity()),
        ];
        assert!(matches!(
            BehaviorChain::activate(&links, relation(None)),
            Err(ConfigError::MultiplePrimary { .. })
        ));
    }

    #[test]
    fn synchronized_validates_input_stamps_against_the_grid() {
        let sync = Sync::new(Duration::minutes(1));
        let links = [
            PlanLink::declared(Triggers::entity()),
            PlanLink::declared(Synchronized::entity()),
        ];
        let chain = BehaviorChain::activate(&links, relation(Some(sync))).unwrap();

        let on_grid = PointValue::new(
            PointRef::ByUuid(Uuid::from_u128(2)),
            Some(chrono::DateTime::from_timestamp(120, 0).unwrap()),
            Value::Null,
            Value::Double(1.0),
        );
        let off_grid = on_grid
            .clone()
            .morph(None, Some(chrono::DateTime::from_timestamp(90, 0).unwrap()));
        let result = chain.new_result_value(chrono::DateTime::from_timestamp(120, 0).unwrap());

        assert!(chain.is_input_valid(&on_grid, &result));
        assert!(!chain.is_input_valid(&off_grid, &result));
    }
}
