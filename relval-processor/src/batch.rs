//! Per-batch working context: the value cache, the store-query coalescer,
//! the update queue and the result-value de-duplication.

use crate::error::MemoryLimitError;
use crate::metadata::Metadata;
use crate::store::{StoreValues, StoreValuesQuery};
use chrono::{DateTime, Utc};
use relval_base::{PointRef, PointValue, ResultValue, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Point values a batch may hold before asking the caller to split.
    pub value_limit: usize,
    /// Upper bound on the look-up passes of a convergence loop.
    pub lookup_pass_limit: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            value_limit: 100_000,
            lookup_pass_limit: 10,
        }
    }
}

/// Identity of a registered result: level, point and stamp. The natural
/// order of the key set is the topological processing order.
pub type ResultKey = (i32, Uuid, DateTime<Utc>);

/// A processor invocation's working context.
pub struct Batch {
    metadata: Arc<Metadata>,
    config: BatchConfig,
    cache: HashMap<Uuid, BTreeMap<DateTime<Utc>, PointValue>>,
    /// Queries already queued or flushed; a repeat is never re-issued.
    answered: HashSet<StoreValuesQuery>,
    pending: Vec<StoreValuesQuery>,
    /// Ordered by point then stamp; an empty slot is the disabled-update
    /// sentinel suppressing output for this pass.
    updates: BTreeMap<(Uuid, Option<DateTime<Utc>>), Option<PointValue>>,
    results: BTreeMap<ResultKey, ResultValue>,
    lookup_pass: u32,
    cutoff: Option<DateTime<Utc>>,
    signals: Vec<(String, Value)>,
    held: usize,
}

impl Batch {
    pub fn new(metadata: Arc<Metadata>, config: BatchConfig, cutoff: Option<DateTime<Utc>>) -> Self {
        Self {
            metadata,
            config,
            cache: HashMap::new(),
            answered: HashSet::new(),
            pending: Vec::new(),
            updates: BTreeMap::new(),
            results: BTreeMap::new(),
            lookup_pass: 1,
            cutoff,
            signals: Vec::new(),
            held: 0,
        }
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.cutoff
    }

    // ── Notices ──

    /// Resolves and caches the notices, subject to the cutoff. Raises the
    /// memory limit to make the driver retry with a smaller sub-batch.
    pub fn accept_notices(
        &mut self,
        notices: Vec<PointValue>,
    ) -> Result<Vec<PointValue>, MemoryLimitError> {
        let mut accepted = Vec::with_capacity(notices.len());
        for notice in notices {
            // The batch owns its working copy; the incoming value may be a
            // frozen snapshot from a store or an earlier batch.
            let mut notice = notice.thawed();
            if let Err(error) = self.metadata.restore(&mut notice) {
                warn!("notice skipped: {error}");
                continue;
            }
            let Some(stamp) = notice.stamp() else {
                warn!("notice for '{}' skipped: no stamp", notice.point());
                continue;
            };
            if self.cutoff.is_some_and(|cutoff| stamp > cutoff) {
                debug!("notice for '{}' is past the cutoff", notice.point());
                continue;
            }
            self.reserve(1)?;
            let notice = notice.into_frozen();
            self.cache_value(notice.clone());
            accepted.push(notice);
        }
        Ok(accepted)
    }

    fn reserve(&mut self, count: usize) -> Result<(), MemoryLimitError> {
        if self.held + count > self.config.value_limit {
            return Err(MemoryLimitError {
                held: self.held,
                limit: self.config.value_limit,
            });
        }
        self.held += count;
        Ok(())
    }

    // ── Value cache ──

    fn cache_value(&mut self, value: PointValue) {
        let Some(uuid) = value.point().uuid() else {
            debug_assert!(false, "caching an unresolved value");
            return;
        };
        let Some(stamp) = value.stamp() else { return };
        self.cache.entry(uuid).or_default().insert(stamp, value);
    }

    pub fn has_point_value(&self, point: Uuid, stamp: DateTime<Utc>) -> bool {
        self.cache
            .get(&point)
            .is_some_and(|series| series.contains_key(&stamp))
    }

    pub fn point_value_at(&self, point: Uuid, stamp: DateTime<Utc>) -> Option<PointValue> {
        self.cache
            .get(&point)
            .and_then(|series| series.get(&stamp))
            .cloned()
    }

    /// The best cached match: the latest value satisfying the query, or a
    /// synthetic stand-in (with no stamp) when nothing concrete is known.
    pub fn get_point_value(&self, query: &StoreValuesQuery) -> PointValue {
        self.get_point_values(query)
            .pop()
            .unwrap_or_else(|| PointValue::null(self.point_ref(query.point)))
    }

    /// All cached values satisfying the query, in stamp order.
    pub fn get_point_values(&self, query: &StoreValuesQuery) -> Vec<PointValue> {
        self.cache
            .get(&query.point)
            .map(|series| {
                series
                    .iter()
                    .filter(|(stamp, value)| {
                        query.interval.contains(**stamp)
                            && query.sync.is_none_or(|sync| sync.is_in_sync(**stamp))
                            && !(query.not_null && value.value().is_null())
                    })
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn point_ref(&self, uuid: Uuid) -> PointRef {
        match self.metadata.resolve(&PointRef::ByUuid(uuid)) {
            Some(idx) => PointRef::Resolved {
                idx,
                uuid,
                name: self.metadata.point(idx).name().map(str::to_string),
            },
            None => PointRef::ByUuid(uuid),
        }
    }

    // ── Pending store queries ──

    /// Queues a store query for the next flush, coalescing overlaps.
    /// Returns false when an identical query was already issued.
    pub fn add_store_values_query(&mut self, query: StoreValuesQuery) -> bool {
        if !self.answered.insert(query.clone()) {
            return false;
        }
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|pending| pending.coalesces_with(&query))
        {
            pending.interval = pending.interval.merge(&query.interval);
        } else {
            self.pending.push(query);
        }
        true
    }

    pub fn has_pending_queries(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn take_pending_queries(&mut self) -> Vec<StoreValuesQuery> {
        std::mem::take(&mut self.pending)
    }

    /// Caches a store answer. Unresolvable values are skipped with a
    /// warning.
    pub fn add_store_values(&mut self, values: StoreValues) {
        for value in values.values {
            let mut value = value.thawed();
            if let Err(error) = self.metadata.restore(&mut value) {
                warn!("store value skipped: {error}");
                continue;
            }
            self.held += 1;
            self.cache_value(value.into_frozen());
        }
    }

    // ── Result set ──

    /// Registers a result value, de-duplicating on (point, stamp) so that
    /// several behaviors triggering the same result share one entry.
    /// Returns true when the result is new.
    pub fn set_up_result_value(&mut self, result: ResultValue, caller: &str) -> bool {
        let Some(key) = self.result_key(&result) else {
            return false;
        };
        if self.cutoff.is_some_and(|cutoff| key.2 > cutoff) {
            debug!("{caller}: result past the cutoff refused");
            return false;
        }
        if self.results.contains_key(&key) {
            trace!("{caller}: result already set up");
            return false;
        }
        self.results.insert(key, result);
        true
    }

    /// Substitutes a result, e.g. when a behavior escalates the variant.
    pub fn replace_result_value(&mut self, result: ResultValue, caller: &str) {
        let Some(key) = self.result_key(&result) else {
            return;
        };
        trace!("{caller}: result replaced");
        self.results.insert(key, result);
    }

    fn result_key(&self, result: &ResultValue) -> Option<ResultKey> {
        let point = result.point_value().point();
        let idx = point.idx()?;
        let stamp = result.point_value().stamp()?;
        Some((self.metadata.point(idx).level(), point.uuid()?, stamp))
    }

    /// Registered result identities in topological order.
    pub fn result_keys(&self) -> Vec<ResultKey> {
        self.results.keys().copied().collect()
    }

    pub fn take_result(&mut self, key: &ResultKey) -> Option<ResultValue> {
        self.results.remove(key)
    }

    pub fn put_result(&mut self, result: ResultValue) {
        if let Some(key) = self.result_key(&result) {
            self.results.insert(key, result);
        }
    }

    // ── Look-up passes ──

    pub fn lookup_pass(&self) -> u32 {
        self.lookup_pass
    }

    pub fn next_lookup_pass(&mut self) -> u32 {
        self.lookup_pass += 1;
        self.lookup_pass
    }

    pub fn lookup_pass_limit(&self) -> u32 {
        self.config.lookup_pass_limit
    }

    // ── Update queue ──

    pub fn schedule_update(&mut self, update: PointValue) {
        let Some(uuid) = update.point().uuid() else {
            debug_assert!(false, "scheduling an update without a UUID");
            return;
        };
        let key = (uuid, update.stamp());
        match self.updates.get(&key) {
            // The disabled sentinel wins for the rest of the pass.
            Some(None) => trace!("update for {} suppressed", update.point()),
            _ => {
                self.updates.insert(key, Some(update));
            }
        }
    }

    /// Suppresses any update for this point and stamp for the rest of the
    /// pass.
    pub fn disable_update(&mut self, point: Uuid, stamp: Option<DateTime<Utc>>) {
        self.updates.insert((point, stamp), None);
    }

    /// A snapshot of the active updates, in emission order.
    pub fn scheduled_updates(&self) -> Vec<PointValue> {
        self.updates.values().flatten().cloned().collect()
    }

    /// Drains the active updates, frozen, ordered by point then stamp.
    pub fn drain_updates(&mut self) -> Vec<PointValue> {
        std::mem::take(&mut self.updates)
            .into_values()
            .flatten()
            .map(PointValue::into_frozen)
            .collect()
    }

    // ── Signals ──

    /// Side-channel notification for the service host.
    pub fn add_signal(&mut self, name: impl Into<String>, info: Value) {
        self.signals.push((name.into(), info));
    }

    pub fn take_signals(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InputDef, MetadataBuilder, PointDef, TransformArg, TransformEntity};
    use crate::transform::PassthroughTransform;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn two_point_metadata() -> Arc<Metadata> {
        let mut builder = MetadataBuilder::new();
        builder.add_point(PointDef::named("input")).unwrap();
        let mut result = PointDef::named("result");
        result.transform = Some(Arc::new(
            TransformEntity::new("passthrough", Arc::new(PassthroughTransform))
                .with_arg(TransformArg::required()),
        ));
        result
            .inputs
            .push(InputDef::new(PointRef::ByName("input".into())));
        builder.add_point(result).unwrap();
        Arc::new(builder.build().unwrap())
    }

    fn notice(metadata: &Metadata, name: &str, seconds: i64, value: f64) -> PointValue {
        let idx = metadata.resolve(&PointRef::ByName(name.into())).unwrap();
        let point = metadata.point(idx);
        PointValue::new(
            PointRef::Resolved {
                idx,
                uuid: point.uuid(),
                name: point.name().map(str::to_string),
            },
            Some(at(seconds)),
            Value::Null,
            Value::Double(value),
        )
    }

    #[test]
    fn notices_are_cached_and_frozen() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);
        let uuid = notice(&metadata, "input", 100, 5.0).point().uuid().unwrap();

        let accepted = batch
            .accept_notices(vec![notice(&metadata, "input", 100, 5.0)])
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].is_frozen());
        assert!(batch.has_point_value(uuid, at(100)));
    }

    #[test]
    fn memory_limit_fires_on_too_many_notices() {
        let metadata = two_point_metadata();
        let config = BatchConfig {
            value_limit: 2,
            ..BatchConfig::default()
        };
        let mut batch = Batch::new(Arc::clone(&metadata), config, None);
        let notices: Vec<PointValue> = (0..3)
            .map(|index| notice(&metadata, "input", index, index as f64))
            .collect();
        assert!(batch.accept_notices(notices).is_err());
    }

    #[test]
    fn cutoff_refuses_late_notices_and_results() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), Some(at(100)));

        let accepted = batch
            .accept_notices(vec![
                notice(&metadata, "input", 50, 1.0),
                notice(&metadata, "input", 150, 2.0),
            ])
            .unwrap();
        assert_eq!(accepted.len(), 1);

        let late = ResultValue::new(notice(&metadata, "result", 150, 0.0));
        assert!(!batch.set_up_result_value(late, "test"));
    }

    #[test]
    fn results_deduplicate_by_identity() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);

        let result = ResultValue::new(notice(&metadata, "result", 100, 0.0));
        assert!(batch.set_up_result_value(result.morph(None, None), "first"));
        assert!(!batch.set_up_result_value(result, "second"));
        assert_eq!(batch.result_keys().len(), 1);
    }

    #[test]
    fn identical_queries_are_issued_once() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);
        let uuid = notice(&metadata, "input", 0, 0.0).point().uuid().unwrap();

        assert!(batch.add_store_values_query(StoreValuesQuery::at(uuid, at(10))));
        assert!(!batch.add_store_values_query(StoreValuesQuery::at(uuid, at(10))));
        assert_eq!(batch.take_pending_queries().len(), 1);
        // Still answered after the flush.
        assert!(!batch.add_store_values_query(StoreValuesQuery::at(uuid, at(10))));
    }

    #[test]
    fn overlapping_queries_coalesce() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);
        let uuid = notice(&metadata, "input", 0, 0.0).point().uuid().unwrap();

        let mut early = StoreValuesQuery::at(uuid, at(0));
        early.interval.not_after = Some(at(60));
        let mut late = StoreValuesQuery::at(uuid, at(30));
        late.interval.not_after = Some(at(90));
        assert!(batch.add_store_values_query(early));
        assert!(batch.add_store_values_query(late));

        let pending = batch.take_pending_queries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].interval.not_before, Some(at(0)));
        assert_eq!(pending[0].interval.not_after, Some(at(90)));
    }

    #[test]
    fn updates_flush_in_point_then_stamp_order() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);

        batch.schedule_update(notice(&metadata, "result", 200, 2.0));
        batch.schedule_update(notice(&metadata, "result", 100, 1.0));
        batch.schedule_update(notice(&metadata, "input", 300, 3.0));

        let updates = batch.drain_updates();
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(PointValue::is_frozen));
        let keys: Vec<(Uuid, DateTime<Utc>)> = updates
            .iter()
            .map(|update| (update.point().uuid().unwrap(), update.stamp().unwrap()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn disabled_update_suppresses_later_schedules() {
        let metadata = two_point_metadata();
        let mut batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);
        let update = notice(&metadata, "result", 100, 1.0);
        let uuid = update.point().uuid().unwrap();

        batch.disable_update(uuid, Some(at(100)));
        batch.schedule_update(update);
        assert!(batch.drain_updates().is_empty());
    }

    #[test]
    fn stand_in_for_unknown_values() {
        let metadata = two_point_metadata();
        let batch = Batch::new(Arc::clone(&metadata), BatchConfig::default(), None);
        let uuid = notice(&metadata, "input", 0, 0.0).point().uuid().unwrap();

        let stand_in = batch.get_point_value(&StoreValuesQuery::at(uuid, at(5)));
        assert!(stand_in.is_null());
        assert!(stand_in.stamp().is_none());
        assert!(stand_in.point().is_resolved());
    }
}
