//! The batch driver: ingests notices, walks the dependency graph through
//! the behavior chains, applies transforms and flushes the updates.

use crate::batch::{Batch, BatchConfig, ResultKey};
use crate::error::ProcessingError;
use crate::metadata::{Metadata, StoreEntity};
use crate::params::PARAM_FAIL_RETURNS_NULL;
use crate::store::StoreValuesQuery;
use chrono::{DateTime, Utc};
use relval_base::{PointIdx, PointRef, PointValue, ResultValue, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct ProcessorConfig {
    pub batch: BatchConfig,
}

/// The processor entry point. Holds the immutable metadata; each
/// `process` call runs one batch.
///
/// Cancellation is cooperative in the async sense: dropping the returned
/// future abandons the batch and releases its working set.
pub struct Processor {
    metadata: Arc<Metadata>,
    config: ProcessorConfig,
    cutoff: Option<DateTime<Utc>>,
}

impl Processor {
    pub fn new(metadata: Arc<Metadata>) -> Self {
        Self::with_config(metadata, ProcessorConfig::default())
    }

    pub fn with_config(metadata: Arc<Metadata>, config: ProcessorConfig) -> Self {
        Self {
            metadata,
            config,
            cutoff: None,
        }
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Upper bound past which batches refuse to generate triggers.
    pub fn set_cutoff(&mut self, cutoff: Option<DateTime<Utc>>) {
        self.cutoff = cutoff;
    }

    /// Reads the cutoff from a clock value (epoch milliseconds), the form
    /// in which wall-clock-driven hosts convey it.
    pub fn set_cutoff_value(&mut self, value: &PointValue) {
        self.cutoff = value
            .value()
            .to_long()
            .and_then(DateTime::from_timestamp_millis);
    }

    /// Releases the processor: every installed transform gets a `release`
    /// call for each point it serves. Batches already returned stay valid.
    pub fn close(self) {
        for (_, point) in self.metadata.iter() {
            if let Some(entity) = point.transform() {
                entity.transform.release(point);
            }
        }
    }

    /// Processes a collection of notices into an optional collection of
    /// updates. An empty return means the batch hit its memory limit and
    /// the caller should split the input and retry.
    pub async fn process(
        &self,
        notices: Vec<PointValue>,
    ) -> Result<Option<Vec<PointValue>>, ProcessingError> {
        let mut batch = Batch::new(
            Arc::clone(&self.metadata),
            self.config.batch.clone(),
            self.cutoff,
        );
        let notices = match batch.accept_notices(notices) {
            Ok(notices) => notices,
            Err(limit) => {
                warn!("{limit}; the caller should split the batch");
                return Ok(None);
            }
        };
        debug!("processing {} notices", notices.len());

        self.trigger_phase(&mut batch, &notices).await?;
        self.select_phase(&mut batch).await?;
        self.compute_phase(&mut batch);
        self.replicate_phase(&mut batch);
        let updates = self.flush_phase(&mut batch).await?;
        Ok(Some(updates))
    }

    // ── Trigger phase ──

    /// For each notice, asks the behavior chains of every dependent
    /// result point to prepare, then trigger. Prepare is looped until it
    /// converges, flushing store queries between passes.
    async fn trigger_phase(
        &self,
        batch: &mut Batch,
        notices: &[PointValue],
    ) -> Result<(), ProcessingError> {
        for notice in notices {
            let Some(idx) = notice.point().idx() else { continue };
            let dependents: Vec<PointIdx> = self.metadata.point(idx).results().to_vec();
            for dependent in dependents {
                let point = self.metadata.point(dependent);
                if point.is_dropped() {
                    continue;
                }
                for input in point.inputs() {
                    if input.point() != idx {
                        continue;
                    }
                    let chain = input.chain();
                    let mut passes = 0;
                    while !chain.prepare_trigger(notice, batch) {
                        self.flush_queries(batch).await?;
                        batch.next_lookup_pass();
                        passes += 1;
                        if passes >= batch.lookup_pass_limit() {
                            warn!(
                                "trigger preparation did not converge for '{}'",
                                point.display_name()
                            );
                            break;
                        }
                    }
                    chain.trigger(notice, batch);
                }
            }
        }
        Ok(())
    }

    // ── Select phase ──

    /// Prepares every registered result until stable, then selects the
    /// inputs, in topological order. A result whose required inputs stay
    /// unavailable is dropped with a warning.
    async fn select_phase(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        let keys = batch.result_keys();
        let mut prepared: HashSet<ResultKey> = HashSet::new();

        loop {
            let mut all_ready = true;
            for key in &keys {
                if prepared.contains(key) {
                    continue;
                }
                let Some(result) = batch.take_result(key) else { continue };
                let Some(idx) = result.point_value().point().idx() else {
                    batch.put_result(result);
                    continue;
                };
                let point = self.metadata.point(idx);

                let mut ready = true;
                if let Some(entity) = point.transform() {
                    if entity.transform.uses_fetched_result() && !result.is_fetched() {
                        if batch
                            .add_store_values_query(StoreValuesQuery::at(point.uuid(), key.2))
                        {
                            ready = false;
                        }
                    }
                }
                for input in point.inputs() {
                    if !input.chain().prepare_select(&result, batch) {
                        ready = false;
                    }
                }
                batch.put_result(result);
                if ready {
                    prepared.insert(*key);
                } else {
                    all_ready = false;
                }
            }
            if all_ready {
                break;
            }
            self.flush_queries(batch).await?;
            if batch.next_lookup_pass() > batch.lookup_pass_limit() {
                warn!("select preparation did not converge; using available values");
                break;
            }
        }

        for key in &keys {
            let Some(mut result) = batch.take_result(key) else { continue };
            let Some(idx) = result.point_value().point().idx() else { continue };
            let point = self.metadata.point(idx);

            if let Some(entity) = point.transform() {
                if entity.transform.uses_fetched_result() && !result.is_fetched() {
                    if let Some(stored) = batch.point_value_at(point.uuid(), key.2) {
                        let value = result.point_value_mut();
                        value.set_state(stored.state().clone());
                        value.set_value(stored.value().clone());
                    }
                    result.set_fetched(true);
                }
            }

            let mut selected = true;
            for input in point.inputs() {
                if !input.chain().select(&mut result, batch) {
                    selected = false;
                    break;
                }
            }
            if selected {
                batch.put_result(result);
            } else {
                warn!(
                    "result for '{}' dropped: required input unavailable",
                    point.display_name()
                );
            }
        }
        Ok(())
    }

    // ── Compute phase ──

    /// Applies each result point's transform. Recalc triggers are
    /// compute-only and emit nothing; per-result failures are local.
    fn compute_phase(&self, batch: &mut Batch) {
        for key in batch.result_keys() {
            let Some(result) = batch.take_result(&key) else { continue };
            let Some(idx) = result.point_value().point().idx() else { continue };
            let point = self.metadata.point(idx);
            let Some(entity) = point.transform() else {
                debug!(
                    "point '{}' has no transform; result ignored",
                    point.display_name()
                );
                continue;
            };
            let transform = entity
                .transform
                .get_instance(point)
                .unwrap_or_else(|| Arc::clone(&entity.transform));
            let compute_only = result.point_value().is_recalc_trigger();

            match transform.apply_to(&result, batch) {
                Ok(Some(update)) => {
                    if compute_only || update.is_recalc_trigger() {
                        debug!("recalc for '{}' computed, no update", point.display_name());
                    } else {
                        batch.schedule_update(update);
                    }
                }
                Ok(None) => {
                    if transform.is_null_removes(point) && !compute_only {
                        batch.schedule_update(null_update(&result));
                    }
                }
                Err(error) => {
                    warn!(
                        "transform '{}' failed for '{}': {error}",
                        entity.name,
                        point.display_name()
                    );
                    if point.params().get_bool(PARAM_FAIL_RETURNS_NULL, false) {
                        batch.schedule_update(null_update(&result));
                    }
                }
            }
        }
    }

    // ── Replicate phase ──

    /// Emits one additional update per configured replicate, optionally
    /// run through the replicate's convert transform.
    fn replicate_phase(&self, batch: &mut Batch) {
        for update in batch.scheduled_updates() {
            let Some(idx) = update.point().idx() else { continue };
            let point = self.metadata.point(idx);
            for replicate in point.replicates() {
                let target_idx = replicate.point();
                let target = self.metadata.point(target_idx);
                let target_ref = PointRef::Resolved {
                    idx: target_idx,
                    uuid: target.uuid(),
                    name: target.name().map(str::to_string),
                };

                let copy = match replicate.convert() {
                    None => update.clone().morph(Some(target_ref), None),
                    Some(convert) => {
                        let mut carrier = ResultValue::new(PointValue::new(
                            target_ref,
                            update.stamp(),
                            Value::Null,
                            Value::Null,
                        ));
                        carrier.push_input(update.clone());
                        match convert.transform.apply_to(&carrier, batch) {
                            Ok(Some(converted)) => converted,
                            Ok(None) => continue,
                            Err(error) => {
                                warn!(
                                    "replicate conversion to '{}' failed: {error}",
                                    target.display_name()
                                );
                                continue;
                            }
                        }
                    }
                };
                batch.schedule_update(copy);
            }
        }
    }

    // ── Flushing ──

    /// Sends the coalesced pending queries to their stores and feeds the
    /// answers back into the batch cache.
    async fn flush_queries(&self, batch: &mut Batch) -> Result<(), ProcessingError> {
        let queries = batch.take_pending_queries();
        if queries.is_empty() {
            return Ok(());
        }
        let mut grouped: BTreeMap<Uuid, (Arc<StoreEntity>, Vec<StoreValuesQuery>)> =
            BTreeMap::new();
        for query in queries {
            let Some(idx) = self.metadata.resolve(&PointRef::ByUuid(query.point)) else {
                warn!("query for unknown point {} dropped", query.point);
                continue;
            };
            let Some(store) = self.metadata.point(idx).store() else {
                debug!(
                    "point '{}' has no store; query served from the cache only",
                    self.metadata.point(idx).display_name()
                );
                continue;
            };
            grouped
                .entry(store.uuid)
                .or_insert_with(|| (Arc::clone(store), Vec::new()))
                .1
                .push(query);
        }
        for (_, (store, queries)) in grouped {
            let answers = store.store.select(&queries).await?;
            for answer in answers {
                batch.add_store_values(answer);
            }
        }
        Ok(())
    }

    /// Drains the ordered updates, pushes them to their stores and hands
    /// them back to the caller.
    async fn flush_phase(&self, batch: &mut Batch) -> Result<Vec<PointValue>, ProcessingError> {
        let updates = batch.drain_updates();
        let mut grouped: BTreeMap<Uuid, (Arc<StoreEntity>, Vec<PointValue>)> = BTreeMap::new();
        for update in &updates {
            let Some(idx) = update.point().idx() else { continue };
            if let Some(store) = self.metadata.point(idx).store() {
                grouped
                    .entry(store.uuid)
                    .or_insert_with(|| (Arc::clone(store), Vec::new()))
                    .1
                    .push(update.clone());
            }
        }
        for (_, (store, values)) in grouped {
            store.store.update(&values).await?;
        }
        for (name, info) in batch.take_signals() {
            info!("signal '{name}': {info}");
        }
        Ok(updates)
    }
}

/// A null-valued update standing for "remove" or "failed with null".
fn null_update(result: &ResultValue) -> PointValue {
    PointValue::new(
        result.point_value().point().clone(),
        result.point_value().stamp(),
        Value::Null,
        Value::Null,
    )
}
