use crate::error::StoreAccessError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relval_base::{PointValue, Sync};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

// ─── Queries ──────────────────────────────────────────────────

/// A time interval with optional closed bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl TimeInterval {
    /// The single-instant interval.
    pub fn at(stamp: DateTime<Utc>) -> Self {
        Self {
            not_before: Some(stamp),
            not_after: Some(stamp),
        }
    }

    pub fn contains(&self, stamp: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|bound| stamp >= bound)
            && self.not_after.is_none_or(|bound| stamp <= bound)
    }

    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        let starts_before_other_ends = match (self.not_before, other.not_after) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        };
        let other_starts_before_self_ends = match (other.not_before, self.not_after) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }

    /// The smallest interval covering both.
    pub fn merge(&self, other: &TimeInterval) -> Self {
        Self {
            not_before: self
                .not_before
                .zip(other.not_before)
                .map(|(mine, theirs)| mine.min(theirs)),
            not_after: self
                .not_after
                .zip(other.not_after)
                .map(|(mine, theirs)| mine.max(theirs)),
        }
    }
}

/// A point-values query sent to a store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoreValuesQuery {
    pub point: Uuid,
    pub interval: TimeInterval,
    pub sync: Option<Sync>,
    pub not_null: bool,
    pub interpolated: bool,
    pub extrapolated: bool,
    pub limit: Option<usize>,
}

impl StoreValuesQuery {
    pub fn at(point: Uuid, stamp: DateTime<Utc>) -> Self {
        Self {
            point,
            interval: TimeInterval::at(stamp),
            sync: None,
            not_null: false,
            interpolated: false,
            extrapolated: false,
            limit: None,
        }
    }

    /// True when the other query can be folded into this one.
    pub fn coalesces_with(&self, other: &StoreValuesQuery) -> bool {
        self.point == other.point
            && self.sync == other.sync
            && self.not_null == other.not_null
            && self.interpolated == other.interpolated
            && self.extrapolated == other.extrapolated
            && self.limit.is_none()
            && other.limit.is_none()
            && self.interval.overlaps(&other.interval)
    }
}

/// The answer to one query.
#[derive(Clone, Debug)]
pub struct StoreValues {
    pub query: StoreValuesQuery,
    pub values: Vec<PointValue>,
}

// ─── Store client ─────────────────────────────────────────────

/// Client side of a point-value store. Implementations own their
/// transport and must be thread-safe.
#[async_trait]
pub trait Store: Send + std::marker::Sync {
    /// Fetches point values for a batch of queries, one answer per query,
    /// in query order.
    async fn select(
        &self,
        queries: &[StoreValuesQuery],
    ) -> Result<Vec<StoreValues>, StoreAccessError>;

    /// Submits a batch of updates.
    async fn update(&self, values: &[PointValue]) -> Result<(), StoreAccessError>;

    /// Store-wide default for treating null values as removals.
    fn null_removes(&self) -> bool {
        false
    }
}

// ─── Memory store ─────────────────────────────────────────────

/// In-memory store of record, used by tests and stand-alone runs.
/// Interpolation and extrapolation requests answer with the concrete
/// values only.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<Uuid, BTreeMap<DateTime<Utc>, PointValue>>>,
    updated: Mutex<Vec<PointValue>>,
    null_removes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_null_removes(null_removes: bool) -> Self {
        Self {
            null_removes,
            ..Self::default()
        }
    }

    /// Seeds a value directly, bypassing the update path.
    pub fn seed(&self, value: PointValue) {
        let uuid = value.point().uuid().expect("seeded value needs a UUID");
        let stamp = value.stamp().expect("seeded value needs a stamp");
        self.values
            .lock()
            .expect("store lock")
            .entry(uuid)
            .or_default()
            .insert(stamp, value.into_frozen());
    }

    /// Every update received so far, in arrival order.
    pub fn updated(&self) -> Vec<PointValue> {
        self.updated.lock().expect("store lock").clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(
        &self,
        queries: &[StoreValuesQuery],
    ) -> Result<Vec<StoreValues>, StoreAccessError> {
        let values = self.values.lock().expect("store lock");
        let mut answers = Vec::with_capacity(queries.len());
        for query in queries {
            let mut matched: Vec<PointValue> = values
                .get(&query.point)
                .map(|series| {
                    series
                        .iter()
                        .filter(|(stamp, value)| {
                            query.interval.contains(**stamp)
                                && query
                                    .sync
                                    .is_none_or(|sync| sync.is_in_sync(**stamp))
                                && !(query.not_null && value.value().is_null())
                        })
                        .map(|(_, value)| value.clone())
                        .collect()
                })
                .unwrap_or_default();
            if let Some(limit) = query.limit {
                if matched.len() > limit {
                    matched.drain(..matched.len() - limit);
                }
            }
            answers.push(StoreValues {
                query: query.clone(),
                values: matched,
            });
        }
        Ok(answers)
    }

    async fn update(&self, values: &[PointValue]) -> Result<(), StoreAccessError> {
        let mut series = self.values.lock().expect("store lock");
        let mut updated = self.updated.lock().expect("store lock");
        for value in values {
            let uuid = value
                .point()
                .uuid()
                .ok_or_else(|| StoreAccessError("update without a point UUID".into()))?;
            let stamp = value
                .stamp()
                .ok_or_else(|| StoreAccessError("update without a stamp".into()))?;
            let removes =
                value.is_deleted() || (self.null_removes && value.value().is_null());
            if removes {
                series.entry(uuid).or_default().remove(&stamp);
            } else {
                series
                    .entry(uuid)
                    .or_default()
                    .insert(stamp, value.clone().into_frozen());
            }
            updated.push(value.clone());
        }
        Ok(())
    }

    fn null_removes(&self) -> bool {
        self.null_removes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relval_base::{PointRef, Value};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn sample(uuid: u128, seconds: i64, value: f64) -> PointValue {
        PointValue::new(
            PointRef::ByUuid(Uuid::from_u128(uuid)),
            Some(at(seconds)),
            Value::Null,
            Value::Double(value),
        )
    }

    #[tokio::test]
    async fn select_honors_interval_and_sync() {
        let store = MemoryStore::new();
        for seconds in [0, 30, 60, 90, 120] {
            store.seed(sample(1, seconds, seconds as f64));
        }

        let query = StoreValuesQuery {
            interval: TimeInterval {
                not_before: Some(at(30)),
                not_after: Some(at(90)),
            },
            sync: Some(Sync::new(chrono::Duration::minutes(1))),
            ..StoreValuesQuery::at(Uuid::from_u128(1), at(0))
        };
        let answers = store.select(&[query]).await.unwrap();
        let stamps: Vec<_> = answers[0].values.iter().filter_map(PointValue::stamp).collect();
        assert_eq!(stamps, [at(60)]);
    }

    #[tokio::test]
    async fn update_applies_and_null_removes() {
        let store = MemoryStore::with_null_removes(true);
        store.seed(sample(1, 0, 1.0));

        let mut removal = sample(1, 0, 0.0);
        removal.set_value(Value::Null);
        store.update(&[removal]).await.unwrap();

        let answers = store
            .select(&[StoreValuesQuery::at(Uuid::from_u128(1), at(0))])
            .await
            .unwrap();
        assert!(answers[0].values.is_empty());
        assert_eq!(store.updated().len(), 1);
    }

    #[test]
    fn interval_merge_and_overlap() {
        let early = TimeInterval {
            not_before: Some(at(0)),
            not_after: Some(at(60)),
        };
        let late = TimeInterval {
            not_before: Some(at(30)),
            not_after: Some(at(90)),
        };
        assert!(early.overlaps(&late));
        let merged = early.merge(&late);
        assert_eq!(merged.not_before, Some(at(0)));
        assert_eq!(merged.not_after, Some(at(90)));
    }
}
