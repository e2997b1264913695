use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A periodic time-grid: stamps at `offset + k * period` for integer `k`.
///
/// Points and input relations may follow a sync; the batch engine uses it
/// to constrain queries and result stamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sync {
    period_millis: i64,
    #[serde(default)]
    offset_millis: i64,
}

impl Sync {
    /// A grid with the given period. Panics on a non-positive period
    /// (configuration bug).
    pub fn new(period: Duration) -> Self {
        Self::with_offset(period, Duration::zero())
    }

    pub fn with_offset(period: Duration, offset: Duration) -> Self {
        let period_millis = period.num_milliseconds();
        assert!(period_millis > 0, "sync period must be positive");
        Self {
            period_millis,
            offset_millis: offset.num_milliseconds().rem_euclid(period_millis),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::milliseconds(self.period_millis)
    }

    pub fn is_in_sync(&self, stamp: DateTime<Utc>) -> bool {
        (stamp.timestamp_millis() - self.offset_millis).rem_euclid(self.period_millis) == 0
    }

    /// The latest grid stamp at or before the given stamp.
    pub fn floor(&self, stamp: DateTime<Utc>) -> DateTime<Utc> {
        let millis = stamp.timestamp_millis();
        let offset = (millis - self.offset_millis).rem_euclid(self.period_millis);
        DateTime::from_timestamp_millis(millis - offset).expect("stamp in range")
    }

    /// The earliest grid stamp at or after the given stamp.
    pub fn ceiling(&self, stamp: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(stamp);
        if floored == stamp {
            stamp
        } else {
            floored + self.period()
        }
    }

    /// The first grid stamp strictly after the given stamp.
    pub fn next(&self, stamp: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(stamp) + self.period()
    }

    /// The last grid stamp strictly before the given stamp.
    pub fn previous(&self, stamp: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(stamp);
        if floored == stamp {
            floored - self.period()
        } else {
            floored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    #[test]
    fn minute_grid() {
        let sync = Sync::new(Duration::minutes(1));
        assert!(sync.is_in_sync(at(120)));
        assert!(!sync.is_in_sync(at(90)));
        assert_eq!(sync.floor(at(90)), at(60));
        assert_eq!(sync.ceiling(at(90)), at(120));
        assert_eq!(sync.ceiling(at(120)), at(120));
        assert_eq!(sync.next(at(120)), at(180));
        assert_eq!(sync.previous(at(120)), at(60));
        assert_eq!(sync.previous(at(90)), at(60));
    }

    #[test]
    fn offset_shifts_the_grid() {
        let sync = Sync::with_offset(Duration::minutes(1), Duration::seconds(15));
        assert!(sync.is_in_sync(at(75)));
        assert!(!sync.is_in_sync(at(60)));
        assert_eq!(sync.floor(at(60)), at(15));
    }

    #[test]
    fn negative_epoch_stamps() {
        let sync = Sync::new(Duration::minutes(1));
        assert_eq!(sync.floor(at(-90)), at(-120));
    }
}
