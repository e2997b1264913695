//! Per-point value filters applied when ingesting into stores.
//!
//! A filter is stateful and single-threaded. The common policy lives in
//! the default `filter` body; concrete filters plug in through `snap` and
//! `do_filter`.

use crate::point_value::PointValue;
use crate::value::Value;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ─── Configuration ────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Elapsed time after which a value is passed through regardless of
    /// the filter decision.
    #[serde(rename = "time_limit")]
    pub time_limit_millis: Option<i64>,
    /// Unit the stamps are floored to before filtering.
    #[serde(rename = "stamp_trim_unit")]
    pub stamp_trim_millis: Option<i64>,
}

impl FilterConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_millis.map(Duration::milliseconds)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadbandConfig {
    /// Absolute gap; takes precedence when non-negative.
    pub deadband_gap: f64,
    /// Relative gap against the previous value; used when the absolute
    /// gap is negative. Both negative means the filter is disabled.
    pub deadband_ratio: f64,
}

impl Default for DeadbandConfig {
    fn default() -> Self {
        Self {
            deadband_gap: -1.0,
            deadband_ratio: -1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Grid the values snap to; non-positive disables snapping.
    pub step_size: f64,
    /// Snap tolerance below the next step; derived from the size and the
    /// ceiling ratio when negative.
    pub ceiling_gap: f64,
    /// Snap tolerance above the previous step; derived from the size and
    /// the floor ratio when negative.
    pub floor_gap: f64,
    pub ceiling_ratio: f64,
    pub floor_ratio: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            step_size: -1.0,
            ceiling_gap: -1.0,
            floor_gap: -1.0,
            ceiling_ratio: 0.25,
            floor_ratio: 0.25,
        }
    }
}

// ─── Common state and policy ──────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct FilterState {
    /// Reference value for the filter comparisons; updated on every
    /// emission.
    previous: Option<PointValue>,
    /// Stamp of the last unconditional emission; the time limit counts
    /// from here.
    heartbeat: Option<DateTime<Utc>>,
    /// Most recent filtered-out value, kept for a later flush.
    held: Option<PointValue>,
}

impl FilterState {
    pub fn previous(&self) -> Option<&PointValue> {
        self.previous.as_ref()
    }
}

pub trait ValueFilter: Send {
    fn config(&self) -> &FilterConfig;

    fn state(&self) -> &FilterState;

    fn state_mut(&mut self) -> &mut FilterState;

    fn is_disabled(&self) -> bool;

    /// Value adjustment hook, applied before the filter decision.
    fn snap(&self, _value: &mut PointValue) {}

    /// The filter decision proper. Returns the value to emit, or none to
    /// suppress it; the implementation maintains `previous` and `held`.
    fn do_filter(&mut self, value: PointValue) -> Option<PointValue>;

    fn reset(&mut self) {
        *self.state_mut() = FilterState::default();
    }

    /// Applies the layered filtering policy. Emitted values are frozen.
    fn filter(&mut self, value: Option<PointValue>) -> Vec<PointValue> {
        if self.is_disabled() {
            return value.into_iter().collect();
        }

        let Some(mut value) = value else {
            let flushed: Vec<PointValue> = self
                .state_mut()
                .held
                .take()
                .map(PointValue::into_frozen)
                .into_iter()
                .collect();
            self.reset();
            return flushed;
        };

        if value.stamp().is_none() {
            if value.is_frozen() {
                value = value.thawed();
            }
            value.set_stamp(Utc::now());
        }

        if let Some(trim) = self.config().stamp_trim_millis {
            let stamp = value.stamp().expect("stamp set above");
            let millis = stamp.timestamp_millis();
            let trimmed = millis - millis.rem_euclid(trim);
            if trimmed != millis {
                if value.is_frozen() {
                    value = value.thawed();
                }
                value.set_stamp(
                    DateTime::from_timestamp_millis(trimmed).expect("stamp in range"),
                );
            }
        }

        if value.value().is_null() {
            let mut emitted: Vec<PointValue> =
                self.state_mut().held.take().into_iter().collect();
            emitted.push(value);
            self.reset();
            return emitted.into_iter().map(PointValue::into_frozen).collect();
        }

        if value.is_frozen() {
            value = value.thawed();
        }
        self.snap(&mut value);

        if self.state().previous.is_none() {
            let stamp = value.stamp();
            let state = self.state_mut();
            state.previous = Some(value.clone());
            state.heartbeat = stamp;
            return vec![value.into_frozen()];
        }

        if let (Some(limit), Some(heartbeat)) = (self.config().time_limit(), self.state().heartbeat)
        {
            let stamp = value.stamp().expect("stamp set above");
            if stamp - heartbeat >= limit {
                let mut emitted: Vec<PointValue> =
                    self.state_mut().held.take().into_iter().collect();
                let state = self.state_mut();
                state.previous = Some(value.clone());
                state.heartbeat = Some(stamp);
                emitted.push(value);
                return emitted.into_iter().map(PointValue::into_frozen).collect();
            }
        }

        self.do_filter(value)
            .map(PointValue::into_frozen)
            .into_iter()
            .collect()
    }
}

/// Shared deadband decision: suppress when the change from the previous
/// value stays within the gap.
fn apply_deadband(
    state: &mut FilterState,
    deadband: &DeadbandConfig,
    value: PointValue,
) -> Option<PointValue> {
    let previous = state
        .previous
        .as_ref()
        .expect("previous set by the first-seen step");
    let comparison = previous
        .value()
        .to_double()
        .zip(value.value().to_double())
        .map(|(previous, current)| {
            let gap = if deadband.deadband_gap >= 0.0 {
                deadband.deadband_gap
            } else {
                previous.abs() * deadband.deadband_ratio
            };
            (current - previous).abs() <= gap
        });
    match comparison {
        Some(true) => {
            state.held = Some(value);
            None
        }
        // Not comparable as doubles: pass through.
        Some(false) | None => {
            state.previous = Some(value.clone());
            state.held = None;
            Some(value)
        }
    }
}

// ─── DeadbandFilter ───────────────────────────────────────────

/// Suppresses a value when it moved less than the configured gap since
/// the previous emission.
#[derive(Debug, Default)]
pub struct DeadbandFilter {
    config: FilterConfig,
    deadband: DeadbandConfig,
    state: FilterState,
}

impl DeadbandFilter {
    pub fn new(config: FilterConfig, deadband: DeadbandConfig) -> Self {
        Self {
            config,
            deadband,
            state: FilterState::default(),
        }
    }
}

impl ValueFilter for DeadbandFilter {
    fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn state(&self) -> &FilterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FilterState {
        &mut self.state
    }

    fn is_disabled(&self) -> bool {
        self.deadband.deadband_gap < 0.0 && self.deadband.deadband_ratio < 0.0
    }

    fn do_filter(&mut self, value: PointValue) -> Option<PointValue> {
        apply_deadband(&mut self.state, &self.deadband, value)
    }
}

// ─── StepFilter ───────────────────────────────────────────────

/// Deadband filtering with step snapping: values close enough to a
/// multiple of the step size are forced onto it.
#[derive(Debug, Default)]
pub struct StepFilter {
    config: FilterConfig,
    deadband: DeadbandConfig,
    step: StepConfig,
    state: FilterState,
}

impl StepFilter {
    pub fn new(config: FilterConfig, deadband: DeadbandConfig, step: StepConfig) -> Self {
        Self {
            config,
            deadband,
            step,
            state: FilterState::default(),
        }
    }

    fn ceiling_gap(&self) -> f64 {
        if self.step.ceiling_gap >= 0.0 {
            self.step.ceiling_gap
        } else {
            self.step.step_size * self.step.ceiling_ratio
        }
    }

    fn floor_gap(&self) -> f64 {
        if self.step.floor_gap >= 0.0 {
            self.step.floor_gap
        } else {
            self.step.step_size * self.step.floor_ratio
        }
    }
}

impl ValueFilter for StepFilter {
    fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn state(&self) -> &FilterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FilterState {
        &mut self.state
    }

    fn is_disabled(&self) -> bool {
        self.step.step_size <= 0.0
            && self.deadband.deadband_gap < 0.0
            && self.deadband.deadband_ratio < 0.0
    }

    fn snap(&self, value: &mut PointValue) {
        let step = self.step.step_size;
        if step <= 0.0 {
            return;
        }
        let Some(current) = value.value().to_double() else {
            return;
        };
        let floor_step = (current / step).floor() * step;
        let ceiling_step = (current / step).ceil() * step;
        let snapped = if ceiling_step - current <= self.ceiling_gap() {
            ceiling_step
        } else if current - floor_step <= self.floor_gap() {
            floor_step
        } else {
            return;
        };
        if snapped != current {
            value.set_value(Value::Double(snapped));
        }
    }

    fn do_filter(&mut self, value: PointValue) -> Option<PointValue> {
        apply_deadband(&mut self.state, &self.deadband, value)
    }
}
