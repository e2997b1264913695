use crate::content::Content;
use crate::error::ValueError;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

// ─── Point references ─────────────────────────────────────────

/// Handle into the metadata point arena. Opaque to the value layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointIdx(u32);

impl PointIdx {
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("point arena overflow"))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference to a point: a lazy UUID or name until the metadata resolves
/// it into an arena handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PointRef {
    ByUuid(Uuid),
    ByName(String),
    Resolved {
        idx: PointIdx,
        uuid: Uuid,
        name: Option<String>,
    },
}

impl PointRef {
    pub fn uuid(&self) -> Option<Uuid> {
        match self {
            PointRef::ByUuid(uuid) => Some(*uuid),
            PointRef::ByName(_) => None,
            PointRef::Resolved { uuid, .. } => Some(*uuid),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            PointRef::ByUuid(_) => None,
            PointRef::ByName(name) => Some(name),
            PointRef::Resolved { name, .. } => name.as_deref(),
        }
    }

    pub fn idx(&self) -> Option<PointIdx> {
        match self {
            PointRef::Resolved { idx, .. } => Some(*idx),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PointRef::Resolved { .. })
    }

    /// Key comparison: UUIDs when both sides have one, names otherwise.
    pub fn same_point(&self, other: &PointRef) -> bool {
        match (self.uuid(), other.uuid()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => match (self.name(), other.name()) {
                (Some(mine), Some(theirs)) => mine.eq_ignore_ascii_case(theirs),
                _ => false,
            },
        }
    }
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointRef::ByUuid(uuid) => write!(f, "{uuid}"),
            PointRef::ByName(name) => write!(f, "{name}"),
            PointRef::Resolved { uuid, name, .. } => match name {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "{uuid}"),
            },
        }
    }
}

// ─── Version counter ──────────────────────────────────────────

static VERSION: AtomicI64 = AtomicI64::new(0);

/// Produces the next version stamp: strictly greater than the previous one
/// and never behind the wall clock.
fn next_version() -> DateTime<Utc> {
    let mut last = VERSION.load(Ordering::Relaxed);
    loop {
        let now = Utc::now().timestamp_micros();
        let next = now.max(last) + 10;
        match VERSION.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                return DateTime::from_timestamp_micros(next).expect("version stamp in range")
            }
            Err(observed) => last = observed,
        }
    }
}

// ─── PointValue ───────────────────────────────────────────────

/// What a versioned value does to the series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionAction {
    Value,
    Deleted,
    Purged,
}

/// The variant tag of a point value; the single source of truth for the
/// `is_*` predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointValueKind {
    Plain,
    Normalized,
    Synthesized,
    Versioned {
        version: DateTime<Utc>,
        action: VersionAction,
    },
    RecalcTrigger,
    Null,
}

/// A time-stamped measurement of a point.
///
/// Mutable only until frozen; frozen values are immutable snapshots safe to
/// share across threads. Equality and hashing key on the point reference
/// and the stamp only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointValue {
    point: PointRef,
    stamp: Option<DateTime<Utc>>,
    state: Value,
    value: Value,
    kind: PointValueKind,
    #[serde(skip)]
    frozen: bool,
}

impl PointValue {
    pub fn new(
        point: PointRef,
        stamp: Option<DateTime<Utc>>,
        state: Value,
        value: Value,
    ) -> Self {
        Self {
            point,
            stamp,
            state,
            value,
            kind: PointValueKind::Plain,
            frozen: false,
        }
    }

    /// The absent/sentinel value for a point.
    pub fn null(point: PointRef) -> Self {
        Self {
            point,
            stamp: None,
            state: Value::Null,
            value: Value::Null,
            kind: PointValueKind::Null,
            frozen: false,
        }
    }

    /// A marker value whose sole role is to force recomputation.
    pub fn recalc_trigger(point: PointRef, stamp: DateTime<Utc>) -> Self {
        Self {
            point,
            stamp: Some(stamp),
            state: Value::Null,
            value: Value::Null,
            kind: PointValueKind::RecalcTrigger,
            frozen: false,
        }
    }

    // ── Accessors ──

    pub fn point(&self) -> &PointRef {
        &self.point
    }

    pub fn stamp(&self) -> Option<DateTime<Utc>> {
        self.stamp
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn kind(&self) -> &PointValueKind {
        &self.kind
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, PointValueKind::Null)
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self.kind, PointValueKind::Synthesized)
    }

    pub fn is_normalized(&self) -> bool {
        matches!(self.kind, PointValueKind::Normalized)
    }

    pub fn is_recalc_trigger(&self) -> bool {
        matches!(self.kind, PointValueKind::RecalcTrigger)
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self.kind, PointValueKind::Versioned { .. })
    }

    pub fn version(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            PointValueKind::Versioned { version, .. } => Some(version),
            _ => None,
        }
    }

    /// True for the versioned sub-variants signaling removal.
    pub fn is_deleted(&self) -> bool {
        matches!(
            self.kind,
            PointValueKind::Versioned {
                action: VersionAction::Deleted | VersionAction::Purged,
                ..
            }
        )
    }

    // ── Mutators (reject when frozen) ──

    pub fn set_stamp(&mut self, stamp: DateTime<Utc>) {
        assert!(!self.frozen, "mutating a frozen point value");
        self.stamp = Some(stamp);
    }

    pub fn set_state(&mut self, state: Value) {
        assert!(!self.frozen, "mutating a frozen point value");
        self.state = state;
    }

    pub fn set_value(&mut self, value: Value) {
        assert!(!self.frozen, "mutating a frozen point value");
        self.value = value;
    }

    // ── Lifecycle ──

    /// Freezes this value and, deeply, any contained container.
    pub fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            self.state.freeze();
            self.value.freeze();
        }
    }

    pub fn into_frozen(mut self) -> Self {
        self.freeze();
        self
    }

    /// An unfrozen clone.
    pub fn thawed(&self) -> Self {
        let mut thawed = self.clone();
        thawed.frozen = false;
        thawed
    }

    /// An unfrozen clone; equality and hash match the original.
    pub fn copy(&self) -> Self {
        self.thawed()
    }

    /// Re-targets the value, replacing the point and/or the stamp. The
    /// result is never frozen.
    pub fn morph(self, new_point: Option<PointRef>, new_stamp: Option<DateTime<Utc>>) -> Self {
        let mut morphed = if self.frozen { self.thawed() } else { self };
        if let Some(point) = new_point {
            morphed.point = point;
        }
        if let Some(stamp) = new_stamp {
            morphed.stamp = Some(stamp);
        }
        morphed
    }

    /// Replaces the lazy reference with the resolved definition. Fails
    /// loudly on an identity mismatch.
    pub fn restore(
        &mut self,
        uuid: Uuid,
        name: Option<&str>,
        idx: PointIdx,
    ) -> Result<(), ValueError> {
        assert!(!self.frozen, "restoring a frozen point value");
        match &self.point {
            PointRef::ByUuid(mine) | PointRef::Resolved { uuid: mine, .. } => {
                if *mine != uuid {
                    return Err(ValueError::PointMismatch(format!(
                        "expected {mine}, resolved {uuid}"
                    )));
                }
            }
            PointRef::ByName(mine) => {
                if !name.is_some_and(|name| name.eq_ignore_ascii_case(mine)) {
                    return Err(ValueError::PointMismatch(format!(
                        "expected '{mine}', resolved {uuid} ({name:?})"
                    )));
                }
            }
        }
        self.point = PointRef::Resolved {
            idx,
            uuid,
            name: name.map(str::to_string),
        };
        Ok(())
    }

    // ── Variant conversions ──

    pub fn into_synthesized(mut self) -> Self {
        self.kind = PointValueKind::Synthesized;
        self
    }

    /// Assigns a fresh version stamp.
    pub fn into_versioned(mut self) -> Self {
        self.kind = PointValueKind::Versioned {
            version: next_version(),
            action: VersionAction::Value,
        };
        self
    }

    /// A removal marker: carries no value.
    pub fn into_deleted(mut self) -> Self {
        self.kind = PointValueKind::Versioned {
            version: next_version(),
            action: VersionAction::Deleted,
        };
        self.state = Value::Null;
        self.value = Value::Null;
        self
    }

    pub fn into_purged(mut self) -> Self {
        self.kind = PointValueKind::Versioned {
            version: next_version(),
            action: VersionAction::Purged,
        };
        self.state = Value::Null;
        self.value = Value::Null;
        self
    }

    // ── Content delegation (no-ops without a content) ──

    pub fn normalized(&self, content: Option<&dyn Content>) -> Self {
        if self.is_normalized() {
            return self.thawed();
        }
        let mut normalized = self.thawed();
        if let Some(content) = content {
            normalized.value = content.normalize(self);
        }
        normalized.kind = PointValueKind::Normalized;
        normalized
    }

    pub fn denormalized(&self, content: Option<&dyn Content>) -> Self {
        let mut denormalized = self.thawed();
        if let Some(content) = content {
            denormalized.value = content.denormalize(self);
        }
        denormalized.kind = PointValueKind::Plain;
        denormalized
    }

    pub fn encoded(&self, content: Option<&dyn Content>) -> Self {
        let mut encoded = self.thawed();
        if let Some(content) = content {
            encoded.value = content.encode(self);
        }
        encoded
    }

    pub fn decoded(&self, content: Option<&dyn Content>) -> Self {
        let mut decoded = self.thawed();
        if let Some(content) = content {
            decoded.value = content.decode(self);
        }
        decoded
    }

    /// Compares value and state only. The null variant never compares
    /// equal, not even to itself.
    pub fn same_value_as(&self, other: &PointValue) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.value == other.value && self.state == other.state
    }
}

impl PartialEq for PointValue {
    fn eq(&self, other: &Self) -> bool {
        self.point.same_point(&other.point) && self.stamp == other.stamp
    }
}

impl Eq for PointValue {}

impl Hash for PointValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.point.uuid() {
            Some(uuid) => uuid.hash(state),
            None => {
                if let Some(name) = self.point.name() {
                    name.to_ascii_lowercase().hash(state);
                }
            }
        }
        self.stamp.hash(state);
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stamp {
            Some(stamp) => write!(f, "{}@{} = {}", self.point, stamp, self.value),
            None => write!(f, "{} = {}", self.point, self.value),
        }
    }
}

// ─── ResultValue ──────────────────────────────────────────────

/// A point value being computed, with its ordered input values and a flag
/// telling whether the previous stored value was fetched.
#[derive(Clone, Debug)]
pub struct ResultValue {
    value: PointValue,
    inputs: Vec<PointValue>,
    fetched: bool,
}

impl ResultValue {
    pub fn new(value: PointValue) -> Self {
        Self {
            value,
            inputs: Vec::new(),
            fetched: false,
        }
    }

    pub fn point_value(&self) -> &PointValue {
        &self.value
    }

    pub fn point_value_mut(&mut self) -> &mut PointValue {
        &mut self.value
    }

    pub fn into_point_value(self) -> PointValue {
        self.value
    }

    pub fn inputs(&self) -> &[PointValue] {
        &self.inputs
    }

    /// Stores an input at its relation position, padding any gap with
    /// null stand-ins for the input's point.
    pub fn set_input(&mut self, index: usize, input: PointValue) {
        while self.inputs.len() <= index {
            self.inputs.push(PointValue::null(input.point().clone()));
        }
        self.inputs[index] = input;
    }

    pub fn push_input(&mut self, input: PointValue) {
        self.inputs.push(input);
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn set_fetched(&mut self, fetched: bool) {
        self.fetched = fetched;
    }

    /// Clones with the inputs morphed empty: structural equality without
    /// aliasing the originals.
    pub fn morph(
        &self,
        new_point: Option<PointRef>,
        new_stamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            value: self.value.clone().morph(new_point, new_stamp),
            inputs: self
                .inputs
                .iter()
                .map(|input| input.clone().morph(None, None))
                .collect(),
            fetched: self.fetched,
        }
    }

    /// Extends point-value comparison to the inputs.
    pub fn same_value_as(&self, other: &ResultValue) -> bool {
        self.value.same_value_as(&other.value)
            && self.inputs.len() == other.inputs.len()
            && self
                .inputs
                .iter()
                .zip(other.inputs.iter())
                .all(|(mine, theirs)| mine.same_value_as(theirs))
    }
}
