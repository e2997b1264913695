use crate::batch::Batch;
use crate::error::TransformError;
use crate::metadata::Point;
use relval_base::{PointValue, ResultValue};
use std::sync::Arc;

/// The pluggable unit computing a result value from its filled-in inputs.
///
/// `apply_to` receives a result whose inputs were selected by the
/// behavior chains; an empty return means "no update" (which the driver
/// may turn into a removal when the point removes on null).
pub trait Transform: Send + std::marker::Sync {
    fn name(&self) -> &str;

    fn apply_to(
        &self,
        result: &ResultValue,
        batch: &mut Batch,
    ) -> Result<Option<PointValue>, TransformError>;

    /// Whether an empty result removes the stored value.
    fn is_null_removes(&self, point: &Point) -> bool {
        point.null_removes()
    }

    /// Whether this transform needs the result point's stored value
    /// fetched before computing.
    fn uses_fetched_result(&self) -> bool {
        false
    }

    /// Per-point specialization hook; empty means "use this instance".
    fn get_instance(&self, _point: &Point) -> Option<Arc<dyn Transform>> {
        None
    }

    /// Releases any per-point resources when the processor closes.
    fn release(&self, _point: &Point) {}
}

/// Copies the first input to the result.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughTransform;

impl Transform for PassthroughTransform {
    fn name(&self) -> &str {
        "Passthrough"
    }

    fn apply_to(
        &self,
        result: &ResultValue,
        _batch: &mut Batch,
    ) -> Result<Option<PointValue>, TransformError> {
        let Some(input) = result.inputs().iter().find(|input| !input.is_null()) else {
            return Ok(None);
        };
        if input.value().is_null() {
            return Ok(None);
        }
        let mut update = PointValue::new(
            result.point_value().point().clone(),
            result.point_value().stamp(),
            input.state().clone(),
            input.value().clone(),
        );
        update = update.into_synthesized();
        Ok(Some(update))
    }
}

/// Always fails; exercises the per-result failure paths.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingTransform;

impl Transform for FailingTransform {
    fn name(&self) -> &str {
        "Failing"
    }

    fn apply_to(
        &self,
        _result: &ResultValue,
        _batch: &mut Batch,
    ) -> Result<Option<PointValue>, TransformError> {
        Err(TransformError::new("transform configured to fail"))
    }
}
