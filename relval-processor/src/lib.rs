//! The related values processor: the point metadata graph and the batch
//! engine computing derived point values from incoming notices.

pub mod batch;
pub mod behavior;
pub mod error;
pub mod metadata;
pub mod params;
pub mod processor;
pub mod store;
pub mod transform;

pub use batch::{Batch, BatchConfig};
pub use behavior::{Behavior, BehaviorChain, BehaviorEntity, PlanLink, RelationRef};
pub use error::{
    ConfigError, MemoryLimitError, ProcessingError, StoreAccessError, TransformError,
};
pub use metadata::{
    ContentEntity, InputDef, Metadata, MetadataBuilder, Point, PointDef, Replicate,
    ReplicateDef, StoreEntity, TransformArg, TransformEntity,
};
pub use params::Params;
pub use processor::{Processor, ProcessorConfig};
pub use store::{MemoryStore, Store, StoreValues, StoreValuesQuery, TimeInterval};
pub use transform::{PassthroughTransform, Transform};
