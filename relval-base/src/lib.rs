//! Base library of the related values processing framework: the point
//! value model and its rich value types, the binary value codec, ingest
//! filters, and the utility services shared by the framework's services.

pub mod coder;
pub mod complex;
pub mod container;
pub mod content;
pub mod error;
pub mod externalizer;
pub mod filter;
pub mod point_value;
pub mod rational;
pub mod state;
pub mod sync;
pub mod timeout;
pub mod traces;
pub mod value;

pub use complex::Complex;
pub use container::{Container, Dict, Tuple};
pub use error::{CodecError, TracesError, ValueError};
pub use point_value::{PointIdx, PointRef, PointValue, PointValueKind, ResultValue, VersionAction};
pub use rational::{BigRational, Rational};
pub use state::{State, StateGroup};
pub use sync::Sync;
pub use value::Value;
