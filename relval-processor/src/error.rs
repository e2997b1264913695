use thiserror::Error;

/// Metadata configuration errors. Fatal at load time: no batch runs
/// against a metadata that failed to build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dependency cycle detected at point '{0}'")]
    DependencyCycle(String),

    #[error("point '{0}' replicates to itself")]
    SelfReplicate(String),

    #[error("dangling point reference '{0}'")]
    DanglingReference(String),

    #[error("duplicate point '{0}'")]
    DuplicatePoint(String),

    #[error("multiple primary behaviors on input {input} of point '{point}'")]
    MultiplePrimary { point: String, input: usize },

    #[error("no primary behavior on input {input} of point '{point}'")]
    MissingPrimary { point: String, input: usize },

    #[error("unknown point '{0}'")]
    UnknownPoint(String),

    #[error("point reference mismatch: {0}")]
    ReferenceMismatch(String),

    #[error("behavior set-up failed: {0}")]
    Behavior(String),
}

/// Store transport failure; aborts the whole batch.
#[derive(Error, Debug, Clone)]
#[error("store access failed: {0}")]
pub struct StoreAccessError(pub String);

/// Raised while installing notices when the batch working set would grow
/// past its limit; the caller should split the input and retry.
#[derive(Error, Debug, Clone)]
#[error("memory limit exceeded: {held} values held, limit {limit}")]
pub struct MemoryLimitError {
    pub held: usize,
    pub limit: usize,
}

/// A transform failed for one result. Local: the result yields no update
/// unless the point asks for a null on failure.
#[derive(Error, Debug, Clone)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by `Processor::process`.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    StoreAccess(#[from] StoreAccessError),
}
