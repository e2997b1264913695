use thiserror::Error;

/// Errors raised by the value model (numeric construction, parsing,
/// reference restoration).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("zero denominator")]
    ZeroDenominator,

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("cannot parse {kind} from {text:?}")]
    Parse { kind: &'static str, text: String },

    #[error("a state needs a code or a name")]
    EmptyState,

    #[error("point identity mismatch: {0}")]
    PointMismatch(String),

    #[error("value has no stamp")]
    MissingStamp,
}

/// Errors raised by the binary value codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown type code {0:#04x}")]
    UnknownTypeCode(u8),

    #[error("unexpected type code {found:#04x}, expected {expected:#04x}")]
    UnexpectedTypeCode { expected: u8, found: u8 },

    #[error("invalid modified UTF-8 sequence")]
    InvalidModifiedUtf8,

    #[error("character {0:?} is outside the basic multilingual plane")]
    NonBmpChar(char),

    #[error("decimal scale {0} is out of range")]
    ScaleOutOfRange(i64),

    #[error("invalid value payload: {0}")]
    InvalidPayload(String),

    #[error("coder failed: {0}")]
    Coder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the traces journal.
#[derive(Error, Debug)]
pub enum TracesError {
    #[error("trace entry vetoed by listener")]
    Vetoed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
