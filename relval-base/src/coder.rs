use crate::error::CodecError;

/// Character-set coder injected into the value codec. When present,
/// strings travel as length-chunked encoded bytes instead of modified-UTF
/// segments; both ends of a stream must agree on the coder.
pub trait Coder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError>;
}

/// The stock UTF-8 coder.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Coder;

impl Coder for Utf8Coder {
    fn encode(&self, text: &str) -> Result<Vec<u8>, CodecError> {
        Ok(text.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|error| CodecError::Coder(format!("invalid UTF-8: {error}")))
    }
}
