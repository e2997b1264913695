//! Typed binary codec for values exchanged with stores.
//!
//! Every value travels as a one-byte type code followed by a
//! variant-specific payload. Byte arrays are emitted as a series of
//! length-prefixed chunks (16-bit unsigned lengths) terminated by a zero
//! length, allowing payloads past 64 KiB.

use crate::coder::Coder;
use crate::complex::Complex;
use crate::container::{Dict, Tuple};
use crate::error::CodecError;
use crate::rational::{BigRational, Rational};
use crate::state::State;
use crate::value::Value;
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::io::{Read, Write};
use std::sync::Arc;

const TAG_BIG_DECIMAL: u8 = b'D';
const TAG_BIG_INTEGER: u8 = b'I';
const TAG_BIG_RATIONAL: u8 = b'R';
const TAG_BOOLEAN: u8 = b'z';
const TAG_BYTE: u8 = b'b';
const TAG_BYTE_ARRAY: u8 = b'a';
const TAG_CHAR: u8 = b'c';
const TAG_COMPLEX: u8 = b'x';
const TAG_DICT: u8 = b'm';
const TAG_DOUBLE: u8 = b'd';
const TAG_FLOAT: u8 = b'f';
const TAG_INT: u8 = b'i';
const TAG_LONG: u8 = b'j';
const TAG_NULL: u8 = b'0';
const TAG_OPAQUE: u8 = b'o';
const TAG_RATIONAL: u8 = b'r';
const TAG_SHORT: u8 = b's';
const TAG_STATE: u8 = b'q';
const TAG_STRING: u8 = b't';
const TAG_TUPLE: u8 = b'n';

/// Largest single chunk payload. One less than the 16-bit maximum so a
/// 65535-byte array needs a second chunk.
const MAX_CHUNK: usize = 65_534;

/// Longest modified-UTF segment, in UTF-16 units: the worst case of three
/// bytes per unit must fit the 16-bit segment length.
const MAX_UTF_SEGMENT: usize = 65_535 / 3;

/// The value codec. Without a coder, strings travel as modified-UTF
/// segments; with one, as chunked encoded bytes.
#[derive(Clone, Default)]
pub struct Externalizer {
    coder: Option<Arc<dyn Coder>>,
}

impl Externalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coder(coder: Arc<dyn Coder>) -> Self {
        Self { coder: Some(coder) }
    }

    // ── Writing ──

    pub fn externalize(&self, value: &Value, out: &mut dyn Write) -> Result<(), CodecError> {
        match value {
            Value::Null => out.write_all(&[TAG_NULL])?,
            Value::Boolean(flag) => {
                out.write_all(&[TAG_BOOLEAN, u8::from(*flag)])?;
            }
            Value::Byte(byte) => {
                out.write_all(&[TAG_BYTE])?;
                out.write_all(&byte.to_be_bytes())?;
            }
            Value::Short(short) => {
                out.write_all(&[TAG_SHORT])?;
                out.write_all(&short.to_be_bytes())?;
            }
            Value::Integer(int) => {
                out.write_all(&[TAG_INT])?;
                out.write_all(&int.to_be_bytes())?;
            }
            Value::Long(long) => {
                out.write_all(&[TAG_LONG])?;
                out.write_all(&long.to_be_bytes())?;
            }
            Value::Float(float) => {
                out.write_all(&[TAG_FLOAT])?;
                out.write_all(&float.to_be_bytes())?;
            }
            Value::Double(double) => {
                out.write_all(&[TAG_DOUBLE])?;
                out.write_all(&double.to_be_bytes())?;
            }
            Value::Char(character) => {
                let mut units = [0u16; 2];
                let encoded = character.encode_utf16(&mut units);
                if encoded.len() != 1 {
                    return Err(CodecError::NonBmpChar(*character));
                }
                out.write_all(&[TAG_CHAR])?;
                out.write_all(&encoded[0].to_be_bytes())?;
            }
            Value::Str(text) => {
                out.write_all(&[TAG_STRING])?;
                self.write_string(text, out)?;
            }
            Value::Bytes(bytes) => {
                out.write_all(&[TAG_BYTE_ARRAY])?;
                write_chunked(bytes, out)?;
            }
            Value::BigInteger(int) => {
                out.write_all(&[TAG_BIG_INTEGER])?;
                write_chunked(&int.to_signed_bytes_be(), out)?;
            }
            Value::BigDecimal(decimal) => {
                let (digits, scale) = decimal.as_bigint_and_exponent();
                let scale =
                    i32::try_from(scale).map_err(|_| CodecError::ScaleOutOfRange(scale))?;
                out.write_all(&[TAG_BIG_DECIMAL])?;
                out.write_all(&scale.to_be_bytes())?;
                write_chunked(&digits.to_signed_bytes_be(), out)?;
            }
            Value::Rational(rational) => {
                out.write_all(&[TAG_RATIONAL])?;
                out.write_all(&rational.numerator().to_be_bytes())?;
                out.write_all(&rational.denominator().to_be_bytes())?;
            }
            Value::BigRational(rational) => {
                out.write_all(&[TAG_BIG_RATIONAL])?;
                write_chunked(&rational.numerator().to_signed_bytes_be(), out)?;
                write_chunked(&rational.denominator().to_signed_bytes_be(), out)?;
            }
            Value::Complex(complex) => {
                let cartesian = complex.to_cartesian();
                out.write_all(&[TAG_COMPLEX])?;
                out.write_all(&cartesian.real().to_be_bytes())?;
                out.write_all(&cartesian.imaginary().to_be_bytes())?;
            }
            Value::State(state) => {
                out.write_all(&[TAG_STATE])?;
                match state.code() {
                    Some(code) => {
                        out.write_all(&[TAG_INT])?;
                        out.write_all(&code.to_be_bytes())?;
                    }
                    None => out.write_all(&[TAG_NULL])?,
                }
                match state.name() {
                    Some(name) => {
                        out.write_all(&[TAG_STRING])?;
                        self.write_string(name, out)?;
                    }
                    None => out.write_all(&[TAG_NULL])?,
                }
            }
            Value::Tuple(tuple) => {
                out.write_all(&[TAG_TUPLE])?;
                out.write_all(&(tuple.len() as i32).to_be_bytes())?;
                for item in tuple.iter() {
                    self.externalize(item, out)?;
                }
            }
            Value::Dict(dict) => {
                out.write_all(&[TAG_DICT])?;
                out.write_all(&(dict.len() as i32).to_be_bytes())?;
                for (key, item) in dict.iter() {
                    self.write_string(key, out)?;
                    self.externalize(item, out)?;
                }
            }
            Value::Opaque(bytes) => {
                out.write_all(&[TAG_OPAQUE])?;
                write_chunked(bytes, out)?;
            }
        }
        Ok(())
    }

    // ── Reading ──

    pub fn internalize(&self, input: &mut dyn Read) -> Result<Value, CodecError> {
        let tag = read_u8(input)?;
        self.read_tagged(tag, input)
    }

    fn read_tagged(&self, tag: u8, input: &mut dyn Read) -> Result<Value, CodecError> {
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_BOOLEAN => Value::Boolean(read_u8(input)? != 0),
            TAG_BYTE => Value::Byte(i8::from_be_bytes(read_array(input)?)),
            TAG_SHORT => Value::Short(i16::from_be_bytes(read_array(input)?)),
            TAG_INT => Value::Integer(i32::from_be_bytes(read_array(input)?)),
            TAG_LONG => Value::Long(i64::from_be_bytes(read_array(input)?)),
            TAG_FLOAT => Value::Float(f32::from_be_bytes(read_array(input)?)),
            TAG_DOUBLE => Value::Double(f64::from_be_bytes(read_array(input)?)),
            TAG_CHAR => {
                let unit = u16::from_be_bytes(read_array(input)?);
                let character = char::from_u32(u32::from(unit)).ok_or_else(|| {
                    CodecError::InvalidPayload(format!("lone surrogate {unit:#06x}"))
                })?;
                Value::Char(character)
            }
            TAG_STRING => Value::Str(self.read_string(input)?),
            TAG_BYTE_ARRAY => Value::Bytes(read_chunked(input)?),
            TAG_BIG_INTEGER => {
                Value::BigInteger(BigInt::from_signed_bytes_be(&read_chunked(input)?))
            }
            TAG_BIG_DECIMAL => {
                let scale = i32::from_be_bytes(read_array(input)?);
                let digits = BigInt::from_signed_bytes_be(&read_chunked(input)?);
                Value::BigDecimal(BigDecimal::new(digits, i64::from(scale)))
            }
            TAG_RATIONAL => {
                let numerator = i64::from_be_bytes(read_array(input)?);
                let denominator = i64::from_be_bytes(read_array(input)?);
                Value::Rational(
                    Rational::new(numerator, denominator)
                        .map_err(|error| CodecError::InvalidPayload(error.to_string()))?,
                )
            }
            TAG_BIG_RATIONAL => {
                let numerator = BigInt::from_signed_bytes_be(&read_chunked(input)?);
                let denominator = BigInt::from_signed_bytes_be(&read_chunked(input)?);
                Value::BigRational(
                    BigRational::from_big(numerator, denominator)
                        .map_err(|error| CodecError::InvalidPayload(error.to_string()))?,
                )
            }
            TAG_COMPLEX => {
                let real = f64::from_be_bytes(read_array(input)?);
                let imaginary = f64::from_be_bytes(read_array(input)?);
                Value::Complex(Complex::cartesian(real, imaginary))
            }
            TAG_STATE => {
                let code = match read_u8(input)? {
                    TAG_INT => Some(i32::from_be_bytes(read_array(input)?)),
                    TAG_NULL => None,
                    found => {
                        return Err(CodecError::UnexpectedTypeCode {
                            expected: TAG_INT,
                            found,
                        })
                    }
                };
                let name = match read_u8(input)? {
                    TAG_STRING => Some(self.read_string(input)?),
                    TAG_NULL => None,
                    found => {
                        return Err(CodecError::UnexpectedTypeCode {
                            expected: TAG_STRING,
                            found,
                        })
                    }
                };
                Value::State(
                    State::new(code, name)
                        .map_err(|error| CodecError::InvalidPayload(error.to_string()))?,
                )
            }
            TAG_TUPLE => {
                let count = i32::from_be_bytes(read_array(input)?);
                let mut tuple = Tuple::new();
                for _ in 0..count {
                    tuple.push(self.internalize(input)?);
                }
                Value::Tuple(tuple)
            }
            TAG_DICT => {
                let count = i32::from_be_bytes(read_array(input)?);
                let mut dict = Dict::new();
                for _ in 0..count {
                    let key = self.read_string(input)?;
                    dict.insert(key, self.internalize(input)?);
                }
                Value::Dict(dict)
            }
            TAG_OPAQUE => Value::Opaque(read_chunked(input)?),
            unknown => return Err(CodecError::UnknownTypeCode(unknown)),
        })
    }

    // ── Strings ──

    fn write_string(&self, text: &str, out: &mut dyn Write) -> Result<(), CodecError> {
        match &self.coder {
            Some(coder) => write_chunked(&coder.encode(text)?, out),
            None => write_utf_segments(text, out),
        }
    }

    /// Reads a string in whichever form this codec writes. In segment
    /// form, an empty segment terminates the string; the writer only cuts
    /// at maximal segment boundaries, so an embedded empty segment cannot
    /// occur in streams produced here.
    fn read_string(&self, input: &mut dyn Read) -> Result<String, CodecError> {
        match &self.coder {
            Some(coder) => coder.decode(&read_chunked(input)?),
            None => read_utf_segments(input),
        }
    }
}

// ─── Chunked byte arrays ──────────────────────────────────────

fn write_chunked(bytes: &[u8], out: &mut dyn Write) -> Result<(), CodecError> {
    for chunk in bytes.chunks(MAX_CHUNK) {
        out.write_all(&(chunk.len() as u16).to_be_bytes())?;
        out.write_all(chunk)?;
    }
    out.write_all(&0u16.to_be_bytes())?;
    Ok(())
}

fn read_chunked(input: &mut dyn Read) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    loop {
        let length = u16::from_be_bytes(read_array(input)?) as usize;
        if length == 0 {
            return Ok(bytes);
        }
        let start = bytes.len();
        bytes.resize(start + length, 0);
        input.read_exact(&mut bytes[start..])?;
    }
}

// ─── Modified-UTF string segments ─────────────────────────────

fn write_utf_segments(text: &str, out: &mut dyn Write) -> Result<(), CodecError> {
    let units: Vec<u16> = text.encode_utf16().collect();
    for segment in units.chunks(MAX_UTF_SEGMENT) {
        let encoded = encode_modified_utf8(segment);
        out.write_all(&(encoded.len() as u16).to_be_bytes())?;
        out.write_all(&encoded)?;
    }
    out.write_all(&0u16.to_be_bytes())?;
    Ok(())
}

fn read_utf_segments(input: &mut dyn Read) -> Result<String, CodecError> {
    let mut units = Vec::new();
    loop {
        let length = u16::from_be_bytes(read_array(input)?) as usize;
        if length == 0 {
            break;
        }
        let mut encoded = vec![0u8; length];
        input.read_exact(&mut encoded)?;
        decode_modified_utf8(&encoded, &mut units)?;
    }
    String::from_utf16(&units).map_err(|_| CodecError::InvalidModifiedUtf8)
}

/// Modified UTF-8: NUL as the two-byte form, surrogates encoded
/// individually (no four-byte sequences).
fn encode_modified_utf8(units: &[u16]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(units.len());
    for &unit in units {
        match unit {
            0x0001..=0x007F => encoded.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                encoded.push(0xC0 | (unit >> 6) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                encoded.push(0xE0 | (unit >> 12) as u8);
                encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    encoded
}

fn decode_modified_utf8(encoded: &[u8], units: &mut Vec<u16>) -> Result<(), CodecError> {
    let mut index = 0;
    while index < encoded.len() {
        let first = encoded[index];
        let unit = match first {
            0x00..=0x7F => {
                index += 1;
                u16::from(first)
            }
            0xC0..=0xDF => {
                let second = *encoded.get(index + 1).ok_or(CodecError::InvalidModifiedUtf8)?;
                if second & 0xC0 != 0x80 {
                    return Err(CodecError::InvalidModifiedUtf8);
                }
                index += 2;
                (u16::from(first & 0x1F) << 6) | u16::from(second & 0x3F)
            }
            0xE0..=0xEF => {
                let second = *encoded.get(index + 1).ok_or(CodecError::InvalidModifiedUtf8)?;
                let third = *encoded.get(index + 2).ok_or(CodecError::InvalidModifiedUtf8)?;
                if second & 0xC0 != 0x80 || third & 0xC0 != 0x80 {
                    return Err(CodecError::InvalidModifiedUtf8);
                }
                index += 3;
                (u16::from(first & 0x0F) << 12)
                    | (u16::from(second & 0x3F) << 6)
                    | u16::from(third & 0x3F)
            }
            _ => return Err(CodecError::InvalidModifiedUtf8),
        };
        units.push(unit);
    }
    Ok(())
}

// ─── Primitive reads ──────────────────────────────────────────

fn read_u8(input: &mut dyn Read) -> Result<u8, CodecError> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_array<const N: usize>(input: &mut dyn Read) -> Result<[u8; N], CodecError> {
    let mut bytes = [0u8; N];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}
