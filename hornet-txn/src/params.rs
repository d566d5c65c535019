//! Procedure parameter sets and their wire codec.
//!
//! The codec covers the prefetch batch of the transaction-init request,
//! which ships parameter sets in serialized form. Encoding is a tag byte
//! followed by a fixed or length-prefixed payload; every decode failure is a
//! structured error so the init callback can translate it into a
//! transaction abort.

use hornet_common::error::{HornetError, HornetResult};

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_ARRAY: u8 = 5;

/// One procedure parameter value.
///
/// Doubles carry their raw bits so equality is total and bit-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// SQL null.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// IEEE-754 double, stored as raw bits.
    Double(u64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte payload.
    Bytes(Vec<u8>),
    /// Array-typed parameter.
    Array(Vec<ParamValue>),
}

impl ParamValue {
    /// Wraps an `f64` preserving its exact bits.
    #[must_use]
    pub fn double(value: f64) -> Self {
        Self::Double(value.to_bits())
    }

    /// Indexes into an array-typed value.
    #[must_use]
    pub fn array_element(&self, offset: usize) -> Option<&ParamValue> {
        match self {
            Self::Array(values) => values.get(offset),
            _ => None,
        }
    }
}

/// Ordered parameter values of one procedure invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    values: Vec<ParamValue>,
}

impl ParamSet {
    /// Creates a parameter set from its values.
    #[must_use]
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self { values }
    }

    /// Returns the value at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns whether the set carries no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable fingerprint over the parameter values, used as the path-cache
    /// key for estimator-state reuse.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.encode().hash(&mut hasher);
        hasher.finish()
    }

    /// Encodes the set into its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut output = Vec::new();
        write_u32(&mut output, self.values.len() as u32);
        for value in &self.values {
            encode_value(&mut output, value);
        }
        output
    }

    /// Decodes a wire payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error on truncated input, unknown tags, invalid
    /// UTF-8, or trailing garbage.
    pub fn decode(input: &[u8]) -> HornetResult<Self> {
        let mut cursor = Cursor { input, offset: 0 };
        let count = cursor.read_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            values.push(decode_value(&mut cursor)?);
        }
        if cursor.offset != input.len() {
            return Err(HornetError::Codec(
                "trailing bytes after parameter set".to_owned(),
            ));
        }
        Ok(Self { values })
    }
}

fn encode_value(output: &mut Vec<u8>, value: &ParamValue) {
    match value {
        ParamValue::Null => output.push(TAG_NULL),
        ParamValue::Int(v) => {
            output.push(TAG_INT);
            output.extend_from_slice(&v.to_be_bytes());
        }
        ParamValue::Double(bits) => {
            output.push(TAG_DOUBLE);
            output.extend_from_slice(&bits.to_be_bytes());
        }
        ParamValue::Str(v) => {
            output.push(TAG_STR);
            write_u32(output, v.len() as u32);
            output.extend_from_slice(v.as_bytes());
        }
        ParamValue::Bytes(v) => {
            output.push(TAG_BYTES);
            write_u32(output, v.len() as u32);
            output.extend_from_slice(v);
        }
        ParamValue::Array(values) => {
            output.push(TAG_ARRAY);
            write_u32(output, values.len() as u32);
            for element in values {
                encode_value(output, element);
            }
        }
    }
}

fn decode_value(cursor: &mut Cursor<'_>) -> HornetResult<ParamValue> {
    let tag = cursor.read_u8()?;
    match tag {
        TAG_NULL => Ok(ParamValue::Null),
        TAG_INT => Ok(ParamValue::Int(i64::from_be_bytes(cursor.read_array()?))),
        TAG_DOUBLE => Ok(ParamValue::Double(u64::from_be_bytes(cursor.read_array()?))),
        TAG_STR => {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.read_slice(len)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|_| HornetError::Codec("string parameter is not utf-8".to_owned()))?;
            Ok(ParamValue::Str(text.to_owned()))
        }
        TAG_BYTES => {
            let len = cursor.read_u32()? as usize;
            Ok(ParamValue::Bytes(cursor.read_slice(len)?.to_vec()))
        }
        TAG_ARRAY => {
            let len = cursor.read_u32()? as usize;
            let mut values = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                values.push(decode_value(cursor)?);
            }
            Ok(ParamValue::Array(values))
        }
        unknown => Err(HornetError::Codec(format!(
            "unknown parameter tag {unknown}"
        ))),
    }
}

fn write_u32(output: &mut Vec<u8>, value: u32) {
    output.extend_from_slice(&value.to_be_bytes());
}

struct Cursor<'a> {
    input: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn read_u8(&mut self) -> HornetResult<u8> {
        let byte = *self
            .input
            .get(self.offset)
            .ok_or_else(|| HornetError::Codec("truncated parameter set".to_owned()))?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> HornetResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> HornetResult<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut array = [0_u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn read_slice(&mut self, len: usize) -> HornetResult<&[u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| HornetError::Codec("truncated parameter set".to_owned()))?;
        let slice = &self.input[self.offset..end];
        self.offset = end;
        Ok(slice)
    }
}
