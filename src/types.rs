//! Core sample types

use crate::error::{IdxError, Result};
use num_traits::{Bounded, NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scalar data types supported by fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    /// Canonical lowercase name (`uint8`, `float32`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::I8 => "int8",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    /// Number of mantissa bits for float types, total bits for integers
    pub fn significant_bits(&self) -> u32 {
        match self {
            DataType::F32 => 23,
            DataType::F64 => 52,
            other => (other.size_in_bytes() * 8) as u32,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = IdxError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "uint8" | "u8" => DataType::U8,
            "uint16" | "u16" => DataType::U16,
            "uint32" | "u32" => DataType::U32,
            "uint64" | "u64" => DataType::U64,
            "int8" | "i8" => DataType::I8,
            "int16" | "i16" => DataType::I16,
            "int32" | "i32" => DataType::I32,
            "int64" | "i64" => DataType::I64,
            "float32" | "f32" => DataType::F32,
            "float64" | "f64" => DataType::F64,
            other => {
                return Err(IdxError::ParseError(format!("unknown data type '{}'", other)))
            }
        })
    }
}

/// Element type of a field: a scalar type with a fixed number of components
/// (`uint8[3]` for RGB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DType {
    pub scalar: DataType,
    pub components: u16,
}

impl DType {
    pub fn new(scalar: DataType, components: u16) -> Self {
        Self {
            scalar,
            components: components.max(1),
        }
    }

    pub fn scalar(scalar: DataType) -> Self {
        Self::new(scalar, 1)
    }

    /// Bytes per sample (all components)
    pub fn sample_size(&self) -> usize {
        self.scalar.size_in_bytes() * self.components as usize
    }

    /// Bytes needed for `num_samples` samples
    pub fn byte_size(&self, num_samples: u64) -> usize {
        num_samples as usize * self.sample_size()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components == 1 {
            write!(f, "{}", self.scalar)
        } else {
            write!(f, "{}[{}]", self.scalar, self.components)
        }
    }
}

impl FromStr for DType {
    type Err = IdxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.find('[') {
            None => Ok(DType::scalar(s.parse()?)),
            Some(open) => {
                let close = s
                    .strip_suffix(']')
                    .ok_or_else(|| IdxError::ParseError(format!("malformed dtype '{}'", s)))?;
                let components: u16 = close[open + 1..]
                    .trim()
                    .parse()
                    .map_err(|_| IdxError::ParseError(format!("malformed dtype '{}'", s)))?;
                if components == 0 {
                    return Err(IdxError::ParseError(format!(
                        "dtype '{}' has zero components",
                        s
                    )));
                }
                Ok(DType::new(s[..open].parse()?, components))
            }
        }
    }
}

impl TryFrom<String> for DType {
    type Error = IdxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DType> for String {
    fn from(value: DType) -> Self {
        value.to_string()
    }
}

/// A native scalar that can be stored in a field. Samples are little-endian on
/// disk and in every buffer the crate hands out.
pub trait Sample: Copy + Default + PartialOrd + ToPrimitive + NumCast + Bounded + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_sample {
    ($($t:ty => $dt:expr),* $(,)?) => {
        $(
            impl Sample for $t {
                const DATA_TYPE: DataType = $dt;

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                    <$t>::from_le_bytes(raw)
                }

                fn write_le(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_sample!(
    u8 => DataType::U8,
    u16 => DataType::U16,
    u32 => DataType::U32,
    u64 => DataType::U64,
    i8 => DataType::I8,
    i16 => DataType::I16,
    i32 => DataType::I32,
    i64 => DataType::I64,
    f32 => DataType::F32,
    f64 => DataType::F64,
);

/// Run `$body` with `$T` bound to the native type of a [`DataType`].
#[macro_export]
macro_rules! with_sample_type {
    ($dt:expr, $T:ident => $body:expr) => {
        match $dt {
            $crate::types::DataType::U8 => { type $T = u8; $body }
            $crate::types::DataType::U16 => { type $T = u16; $body }
            $crate::types::DataType::U32 => { type $T = u32; $body }
            $crate::types::DataType::U64 => { type $T = u64; $body }
            $crate::types::DataType::I8 => { type $T = i8; $body }
            $crate::types::DataType::I16 => { type $T = i16; $body }
            $crate::types::DataType::I32 => { type $T = i32; $body }
            $crate::types::DataType::I64 => { type $T = i64; $body }
            $crate::types::DataType::F32 => { type $T = f32; $body }
            $crate::types::DataType::F64 => { type $T = f64; $body }
        }
    };
}

/// Convert an `f64` to `T`, rounding integers and saturating at the type range.
pub fn saturating_cast<T: Sample>(value: f64) -> T {
    if value.is_nan() {
        return T::default();
    }
    let lo = T::min_value().to_f64().unwrap_or(f64::MIN);
    let hi = T::max_value().to_f64().unwrap_or(f64::MAX);
    let value = if T::DATA_TYPE.is_integer() {
        value.round()
    } else {
        value
    };
    if value <= lo {
        return T::min_value();
    }
    if value >= hi {
        return T::max_value();
    }
    <T as NumCast>::from(value).unwrap_or_default()
}

/// Encode one sample (every component set to `value`) for `dtype`.
pub fn encode_sample(dtype: DType, value: f64) -> Vec<u8> {
    let scalar_size = dtype.scalar.size_in_bytes();
    let mut out = vec![0u8; dtype.sample_size()];
    with_sample_type!(dtype.scalar, T => {
        let v: T = saturating_cast(value);
        for chunk in out.chunks_exact_mut(scalar_size) {
            v.write_le(chunk);
        }
    });
    out
}

/// Build a buffer of `num_samples` samples all equal to `value`.
pub fn filled_buffer(dtype: DType, num_samples: u64, value: f64) -> Vec<u8> {
    if value == 0.0 {
        return vec![0u8; dtype.byte_size(num_samples)];
    }
    encode_sample(dtype, value).repeat(num_samples as usize)
}

/// Reinterpret a little-endian buffer as native values.
pub fn bytes_to_samples<T: Sample>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = std::mem::size_of::<T>();
    if bytes.len() % size != 0 {
        return Err(IdxError::InvalidGeometry(format!(
            "buffer of {} bytes is not a multiple of {}",
            bytes.len(),
            size
        )));
    }
    Ok(bytes.chunks_exact(size).map(T::read_le).collect())
}

/// Serialize native values into a little-endian buffer.
pub fn samples_to_bytes<T: Sample>(values: &[T]) -> Vec<u8> {
    let size = std::mem::size_of::<T>();
    let mut out = vec![0u8; values.len() * size];
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(size)) {
        value.write_le(chunk);
    }
    out
}
