//! Block codecs: codec specs, compressors and the registry that dispatches
//! between them

use crate::error::{IdxError, Result};
use crate::types::{saturating_cast, DType, DataType, Sample};
use crate::with_sample_type;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

/// Default zlib level for `zip`
pub const DEFAULT_ZIP_LEVEL: u32 = 6;

/// Default level for `zstd` and for the entropy stage of `quantize`
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// How the lossy codec bounds its error
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantizeMode {
    /// Absolute error bound: `|decoded - original| <= ε`
    Accuracy(f64),
    /// Keep this many mantissa bits: relative error `<= 2^-p`
    Precision(u8),
}

/// Codec applied to a block payload.
///
/// Textual form: `codec[-param=value...]`, e.g. `zip-level=9`,
/// `quantize-accuracy=0.01`. The empty string means `raw`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CodecSpec {
    #[default]
    Raw,
    Lz4,
    Zip { level: u32 },
    Zstd { level: i32 },
    Quantize(QuantizeMode),
}

impl CodecSpec {
    pub fn zip() -> Self {
        CodecSpec::Zip { level: DEFAULT_ZIP_LEVEL }
    }

    pub fn zstd() -> Self {
        CodecSpec::Zstd { level: DEFAULT_ZSTD_LEVEL }
    }

    /// Registry key of the compressor implementing this spec
    pub fn name(&self) -> &'static str {
        match self {
            CodecSpec::Raw => "raw",
            CodecSpec::Lz4 => "lz4",
            CodecSpec::Zip { .. } => "zip",
            CodecSpec::Zstd { .. } => "zstd",
            CodecSpec::Quantize(_) => "quantize",
        }
    }

    pub fn is_lossless(&self) -> bool {
        !matches!(self, CodecSpec::Quantize(_))
    }

    /// Largest deviation the codec allows for an original value `x`
    pub fn error_bound(&self, x: f64, data_type: DataType) -> f64 {
        match self {
            CodecSpec::Quantize(QuantizeMode::Accuracy(eps)) => *eps,
            CodecSpec::Quantize(QuantizeMode::Precision(p)) if data_type.is_float() => {
                x.abs() * 2f64.powi(-(*p as i32))
            }
            _ => 0.0,
        }
    }
}

impl fmt::Display for CodecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecSpec::Raw => f.write_str("raw"),
            CodecSpec::Lz4 => f.write_str("lz4"),
            CodecSpec::Zip { level } => write!(f, "zip-level={}", level),
            CodecSpec::Zstd { level } => write!(f, "zstd-level={}", level),
            CodecSpec::Quantize(QuantizeMode::Accuracy(eps)) => {
                write!(f, "quantize-accuracy={}", eps)
            }
            CodecSpec::Quantize(QuantizeMode::Precision(p)) => {
                write!(f, "quantize-precision={}", p)
            }
        }
    }
}

/// Split `name-k=v-k=v` into the name and its parameters. A token without
/// `=` continues the previous value, so `zstd-level=-1` and
/// `quantize-accuracy=1e-3` keep their minus signs.
fn split_codec(s: &str) -> Result<(String, BTreeMap<String, String>)> {
    let mut tokens = s.split('-');
    let name = tokens.next().unwrap_or_default().trim().to_lowercase();
    let mut params: Vec<(String, String)> = Vec::new();
    for token in tokens {
        match token.split_once('=') {
            Some((k, v)) => params.push((k.trim().to_lowercase(), v.trim().to_string())),
            None => match params.last_mut() {
                Some((_, v)) => {
                    v.push('-');
                    v.push_str(token.trim());
                }
                None => {
                    return Err(IdxError::UnsupportedCodec(format!(
                        "malformed codec '{}'",
                        s
                    )))
                }
            },
        }
    }

    let mut map = BTreeMap::new();
    for (k, v) in params {
        if map.insert(k.clone(), v).is_some() {
            return Err(IdxError::UnsupportedCodec(format!(
                "parameter '{}' repeated in '{}'",
                k, s
            )));
        }
    }
    Ok((name, map))
}

fn parse_param<T: FromStr>(codec: &str, key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        IdxError::UnsupportedCodec(format!("invalid {} '{}' for codec {}", key, value, codec))
    })
}

impl FromStr for CodecSpec {
    type Err = IdxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(CodecSpec::Raw);
        }
        let (name, mut params) = split_codec(s)?;

        let spec = match name.as_str() {
            "raw" | "none" => CodecSpec::Raw,
            "lz4" => CodecSpec::Lz4,
            "zip" => {
                let level = match params.remove("level") {
                    Some(v) => parse_param::<u32>("zip", "level", &v)?,
                    None => DEFAULT_ZIP_LEVEL,
                };
                if level > 9 {
                    return Err(IdxError::UnsupportedCodec(format!(
                        "zip level {} outside 0..=9",
                        level
                    )));
                }
                CodecSpec::Zip { level }
            }
            "zstd" => {
                let level = match params.remove("level") {
                    Some(v) => parse_param::<i32>("zstd", "level", &v)?,
                    None => DEFAULT_ZSTD_LEVEL,
                };
                if !(-7..=22).contains(&level) {
                    return Err(IdxError::UnsupportedCodec(format!(
                        "zstd level {} outside -7..=22",
                        level
                    )));
                }
                CodecSpec::Zstd { level }
            }
            "quantize" => {
                let accuracy = params.remove("accuracy");
                let precision = params.remove("precision");
                match (accuracy, precision) {
                    (Some(a), None) => {
                        let eps: f64 = parse_param("quantize", "accuracy", &a)?;
                        if !(eps.is_finite() && eps > 0.0) {
                            return Err(IdxError::UnsupportedCodec(format!(
                                "quantize accuracy must be positive, got {}",
                                a
                            )));
                        }
                        CodecSpec::Quantize(QuantizeMode::Accuracy(eps))
                    }
                    (None, Some(p)) => {
                        let bits: u8 = parse_param("quantize", "precision", &p)?;
                        if !(1..=52).contains(&bits) {
                            return Err(IdxError::UnsupportedCodec(format!(
                                "quantize precision {} outside 1..=52",
                                bits
                            )));
                        }
                        CodecSpec::Quantize(QuantizeMode::Precision(bits))
                    }
                    _ => {
                        return Err(IdxError::UnsupportedCodec(format!(
                            "quantize needs exactly one of accuracy or precision: '{}'",
                            s
                        )))
                    }
                }
            }
            other => {
                return Err(IdxError::UnsupportedCodec(other.to_string()));
            }
        };

        if let Some(key) = params.keys().next() {
            return Err(IdxError::UnsupportedCodec(format!(
                "unknown parameter '{}' for codec {}",
                key, name
            )));
        }
        Ok(spec)
    }
}

impl TryFrom<String> for CodecSpec {
    type Error = IdxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CodecSpec> for String {
    fn from(value: CodecSpec) -> Self {
        value.to_string()
    }
}

/// Trait for block compression/decompression
pub trait Compressor: Send + Sync {
    /// Registry key, matching [`CodecSpec::name`]
    fn name(&self) -> &'static str;

    /// Compress `data`, a buffer of `dtype` samples
    fn compress(&self, data: &[u8], spec: &CodecSpec, dtype: DType) -> Result<Vec<u8>>;

    /// Decompress into exactly `expected_size` bytes
    fn decompress(
        &self,
        data: &[u8],
        spec: &CodecSpec,
        dtype: DType,
        expected_size: usize,
    ) -> Result<Vec<u8>>;
}

/// No compression
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn compress(&self, data: &[u8], _spec: &CodecSpec, _dtype: DType) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(
        &self,
        data: &[u8],
        _spec: &CodecSpec,
        _dtype: DType,
        _expected_size: usize,
    ) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// zlib stream (`zip`)
#[derive(Debug, Default)]
pub struct ZipCompressor;

impl Compressor for ZipCompressor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn compress(&self, data: &[u8], spec: &CodecSpec, _dtype: DType) -> Result<Vec<u8>> {
        let level = match spec {
            CodecSpec::Zip { level } => *level,
            _ => DEFAULT_ZIP_LEVEL,
        };
        let mut encoder = ZlibEncoder::new(data, FlateCompression::new(level));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| IdxError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(
        &self,
        data: &[u8],
        _spec: &CodecSpec,
        _dtype: DType,
        expected_size: usize,
    ) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| IdxError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8], spec: &CodecSpec, _dtype: DType) -> Result<Vec<u8>> {
        let level = match spec {
            CodecSpec::Zstd { level } => *level,
            _ => DEFAULT_ZSTD_LEVEL,
        };
        zstd::encode_all(data, level).map_err(|e| IdxError::Compression(e.to_string()))
    }

    fn decompress(
        &self,
        data: &[u8],
        _spec: &CodecSpec,
        _dtype: DType,
        _expected_size: usize,
    ) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| IdxError::Decompression(e.to_string()))
    }
}

/// LZ4 block format with the uncompressed size prepended
#[derive(Debug, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8], _spec: &CodecSpec, _dtype: DType) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(
        &self,
        data: &[u8],
        _spec: &CodecSpec,
        _dtype: DType,
        _expected_size: usize,
    ) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| IdxError::Decompression(e.to_string()))
    }
}

const QUANTIZE_VERBATIM: u8 = 0;
const QUANTIZE_ACCURACY: u8 = 1;
const QUANTIZE_PRECISION: u8 = 2;

/// Largest quantized magnitude; keeps `q * ε` exact in an `f64`
const QUANTIZE_MAX_LEVEL: f64 = (1u64 << 52) as f64;

/// Error-bounded lossy codec.
///
/// `accuracy=ε` rounds every scalar to the nearest multiple of `ε` and
/// entropy-codes the zigzag deltas of the multiples. `precision=p` clears all
/// but the top `p` mantissa bits of float scalars; integers pass through
/// exactly. Blocks that cannot honor the bound (non-finite values, magnitudes
/// beyond the quantizer range) are stored verbatim.
#[derive(Debug, Default)]
pub struct QuantizeCompressor;

fn push_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut ret = 0u64;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| IdxError::Decompression("truncated quantized stream".to_string()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(IdxError::Decompression("varint overflow".to_string()));
        }
        ret |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(ret);
        }
        shift += 7;
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn quantize_levels<T: Sample>(data: &[u8], eps: f64) -> Option<Vec<i64>> {
    let size = std::mem::size_of::<T>();
    let mut levels = Vec::with_capacity(data.len() / size);
    for chunk in data.chunks_exact(size) {
        let value = T::read_le(chunk);
        let x = value.to_f64()?;
        if !x.is_finite() {
            return None;
        }
        let q = (x / eps).round();
        if q.abs() > QUANTIZE_MAX_LEVEL {
            return None;
        }
        let q = q as i64;
        // the bound has to hold after the cast back to T
        let back: T = saturating_cast(q as f64 * eps);
        let error = if T::DATA_TYPE.is_integer() {
            // 64-bit integers lose precision in an f64
            (back.to_i128()? - value.to_i128()?).unsigned_abs() as f64
        } else {
            (back.to_f64()? - x).abs()
        };
        if error > eps {
            return None;
        }
        levels.push(q);
    }
    Some(levels)
}

fn dequantize_levels<T: Sample>(levels: &[i64], eps: f64, out: &mut [u8]) {
    let size = std::mem::size_of::<T>();
    for (q, chunk) in levels.iter().zip(out.chunks_exact_mut(size)) {
        let value: T = saturating_cast(*q as f64 * eps);
        value.write_le(chunk);
    }
}

fn truncate_mantissa(data: &[u8], data_type: DataType, bits: u8) -> Option<Vec<u8>> {
    let mut out = data.to_vec();
    match data_type {
        DataType::F32 => {
            let drop = 23u32.saturating_sub(bits as u32);
            let mask = !((1u32 << drop) - 1);
            for chunk in out.chunks_exact_mut(4) {
                let v = f32::read_le(chunk);
                if !v.is_finite() {
                    return None;
                }
                f32::from_bits(v.to_bits() & mask).write_le(chunk);
            }
        }
        DataType::F64 => {
            let drop = 52u32.saturating_sub(bits as u32);
            let mask = !((1u64 << drop) - 1);
            for chunk in out.chunks_exact_mut(8) {
                let v = f64::read_le(chunk);
                if !v.is_finite() {
                    return None;
                }
                f64::from_bits(v.to_bits() & mask).write_le(chunk);
            }
        }
        _ => {}
    }
    Some(out)
}

impl QuantizeCompressor {
    fn verbatim(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![QUANTIZE_VERBATIM];
        out.extend(
            zstd::encode_all(data, DEFAULT_ZSTD_LEVEL)
                .map_err(|e| IdxError::Compression(e.to_string()))?,
        );
        Ok(out)
    }
}

impl Compressor for QuantizeCompressor {
    fn name(&self) -> &'static str {
        "quantize"
    }

    fn compress(&self, data: &[u8], spec: &CodecSpec, dtype: DType) -> Result<Vec<u8>> {
        let mode = match spec {
            CodecSpec::Quantize(mode) => *mode,
            other => {
                return Err(IdxError::UnsupportedCodec(format!(
                    "quantize compressor asked to encode {}",
                    other
                )))
            }
        };

        match mode {
            QuantizeMode::Accuracy(eps) => {
                // integers below unit accuracy cannot lose anything useful
                if dtype.scalar.is_integer() && eps < 1.0 {
                    return Self::verbatim(data);
                }
                let levels = with_sample_type!(dtype.scalar, T => quantize_levels::<T>(data, eps));
                let levels = match levels {
                    Some(levels) => levels,
                    None => {
                        tracing::debug!("quantizer falling back to verbatim storage");
                        return Self::verbatim(data);
                    }
                };

                let mut stream = Vec::with_capacity(levels.len());
                let mut prev = 0i64;
                for q in levels {
                    push_varint(&mut stream, zigzag(q.wrapping_sub(prev)));
                    prev = q;
                }

                let mut out = vec![QUANTIZE_ACCURACY];
                out.extend_from_slice(&eps.to_le_bytes());
                out.extend(
                    zstd::encode_all(stream.as_slice(), DEFAULT_ZSTD_LEVEL)
                        .map_err(|e| IdxError::Compression(e.to_string()))?,
                );
                Ok(out)
            }
            QuantizeMode::Precision(bits) => {
                if dtype.scalar.is_integer() {
                    return Self::verbatim(data);
                }
                match truncate_mantissa(data, dtype.scalar, bits) {
                    Some(truncated) => {
                        let mut out = vec![QUANTIZE_PRECISION];
                        out.extend(
                            zstd::encode_all(truncated.as_slice(), DEFAULT_ZSTD_LEVEL)
                                .map_err(|e| IdxError::Compression(e.to_string()))?,
                        );
                        Ok(out)
                    }
                    None => Self::verbatim(data),
                }
            }
        }
    }

    fn decompress(
        &self,
        data: &[u8],
        _spec: &CodecSpec,
        dtype: DType,
        expected_size: usize,
    ) -> Result<Vec<u8>> {
        let (&flag, body) = data
            .split_first()
            .ok_or_else(|| IdxError::Decompression("empty quantized payload".to_string()))?;

        match flag {
            QUANTIZE_VERBATIM | QUANTIZE_PRECISION => {
                zstd::decode_all(body).map_err(|e| IdxError::Decompression(e.to_string()))
            }
            QUANTIZE_ACCURACY => {
                if body.len() < 8 {
                    return Err(IdxError::Decompression("truncated quantizer header".to_string()));
                }
                let mut raw_eps = [0u8; 8];
                raw_eps.copy_from_slice(&body[..8]);
                let eps = f64::from_le_bytes(raw_eps);
                let stream = zstd::decode_all(&body[8..])
                    .map_err(|e| IdxError::Decompression(e.to_string()))?;

                let count = expected_size / dtype.scalar.size_in_bytes();
                let mut levels = Vec::with_capacity(count);
                let mut pos = 0usize;
                let mut prev = 0i64;
                for _ in 0..count {
                    prev = prev.wrapping_add(unzigzag(read_varint(&stream, &mut pos)?));
                    levels.push(prev);
                }

                let mut out = vec![0u8; expected_size];
                with_sample_type!(dtype.scalar, T => dequantize_levels::<T>(&levels, eps, &mut out));
                Ok(out)
            }
            other => Err(IdxError::Decompression(format!(
                "unknown quantizer flag {}",
                other
            ))),
        }
    }
}

/// Maps codec names to compressors. Each dataset handle owns one.
#[derive(Clone)]
pub struct CodecRegistry {
    compressors: BTreeMap<&'static str, Arc<dyn Compressor>>,
}

impl CodecRegistry {
    /// Registry without any codec
    pub fn empty() -> Self {
        Self {
            compressors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in codec
    pub fn with_defaults() -> Self {
        let mut ret = Self::empty();
        ret.register(Arc::new(NoneCompressor));
        ret.register(Arc::new(ZipCompressor));
        ret.register(Arc::new(ZstdCompressor));
        ret.register(Arc::new(Lz4Compressor));
        ret.register(Arc::new(QuantizeCompressor));
        ret
    }

    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(compressor.name(), compressor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.compressors.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Compressor>> {
        self.compressors
            .get(name)
            .cloned()
            .ok_or_else(|| IdxError::UnsupportedCodec(format!("codec '{}' is not registered", name)))
    }

    pub fn encode(&self, spec: &CodecSpec, raw: &[u8], dtype: DType) -> Result<Vec<u8>> {
        self.get(spec.name())?.compress(raw, spec, dtype)
    }

    /// Decode and check the decoded length
    pub fn decode(
        &self,
        spec: &CodecSpec,
        encoded: &[u8],
        dtype: DType,
        expected_size: usize,
    ) -> Result<Vec<u8>> {
        let decoded = self
            .get(spec.name())?
            .decompress(encoded, spec, dtype, expected_size)?;
        if decoded.len() != expected_size {
            return Err(IdxError::Decompression(format!(
                "{} produced {} bytes, expected {}",
                spec,
                decoded.len(),
                expected_size
            )));
        }
        Ok(decoded)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
