//! Value Packer
//!
//! Converts typed values into the `(flags, bytes)` pair stored on the
//! server and back. Compression is an injected capability: a packer built
//! without a [`Compressor`] refuses to compress and cannot read compressed
//! items.

use super::flags::{self, COMPRESS, TYPE_BINARY, TYPE_JSON, TYPE_NUMERIC};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Payloads shorter than this are stored uncompressed even when asked.
pub const COMPRESS_THRESHOLD: usize = 100;

/// Errors from packing or unpacking a value.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression requested but no compressor is configured")]
    NoCompressor,

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("invalid JSON value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid numeric value: {0:?}")]
    InvalidNumber(String),
}

/// A compression algorithm supplied by the caller.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// A value as stored in or read from the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(serde_json::Number),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Value {
    /// Returns the string if this is a plain string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{}", n),
            Value::Json(v) => write!(f, "{}", v),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

/// An encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedValue {
    pub flags: u32,
    pub data: Bytes,
}

/// Packs and unpacks values, optionally compressing large payloads.
#[derive(Clone, Default)]
pub struct ValuePacker {
    compressor: Option<Arc<dyn Compressor>>,
}

impl ValuePacker {
    pub fn new(compressor: Option<Arc<dyn Compressor>>) -> Self {
        Self { compressor }
    }

    /// Encodes a value, compressing it when asked and large enough.
    pub fn pack(&self, value: &Value, compress: bool) -> Result<PackedValue, CodecError> {
        let (mut flags, data) = match value {
            Value::String(s) => (0, Bytes::copy_from_slice(s.as_bytes())),
            Value::Number(n) => (TYPE_NUMERIC, Bytes::from(n.to_string())),
            Value::Json(v) => (TYPE_JSON, Bytes::from(serde_json::to_vec(v)?)),
            Value::Binary(b) => (TYPE_BINARY, b.clone()),
        };

        if !compress || data.len() < COMPRESS_THRESHOLD {
            return Ok(PackedValue { flags, data });
        }

        let compressor = self.compressor.as_ref().ok_or(CodecError::NoCompressor)?;
        let data = Bytes::from(compressor.compress(&data)?);
        flags |= COMPRESS;

        Ok(PackedValue { flags, data })
    }

    /// Decodes a value read from the server.
    pub fn unpack(&self, packed: PackedValue) -> Result<Value, CodecError> {
        let PackedValue { flags, mut data } = packed;

        if flags::is_compressed(flags) {
            let compressor = self.compressor.as_ref().ok_or(CodecError::NoCompressor)?;
            data = Bytes::from(compressor.decompress(&data)?);
        }

        match flags::type_of(flags) {
            TYPE_JSON => Ok(Value::Json(serde_json::from_slice(&data)?)),
            TYPE_NUMERIC => {
                let text = String::from_utf8_lossy(&data);
                text.trim()
                    .parse::<serde_json::Number>()
                    .map(Value::Number)
                    .map_err(|_| CodecError::InvalidNumber(text.into_owned()))
            }
            TYPE_BINARY => Ok(Value::Binary(data)),
            _ => Ok(Value::String(String::from_utf8_lossy(&data).into_owned())),
        }
    }
}

impl fmt::Debug for ValuePacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValuePacker")
            .field("compressor", &self.compressor.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Run-length encoding. Good enough to prove the flag plumbing.
    pub(crate) struct RunLength;

    impl Compressor for RunLength {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
            let mut out = Vec::new();
            for chunk in data.chunk_by(|a, b| a == b) {
                for run in chunk.chunks(255) {
                    out.push(run.len() as u8);
                    out.push(run[0]);
                }
            }
            Ok(out)
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
            if data.len() % 2 != 0 {
                return Err(CodecError::Decompress("odd length".into()));
            }
            let mut out = Vec::new();
            for pair in data.chunks(2) {
                out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
            }
            Ok(out)
        }
    }

    fn packer() -> ValuePacker {
        ValuePacker::new(Some(Arc::new(RunLength)))
    }

    fn samples(size: usize) -> Vec<Value> {
        vec![
            Value::from("a".repeat(size)),
            Value::from(1234567890123_i64),
            Value::Number(serde_json::Number::from_f64(3.25).unwrap()),
            Value::from(json!({ "name": "x".repeat(size), "n": [1, 2, 3] })),
            Value::from(vec![7u8; size]),
        ]
    }

    #[test]
    fn test_round_trip_small_and_large() {
        let packer = packer();
        for size in [3, COMPRESS_THRESHOLD - 1, COMPRESS_THRESHOLD, 4096] {
            for value in samples(size) {
                for compress in [false, true] {
                    let packed = packer.pack(&value, compress).unwrap();
                    assert_eq!(packer.unpack(packed).unwrap(), value);
                }
            }
        }
    }

    #[test]
    fn test_compression_threshold() {
        let packer = packer();

        let small = packer.pack(&Value::from("a".repeat(99)), true).unwrap();
        assert_eq!(small.flags, 0);
        assert_eq!(small.data.len(), 99);

        let large = packer.pack(&Value::from("a".repeat(100)), true).unwrap();
        assert_eq!(large.flags, COMPRESS);
        assert_eq!(&large.data[..], &[100, b'a']);
    }

    #[test]
    fn test_type_flags() {
        let packer = ValuePacker::default();
        assert_eq!(packer.pack(&Value::from("s"), false).unwrap().flags, 0);
        assert_eq!(packer.pack(&Value::from(5_i64), false).unwrap().flags, TYPE_NUMERIC);
        assert_eq!(packer.pack(&Value::from(json!([1])), false).unwrap().flags, TYPE_JSON);
        assert_eq!(
            packer.pack(&Value::from(vec![0u8, 1]), false).unwrap().flags,
            TYPE_BINARY
        );
    }

    #[test]
    fn test_missing_compressor() {
        let packer = ValuePacker::default();

        // Below the threshold nothing needs compressing
        assert!(packer.pack(&Value::from("short"), true).is_ok());

        let err = packer.pack(&Value::from("z".repeat(200)), true).unwrap_err();
        assert!(matches!(err, CodecError::NoCompressor));

        let packed = PackedValue {
            flags: COMPRESS,
            data: Bytes::from_static(&[3, b'x']),
        };
        assert!(matches!(packer.unpack(packed), Err(CodecError::NoCompressor)));
    }

    #[test]
    fn test_unpack_plain_is_lossy() {
        let packer = ValuePacker::default();
        let value = packer
            .unpack(PackedValue {
                flags: 0,
                data: Bytes::from_static(b"ok\xff"),
            })
            .unwrap();
        assert_eq!(value, Value::from("ok\u{fffd}"));
    }

    #[test]
    fn test_unpack_bad_number() {
        let packer = ValuePacker::default();
        let err = packer
            .unpack(PackedValue {
                flags: TYPE_NUMERIC,
                data: Bytes::from_static(b"12abc"),
            })
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidNumber(_)));
    }
}
