//! Value Codec
//!
//! Items are stored as an opaque data block plus a 32-bit flags word. This
//! module decides how typed values map onto that pair.
//!
//! - `flags`: The flag bit layout
//! - `packer`: `ValuePacker` and the pluggable `Compressor` trait

pub mod flags;
pub mod packer;

pub use packer::{CodecError, Compressor, PackedValue, Value, ValuePacker, COMPRESS_THRESHOLD};
