//! Item flag bit layout
//!
//! Bit 0 marks compressed data. Bits 1-3 carry the type tag, and no tag
//! set means a plain UTF-8 string.

/// The data block is compressed.
pub const COMPRESS: u32 = 1;

/// The data block is a JSON document.
pub const TYPE_JSON: u32 = 1 << 1;

/// The data block is a decimal number.
pub const TYPE_NUMERIC: u32 = 1 << 2;

/// The data block is raw binary.
pub const TYPE_BINARY: u32 = 1 << 3;

/// Mask covering every type tag bit.
pub const TYPE_ALL: u32 = TYPE_JSON | TYPE_NUMERIC | TYPE_BINARY;

/// Returns true if the compression bit is set.
#[inline]
pub fn is_compressed(flags: u32) -> bool {
    flags & COMPRESS != 0
}

/// Returns the type tag bits.
#[inline]
pub fn type_of(flags: u32) -> u32 {
    flags & TYPE_ALL
}
