//! Subblock filter.
//!
//! Frames arbitrary payload into self-describing chunks.  Every chunk starts
//! with one marker byte; the high nibble selects the chunk type:
//!
//! ```text
//! 0x00  Padding          single byte, low nibble zero
//! 0x10  End of Payload   single byte, low nibble zero
//! 0x2s  Data             3 more size bytes, then size bytes of data
//! 0x3s  Repeating Data   3 more count bytes, pattern size - 1, pattern
//! 0x40  Set Subfilter    Filter Flags of the subfilter follow
//! 0x50  End Subfilter    single byte, low nibble zero
//! ```
//!
//! Sizes and counts are stored minus one, 28 bits wide: the low nibble of the
//! marker holds bits 0..4, the next three bytes hold bits 4..28.
//!
//! Padding may only precede a Data or Repeating Data chunk, and only when the
//! padding count is smaller than the data size (pattern size for a repeat).
//!
//! Between Set Subfilter and End Subfilter, chunk payload is the output of a
//! nested chain.  At most one subfilter is active at a time and it must
//! produce at least one byte.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod decoder;
pub mod encoder;

pub use decoder::SubblockDecoder;
pub use encoder::SubblockEncoder;

// ── Limits ───────────────────────────────────────────────────────────────────

pub const ALIGNMENT_MIN:     u32 = 1;
pub const ALIGNMENT_MAX:     u32 = 32;
pub const ALIGNMENT_DEFAULT: u32 = 4;

pub const CHUNK_SIZE_MIN:     usize = 1;
pub const CHUNK_SIZE_MAX:     usize = 1 << 28;
pub const CHUNK_SIZE_DEFAULT: usize = 4096;

/// Longest run-length unit.
pub const RLE_MAX: usize = 256;

/// Largest size or repeat count one marker can express.
pub const MARKER_COUNT_MAX: u64 = 1 << 28;

/// Staging buffer between the framing and a nested subfilter chain.
pub(crate) const SUBFILTER_BUF_SIZE: usize = 4096;

// ── Markers ──────────────────────────────────────────────────────────────────

pub(crate) const MARKER_PADDING:        u8 = 0x00;
pub(crate) const MARKER_END_OF_PAYLOAD: u8 = 0x10;
pub(crate) const MARKER_DATA:           u8 = 0x20;
pub(crate) const MARKER_REPEAT:         u8 = 0x30;
pub(crate) const MARKER_SET_SUBFILTER:  u8 = 0x40;
pub(crate) const MARKER_END_SUBFILTER:  u8 = 0x50;

// ── Options ──────────────────────────────────────────────────────────────────

/// Subblock encoder and decoder settings.
///
/// Only `allow_subfilters` is stored in Filter Flags.  The other fields shape
/// the encoder's output and the decoder does not need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubblockOptions {
    pub allow_subfilters: bool,
    /// Chunk payloads are padded to start at an output offset congruent to
    /// their input offset modulo this.
    pub alignment:        u32,
    /// Largest Data chunk the encoder writes.
    pub chunk_size:       usize,
    /// Run-length unit in bytes.  0 disables run-length detection.
    pub rle:              usize,
}

impl Default for SubblockOptions {
    fn default() -> Self {
        SubblockOptions {
            allow_subfilters: false,
            alignment:        ALIGNMENT_DEFAULT,
            chunk_size:       CHUNK_SIZE_DEFAULT,
            rle:              0,
        }
    }
}

impl SubblockOptions {
    pub fn validate(&self) -> Result<()> {
        if !(ALIGNMENT_MIN..=ALIGNMENT_MAX).contains(&self.alignment) {
            return Err(Error::Options("subblock alignment must be 1 to 32"));
        }
        if !(CHUNK_SIZE_MIN..=CHUNK_SIZE_MAX).contains(&self.chunk_size) {
            return Err(Error::Options("subblock chunk size must be 1 B to 256 MiB"));
        }
        if self.rle > RLE_MAX {
            return Err(Error::Options("subblock run-length unit must be 0 to 256"));
        }
        Ok(())
    }
}

/// Header bytes of a 28-bit size field: low nibble in the marker, then three
/// more bytes.
pub(crate) fn size_header(marker: u8, value: u64) -> [u8; 4] {
    let v = value - 1;
    [
        marker | (v & 0x0F) as u8,
        (v >> 4) as u8,
        (v >> 12) as u8,
        (v >> 20) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_header_layout() {
        assert_eq!(size_header(MARKER_DATA, 1), [0x20, 0, 0, 0]);
        assert_eq!(size_header(MARKER_REPEAT, 10), [0x39, 0, 0, 0]);
        assert_eq!(size_header(MARKER_DATA, MARKER_COUNT_MAX), [0x2F, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn options_bounds() {
        assert!(SubblockOptions::default().validate().is_ok());
        let bad = SubblockOptions { alignment: 33, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SubblockOptions { chunk_size: 0, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = SubblockOptions { rle: 257, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn options_from_partial_json() {
        let options: SubblockOptions = serde_json::from_str(r#"{"rle": 2}"#).unwrap();
        assert_eq!(options.rle, 2);
        assert_eq!(options.alignment, ALIGNMENT_DEFAULT);
        assert_eq!(options.chunk_size, CHUNK_SIZE_DEFAULT);
    }
}
