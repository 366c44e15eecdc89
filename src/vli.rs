//! Variable-length integers.
//!
//! Seven payload bits per byte, least significant group first, high bit set
//! on every byte except the last.  Encodings are minimal, so at most
//! [`VLI_BYTES_MAX`] bytes are ever used.
//!
//! Both directions work in two modes.  Passing `None` as the position runs
//! the codec in single-call mode: the whole integer must fit (or be
//! available) in one go.  Passing `Some(&mut pos)` runs it in multi-call
//! mode: the codec may stop anywhere and resume on the next call, returning
//! `Status::StreamEnd` once the integer is complete.

use crate::coder::Status;
use crate::error::{Error, Result};

/// Largest value a VLI can carry.
pub const VLI_MAX: u64 = u64::MAX / 2;

/// Sentinel for "size not known".  Never encodable.
pub const VLI_UNKNOWN: u64 = u64::MAX;

/// Maximum encoded length.
pub const VLI_BYTES_MAX: usize = 9;

#[inline]
pub fn is_valid(vli: u64) -> bool {
    vli <= VLI_MAX || vli == VLI_UNKNOWN
}

/// Number of bytes `vli` encodes to, or 0 if it is not encodable.
pub fn size(vli: u64) -> usize {
    if vli > VLI_MAX {
        return 0;
    }
    let mut vli = vli;
    let mut n = 0;
    loop {
        vli >>= 7;
        n += 1;
        if vli == 0 {
            return n;
        }
    }
}

/// Round up to the next multiple of four.
#[inline]
pub fn ceil4(vli: u64) -> u64 {
    (vli + 3) & !3
}

/// Encode `vli` into `out[*out_pos..]`.
pub fn encode(
    vli: u64,
    vli_pos: Option<&mut usize>,
    out: &mut [u8],
    out_pos: &mut usize,
) -> Result<Status> {
    if vli > VLI_MAX {
        return Err(Error::Prog("integer out of range"));
    }

    let mut single = 0usize;
    let single_call = vli_pos.is_none();
    let pos = match vli_pos {
        Some(p) => p,
        None => {
            // Fail before touching the output.
            if out.len().saturating_sub(*out_pos) < size(vli) {
                return Err(Error::Prog("output buffer too small"));
            }
            &mut single
        }
    };

    if *pos >= VLI_BYTES_MAX {
        return Err(Error::Prog("integer position out of range"));
    }
    if *out_pos >= out.len() {
        return Err(if single_call {
            Error::Prog("output buffer too small")
        } else {
            Error::Buf
        });
    }

    let mut rest = vli >> (7 * *pos);
    // A resumed call must still have something left to write.
    if *pos != 0 && rest == 0 {
        return Err(Error::Prog("integer already encoded"));
    }

    while *out_pos < out.len() {
        let more = rest >= 0x80;
        out[*out_pos] = (rest as u8 & 0x7F) | if more { 0x80 } else { 0 };
        *out_pos += 1;
        *pos += 1;
        rest >>= 7;
        if !more {
            return Ok(if single_call { Status::Ok } else { Status::StreamEnd });
        }
    }

    if single_call {
        Err(Error::Prog("output buffer too small"))
    } else {
        Ok(Status::Ok)
    }
}

/// Decode a VLI from `input[*in_pos..]` into `vli`.
///
/// In multi-call mode `vli` must be zero when `*vli_pos` is zero; the partial
/// value accumulates there between calls.
pub fn decode(
    vli: &mut u64,
    vli_pos: Option<&mut usize>,
    input: &[u8],
    in_pos: &mut usize,
) -> Result<Status> {
    let mut single = 0usize;
    let single_call = vli_pos.is_none();
    let pos = match vli_pos {
        Some(p) => p,
        None => {
            *vli = 0;
            &mut single
        }
    };

    if *pos == 0 {
        *vli = 0;
    } else if *pos >= VLI_BYTES_MAX || (*vli >> (7 * *pos)) != 0 {
        return Err(Error::Prog("integer position out of range"));
    }

    if *in_pos >= input.len() {
        return Err(if single_call {
            Error::Data("truncated integer")
        } else {
            Error::Buf
        });
    }

    while *in_pos < input.len() {
        let byte = input[*in_pos];
        *in_pos += 1;

        *vli |= u64::from(byte & 0x7F) << (7 * *pos);
        *pos += 1;

        if byte & 0x80 == 0 {
            // A zero terminator after other bytes is a padded encoding.
            if byte == 0x00 && *pos > 1 {
                return Err(Error::Data("non-minimal integer encoding"));
            }
            return Ok(if single_call { Status::Ok } else { Status::StreamEnd });
        }

        if *pos == VLI_BYTES_MAX {
            return Err(Error::Data("integer too long"));
        }
    }

    if single_call {
        Err(Error::Data("truncated integer"))
    } else {
        Ok(Status::Ok)
    }
}
