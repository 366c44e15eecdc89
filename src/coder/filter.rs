//! Filter descriptions, Filter Flags and chain construction.
//!
//! # Filter Flags
//! A filter describes itself on the wire as
//!   - VLI filter ID
//!   - VLI size of the properties
//!   - the properties
//!
//! Subblock uses its registered ID.  The identity and zstd filters live in
//! the custom ID range (bit 62 set) so they never collide with registered
//! filters.

use serde::{Deserialize, Serialize};

use crate::codec::{ZstdDecoder, ZstdEncoder};
use crate::coder::{CopyCoder, NextCoder};
use crate::error::{Error, Result};
use crate::subblock::{SubblockDecoder, SubblockEncoder, SubblockOptions};
use crate::vli;

/// Longest chain a raw encoder or decoder accepts.
pub const FILTERS_MAX: usize = 4;

pub const FILTER_SUBBLOCK: u64 = 0x01;
pub const FILTER_COPY:     u64 = 0x4000_0000_0000_0001;
pub const FILTER_ZSTD:     u64 = 0x4000_0000_0000_0002;

/// Largest property block accepted in Filter Flags.
pub const FILTER_PROPS_MAX: u64 = 256;

fn default_zstd_level() -> i32 {
    zstd::DEFAULT_COMPRESSION_LEVEL
}

/// One filter in a chain.  Listed in encoding order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Copy,
    Zstd {
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
    Subblock(SubblockOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encode,
    Decode,
}

impl Filter {
    pub fn id(&self) -> u64 {
        match self {
            Filter::Copy        => FILTER_COPY,
            Filter::Zstd { .. } => FILTER_ZSTD,
            Filter::Subblock(_) => FILTER_SUBBLOCK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::Copy        => "copy",
            Filter::Zstd { .. } => "zstd",
            Filter::Subblock(_) => "subblock",
        }
    }

    /// Property bytes carried in Filter Flags.
    pub fn props(&self) -> Vec<u8> {
        match self {
            Filter::Copy              => Vec::new(),
            Filter::Zstd { level }    => vec![*level as i8 as u8],
            Filter::Subblock(options) => vec![u8::from(options.allow_subfilters)],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Copy => Ok(()),
            Filter::Zstd { level } => {
                // The level travels as one signed byte in Filter Flags.
                if zstd::compression_level_range().contains(level) && i8::try_from(*level).is_ok() {
                    Ok(())
                } else {
                    Err(Error::Options("zstd level out of range"))
                }
            }
            Filter::Subblock(options) => options.validate(),
        }
    }

    /// Serialize as Filter Flags.
    pub fn encode_flags(&self) -> Result<Vec<u8>> {
        let props = self.props();
        let mut out = vec![0u8; vli::size(self.id()) + vli::size(props.len() as u64)];
        let mut pos = 0;
        vli::encode(self.id(), None, &mut out, &mut pos)?;
        vli::encode(props.len() as u64, None, &mut out, &mut pos)?;
        out.extend_from_slice(&props);
        Ok(out)
    }

    /// Rebuild a filter from its ID and property bytes.
    pub fn from_flags(id: u64, props: &[u8]) -> Result<Self> {
        match id {
            FILTER_COPY => {
                if !props.is_empty() {
                    return Err(Error::Options("copy filter takes no properties"));
                }
                Ok(Filter::Copy)
            }
            FILTER_ZSTD => match props {
                [level] => {
                    let filter = Filter::Zstd { level: i32::from(*level as i8) };
                    filter.validate()?;
                    Ok(filter)
                }
                _ => Err(Error::Options("zstd filter takes one property byte")),
            },
            FILTER_SUBBLOCK => match props {
                [flags] if flags & !1 == 0 => Ok(Filter::Subblock(SubblockOptions {
                    allow_subfilters: flags & 1 != 0,
                    ..SubblockOptions::default()
                })),
                _ => Err(Error::Options("invalid subblock properties")),
            },
            _ => Err(Error::Options("unknown filter ID")),
        }
    }

    /// Parse complete Filter Flags from `input[*in_pos..]`.
    pub fn decode_flags(input: &[u8], in_pos: &mut usize) -> Result<Self> {
        let mut id = 0;
        vli::decode(&mut id, None, input, in_pos)?;
        let mut size = 0;
        vli::decode(&mut size, None, input, in_pos)?;
        if size > FILTER_PROPS_MAX {
            return Err(Error::Options("filter properties are too large"));
        }
        let size = size as usize;
        if input.len() - *in_pos < size {
            return Err(Error::Data("truncated filter properties"));
        }
        let props = &input[*in_pos..*in_pos + size];
        *in_pos += size;
        Filter::from_flags(id, props)
    }
}

/// Check the shape of a whole chain before building it.
pub fn validate_chain(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() || filters.len() > FILTERS_MAX {
        return Err(Error::Options("a chain holds one to four filters"));
    }
    filters.iter().try_for_each(Filter::validate)
}

/// Build (or rebuild) the chain for `filters` at `next`.
///
/// Encoders produce the output of the last filter, so the last filter is the
/// head.  Decoders produce the output of the first.  The rest of the list is
/// handed to the head's upstream position.  An empty list ends the chain.
pub fn chain_init(next: &mut NextCoder, filters: &[Filter], direction: Direction) -> Result<()> {
    let split = match direction {
        Direction::Encode => filters.split_last(),
        Direction::Decode => filters.split_first(),
    };
    let Some((head, upstream)) = split else {
        next.end();
        return Ok(());
    };

    match (head, direction) {
        (Filter::Copy, _) => CopyCoder::init(next, upstream, direction),
        (Filter::Zstd { level }, Direction::Encode) => ZstdEncoder::init(next, *level, upstream),
        (Filter::Zstd { .. }, Direction::Decode) => ZstdDecoder::init(next, upstream),
        (Filter::Subblock(options), Direction::Encode) => {
            SubblockEncoder::init(next, options, upstream)
        }
        (Filter::Subblock(options), Direction::Decode) => {
            SubblockDecoder::init(next, options, upstream)
        }
    }
}
