//! Index field writer.
//!
//! ```text
//! Indicator (0x00) | Number of Records | { Unpadded | Uncompressed }* | Padding | CRC32
//! ```

use std::any::Any;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use crate::coder::{Action, Check, Coder, NextCoder, Status};
use crate::error::{Error, Result};
use crate::index::{Index, Record, INDEX_INDICATOR};
use crate::vli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Sequence {
    Indicator,
    Count,
    Next,
    Unpadded,
    Uncompressed,
    Padding,
    Crc32,
    Done,
}

#[derive(Debug)]
pub struct IndexEncoder {
    sequence: Sequence,
    index:    Index,
    record:   Option<Record>,
    vli_pos:  usize,
    /// Position inside the padding or CRC32 field.
    pos:      usize,
    /// Running CRC32 of everything before the CRC32 field.
    crc32:    u32,
    crc_le:   [u8; 4],
}

impl IndexEncoder {
    pub(crate) fn init(next: &mut NextCoder, index: Index) {
        if let Some(coder) = next.reuse::<IndexEncoder>() {
            coder.reset(index);
            return;
        }
        next.set(IndexEncoder::new(index));
    }

    pub fn new(mut index: Index) -> Self {
        index.rewind();
        IndexEncoder {
            sequence: Sequence::Indicator,
            index,
            record:   None,
            vli_pos:  0,
            pos:      0,
            crc32:    0,
            crc_le:   [0; 4],
        }
    }

    fn reset(&mut self, index: Index) {
        *self = IndexEncoder::new(index);
    }

    /// Zero bytes needed to reach a four-byte boundary before the CRC32.
    fn padding_size(&self) -> usize {
        let unpadded = 1 + vli::size(self.index.count()) as u64 + self.index.index_list_size();
        ((4 - unpadded % 4) % 4) as usize
    }

    fn encode(&mut self, out: &mut [u8], out_pos: &mut usize) -> Result<Status> {
        while *out_pos < out.len() {
            match self.sequence {
                Sequence::Indicator => {
                    out[*out_pos] = INDEX_INDICATOR;
                    *out_pos += 1;
                    self.sequence = Sequence::Count;
                }
                Sequence::Count => {
                    if vli::encode(self.index.count(), Some(&mut self.vli_pos), out, out_pos)?
                        == Status::Ok
                    {
                        return Ok(Status::Ok);
                    }
                    self.vli_pos = 0;
                    self.sequence = Sequence::Next;
                }
                Sequence::Next => {
                    self.record = self.index.read();
                    self.sequence = if self.record.is_some() {
                        Sequence::Unpadded
                    } else {
                        Sequence::Padding
                    };
                }
                Sequence::Unpadded | Sequence::Uncompressed => {
                    let Some(record) = self.record else {
                        return Err(Error::Prog("index encoder lost its record"));
                    };
                    let value = if self.sequence == Sequence::Unpadded {
                        record.unpadded_size
                    } else {
                        record.uncompressed_size
                    };
                    if vli::encode(value, Some(&mut self.vli_pos), out, out_pos)? == Status::Ok {
                        return Ok(Status::Ok);
                    }
                    self.vli_pos = 0;
                    self.sequence = if self.sequence == Sequence::Unpadded {
                        Sequence::Uncompressed
                    } else {
                        Sequence::Next
                    };
                }
                Sequence::Padding => {
                    if self.pos < self.padding_size() {
                        out[*out_pos] = 0x00;
                        *out_pos += 1;
                        self.pos += 1;
                        continue;
                    }
                    self.pos = 0;
                    self.sequence = Sequence::Crc32;
                    // Everything up to here is covered by the checksum.
                    return Ok(Status::Ok);
                }
                Sequence::Crc32 => {
                    out[*out_pos] = self.crc_le[self.pos];
                    *out_pos += 1;
                    self.pos += 1;
                    if self.pos == 4 {
                        self.sequence = Sequence::Done;
                    }
                }
                Sequence::Done => return Ok(Status::StreamEnd),
            }
        }
        Ok(if self.sequence == Sequence::Done { Status::StreamEnd } else { Status::Ok })
    }
}

impl Coder for IndexEncoder {
    fn code(
        &mut self,
        _input: &[u8],
        _in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        _action: Action,
    ) -> Result<Status> {
        loop {
            let start = *out_pos;
            let checked = self.sequence < Sequence::Crc32;
            let status = self.encode(out, out_pos)?;
            if checked {
                let mut hasher = Hasher::new_with_initial(self.crc32);
                hasher.update(&out[start..*out_pos]);
                self.crc32 = hasher.finalize();
                if self.sequence == Sequence::Crc32 {
                    LittleEndian::write_u32(&mut self.crc_le, self.crc32);
                    continue;
                }
            }
            return Ok(status);
        }
    }

    fn name(&self) -> &'static str {
        "index-encoder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn check(&self) -> Check {
        Check::Crc32
    }
}
