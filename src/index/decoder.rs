//! Index field parser.

use std::any::Any;
use std::mem;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use log::debug;

use crate::coder::{Action, Check, Coder, NextCoder, Status};
use crate::error::{Error, Result};
use crate::index::{Index, INDEX_INDICATOR};
use crate::vli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Sequence {
    Indicator,
    Count,
    Memusage,
    Unpadded,
    Uncompressed,
    PaddingInit,
    Padding,
    Crc32,
    Done,
}

#[derive(Debug)]
pub struct IndexDecoder {
    sequence:     Sequence,
    index:        Index,
    memlimit:     u64,
    /// Records announced by the Number of Records field.
    total:        u64,
    /// Records still to be read.
    remaining:    u64,
    unpadded:     u64,
    uncompressed: u64,
    vli_pos:      usize,
    padding:      usize,
    pos:          usize,
    crc32:        u32,
    crc_le:       [u8; 4],
}

impl IndexDecoder {
    pub(crate) fn init(next: &mut NextCoder, memlimit: u64) {
        if let Some(coder) = next.reuse::<IndexDecoder>() {
            *coder = IndexDecoder::new(memlimit);
            return;
        }
        next.set(IndexDecoder::new(memlimit));
    }

    pub fn new(memlimit: u64) -> Self {
        IndexDecoder {
            sequence:     Sequence::Indicator,
            index:        Index::new(),
            memlimit,
            total:        0,
            remaining:    0,
            unpadded:     0,
            uncompressed: 0,
            vli_pos:      0,
            padding:      0,
            pos:          0,
            crc32:        0,
            crc_le:       [0; 4],
        }
    }

    /// `true` once the CRC32 has been verified.
    pub fn is_done(&self) -> bool {
        self.sequence == Sequence::Done
    }

    /// Records decoded so far.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Hand over the decoded Index.  `None` until decoding has finished.
    pub fn take_index(&mut self) -> Option<Index> {
        if self.is_done() {
            Some(mem::take(&mut self.index))
        } else {
            None
        }
    }

    fn decode(&mut self, input: &[u8], in_pos: &mut usize) -> Result<Status> {
        loop {
            match self.sequence {
                Sequence::Memusage => {
                    let needed = Index::memusage(self.total);
                    // A saturated estimate cannot be satisfied by any limit.
                    if needed == u64::MAX || needed > self.memlimit {
                        debug!("index needs {} bytes, limit is {}", needed, self.memlimit);
                        return Err(Error::MemLimit { needed, limit: self.memlimit });
                    }
                    self.sequence = if self.remaining == 0 {
                        Sequence::PaddingInit
                    } else {
                        Sequence::Unpadded
                    };
                    continue;
                }
                Sequence::PaddingInit => {
                    let unpadded = 1 + vli::size(self.total) as u64 + self.index.index_list_size();
                    self.padding = ((4 - unpadded % 4) % 4) as usize;
                    self.sequence = Sequence::Padding;
                    continue;
                }
                Sequence::Padding if self.padding == 0 => {
                    self.pos = 0;
                    self.sequence = Sequence::Crc32;
                    // The caller hashes everything consumed so far.
                    return Ok(Status::Ok);
                }
                Sequence::Done => return Ok(Status::StreamEnd),
                _ => {}
            }

            if *in_pos >= input.len() {
                return Ok(Status::Ok);
            }

            match self.sequence {
                Sequence::Indicator => {
                    if input[*in_pos] != INDEX_INDICATOR {
                        return Err(Error::Data("index indicator mismatch"));
                    }
                    *in_pos += 1;
                    self.sequence = Sequence::Count;
                }
                Sequence::Count => {
                    if vli::decode(&mut self.total, Some(&mut self.vli_pos), input, in_pos)?
                        == Status::StreamEnd
                    {
                        self.vli_pos = 0;
                        self.remaining = self.total;
                        self.sequence = Sequence::Memusage;
                    }
                }
                Sequence::Unpadded => {
                    if vli::decode(&mut self.unpadded, Some(&mut self.vli_pos), input, in_pos)?
                        == Status::StreamEnd
                    {
                        self.vli_pos = 0;
                        self.sequence = Sequence::Uncompressed;
                    }
                }
                Sequence::Uncompressed => {
                    if vli::decode(&mut self.uncompressed, Some(&mut self.vli_pos), input, in_pos)?
                        == Status::StreamEnd
                    {
                        self.vli_pos = 0;
                        self.index
                            .append(self.unpadded, self.uncompressed)
                            .map_err(|e| match e {
                                Error::Mem => Error::Mem,
                                _ => Error::Data("invalid index record"),
                            })?;
                        self.remaining -= 1;
                        self.sequence = if self.remaining == 0 {
                            Sequence::PaddingInit
                        } else {
                            Sequence::Unpadded
                        };
                    }
                }
                Sequence::Padding => {
                    if input[*in_pos] != 0x00 {
                        return Err(Error::Data("nonzero index padding"));
                    }
                    *in_pos += 1;
                    self.padding -= 1;
                }
                Sequence::Crc32 => {
                    self.crc_le[self.pos] = input[*in_pos];
                    *in_pos += 1;
                    self.pos += 1;
                    if self.pos == 4 {
                        if LittleEndian::read_u32(&self.crc_le) != self.crc32 {
                            return Err(Error::Data("index CRC32 mismatch"));
                        }
                        self.sequence = Sequence::Done;
                    }
                }
                Sequence::Memusage | Sequence::PaddingInit | Sequence::Done => {}
            }
        }
    }
}

impl Coder for IndexDecoder {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        _out: &mut [u8],
        _out_pos: &mut usize,
        _action: Action,
    ) -> Result<Status> {
        loop {
            let start = *in_pos;
            let checked = self.sequence < Sequence::Crc32;
            let result = self.decode(input, in_pos);
            if checked {
                let mut hasher = Hasher::new_with_initial(self.crc32);
                hasher.update(&input[start..*in_pos]);
                self.crc32 = hasher.finalize();
                if result.is_ok() && self.sequence == Sequence::Crc32 {
                    continue;
                }
            }
            return result;
        }
    }

    fn name(&self) -> &'static str {
        "index-decoder"
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

    fn memusage(&self) -> Option<u64> {
        Some(Index::memusage(self.total))
    }

    fn memlimit(&self) -> Option<u64> {
        Some(self.memlimit)
    }

    fn set_memlimit(&mut self, limit: u64) -> Result<()> {
        let needed = Index::memusage(self.total);
        if needed == u64::MAX || limit < needed {
            return Err(Error::MemLimit { needed, limit });
        }
        self.memlimit = limit;
        Ok(())
    }
}
