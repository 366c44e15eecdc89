//! Block index.
//!
//! Records are `(Unpadded Size, Uncompressed Size)` pairs kept in groups of
//! [`GROUP_SIZE`].  Inside a group both columns are cumulative sums relative
//! to the group start, with the unpadded column rounded up to a multiple of
//! four before each addition:
//!
//! ```text
//! unpadded_sum[k]     = ceil4(unpadded_sum[k - 1]) + unpadded[k]
//! uncompressed_sum[k] = uncompressed_sum[k - 1] + uncompressed[k]
//! ```
//!
//! That keeps [`Index::locate`] a group walk plus one binary search, without
//! storing absolute offsets per record.
//!
//! Concatenating Indexes inserts padding records.  They stand for the bytes
//! between two Streams (Index, footer, Stream Padding, next header), shift
//! the stream offsets of everything after them, and are skipped by
//! [`Index::read`].

use std::mem;

use crate::error::{Error, Result};
use crate::vli::{self, VLI_MAX};

pub mod decoder;
pub mod encoder;

pub use decoder::IndexDecoder;
pub use encoder::IndexEncoder;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Records per group.
pub const GROUP_SIZE: usize = 256;

pub const UNPADDED_SIZE_MIN: u64 = 5;
pub const UNPADDED_SIZE_MAX: u64 = VLI_MAX & !3;

/// Largest encoded Index a Stream Footer can point back over.
pub const BACKWARD_SIZE_MAX: u64 = 1 << 34;

/// Size of a Stream Header.  A Stream Footer has the same size.
pub const STREAM_HEADER_SIZE: u64 = 12;

/// First byte of an encoded Index.
pub const INDEX_INDICATOR: u8 = 0x00;

// ── Storage ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    unpadded_sum:     u64,
    uncompressed_sum: u64,
    padding:          bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    entries: Vec<Entry>,
}

impl Group {
    fn is_full(&self) -> bool {
        self.entries.len() == GROUP_SIZE
    }

    fn last(&self) -> Option<&Entry> {
        self.entries.last()
    }

    /// Padded size and uncompressed size of the whole group.
    fn span(&self) -> (u64, u64) {
        self.last()
            .map_or((0, 0), |e| (vli::ceil4(e.unpadded_sum), e.uncompressed_sum))
    }
}

/// Read position: a record inside a group, plus the absolute offsets of the
/// group start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    group:               usize,
    record:              usize,
    stream_offset:       u64,
    uncompressed_offset: u64,
}

impl Cursor {
    const START: Cursor = Cursor { group: 0, record: 0, stream_offset: 0, uncompressed_offset: 0 };
}

/// Totals of every Stream except the last one, after concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct OldStreams {
    count:           u64,
    index_list_size: u64,
    /// Everything before the last Stream, including Stream Padding.
    streams_size:    u64,
}

/// One Block as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub unpadded_size:       u64,
    /// Unpadded size rounded up to a multiple of four.
    pub total_size:          u64,
    pub uncompressed_size:   u64,
    /// Offset of the Block relative to the first Block of the first Stream.
    pub stream_offset:       u64,
    pub uncompressed_offset: u64,
}

// ── Size helpers ─────────────────────────────────────────────────────────────

/// Encoded Index size without the final padding.
fn index_size_unpadded(count: u64, index_list_size: u64) -> u64 {
    // Indicator + Number of Records + List of Records + CRC32
    1 + vli::size(count) as u64 + index_list_size + 4
}

fn index_size(count: u64, index_list_size: u64) -> u64 {
    vli::ceil4(index_size_unpadded(count, index_list_size))
}

// ── Index ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Index {
    groups:            Vec<Group>,
    /// Sum of the padded sizes of all real records.
    total_size:        u64,
    uncompressed_size: u64,
    count:             u64,
    /// Bytes the List of Records takes when encoded.
    index_list_size:   u64,
    old:               OldStreams,
    cursor:            Option<Cursor>,
}

impl PartialEq for Index {
    /// Compares content only.  Read positions are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.total_size == other.total_size
            && self.uncompressed_size == other.uncompressed_size
            && self.count == other.count
            && self.index_list_size == other.index_list_size
            && self.old == other.old
            && self.groups == other.groups
    }
}

impl Eq for Index {}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approximate heap and struct footprint of an Index with `count` records.
    /// Saturates at `u64::MAX` for counts no Index could hold.
    pub fn memusage(count: u64) -> u64 {
        let groups = count.div_ceil(GROUP_SIZE as u64);
        let per_group = (mem::size_of::<Group>() + GROUP_SIZE * mem::size_of::<Entry>()) as u64;
        groups
            .checked_mul(per_group)
            .and_then(|n| n.checked_add(mem::size_of::<Index>() as u64))
            .unwrap_or(u64::MAX)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    pub(crate) fn index_list_size(&self) -> u64 {
        self.index_list_size
    }

    /// Encoded size of the Index field.
    pub fn size(&self) -> u64 {
        index_size(self.count, self.index_list_size)
    }

    /// Size of a single Stream holding every record.
    pub fn stream_size(&self) -> u64 {
        STREAM_HEADER_SIZE + self.total_size + self.size() + STREAM_HEADER_SIZE
    }

    /// Size of all concatenated Streams, Stream Padding included.
    pub fn file_size(&self) -> u64 {
        self.old.streams_size
            + 2 * STREAM_HEADER_SIZE
            + self.total_size
            + index_size(self.count - self.old.count, self.index_list_size - self.old.index_list_size)
    }

    // ── Append ───────────────────────────────────────────────────────────────

    /// Add one Block.  On error nothing changes.
    pub fn append(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        if !(UNPADDED_SIZE_MIN..=UNPADDED_SIZE_MAX).contains(&unpadded_size) {
            return Err(Error::Prog("unpadded size out of range"));
        }
        if uncompressed_size > VLI_MAX {
            return Err(Error::Prog("uncompressed size out of range"));
        }

        let total_size = self.total_size + vli::ceil4(unpadded_size);
        let uncompressed = self.uncompressed_size + uncompressed_size;
        let count = self.count + 1;
        let list_size = self.index_list_size
            + (vli::size(unpadded_size) + vli::size(uncompressed_size)) as u64;

        let stream_index_size =
            index_size(count - self.old.count, list_size - self.old.index_list_size);
        let file_size = self.old.streams_size + 2 * STREAM_HEADER_SIZE + total_size + stream_index_size;
        if file_size > VLI_MAX {
            return Err(Error::Data("file size would exceed the limit"));
        }
        if stream_index_size > BACKWARD_SIZE_MAX {
            return Err(Error::Data("index size would exceed the limit"));
        }
        if uncompressed > VLI_MAX {
            return Err(Error::Data("uncompressed size would exceed the limit"));
        }

        self.push(unpadded_size, uncompressed_size, false)?;
        self.total_size = total_size;
        self.uncompressed_size = uncompressed;
        self.count = count;
        self.index_list_size = list_size;
        Ok(())
    }

    /// Store one entry.  Only allocation can fail, and nothing changes then.
    fn push(&mut self, unpadded_size: u64, uncompressed_size: u64, padding: bool) -> Result<()> {
        let need_group = self.groups.last().map_or(true, Group::is_full);
        if need_group {
            let mut entries = Vec::new();
            entries.try_reserve_exact(GROUP_SIZE).map_err(|_| Error::Mem)?;
            self.groups.try_reserve(1).map_err(|_| Error::Mem)?;
            self.groups.push(Group { entries });
        }
        let Some(group) = self.groups.last_mut() else {
            return Err(Error::Prog("index has no group"));
        };
        let (base_unpadded, base_uncompressed) = group.span();
        group.entries.push(Entry {
            unpadded_sum:     base_unpadded + unpadded_size,
            uncompressed_sum: base_uncompressed + uncompressed_size,
            padding,
        });
        Ok(())
    }

    // ── Iteration ────────────────────────────────────────────────────────────

    /// Start reading from the first record again.
    pub fn rewind(&mut self) {
        self.cursor = None;
    }

    /// Next Block in order.  Padding records are skipped.
    pub fn read(&mut self) -> Option<Record> {
        let mut cursor = match self.cursor {
            None => {
                if self.groups.is_empty() {
                    return None;
                }
                let start = Cursor::START;
                self.cursor = Some(start);
                if !self.entry(&start).padding {
                    return Some(self.record_at(&start));
                }
                start
            }
            Some(cursor) => cursor,
        };

        loop {
            if !self.advance(&mut cursor) {
                self.cursor = Some(cursor);
                return None;
            }
            if !self.entry(&cursor).padding {
                self.cursor = Some(cursor);
                return Some(self.record_at(&cursor));
            }
        }
    }

    /// Find the Block holding uncompressed offset `target`.
    ///
    /// Empty Blocks are never returned.  A later [`Index::read`] continues
    /// after the located record.
    pub fn locate(&mut self, target: u64) -> Option<Record> {
        if target >= self.uncompressed_size {
            return None;
        }

        let mut cursor = self.cursor.unwrap_or(Cursor::START);
        cursor.record = 0;

        // Forward until the next group starts past the target.
        while cursor.group + 1 < self.groups.len() {
            let (_, uncompressed) = self.groups[cursor.group].span();
            if cursor.uncompressed_offset + uncompressed > target {
                break;
            }
            self.next_group(&mut cursor);
        }
        // Back while this group starts past it.
        while cursor.uncompressed_offset > target && cursor.group > 0 {
            cursor.group -= 1;
            let (stream, uncompressed) = self.groups[cursor.group].span();
            cursor.stream_offset -= stream;
            cursor.uncompressed_offset -= uncompressed;
        }

        let relative = target - cursor.uncompressed_offset;
        let entries = &self.groups[cursor.group].entries;
        cursor.record = entries.partition_point(|e| e.uncompressed_sum <= relative);
        if cursor.record >= entries.len() {
            return None;
        }

        self.cursor = Some(cursor);
        Some(self.record_at(&cursor))
    }

    fn entry(&self, cursor: &Cursor) -> &Entry {
        &self.groups[cursor.group].entries[cursor.record]
    }

    fn next_group(&self, cursor: &mut Cursor) {
        let (stream, uncompressed) = self.groups[cursor.group].span();
        cursor.stream_offset += stream;
        cursor.uncompressed_offset += uncompressed;
        cursor.group += 1;
        cursor.record = 0;
    }

    /// Step to the following entry.  `false` at the end of the Index.
    fn advance(&self, cursor: &mut Cursor) -> bool {
        if cursor.record + 1 < self.groups[cursor.group].entries.len() {
            cursor.record += 1;
            return true;
        }
        if cursor.group + 1 < self.groups.len() {
            self.next_group(cursor);
            return true;
        }
        false
    }

    fn record_at(&self, cursor: &Cursor) -> Record {
        let entries = &self.groups[cursor.group].entries;
        let entry = &entries[cursor.record];

        let (prev_unpadded, prev_uncompressed) = match cursor.record {
            0 => (0, 0),
            r => (vli::ceil4(entries[r - 1].unpadded_sum), entries[r - 1].uncompressed_sum),
        };

        let unpadded_size = entry.unpadded_sum - prev_unpadded;
        Record {
            unpadded_size,
            total_size:          vli::ceil4(unpadded_size),
            uncompressed_size:   entry.uncompressed_sum - prev_uncompressed,
            stream_offset:       cursor.stream_offset + prev_unpadded,
            uncompressed_offset: cursor.uncompressed_offset + prev_uncompressed,
        }
    }

    // ── Concatenation ────────────────────────────────────────────────────────

    /// Append the Streams described by `src` after the ones in `self`.
    ///
    /// `padding` is the Stream Padding between the two, a multiple of four.
    /// On error `self` is unchanged and `src` is dropped.
    pub fn cat(&mut self, src: Index, padding: u64) -> Result<()> {
        if padding > VLI_MAX || padding % 4 != 0 {
            return Err(Error::Prog("invalid stream padding"));
        }

        let combined_index = vli::ceil4(
            index_size_unpadded(self.count, self.index_list_size)
                + index_size_unpadded(src.count, src.index_list_size),
        );
        if combined_index > BACKWARD_SIZE_MAX {
            return Err(Error::Data("combined index size would exceed the limit"));
        }

        let combined_file = self.file_size() + src.file_size();
        if combined_file > VLI_MAX || combined_file + padding > VLI_MAX {
            return Err(Error::Data("combined file size would exceed the limit"));
        }

        // Stands for this Stream's Index and footer, the Stream Padding and
        // the next Stream's header.
        let gap = padding
            + index_size(self.count - self.old.count, self.index_list_size - self.old.index_list_size)
            + 2 * STREAM_HEADER_SIZE;
        let streams_size = self.old.streams_size + gap;
        if gap > VLI_MAX || streams_size > VLI_MAX || self.file_size() + gap > VLI_MAX {
            return Err(Error::Data("stream padding would exceed the limit"));
        }

        self.push(gap, 0, true)?;
        self.old.streams_size = streams_size;

        let mut src_groups = src.groups.into_iter();
        if let Some(first) = src_groups.next() {
            let tail = match self.groups.last_mut() {
                Some(tail) if first.entries.len() <= GROUP_SIZE - tail.entries.len() => Some(tail),
                _ => None,
            };
            match tail {
                Some(tail) => {
                    // Small enough to merge into our last group.
                    let (base_unpadded, base_uncompressed) = tail.span();
                    tail.entries.extend(first.entries.iter().map(|e| Entry {
                        unpadded_sum:     base_unpadded + e.unpadded_sum,
                        uncompressed_sum: base_uncompressed + e.uncompressed_sum,
                        padding:          e.padding,
                    }));
                }
                None => self.groups.push(first),
            }
        }
        self.groups.extend(src_groups);

        // Only the last Stream of `src` stays open for appending.
        self.old.count = self.count + src.old.count;
        self.old.index_list_size = self.index_list_size + src.old.index_list_size;
        self.old.streams_size += src.old.streams_size;

        self.total_size += src.total_size;
        self.uncompressed_size += src.uncompressed_size;
        self.count += src.count;
        self.index_list_size += src.index_list_size;
        Ok(())
    }
}
