//! Subblock encoder.
//!
//! Input bytes (or the output of an active subfilter) go through a
//! [`Framer`], which collects literal bytes and run-length units and turns
//! them into chunks.  Finished chunks are queued in a [`ChunkWriter`] and
//! copied out before any more input is taken.

use std::any::Any;
use std::mem;

use log::debug;

use crate::coder::{
    chain_init, Action, Coder, Direction, Filter, NextCoder, Source, Status, SubfilterCommand,
    SubfilterState,
};
use crate::error::{Error, Result};
use crate::subblock::{
    size_header, SubblockOptions, MARKER_COUNT_MAX, MARKER_DATA, MARKER_END_OF_PAYLOAD,
    MARKER_END_SUBFILTER, MARKER_PADDING, MARKER_REPEAT, MARKER_SET_SUBFILTER, RLE_MAX,
    SUBFILTER_BUF_SIZE,
};

// ── Alignment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Alignment {
    multiple: u64,
    /// Payload bytes framed so far.
    in_pos:   u64,
    /// Bytes written so far.
    out_pos:  u64,
}

impl Alignment {
    /// Padding that puts a payload following `header` bytes at an output
    /// offset congruent to its input offset.  Zero unless shorter than the
    /// payload itself.
    fn padding(&self, header: u64, payload: u64) -> usize {
        let m = self.multiple;
        let want = self.in_pos % m;
        let at = (self.out_pos + header) % m;
        let pad = (want + m - at) % m;
        if pad < payload { pad as usize } else { 0 }
    }
}

// ── Chunk output ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ChunkWriter {
    queue: Vec<u8>,
    pos:   usize,
    align: Alignment,
}

impl ChunkWriter {
    fn new(alignment: u32) -> Self {
        ChunkWriter {
            queue: Vec::new(),
            pos:   0,
            align: Alignment { multiple: u64::from(alignment), in_pos: 0, out_pos: 0 },
        }
    }

    fn is_pending(&self) -> bool {
        self.pos < self.queue.len()
    }

    fn drain(&mut self, out: &mut [u8], out_pos: &mut usize) {
        let n = (self.queue.len() - self.pos).min(out.len() - *out_pos);
        out[*out_pos..*out_pos + n].copy_from_slice(&self.queue[self.pos..self.pos + n]);
        *out_pos += n;
        self.pos += n;
        if self.pos == self.queue.len() {
            self.queue.clear();
            self.pos = 0;
        }
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        self.queue.try_reserve(n).map_err(|_| Error::Mem)
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.queue.extend_from_slice(bytes);
        self.align.out_pos += bytes.len() as u64;
        Ok(())
    }

    fn marker(&mut self, marker: u8) -> Result<()> {
        self.push(&[marker])
    }

    fn pad(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.marker(MARKER_PADDING)?;
        }
        Ok(())
    }

    /// Queue `payload` as one Data chunk, or as a one-byte repeat when that
    /// is shorter.
    fn data(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len();
        if len > 2 && payload.iter().all(|&b| b == payload[0]) {
            return self.repeat(&payload[..1], len as u64);
        }
        let pad = self.align.padding(4, len as u64);
        self.reserve(pad + 4 + len)?;
        self.pad(pad)?;
        self.push(&size_header(MARKER_DATA, len as u64))?;
        self.push(payload)?;
        self.align.in_pos += len as u64;
        Ok(())
    }

    /// Queue `count` repetitions of `pattern`, split over as many chunks as
    /// the 28-bit count field needs.
    fn repeat(&mut self, pattern: &[u8], mut count: u64) -> Result<()> {
        let len = pattern.len();
        while count > 0 {
            let n = count.min(MARKER_COUNT_MAX);
            let pad = self.align.padding(5, len as u64);
            self.reserve(pad + 5 + len)?;
            self.pad(pad)?;
            self.push(&size_header(MARKER_REPEAT, n))?;
            self.push(&[(len - 1) as u8])?;
            self.push(pattern)?;
            self.align.in_pos += n * len as u64;
            count -= n;
        }
        Ok(())
    }
}

// ── Framer ───────────────────────────────────────────────────────────────────

/// Splits payload into literal chunks and runs of identical units.
#[derive(Debug)]
struct Framer {
    chunk_size: usize,
    rle:        usize,
    literal:    Vec<u8>,
    /// Unit being collected.
    unit:       Vec<u8>,
    /// Unit repeated by the current run.
    run:        Vec<u8>,
    run_count:  u64,
}

impl Framer {
    fn new(options: &SubblockOptions) -> Result<Self> {
        let mut literal = Vec::new();
        literal
            .try_reserve_exact(options.chunk_size + RLE_MAX)
            .map_err(|_| Error::Mem)?;
        Ok(Framer {
            chunk_size: options.chunk_size,
            rle:        options.rle,
            literal,
            unit:       Vec::with_capacity(options.rle),
            run:        Vec::with_capacity(options.rle),
            run_count:  0,
        })
    }

    /// Take bytes from `data` until a chunk gets queued.  Returns how many
    /// were used.
    fn absorb(&mut self, data: &[u8], writer: &mut ChunkWriter) -> Result<usize> {
        if self.rle == 0 {
            let n = data.len().min(self.chunk_size - self.literal.len());
            self.literal.extend_from_slice(&data[..n]);
            if self.literal.len() == self.chunk_size {
                self.emit_literal(writer)?;
            }
            return Ok(n);
        }

        let mut used = 0;
        for &byte in data {
            used += 1;
            self.unit.push(byte);
            if self.unit.len() == self.rle {
                if self.run_count > 0 && self.unit == self.run {
                    self.run_count += 1;
                } else {
                    self.end_run(writer)?;
                    mem::swap(&mut self.run, &mut self.unit);
                    self.run_count = 1;
                }
                self.unit.clear();
            }
            if writer.is_pending() {
                break;
            }
        }
        Ok(used)
    }

    fn end_run(&mut self, writer: &mut ChunkWriter) -> Result<()> {
        match self.run_count {
            0 => {}
            1 => {
                self.literal.extend_from_slice(&self.run);
                let full = self.literal.len() / self.chunk_size * self.chunk_size;
                if full > 0 {
                    for piece in self.literal[..full].chunks(self.chunk_size) {
                        writer.data(piece)?;
                    }
                    self.literal.drain(..full);
                }
            }
            n => {
                self.emit_literal(writer)?;
                writer.repeat(&self.run, n)?;
            }
        }
        self.run_count = 0;
        Ok(())
    }

    fn emit_literal(&mut self, writer: &mut ChunkWriter) -> Result<()> {
        for piece in self.literal.chunks(self.chunk_size) {
            writer.data(piece)?;
        }
        self.literal.clear();
        Ok(())
    }

    /// Queue everything collected so far.
    fn close(&mut self, writer: &mut ChunkWriter) -> Result<()> {
        self.end_run(writer)?;
        if !self.unit.is_empty() {
            self.literal.extend_from_slice(&self.unit);
            self.unit.clear();
        }
        self.emit_literal(writer)
    }
}

// ── Subfilter ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Subfilter {
    state:      SubfilterState,
    /// Filter waiting for the next chunk boundary.
    filter:     Option<Filter>,
    chain:      NextCoder,
    buf:        Vec<u8>,
    pos:        usize,
    size:       usize,
    got_output: bool,
    /// The nested chain reported `StreamEnd`.
    end:        bool,
}

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct SubblockEncoder {
    options:  SubblockOptions,
    source:   Source,
    framer:   Framer,
    writer:   ChunkWriter,
    sub:      Subfilter,
    /// A flush completed; report it once the queue is drained.
    flushed:  bool,
    /// End of Payload has been queued.
    finished: bool,
}

impl SubblockEncoder {
    pub(crate) fn init(next: &mut NextCoder, options: &SubblockOptions, upstream: &[Filter]) -> Result<()> {
        options.validate()?;
        if let Some(coder) = next.reuse::<SubblockEncoder>() {
            coder.source.reinit(upstream, Direction::Encode)?;
            coder.reset(options)?;
            return Ok(());
        }
        next.set(SubblockEncoder {
            options:  *options,
            source:   Source::init(upstream, Direction::Encode)?,
            framer:   Framer::new(options)?,
            writer:   ChunkWriter::new(options.alignment),
            sub:      Subfilter::default(),
            flushed:  false,
            finished: false,
        });
        Ok(())
    }

    fn reset(&mut self, options: &SubblockOptions) -> Result<()> {
        self.framer = Framer::new(options)?;
        self.options = *options;
        self.writer = ChunkWriter::new(options.alignment);
        self.sub = Subfilter::default();
        self.flushed = false;
        self.finished = false;
        Ok(())
    }

    fn start_subfilter(&mut self) -> Result<()> {
        let Some(filter) = self.sub.filter.clone() else {
            return Err(Error::Prog("no subfilter requested"));
        };
        chain_init(&mut self.sub.chain, std::slice::from_ref(&filter), Direction::Encode)?;
        if self.sub.buf.is_empty() {
            self.sub.buf.try_reserve_exact(SUBFILTER_BUF_SIZE).map_err(|_| Error::Mem)?;
            self.sub.buf.resize(SUBFILTER_BUF_SIZE, 0);
        }
        let flags = filter.encode_flags()?;
        self.writer.reserve(1 + flags.len())?;
        self.writer.marker(MARKER_SET_SUBFILTER)?;
        self.writer.push(&flags)?;

        debug!("subfilter {} started", filter.name());
        self.sub.filter = None;
        self.sub.state = SubfilterState::Running;
        self.sub.got_output = false;
        self.sub.end = false;
        self.sub.pos = 0;
        self.sub.size = 0;
        Ok(())
    }

    /// One step of an active subfilter.  `false` when nothing can move.
    fn drive_subfilter(&mut self, input: &[u8], in_pos: &mut usize, action: Action) -> Result<bool> {
        let sub = &mut self.sub;

        // Nested output staged earlier is framed first.
        if sub.pos < sub.size {
            let used = self.framer.absorb(&sub.buf[sub.pos..sub.size], &mut self.writer)?;
            sub.pos += used;
            return Ok(true);
        }
        sub.pos = 0;
        sub.size = 0;

        if sub.end {
            sub.end = false;
            self.framer.close(&mut self.writer)?;
            if sub.state == SubfilterState::Finishing || action == Action::Finish {
                if !sub.got_output {
                    return Err(Error::Prog("subfilter produced no output"));
                }
                self.writer.marker(MARKER_END_SUBFILTER)?;
                sub.chain.end();
                sub.state = SubfilterState::Unset;
                debug!("subfilter closed");
            } else {
                sub.state = SubfilterState::Running;
                self.flushed = true;
            }
            return Ok(true);
        }

        let mut used = 0;
        let status = if sub.state == SubfilterState::Finishing {
            sub.chain.code(&[], &mut used, &mut sub.buf[..], &mut sub.size, Action::Finish)?
        } else {
            self.source.fill(input, in_pos, action)?;
            let avail = self.source.available(input, *in_pos);
            let nested = if self.source.is_final(action) { action } else { Action::Run };
            if matches!(nested, Action::SyncFlush | Action::FullFlush) {
                sub.state = SubfilterState::Flushing;
            }
            let status = sub.chain.code(avail, &mut used, &mut sub.buf[..], &mut sub.size, nested)?;
            self.source.consume(in_pos, used);
            status
        };

        if sub.size > 0 {
            sub.got_output = true;
        }
        if status == Status::StreamEnd {
            sub.end = true;
            return Ok(true);
        }
        Ok(used > 0 || sub.size > 0)
    }
}

impl Coder for SubblockEncoder {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        loop {
            if self.writer.is_pending() {
                self.writer.drain(out, out_pos);
                if self.writer.is_pending() {
                    return Ok(Status::Ok);
                }
            }
            if self.finished {
                return Ok(Status::StreamEnd);
            }
            if self.flushed {
                self.flushed = false;
                self.source.rearm();
                return Ok(Status::StreamEnd);
            }

            match self.sub.state {
                SubfilterState::Unset => {}
                SubfilterState::Requested => {
                    self.framer.close(&mut self.writer)?;
                    self.start_subfilter()?;
                    continue;
                }
                _ => {
                    if self.drive_subfilter(input, in_pos, action)? {
                        continue;
                    }
                    return Ok(Status::Ok);
                }
            }

            self.source.fill(input, in_pos, action)?;
            let avail = self.source.available(input, *in_pos);
            if !avail.is_empty() {
                let used = self.framer.absorb(avail, &mut self.writer)?;
                self.source.consume(in_pos, used);
                continue;
            }
            if !self.source.is_final(action) {
                return Ok(Status::Ok);
            }

            self.framer.close(&mut self.writer)?;
            if action == Action::Finish {
                self.writer.marker(MARKER_END_OF_PAYLOAD)?;
                self.finished = true;
            } else {
                self.flushed = true;
            }
        }
    }

    fn name(&self) -> &'static str {
        "subblock-encoder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn subfilter(&mut self, cmd: SubfilterCommand) -> Result<SubfilterState> {
        match cmd {
            SubfilterCommand::Query => {}
            SubfilterCommand::Set(filter) => {
                if !self.options.allow_subfilters {
                    return Err(Error::Options("subfilters are not allowed"));
                }
                if self.sub.state != SubfilterState::Unset {
                    return Err(Error::Prog("a subfilter is already active"));
                }
                if matches!(filter, Filter::Subblock(_)) {
                    return Err(Error::Options("subblock cannot nest inside subblock"));
                }
                filter.validate()?;
                self.sub.filter = Some(filter);
                self.sub.state = SubfilterState::Requested;
            }
            SubfilterCommand::Finish => {
                if self.sub.state != SubfilterState::Running {
                    return Err(Error::Prog("no running subfilter to finish"));
                }
                self.sub.state = SubfilterState::Finishing;
            }
        }
        Ok(self.sub.state)
    }
}
