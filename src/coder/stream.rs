//! Top-level driver for a coder chain.
//!
//! `Stream` validates the caller's action sequence, forwards each call to the
//! chain head and keeps the running byte totals.
//!
//! # Action lock
//! Once a flush or finish has been requested, the same action must be passed
//! on every call until the chain reports `StreamEnd`, and the caller may not
//! add input in the meantime: the unconsumed input length has to match what
//! the previous call left over.

use log::{debug, trace};

use crate::coder::filter::validate_chain;
use crate::coder::{
    chain_init, Action, Check, Coder, Direction, Filter, NextCoder, Status, SubfilterCommand,
    SubfilterState,
};
use crate::error::{Error, Result};
use crate::index::{Index, IndexDecoder, IndexEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sequence {
    Run,
    SyncFlush,
    FullFlush,
    Finish,
    End,
    Error,
}

/// A coding session: one chain plus its call-sequence bookkeeping.
#[derive(Debug)]
pub struct Stream {
    next:            NextCoder,
    sequence:        Sequence,
    /// Unconsumed input left by the previous call.
    avail_in:        usize,
    /// One call without progress has already been let through.
    allow_buf_error: bool,
    supported:       [bool; 4],
    total_in:        u64,
    total_out:       u64,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    /// An uninitialised session.  Every `process` call fails until one of the
    /// init methods succeeds.
    pub fn new() -> Self {
        Stream {
            next:            NextCoder::new(),
            sequence:        Sequence::Run,
            avail_in:        0,
            allow_buf_error: false,
            supported:       [false; 4],
            total_in:        0,
            total_out:       0,
        }
    }

    pub fn new_raw_encoder(filters: &[Filter]) -> Result<Self> {
        let mut strm = Self::new();
        strm.raw_encoder(filters)?;
        Ok(strm)
    }

    pub fn new_raw_decoder(filters: &[Filter]) -> Result<Self> {
        let mut strm = Self::new();
        strm.raw_decoder(filters)?;
        Ok(strm)
    }

    pub fn new_index_encoder(index: Index) -> Result<Self> {
        let mut strm = Self::new();
        strm.index_encoder(index)?;
        Ok(strm)
    }

    pub fn new_index_decoder(memlimit: u64) -> Result<Self> {
        let mut strm = Self::new();
        strm.index_decoder(memlimit)?;
        Ok(strm)
    }

    // ── (Re)initialisation ───────────────────────────────────────────────────

    /// Encode through `filters`, listed in encoding order.
    pub fn raw_encoder(&mut self, filters: &[Filter]) -> Result<()> {
        let result = validate_chain(filters)
            .and_then(|()| chain_init(&mut self.next, filters, Direction::Encode));
        self.finish_init(result, &Action::ALL)
    }

    /// Decode data produced by a raw encoder with the same `filters`.
    pub fn raw_decoder(&mut self, filters: &[Filter]) -> Result<()> {
        let result = validate_chain(filters)
            .and_then(|()| chain_init(&mut self.next, filters, Direction::Decode));
        self.finish_init(result, &[Action::Run, Action::Finish])
    }

    /// Serialize `index` in the Index wire format.
    pub fn index_encoder(&mut self, index: Index) -> Result<()> {
        IndexEncoder::init(&mut self.next, index);
        self.finish_init(Ok(()), &[Action::Run, Action::Finish])
    }

    /// Parse an Index, refusing to hold more than `memlimit` bytes of it.
    pub fn index_decoder(&mut self, memlimit: u64) -> Result<()> {
        IndexDecoder::init(&mut self.next, memlimit);
        self.finish_init(Ok(()), &[Action::Run, Action::Finish])
    }

    fn finish_init(&mut self, result: Result<()>, actions: &[Action]) -> Result<()> {
        self.sequence = Sequence::Run;
        self.avail_in = 0;
        self.allow_buf_error = false;
        self.total_in = 0;
        self.total_out = 0;
        self.supported = [false; 4];

        if let Err(e) = result {
            debug!("chain initialization failed: {}", e);
            self.next.end();
            return Err(e);
        }
        for action in actions {
            self.supported[action.index()] = true;
        }
        Ok(())
    }

    // ── Coding ───────────────────────────────────────────────────────────────

    /// Run the chain over `input[*in_pos..]` into `out[*out_pos..]`.
    pub fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        if self.next.is_none() {
            return Err(Error::Prog("stream is not initialized"));
        }
        if *in_pos > input.len() || *out_pos > out.len() {
            return Err(Error::Prog("buffer position out of range"));
        }
        if !self.supported[action.index()] {
            return Err(Error::Prog("action not supported by this chain"));
        }

        let avail_in = input.len() - *in_pos;
        match self.sequence {
            Sequence::Run => {
                self.sequence = match action {
                    Action::Run       => Sequence::Run,
                    Action::SyncFlush => Sequence::SyncFlush,
                    Action::FullFlush => Sequence::FullFlush,
                    Action::Finish    => Sequence::Finish,
                };
            }
            Sequence::SyncFlush => self.check_locked(action, Action::SyncFlush, avail_in)?,
            Sequence::FullFlush => self.check_locked(action, Action::FullFlush, avail_in)?,
            Sequence::Finish    => self.check_locked(action, Action::Finish, avail_in)?,
            Sequence::End       => return Ok(Status::StreamEnd),
            Sequence::Error     => return Err(Error::Prog("stream is in error state")),
        }

        let (in_start, out_start) = (*in_pos, *out_pos);
        let result = self.next.code(input, in_pos, out, out_pos, action);

        let in_used = *in_pos - in_start;
        let out_used = *out_pos - out_start;
        self.total_in += in_used as u64;
        self.total_out += out_used as u64;
        self.avail_in = input.len() - *in_pos;

        match result {
            Ok(Status::Ok) => {
                if in_used == 0 && out_used == 0 {
                    if self.allow_buf_error {
                        return Err(Error::Buf);
                    }
                    self.allow_buf_error = true;
                } else {
                    self.allow_buf_error = false;
                }
                Ok(Status::Ok)
            }
            Ok(Status::StreamEnd) => {
                self.allow_buf_error = false;
                self.sequence = match self.sequence {
                    Sequence::SyncFlush | Sequence::FullFlush => Sequence::Run,
                    _ => Sequence::End,
                };
                trace!("stream reached end of {:?}", action);
                Ok(Status::StreamEnd)
            }
            Err(e) => {
                if e.is_recoverable() {
                    self.allow_buf_error = false;
                } else {
                    debug!("stream entering error state: {}", e);
                    self.sequence = Sequence::Error;
                }
                Err(e)
            }
        }
    }

    fn check_locked(&self, action: Action, locked: Action, avail_in: usize) -> Result<()> {
        if action != locked {
            return Err(Error::Prog("action changed before the previous one completed"));
        }
        if avail_in != self.avail_in {
            return Err(Error::Prog("input changed during flush or finish"));
        }
        Ok(())
    }

    /// Convenience wrapper over [`Stream::code`] for whole buffers.
    ///
    /// Returns the status together with the bytes consumed and produced.
    pub fn process(&mut self, input: &[u8], out: &mut [u8], action: Action) -> Result<(Status, usize, usize)> {
        let (mut in_pos, mut out_pos) = (0, 0);
        let status = self.code(input, &mut in_pos, out, &mut out_pos, action)?;
        Ok((status, in_pos, out_pos))
    }

    /// Like [`Stream::code`], writing into the spare capacity of `out`.
    pub fn process_vec(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut Vec<u8>,
        action: Action,
    ) -> Result<Status> {
        let mut out_pos = out.len();
        let cap = out.capacity();
        out.resize(cap, 0);
        let result = self.code(input, in_pos, out, &mut out_pos, action);
        out.truncate(out_pos);
        result
    }

    // ── Accessors and hooks ──────────────────────────────────────────────────

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn check(&self) -> Check {
        self.next.get().map_or(Check::None, |c| c.check())
    }

    pub fn memusage(&self) -> Option<u64> {
        self.next.get().and_then(|c| c.memusage())
    }

    pub fn memlimit(&self) -> Option<u64> {
        self.next.get().and_then(|c| c.memlimit())
    }

    pub fn set_memlimit(&mut self, limit: u64) -> Result<()> {
        match self.next.get_mut() {
            Some(c) => c.set_memlimit(limit),
            None    => Err(Error::Prog("stream is not initialized")),
        }
    }

    /// Control a subfilter-capable node in the chain.
    pub fn subfilter(&mut self, cmd: SubfilterCommand) -> Result<SubfilterState> {
        self.next.subfilter(cmd)
    }

    /// The chain head, if it is a `T`.
    pub fn coder<T: Coder + 'static>(&self) -> Option<&T> {
        self.next.downcast_ref::<T>()
    }

    pub fn coder_mut<T: Coder + 'static>(&mut self) -> Option<&mut T> {
        self.next.downcast_mut::<T>()
    }

    /// Release the chain.  The session must be reinitialised before reuse.
    pub fn end(&mut self) {
        self.next.end();
        self.supported = [false; 4];
    }
}
