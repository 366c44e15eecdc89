//! Zstandard chain nodes.
//!
//! # Framing
//! The encoder writes one zstd frame per chain.  Sync and full flushes end the
//! current zstd block so everything consumed so far can be decoded, without
//! closing the frame.  Finish closes the frame.
//!
//! The decoder stops at the end of the first frame; bytes after it are left
//! unconsumed for whoever owns the outer framing.

use std::any::Any;

use log::debug;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::coder::{
    Action, Coder, Direction, Filter, NextCoder, Source, Status, SubfilterCommand,
    SubfilterState,
};
use crate::error::{Error, Result};

// ── Encoder ──────────────────────────────────────────────────────────────────

pub struct ZstdEncoder {
    ctx:    Encoder<'static>,
    level:  i32,
    source: Source,
}

impl ZstdEncoder {
    pub(crate) fn init(next: &mut NextCoder, level: i32, upstream: &[Filter]) -> Result<()> {
        if let Some(coder) = next.reuse::<ZstdEncoder>() {
            if coder.level == level {
                coder.ctx.reinit().map_err(|e| {
                    debug!("zstd encoder reset failed: {}", e);
                    Error::Mem
                })?;
            } else {
                coder.ctx = new_encoder(level)?;
                coder.level = level;
            }
            return coder.source.reinit(upstream, Direction::Encode);
        }
        next.set(ZstdEncoder {
            ctx:    new_encoder(level)?,
            level,
            source: Source::init(upstream, Direction::Encode)?,
        });
        Ok(())
    }
}

fn new_encoder(level: i32) -> Result<Encoder<'static>> {
    Encoder::new(level).map_err(|e| {
        debug!("zstd encoder allocation failed: {}", e);
        Error::Mem
    })
}

impl Coder for ZstdEncoder {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        loop {
            if *out_pos == out.len() {
                return Ok(Status::Ok);
            }
            self.source.fill(input, in_pos, action)?;
            let avail = self.source.available(input, *in_pos);

            if !avail.is_empty() {
                let mut src = InBuffer::around(avail);
                let mut dst = OutBuffer::around(&mut out[*out_pos..]);
                self.ctx.run(&mut src, &mut dst).map_err(|e| {
                    debug!("zstd compression failed: {}", e);
                    Error::Prog("zstd compression failed")
                })?;
                let (read, written) = (src.pos(), dst.pos());
                self.source.consume(in_pos, read);
                *out_pos += written;
                if read == 0 && written == 0 {
                    return Ok(Status::Ok);
                }
                continue;
            }

            if !self.source.is_final(action) {
                return Ok(Status::Ok);
            }

            let mut dst = OutBuffer::around(&mut out[*out_pos..]);
            let remaining = match action {
                Action::Finish => self.ctx.finish(&mut dst, true),
                _              => self.ctx.flush(&mut dst),
            }
            .map_err(|e| {
                debug!("zstd flush failed: {}", e);
                Error::Prog("zstd flush failed")
            })?;
            *out_pos += dst.pos();

            if remaining > 0 {
                return Ok(Status::Ok);
            }
            if action != Action::Finish {
                self.source.rearm();
            }
            return Ok(Status::StreamEnd);
        }
    }

    fn name(&self) -> &'static str {
        "zstd-encoder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn subfilter(&mut self, cmd: SubfilterCommand) -> Result<SubfilterState> {
        self.source.next_mut().subfilter(cmd)
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct ZstdDecoder {
    ctx:    Decoder<'static>,
    source: Source,
}

impl ZstdDecoder {
    pub(crate) fn init(next: &mut NextCoder, upstream: &[Filter]) -> Result<()> {
        if let Some(coder) = next.reuse::<ZstdDecoder>() {
            coder.ctx.reinit().map_err(|e| {
                debug!("zstd decoder reset failed: {}", e);
                Error::Mem
            })?;
            return coder.source.reinit(upstream, Direction::Decode);
        }
        let ctx = Decoder::new().map_err(|e| {
            debug!("zstd decoder allocation failed: {}", e);
            Error::Mem
        })?;
        next.set(ZstdDecoder { ctx, source: Source::init(upstream, Direction::Decode)? });
        Ok(())
    }
}

impl Coder for ZstdDecoder {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        loop {
            self.source.fill(input, in_pos, action)?;
            let avail = self.source.available(input, *in_pos);

            let mut src = InBuffer::around(avail);
            let mut dst = OutBuffer::around(&mut out[*out_pos..]);
            let hint = self.ctx.run(&mut src, &mut dst).map_err(|e| {
                debug!("zstd decompression failed: {}", e);
                Error::Data("corrupt zstd frame")
            })?;
            let (read, written) = (src.pos(), dst.pos());
            self.source.consume(in_pos, read);
            *out_pos += written;

            // A zero hint means the frame is complete and fully flushed.
            if hint == 0 {
                return Ok(Status::StreamEnd);
            }
            if read == 0 && written == 0 {
                let drained = self.source.available(input, *in_pos).is_empty();
                if drained && self.source.is_final(action) && *out_pos < out.len() {
                    return Err(Error::Data("truncated zstd frame"));
                }
                return Ok(Status::Ok);
            }
        }
    }

    fn name(&self) -> &'static str {
        "zstd-decoder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
