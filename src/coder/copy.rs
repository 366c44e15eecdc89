use std::any::Any;

use crate::coder::{
    Action, Coder, Direction, Filter, NextCoder, Source, Status, SubfilterCommand,
    SubfilterState,
};
use crate::error::Result;

/// Identity node.  Passes bytes through unchanged; useful as a chain
/// terminator and as a subfilter that must produce output.
#[derive(Debug)]
pub struct CopyCoder {
    source: Source,
}

impl CopyCoder {
    pub(crate) fn init(next: &mut NextCoder, upstream: &[Filter], direction: Direction) -> Result<()> {
        if let Some(coder) = next.reuse::<CopyCoder>() {
            return coder.source.reinit(upstream, direction);
        }
        next.set(CopyCoder { source: Source::init(upstream, direction)? });
        Ok(())
    }
}

impl Coder for CopyCoder {
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
            let n = avail.len().min(out.len() - *out_pos);
            out[*out_pos..*out_pos + n].copy_from_slice(&avail[..n]);
            *out_pos += n;
            self.source.consume(in_pos, n);

            if !self.source.available(input, *in_pos).is_empty() {
                return Ok(Status::Ok);
            }
            if self.source.is_final(action) {
                if action != Action::Finish {
                    self.source.rearm();
                }
                return Ok(Status::StreamEnd);
            }
            if self.source.is_direct() || n == 0 {
                return Ok(Status::Ok);
            }
        }
    }

    fn name(&self) -> &'static str {
        "copy"
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
