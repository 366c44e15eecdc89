//! Coder chain runtime.
//!
//! A chain is a pull pipeline.  The head node produces the bytes the caller
//! sees and pulls its own input from its upstream neighbour, or straight from
//! the caller's buffer when it is the last node.  Every node owns its
//! upstream, so dropping the head tears the whole chain down.
//!
//! # Chain positions
//! A position is a [`NextCoder`].  Initialising a position with the type it
//! already holds reuses the existing allocation; any other type drops the old
//! occupant (and everything upstream of it) first.

use std::any::Any;

use log::trace;

use crate::error::{Error, Result};

pub mod copy;
pub mod filter;
pub mod stream;

pub use copy::CopyCoder;
pub use filter::{chain_init, Direction, Filter, FILTERS_MAX};
pub use stream::Stream;

// ── Status and actions ───────────────────────────────────────────────────────

/// Successful outcome of one coding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// More work remains; call again.
    Ok,
    /// The flush or the stream is complete.
    StreamEnd,
}

/// What the caller wants the chain to do with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Run,
    SyncFlush,
    FullFlush,
    Finish,
}

impl Action {
    pub(crate) const ALL: [Action; 4] =
        [Action::Run, Action::SyncFlush, Action::FullFlush, Action::Finish];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Action::Run       => 0,
            Action::SyncFlush => 1,
            Action::FullFlush => 2,
            Action::Finish    => 3,
        }
    }
}

/// Integrity check a node verifies or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Check {
    #[default]
    None,
    Crc32,
}

// ── Subfilter control ────────────────────────────────────────────────────────

/// Command for a node that can nest a subfilter inside its output.
#[derive(Debug, Clone, PartialEq)]
pub enum SubfilterCommand {
    /// Report the current state only.
    Query,
    /// Start a subfilter at the next chunk boundary.
    Set(Filter),
    /// Drive the running subfilter to its end and close it.
    Finish,
}

/// Lifecycle of a nested subfilter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubfilterState {
    #[default]
    Unset,
    Requested,
    Running,
    Flushing,
    Finishing,
}

// ── Coder trait ──────────────────────────────────────────────────────────────

/// One node of a chain.
///
/// `code` consumes from `input[*in_pos..]` and writes into `out[*out_pos..]`,
/// advancing both cursors by what it actually used.  It is re-entrant: a call
/// that returns `Status::Ok` may be repeated with the same cursors.
pub trait Coder: Send {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn check(&self) -> Check {
        Check::None
    }

    fn memusage(&self) -> Option<u64> {
        None
    }

    fn memlimit(&self) -> Option<u64> {
        None
    }

    fn set_memlimit(&mut self, _limit: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn subfilter(&mut self, _cmd: SubfilterCommand) -> Result<SubfilterState> {
        Err(Error::Unsupported)
    }
}

// ── Chain position ───────────────────────────────────────────────────────────

/// A chain position: either empty (end of chain) or one boxed node.
#[derive(Default)]
pub struct NextCoder {
    coder: Option<Box<dyn Coder>>,
}

impl std::fmt::Debug for NextCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.coder {
            Some(c) => write!(f, "NextCoder({})", c.name()),
            None    => write!(f, "NextCoder(end)"),
        }
    }
}

impl NextCoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.coder.is_none()
    }

    /// Return the occupant if it is a `T`, ready to be reinitialised in
    /// place.  An occupant of any other type is dropped.
    pub fn reuse<T: Coder + 'static>(&mut self) -> Option<&mut T> {
        let same = self
            .coder
            .as_ref()
            .map_or(false, |c| c.as_any().is::<T>());
        if !same {
            if let Some(old) = self.coder.take() {
                trace!("dropping {} from chain position", old.name());
            }
            return None;
        }
        let coder = self.coder.as_mut()?.as_any_mut().downcast_mut::<T>()?;
        trace!("reusing {} at chain position", coder.name());
        Some(coder)
    }

    /// Install a freshly built node, dropping any occupant.
    pub fn set<T: Coder + 'static>(&mut self, coder: T) {
        trace!("initializing {} at chain position", coder.name());
        self.coder = Some(Box::new(coder));
    }

    /// Release this position and everything upstream of it.
    pub fn end(&mut self) {
        self.coder = None;
    }

    pub fn get(&self) -> Option<&dyn Coder> {
        self.coder.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut (dyn Coder + 'static)> {
        self.coder.as_deref_mut()
    }

    pub fn downcast_ref<T: Coder + 'static>(&self) -> Option<&T> {
        self.coder.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Coder + 'static>(&mut self) -> Option<&mut T> {
        self.coder.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    pub fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        match self.coder.as_mut() {
            Some(c) => c.code(input, in_pos, out, out_pos, action),
            None    => Err(Error::Prog("coder chain is not initialized")),
        }
    }

    pub fn subfilter(&mut self, cmd: SubfilterCommand) -> Result<SubfilterState> {
        match self.coder.as_mut() {
            Some(c) => c.subfilter(cmd),
            None    => Err(Error::Unsupported),
        }
    }
}

// ── Input source ─────────────────────────────────────────────────────────────

/// Size of the staging buffer between two chained nodes.
pub const SOURCE_BUF_SIZE: usize = 4096;

/// Where a node gets its input from.
///
/// With no upstream the node reads the caller's buffer directly.  With an
/// upstream node the bytes are pulled into a private staging buffer first.
#[derive(Debug)]
pub struct Source {
    next: NextCoder,
    buf:  Vec<u8>,
    pos:  usize,
    size: usize,
    /// Upstream returned `StreamEnd` for the current action.
    end:  bool,
}

impl Source {
    pub fn init(upstream: &[Filter], direction: Direction) -> Result<Self> {
        let mut source = Source {
            next: NextCoder::new(),
            buf:  Vec::new(),
            pos:  0,
            size: 0,
            end:  false,
        };
        source.reinit(upstream, direction)?;
        Ok(source)
    }

    /// Re-chain the upstream and forget any staged bytes.
    pub fn reinit(&mut self, upstream: &[Filter], direction: Direction) -> Result<()> {
        chain_init(&mut self.next, upstream, direction)?;
        if !self.next.is_none() && self.buf.is_empty() {
            self.buf.try_reserve_exact(SOURCE_BUF_SIZE).map_err(|_| Error::Mem)?;
            self.buf.resize(SOURCE_BUF_SIZE, 0);
        }
        self.reset();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.size = 0;
        self.end = false;
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.next.is_none()
    }

    pub fn next_mut(&mut self) -> &mut NextCoder {
        &mut self.next
    }

    /// Pull from upstream once the staging buffer is empty.
    pub fn fill(&mut self, input: &[u8], in_pos: &mut usize, action: Action) -> Result<()> {
        if self.is_direct() || self.end || self.pos < self.size {
            return Ok(());
        }
        self.pos = 0;
        self.size = 0;
        let status = self.next.code(input, in_pos, &mut self.buf, &mut self.size, action)?;
        if status == Status::StreamEnd {
            self.end = true;
        }
        Ok(())
    }

    /// Bytes ready to be consumed.
    pub fn available<'a>(&'a self, input: &'a [u8], in_pos: usize) -> &'a [u8] {
        if self.is_direct() {
            &input[in_pos.min(input.len())..]
        } else {
            &self.buf[self.pos..self.size]
        }
    }

    pub fn consume(&mut self, in_pos: &mut usize, n: usize) {
        if self.is_direct() {
            *in_pos += n;
        } else {
            self.pos += n;
        }
    }

    /// `true` once no more input will arrive for the current action.
    pub fn is_final(&self, action: Action) -> bool {
        if self.is_direct() {
            action != Action::Run
        } else {
            self.end
        }
    }

    /// Let upstream run again after a completed flush.
    pub fn rearm(&mut self) {
        self.end = false;
    }
}
