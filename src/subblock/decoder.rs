//! Subblock decoder.
//!
//! [`Framing`] parses markers and expands Data and Repeating Data chunks into
//! a target buffer: the caller's output, or the input buffer of the active
//! subfilter chain.  [`SubblockDecoder`] moves bytes between the two.

use std::any::Any;

use log::debug;

use crate::coder::filter::FILTER_PROPS_MAX;
use crate::coder::{chain_init, Action, Coder, Direction, Filter, NextCoder, Source, Status};
use crate::error::{Error, Result};
use crate::subblock::{
    SubblockOptions, ALIGNMENT_MAX, MARKER_DATA, MARKER_END_OF_PAYLOAD, MARKER_END_SUBFILTER,
    MARKER_PADDING, MARKER_REPEAT, MARKER_SET_SUBFILTER, RLE_MAX, SUBFILTER_BUF_SIZE,
};
use crate::vli;

// ── Framing parser ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Data,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sequence {
    Marker,
    /// Reading size byte 1, 2 or 3.
    Size(u8),
    PatternSize,
    Pattern,
    Data,
    Repeat,
    FilterId,
    FilterPropsSize,
    FilterProps,
    Finished,
}

/// What a call to [`Framing::parse`] stopped on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    /// Out of input or out of target space.
    Continue,
    Set(Filter),
    End,
    EndOfPayload,
}

#[derive(Debug)]
pub(crate) struct Framing {
    sequence:         Sequence,
    allow_subfilters: bool,
    /// Padding markers since the last chunk.
    padding:          u32,
    kind:             Kind,
    /// Data size or repeat count.  Holds the stored value minus one while the
    /// size bytes are read.
    size:             u64,
    pattern:          Vec<u8>,
    pattern_size:     usize,
    pattern_pos:      usize,
    filter_id:        u64,
    props_size:       u64,
    vli_pos:          usize,
    props:            Vec<u8>,
}

impl Framing {
    pub(crate) fn new(allow_subfilters: bool) -> Self {
        Framing {
            sequence: Sequence::Marker,
            allow_subfilters,
            padding: 0,
            kind: Kind::Data,
            size: 0,
            pattern: Vec::with_capacity(RLE_MAX),
            pattern_size: 0,
            pattern_pos: 0,
            filter_id: 0,
            props_size: 0,
            vli_pos: 0,
            props: Vec::new(),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.sequence == Sequence::Finished
    }

    /// Parse `input[*in_pos..]`, writing payload bytes to
    /// `target[*target_pos..]`.  `sub_active` tells whether a subfilter is
    /// open.
    pub(crate) fn parse(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        target: &mut [u8],
        target_pos: &mut usize,
        sub_active: bool,
    ) -> Result<Event> {
        loop {
            match self.sequence {
                Sequence::Finished => return Ok(Event::EndOfPayload),
                Sequence::Repeat => {
                    if self.size == 0 {
                        self.sequence = Sequence::Marker;
                        continue;
                    }
                    if *target_pos == target.len() {
                        return Ok(Event::Continue);
                    }
                    let pattern = &self.pattern[self.pattern_pos..];
                    let n = pattern.len().min(target.len() - *target_pos);
                    target[*target_pos..*target_pos + n].copy_from_slice(&pattern[..n]);
                    *target_pos += n;
                    self.pattern_pos += n;
                    if self.pattern_pos == self.pattern.len() {
                        self.pattern_pos = 0;
                        self.size -= 1;
                    }
                    continue;
                }
                Sequence::Data if self.size == 0 => {
                    self.sequence = Sequence::Marker;
                    continue;
                }
                Sequence::FilterProps if self.props.len() as u64 == self.props_size => {
                    let filter = Filter::from_flags(self.filter_id, &self.props)?;
                    self.sequence = Sequence::Marker;
                    return Ok(Event::Set(filter));
                }
                _ => {}
            }

            if *in_pos >= input.len() {
                return Ok(Event::Continue);
            }

            match self.sequence {
                Sequence::Marker => {
                    let byte = input[*in_pos];
                    *in_pos += 1;
                    if let Some(event) = self.marker(byte, sub_active)? {
                        return Ok(event);
                    }
                }
                Sequence::Size(n) => {
                    let byte = input[*in_pos];
                    *in_pos += 1;
                    self.size |= u64::from(byte) << (4 + 8 * (u32::from(n) - 1));
                    if n < 3 {
                        self.sequence = Sequence::Size(n + 1);
                        continue;
                    }
                    self.size += 1;
                    match self.kind {
                        Kind::Data => {
                            if self.size <= u64::from(self.padding) {
                                return Err(Error::Data("padding is not shorter than the data"));
                            }
                            self.padding = 0;
                            self.sequence = Sequence::Data;
                        }
                        Kind::Repeat => self.sequence = Sequence::PatternSize,
                    }
                }
                Sequence::PatternSize => {
                    self.pattern_size = usize::from(input[*in_pos]) + 1;
                    *in_pos += 1;
                    if self.pattern_size as u64 <= u64::from(self.padding) {
                        return Err(Error::Data("padding is not shorter than the pattern"));
                    }
                    self.padding = 0;
                    self.pattern.clear();
                    self.sequence = Sequence::Pattern;
                }
                Sequence::Pattern => {
                    let n = (self.pattern_size - self.pattern.len()).min(input.len() - *in_pos);
                    self.pattern.extend_from_slice(&input[*in_pos..*in_pos + n]);
                    *in_pos += n;
                    if self.pattern.len() == self.pattern_size {
                        self.pattern_pos = 0;
                        self.sequence = Sequence::Repeat;
                    }
                }
                Sequence::Data => {
                    if *target_pos == target.len() {
                        return Ok(Event::Continue);
                    }
                    let n = (self.size as usize)
                        .min(input.len() - *in_pos)
                        .min(target.len() - *target_pos);
                    target[*target_pos..*target_pos + n].copy_from_slice(&input[*in_pos..*in_pos + n]);
                    *target_pos += n;
                    *in_pos += n;
                    self.size -= n as u64;
                }
                Sequence::FilterId => {
                    if vli::decode(&mut self.filter_id, Some(&mut self.vli_pos), input, in_pos)?
                        == Status::StreamEnd
                    {
                        self.vli_pos = 0;
                        self.sequence = Sequence::FilterPropsSize;
                    }
                }
                Sequence::FilterPropsSize => {
                    if vli::decode(&mut self.props_size, Some(&mut self.vli_pos), input, in_pos)?
                        == Status::StreamEnd
                    {
                        self.vli_pos = 0;
                        if self.props_size > FILTER_PROPS_MAX {
                            return Err(Error::Options("filter properties are too large"));
                        }
                        self.props.clear();
                        self.sequence = Sequence::FilterProps;
                    }
                }
                Sequence::FilterProps => {
                    let want = self.props_size as usize - self.props.len();
                    let n = want.min(input.len() - *in_pos);
                    self.props.extend_from_slice(&input[*in_pos..*in_pos + n]);
                    *in_pos += n;
                }
                Sequence::Repeat | Sequence::Finished => {}
            }
        }
    }

    fn marker(&mut self, byte: u8, sub_active: bool) -> Result<Option<Event>> {
        let low = byte & 0x0F;
        let kind = byte & 0xF0;

        if matches!(
            kind,
            MARKER_PADDING | MARKER_END_OF_PAYLOAD | MARKER_SET_SUBFILTER | MARKER_END_SUBFILTER
        ) && low != 0
        {
            return Err(Error::Data("reserved marker bits are set"));
        }

        match kind {
            MARKER_PADDING => {
                self.padding += 1;
                if self.padding >= ALIGNMENT_MAX {
                    return Err(Error::Data("too much padding"));
                }
                Ok(None)
            }
            MARKER_DATA | MARKER_REPEAT => {
                self.kind = if kind == MARKER_DATA { Kind::Data } else { Kind::Repeat };
                self.size = u64::from(low);
                self.sequence = Sequence::Size(1);
                Ok(None)
            }
            _ if self.padding != 0 => Err(Error::Data("padding before a non-data chunk")),
            MARKER_END_OF_PAYLOAD => {
                if sub_active {
                    return Err(Error::Data("end of payload inside a subfilter"));
                }
                self.sequence = Sequence::Finished;
                Ok(Some(Event::EndOfPayload))
            }
            MARKER_SET_SUBFILTER => {
                if !self.allow_subfilters {
                    return Err(Error::Data("subfilters are not allowed"));
                }
                if sub_active {
                    return Err(Error::Data("a subfilter is already active"));
                }
                self.filter_id = 0;
                self.props_size = 0;
                self.vli_pos = 0;
                self.sequence = Sequence::FilterId;
                Ok(None)
            }
            MARKER_END_SUBFILTER => {
                if !sub_active {
                    return Err(Error::Data("no active subfilter to end"));
                }
                Ok(Some(Event::End))
            }
            _ => Err(Error::Data("unknown chunk type")),
        }
    }
}

// ── Nested chain ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    /// The subfilter reached its end after End Subfilter.
    Closed,
    /// Needs more output space.
    Blocked,
    /// Ready for more payload.
    Ready,
}

#[derive(Debug)]
struct Subfilter {
    chain:       NextCoder,
    buf:         Vec<u8>,
    pos:         usize,
    size:        usize,
    got_payload: bool,
    stream_end:  bool,
    /// End Subfilter has been read.
    closing:     bool,
}

impl Subfilter {
    fn new(filter: &Filter) -> Result<Self> {
        let mut chain = NextCoder::new();
        chain_init(&mut chain, std::slice::from_ref(filter), Direction::Decode)?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(SUBFILTER_BUF_SIZE).map_err(|_| Error::Mem)?;
        buf.resize(SUBFILTER_BUF_SIZE, 0);
        Ok(Subfilter {
            chain,
            buf,
            pos: 0,
            size: 0,
            got_payload: false,
            stream_end: false,
            closing: false,
        })
    }

    fn run(&mut self, out: &mut [u8], out_pos: &mut usize) -> Result<Drive> {
        loop {
            if self.stream_end {
                if self.pos < self.size {
                    return Err(Error::Data("data after the end of the subfilter stream"));
                }
                return Ok(if self.closing { Drive::Closed } else { Drive::Ready });
            }
            if self.pos == self.size && !self.closing {
                self.pos = 0;
                self.size = 0;
                return Ok(Drive::Ready);
            }

            let action = if self.closing { Action::Finish } else { Action::Run };
            let (in_start, out_start) = (self.pos, *out_pos);
            let status = self.chain.code(&self.buf[..self.size], &mut self.pos, out, out_pos, action)?;
            let progress = self.pos != in_start || *out_pos != out_start;

            if self.pos == self.size {
                self.pos = 0;
                self.size = 0;
            }
            if status == Status::StreamEnd {
                self.stream_end = true;
                continue;
            }
            if *out_pos == out.len() {
                return Ok(Drive::Blocked);
            }
            if !progress {
                if self.closing {
                    return Err(Error::Data("subfilter stream is truncated"));
                }
                // Unconsumed bytes stay at the front of the buffer.
                if self.pos > 0 {
                    self.buf.copy_within(self.pos..self.size, 0);
                    self.size -= self.pos;
                    self.pos = 0;
                }
                return Ok(if self.size < self.buf.len() { Drive::Ready } else { Drive::Blocked });
            }
        }
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub struct SubblockDecoder {
    source:    Source,
    framing:   Framing,
    subfilter: Option<Subfilter>,
}

impl SubblockDecoder {
    pub(crate) fn init(next: &mut NextCoder, options: &SubblockOptions, upstream: &[Filter]) -> Result<()> {
        if let Some(coder) = next.reuse::<SubblockDecoder>() {
            coder.source.reinit(upstream, Direction::Decode)?;
            coder.framing = Framing::new(options.allow_subfilters);
            coder.subfilter = None;
            return Ok(());
        }
        next.set(SubblockDecoder {
            source:    Source::init(upstream, Direction::Decode)?,
            framing:   Framing::new(options.allow_subfilters),
            subfilter: None,
        });
        Ok(())
    }
}

impl Coder for SubblockDecoder {
    fn code(
        &mut self,
        input: &[u8],
        in_pos: &mut usize,
        out: &mut [u8],
        out_pos: &mut usize,
        action: Action,
    ) -> Result<Status> {
        loop {
            if let Some(sub) = self.subfilter.as_mut() {
                match sub.run(out, out_pos)? {
                    Drive::Closed => {
                        debug!("subfilter closed");
                        self.subfilter = None;
                        continue;
                    }
                    Drive::Blocked => return Ok(Status::Ok),
                    Drive::Ready => {}
                }
            }

            self.source.fill(input, in_pos, action)?;
            if self.framing.is_finished() {
                if !self.source.available(input, *in_pos).is_empty() {
                    return Err(Error::Data("data after end of payload"));
                }
                return Ok(Status::StreamEnd);
            }

            let avail = self.source.available(input, *in_pos);
            let mut used = 0;
            let (event, wrote) = match self.subfilter.as_mut() {
                Some(sub) => {
                    let start = sub.size;
                    let event = self.framing.parse(avail, &mut used, &mut sub.buf[..], &mut sub.size, true);
                    let wrote = sub.size != start;
                    if wrote {
                        sub.got_payload = true;
                    }
                    (event, wrote)
                }
                None => {
                    let start = *out_pos;
                    let event = self.framing.parse(avail, &mut used, out, out_pos, false);
                    (event, *out_pos != start)
                }
            };
            self.source.consume(in_pos, used);

            match event? {
                Event::Continue => {
                    if used == 0 && !wrote {
                        return Ok(Status::Ok);
                    }
                }
                Event::Set(Filter::Subblock(_)) => {
                    return Err(Error::Data("subblock cannot nest inside subblock"));
                }
                Event::Set(filter) => {
                    debug!("subfilter {} started", filter.name());
                    self.subfilter = Some(Subfilter::new(&filter)?);
                }
                Event::End => {
                    let Some(sub) = self.subfilter.as_mut() else {
                        return Err(Error::Data("no active subfilter to end"));
                    };
                    if !sub.got_payload {
                        return Err(Error::Data("empty subfilter"));
                    }
                    sub.closing = true;
                }
                Event::EndOfPayload => {}
            }
        }
    }

    fn name(&self) -> &'static str {
        "subblock-decoder"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
