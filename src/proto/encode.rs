//! The response generator.
//!
//! [`ResponseGenerator`] is a step machine between the connection and the
//! wire format. The connection feeds it an [`Action`] plus the five buffer
//! slots; each step answers with what it needs next: a buffer slot filled
//! from the pool, a flush of what it has staged, or nothing. The generator
//! decides framing at commit time and owns every framing byte on the wire;
//! the connection owns delivery order and backpressure.

use std::cmp;
use std::fmt::Write as _;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use tracing::trace;

use super::date;
use crate::{Error, Result};

/// Capacity of the chunk-frame slot: CRLF + 16 hex digits + CRLF, with room
/// for the terminating last-chunk.
pub(crate) const CHUNK_SPACE: usize = 24;

/// Content at or above this size bypasses the body buffer and is written
/// directly from the caller's bytes.
const DIRECT_CONTENT_MIN: usize = 1024;

/// What the connection asks of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Accept content and stage it; do not force it onto the wire.
    Prepare,
    /// Push everything staged onto the wire.
    Flush,
    /// Finish the response, including any terminal framing.
    Complete,
}

/// What the generator needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A header buffer must be acquired from the pool.
    NeedHeader,
    /// A body buffer must be acquired from the pool.
    NeedBuffer,
    /// A chunk-frame buffer must be acquired; the header slot can go back.
    NeedChunk,
    /// Flush the staged header/chunk/body slots.
    Flush,
    /// Flush the staged header/chunk slots together with the caller's
    /// content.
    FlushContent,
    /// Shut the endpoint's output side.
    ShutdownOut,
    /// Nothing to do for this action.
    Ok,
}

/// The response descriptor the generator commits from: status, fields, and
/// what the request implies for framing.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// The response HTTP version.
    pub version: Version,
    /// The response status.
    pub status: StatusCode,
    /// An overriding reason phrase, if any.
    pub reason: Option<String>,
    /// The response header fields.
    pub headers: HeaderMap,
    /// The declared body length; `None` means unknown.
    pub content_length: Option<u64>,
    /// Whether the request was HEAD: body bytes are consumed, never sent.
    pub head: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenState {
    Start,
    Committed,
    End,
}

#[derive(Debug)]
enum Framing {
    /// No body on the wire (1xx, 204, 304), or not yet decided.
    None,
    Length(u64),
    Chunked { wrote_chunk: bool },
    CloseDelimited,
}

/// The HTTP/1.x response serializer state machine.
#[derive(Debug)]
pub struct ResponseGenerator {
    state: GenState,
    framing: Framing,
    persistent: bool,
    head: bool,
    prepared: u64,
    shutdown_sent: bool,
}

impl ResponseGenerator {
    /// A generator in the idle state.
    pub fn new() -> ResponseGenerator {
        ResponseGenerator {
            state: GenState::Start,
            framing: Framing::None,
            persistent: true,
            head: false,
            prepared: 0,
            shutdown_sent: false,
        }
    }

    /// Advance the state machine one step.
    ///
    /// `info` is only consulted while uncommitted. `content` is the
    /// caller's body bytes; the generator consumes from it and leaves what
    /// should go to the wire for the connection to move into its content
    /// slot on [`Step::FlushContent`].
    pub(crate) fn generate(
        &mut self,
        info: Option<&ResponseInfo>,
        header: &mut Option<BytesMut>,
        chunk: &mut Option<BytesMut>,
        buffer: &mut Option<BytesMut>,
        content: &mut Option<Bytes>,
        action: Action,
    ) -> Result<Step> {
        loop {
            match self.state {
                GenState::Start => {
                    let info = info.ok_or_else(Error::new_closed)?;
                    let dst = match header.as_mut() {
                        Some(dst) => dst,
                        None => return Ok(Step::NeedHeader),
                    };
                    self.commit(info, dst);
                    self.state = GenState::Committed;
                    if matches!(self.framing, Framing::Chunked { .. }) {
                        // chunk frames cannot share a gather write with the
                        // header slot; put the header on the wire first
                        return Ok(Step::Flush);
                    }
                }
                GenState::Committed => {
                    if content.as_ref().map_or(false, |c| c.is_empty()) {
                        *content = None;
                    }
                    if let Some(mut c) = content.take() {
                        match self.step_content(&mut c, chunk, buffer)? {
                            Some(step) => {
                                if !c.is_empty() {
                                    *content = Some(c);
                                }
                                return Ok(step);
                            }
                            None => continue,
                        }
                    }
                    let staged = dirty(header) || dirty(buffer);
                    match action {
                        Action::Prepare => return Ok(Step::Ok),
                        Action::Flush => {
                            return Ok(if staged { Step::Flush } else { Step::Ok });
                        }
                        Action::Complete => match self.framing {
                            Framing::Length(remaining) if remaining > 0 => {
                                return Err(Error::new_body_too_short(remaining));
                            }
                            Framing::Chunked { wrote_chunk } if !self.head => {
                                let ch = match chunk.as_mut() {
                                    Some(ch) => ch,
                                    None => return Ok(Step::NeedChunk),
                                };
                                if wrote_chunk {
                                    ch.extend_from_slice(b"\r\n0\r\n\r\n");
                                } else {
                                    ch.extend_from_slice(b"0\r\n\r\n");
                                }
                                self.state = GenState::End;
                                return Ok(Step::Flush);
                            }
                            Framing::CloseDelimited => {
                                if staged {
                                    return Ok(Step::Flush);
                                }
                                self.persistent = false;
                                self.state = GenState::End;
                            }
                            _ => {
                                if staged {
                                    return Ok(Step::Flush);
                                }
                                self.state = GenState::End;
                            }
                        },
                    }
                }
                GenState::End => {
                    if !self.persistent && !self.shutdown_sent {
                        self.shutdown_sent = true;
                        return Ok(Step::ShutdownOut);
                    }
                    return Ok(Step::Ok);
                }
            }
        }
    }

    /// Consume from `c`. `Some(step)` hands control back to the connection;
    /// `None` means the content was fully absorbed here.
    fn step_content(
        &mut self,
        c: &mut Bytes,
        chunk: &mut Option<BytesMut>,
        buffer: &mut Option<BytesMut>,
    ) -> Result<Option<Step>> {
        if self.head {
            // HEAD responses consume the body without sending it
            self.prepared += c.len() as u64;
            if let Framing::Length(ref mut remaining) = self.framing {
                *remaining -= cmp::min(*remaining, c.len() as u64);
            }
            c.clear();
            return Ok(None);
        }
        match self.framing {
            Framing::None => {
                self.prepared += c.len() as u64;
                c.clear();
                Ok(None)
            }
            Framing::Length(ref mut remaining) => {
                if *remaining == 0 {
                    // bytes beyond the declared length never reach the wire
                    self.prepared += c.len() as u64;
                    c.clear();
                    return Ok(None);
                }
                if c.len() >= DIRECT_CONTENT_MIN {
                    if dirty(buffer) {
                        return Ok(Some(Step::Flush));
                    }
                    let take = cmp::min(*remaining, c.len() as u64) as usize;
                    let excess = c.len() - take;
                    let send = c.split_to(take);
                    c.clear();
                    *remaining -= take as u64;
                    self.prepared += (take + excess) as u64;
                    *c = send;
                    Ok(Some(Step::FlushContent))
                } else {
                    let buf = match buffer.as_mut() {
                        Some(buf) => buf,
                        None => return Ok(Some(Step::NeedBuffer)),
                    };
                    let free = buf.capacity() - buf.len();
                    if free == 0 {
                        return Ok(Some(Step::Flush));
                    }
                    let take = cmp::min(cmp::min(free, c.len()), *remaining as usize);
                    buf.extend_from_slice(&c[..take]);
                    c.advance(take);
                    *remaining -= take as u64;
                    self.prepared += take as u64;
                    trace!("buffered {} content bytes", take);
                    if *remaining == 0 && !c.is_empty() {
                        self.prepared += c.len() as u64;
                        c.clear();
                    }
                    if c.is_empty() {
                        Ok(None)
                    } else {
                        // buffer filled before the content drained
                        Ok(Some(Step::Flush))
                    }
                }
            }
            Framing::Chunked { ref mut wrote_chunk } => {
                let ch = match chunk.as_mut() {
                    Some(ch) => ch,
                    None => return Ok(Some(Step::NeedChunk)),
                };
                if *wrote_chunk {
                    ch.extend_from_slice(b"\r\n");
                }
                write!(ch, "{:X}\r\n", c.len()).expect("chunk frame fits any usize");
                *wrote_chunk = true;
                self.prepared += c.len() as u64;
                Ok(Some(Step::FlushContent))
            }
            Framing::CloseDelimited => {
                if c.len() >= DIRECT_CONTENT_MIN {
                    if dirty(buffer) {
                        return Ok(Some(Step::Flush));
                    }
                    self.prepared += c.len() as u64;
                    Ok(Some(Step::FlushContent))
                } else {
                    let buf = match buffer.as_mut() {
                        Some(buf) => buf,
                        None => return Ok(Some(Step::NeedBuffer)),
                    };
                    let free = buf.capacity() - buf.len();
                    if free == 0 {
                        return Ok(Some(Step::Flush));
                    }
                    let take = cmp::min(free, c.len());
                    buf.extend_from_slice(&c[..take]);
                    c.advance(take);
                    self.prepared += take as u64;
                    if c.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(Step::Flush))
                    }
                }
            }
        }
    }

    fn commit(&mut self, info: &ResponseInfo, dst: &mut BytesMut) {
        self.head = info.head;
        if super::parse::wants_close(&info.headers) {
            self.persistent = false;
        }
        if info.version != Version::HTTP_11 {
            self.persistent = false;
        }

        let no_body = info.status.is_informational()
            || info.status == StatusCode::NO_CONTENT
            || info.status == StatusCode::NOT_MODIFIED;
        self.framing = if no_body {
            Framing::None
        } else {
            match info.content_length {
                Some(n) => Framing::Length(n),
                None if self.persistent => Framing::Chunked { wrote_chunk: false },
                None => {
                    self.persistent = false;
                    Framing::CloseDelimited
                }
            }
        };

        trace!("commit {} {:?}", info.status, self.framing);

        match info.version {
            Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
            _ => dst.extend_from_slice(b"HTTP/1.1 "),
        }
        let mut fmt = itoa::Buffer::new();
        dst.extend_from_slice(fmt.format(info.status.as_u16()).as_bytes());
        dst.extend_from_slice(b" ");
        let reason = info
            .reason
            .as_deref()
            .or_else(|| info.status.canonical_reason())
            .unwrap_or("");
        dst.extend_from_slice(reason.as_bytes());
        dst.extend_from_slice(b"\r\n");

        for (name, value) in info.headers.iter() {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            dst.extend_from_slice(name.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        match self.framing {
            Framing::Length(n) => {
                dst.extend_from_slice(b"content-length: ");
                dst.extend_from_slice(fmt.format(n).as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            Framing::Chunked { .. } => {
                dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
            }
            Framing::None | Framing::CloseDelimited => {}
        }
        if !self.persistent
            && info.version == Version::HTTP_11
            && !info.headers.contains_key(CONNECTION)
        {
            dst.extend_from_slice(b"connection: close\r\n");
        }
        if !info.headers.contains_key(DATE) && !info.status.is_informational() {
            dst.extend_from_slice(b"date: ");
            date::extend(dst);
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
    }

    /// Whether the generator has not started a response.
    pub fn is_idle(&self) -> bool {
        self.state == GenState::Start
    }

    /// Whether the response head has been serialized.
    pub fn is_committed(&self) -> bool {
        self.state != GenState::Start
    }

    /// Whether the response is finished.
    pub fn is_ended(&self) -> bool {
        self.state == GenState::End
    }

    /// Whether the connection may carry another response after this one.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Force this response to be the connection's last.
    pub fn set_persistent(&mut self, persistent: bool) {
        if !persistent {
            self.persistent = false;
        }
    }

    /// Total content bytes consumed from callers so far.
    pub fn prepared(&self) -> u64 {
        self.prepared
    }

    /// Return to idle for the next response on a kept-alive connection.
    pub fn reset(&mut self) {
        self.state = GenState::Start;
        self.framing = Framing::None;
        self.persistent = true;
        self.head = false;
        self.prepared = 0;
        self.shutdown_sent = false;
    }
}

impl Default for ResponseGenerator {
    fn default() -> ResponseGenerator {
        ResponseGenerator::new()
    }
}

fn dirty(slot: &Option<BytesMut>) -> bool {
    slot.as_ref().map_or(false, |b| !b.is_empty())
}
