//! The HTTP connection state: buffer slots, the generate loop, and the
//! gather-write flush machine.
//!
//! A connection holds at most one pooled buffer per slot (request, header,
//! chunk, body) plus a caller-owned content slot. Pending output is
//! described by [`PendingFlush`], a closed enumeration of the slot
//! combinations the wire format can express: header first, then chunk, then
//! exactly one of body or content. Anything else is a programmer error and
//! is rejected before a single byte is written.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use tracing::{debug, trace};

use super::channel::HttpChannel;
use super::encode::{Action, ResponseGenerator, Step, CHUNK_SPACE};
use super::parse::RequestParser;
use crate::io::{ByteChannel, Selectable};
use crate::pool::BufferPool;
use crate::server::Connector;
use crate::{Error, Result};

const HEADER_BIT: u8 = 8;
const CHUNK_BIT: u8 = 4;
const BUFFER_BIT: u8 = 2;
const CONTENT_BIT: u8 = 1;

/// The set of slots with bytes waiting to reach the wire.
///
/// Only the combinations a gather write can legally express exist; the
/// header and chunk slots never carry bytes at the same time, and the body
/// buffer and caller content are mutually exclusive within one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFlush {
    /// Nothing to write.
    None,
    /// Response header only.
    Header,
    /// Chunk frame only.
    Chunk,
    /// Body buffer only.
    Buffer,
    /// Caller content only.
    Content,
    /// Header gathered with the body buffer.
    HeaderBuffer,
    /// Header gathered with caller content.
    HeaderContent,
    /// Chunk frame gathered with the body buffer.
    ChunkBuffer,
    /// Chunk frame gathered with caller content.
    ChunkContent,
}

impl PendingFlush {
    /// Classify a slot bitset, rejecting combinations the wire format
    /// cannot express.
    pub fn from_bits(bits: u8) -> Result<PendingFlush> {
        match bits {
            0 => Ok(PendingFlush::None),
            8 => Ok(PendingFlush::Header),
            4 => Ok(PendingFlush::Chunk),
            2 => Ok(PendingFlush::Buffer),
            1 => Ok(PendingFlush::Content),
            10 => Ok(PendingFlush::HeaderBuffer),
            9 => Ok(PendingFlush::HeaderContent),
            6 => Ok(PendingFlush::ChunkBuffer),
            5 => Ok(PendingFlush::ChunkContent),
            other => Err(Error::new_invalid_flush(other)),
        }
    }

    /// The slot bitset this combination covers.
    pub fn bits(self) -> u8 {
        match self {
            PendingFlush::None => 0,
            PendingFlush::Header => HEADER_BIT,
            PendingFlush::Chunk => CHUNK_BIT,
            PendingFlush::Buffer => BUFFER_BIT,
            PendingFlush::Content => CONTENT_BIT,
            PendingFlush::HeaderBuffer => HEADER_BIT | BUFFER_BIT,
            PendingFlush::HeaderContent => HEADER_BIT | CONTENT_BIT,
            PendingFlush::ChunkBuffer => CHUNK_BIT | BUFFER_BIT,
            PendingFlush::ChunkContent => CHUNK_BIT | CONTENT_BIT,
        }
    }
}

/// The connection-level buffer and framing state for one HTTP connection.
pub struct Conn<C> {
    pub(crate) io: Selectable<C>,
    pub(crate) parser: RequestParser,
    pub(crate) generator: ResponseGenerator,
    pub(crate) channel: HttpChannel<C>,
    pub(crate) pool: Arc<BufferPool>,
    connector: Arc<Connector>,
    pub(crate) request: Option<BytesMut>,
    header: Option<BytesMut>,
    chunk: Option<BytesMut>,
    buffer: Option<BytesMut>,
    content: Option<Bytes>,
    pending: PendingFlush,
}

impl<C: ByteChannel> Conn<C> {
    pub(crate) fn new(connector: Arc<Connector>, io: Selectable<C>) -> Conn<C> {
        Conn {
            io,
            parser: RequestParser::new(),
            generator: ResponseGenerator::new(),
            channel: HttpChannel::new(),
            pool: connector.pool().clone(),
            connector,
            request: None,
            header: None,
            chunk: None,
            buffer: None,
            content: None,
            pending: PendingFlush::None,
        }
    }

    /// The selectable endpoint this connection drives.
    pub fn io(&self) -> &Selectable<C> {
        &self.io
    }

    /// Mutable access to the selectable endpoint.
    pub fn io_mut(&mut self) -> &mut Selectable<C> {
        &mut self.io
    }

    /// Feed one step to the generator and drive it until the given content
    /// (if any) is consumed and the action is satisfied.
    ///
    /// `volatile` declares that the caller's content buffer may be
    /// reclaimed when this call returns; the flush then completes
    /// synchronously instead of leaving bytes staged in the content slot.
    /// Returns the number of content bytes the generator consumed.
    pub async fn generate(
        &mut self,
        content: Option<Bytes>,
        action: Action,
        volatile: bool,
    ) -> Result<usize> {
        if self.generator.is_ended() {
            // completing or flushing an already-finished response is a
            // no-op; writing more body is not
            if content.is_none() && !matches!(action, Action::Prepare) {
                return Ok(0);
            }
            return Err(Error::new_closed());
        }
        let mut content = content;
        let before = self.generator.prepared();
        loop {
            if self.pending != PendingFlush::None {
                self.flush(true).await?;
            }
            let info = if self.generator.is_committed() {
                None
            } else {
                Some(self.channel.response_info())
            };
            let step = self.generator.generate(
                info.as_ref(),
                &mut self.header,
                &mut self.chunk,
                &mut self.buffer,
                &mut content,
                action,
            )?;
            trace!("generate step {:?}", step);
            match step {
                Step::NeedHeader => {
                    self.header = Some(self.pool.header());
                }
                Step::NeedBuffer => {
                    self.buffer = Some(self.pool.buffer());
                }
                Step::NeedChunk => {
                    // chunked responses reuse the header slot's place in
                    // the write order; the buffer itself goes back
                    if let Some(header) = self.header.take() {
                        self.pool.release(header);
                    }
                    self.chunk = Some(self.pool.sized(CHUNK_SPACE));
                }
                Step::Flush => {
                    self.pending = PendingFlush::from_bits(self.slot_bits(true, false))?;
                    self.flush(false).await?;
                    if content.is_none() && matches!(action, Action::Prepare) {
                        break;
                    }
                }
                Step::FlushContent => {
                    self.content = content.take();
                    self.pending = PendingFlush::from_bits(self.slot_bits(false, true))?;
                    self.flush(volatile).await?;
                    if matches!(action, Action::Prepare) {
                        break;
                    }
                }
                Step::ShutdownOut => {
                    self.io.endpoint_mut().shutdown_output();
                }
                Step::Ok => break,
            }
        }
        if matches!(action, Action::Complete) && self.pending != PendingFlush::None {
            self.flush(true).await?;
        }
        Ok((self.generator.prepared() - before) as usize)
    }

    /// Push pending slots to the endpoint with the fewest possible writes.
    ///
    /// With `block = false`, a single gather pass is made and whatever
    /// remains stays pending. With `block = true`, the call parks on
    /// [`Selectable::block_writeable`] between passes until every pending
    /// byte is on the wire; a wait that times out is an error.
    pub async fn flush(&mut self, block: bool) -> Result<()> {
        loop {
            if self.pending == PendingFlush::None {
                // our view of the caller's content ends when it is drained
                self.content = None;
                return Ok(());
            }
            let bits = self.pending.bits();
            let empty = IoSlice::new(&[]);
            let mut slices = [empty, empty];
            let mut count = 0;
            if bits & HEADER_BIT != 0 {
                if let Some(header) = self.header.as_ref() {
                    slices[count] = IoSlice::new(header);
                    count += 1;
                }
            }
            if bits & CHUNK_BIT != 0 {
                if let Some(chunk) = self.chunk.as_ref() {
                    slices[count] = IoSlice::new(chunk);
                    count += 1;
                }
            }
            if bits & BUFFER_BIT != 0 {
                if let Some(buffer) = self.buffer.as_ref() {
                    slices[count] = IoSlice::new(buffer);
                    count += 1;
                }
            }
            if bits & CONTENT_BIT != 0 {
                if let Some(content) = self.content.as_ref() {
                    slices[count] = IoSlice::new(content);
                    count += 1;
                }
            }
            let written = self.io.endpoint_mut().flush(&slices[..count])?;
            self.consume_pending(written);
            self.pending = PendingFlush::from_bits(self.remaining_bits())?;
            if self.pending == PendingFlush::None {
                self.content = None;
                return Ok(());
            }
            if !block {
                return Ok(());
            }
            trace!("flush blocked with {:?} pending", self.pending);
            if !self.io.block_writeable().await? {
                return Err(Error::new_idle_timeout());
            }
        }
    }

    // Advance the pending slots, in wire order, past `written` bytes.
    fn consume_pending(&mut self, mut written: usize) {
        let bits = self.pending.bits();
        if bits & HEADER_BIT != 0 {
            if let Some(header) = self.header.as_mut() {
                let take = std::cmp::min(header.len(), written);
                header.advance(take);
                written -= take;
            }
        }
        if bits & CHUNK_BIT != 0 {
            if let Some(chunk) = self.chunk.as_mut() {
                let take = std::cmp::min(chunk.len(), written);
                chunk.advance(take);
                written -= take;
            }
        }
        if bits & BUFFER_BIT != 0 {
            if let Some(buffer) = self.buffer.as_mut() {
                let take = std::cmp::min(buffer.len(), written);
                buffer.advance(take);
                written -= take;
            }
        }
        if bits & CONTENT_BIT != 0 {
            if let Some(content) = self.content.as_mut() {
                let take = std::cmp::min(content.len(), written);
                content.advance(take);
            }
        }
    }

    // Which of the currently pending slots still hold bytes.
    fn remaining_bits(&self) -> u8 {
        let mut bits = self.pending.bits();
        if self.header.as_ref().map_or(true, |b| b.is_empty()) {
            bits &= !HEADER_BIT;
        }
        if self.chunk.as_ref().map_or(true, |b| b.is_empty()) {
            bits &= !CHUNK_BIT;
        }
        if self.buffer.as_ref().map_or(true, |b| b.is_empty()) {
            bits &= !BUFFER_BIT;
        }
        if self.content.as_ref().map_or(true, |b| b.is_empty()) {
            bits &= !CONTENT_BIT;
        }
        bits
    }

    // Which slots hold bytes, over the candidates a generator step names.
    fn slot_bits(&self, include_buffer: bool, include_content: bool) -> u8 {
        let mut bits = 0;
        if self.header.as_ref().map_or(false, |b| !b.is_empty()) {
            bits |= HEADER_BIT;
        }
        if self.chunk.as_ref().map_or(false, |b| !b.is_empty()) {
            bits |= CHUNK_BIT;
        }
        if include_buffer && self.buffer.as_ref().map_or(false, |b| !b.is_empty()) {
            bits |= BUFFER_BIT;
        }
        if include_content && self.content.as_ref().map_or(false, |b| !b.is_empty()) {
            bits |= CONTENT_BIT;
        }
        bits
    }

    /// Synthesize and emit an error response.
    ///
    /// Rejected once the response is committed. With `close`, the response
    /// is also the connection's last.
    pub async fn send_error(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
        body: Option<Bytes>,
        close: bool,
    ) -> Result<()> {
        if self.generator.is_committed() {
            return Err(Error::new_response_committed());
        }
        debug!("sending error response {}", status);
        if close {
            self.generator.set_persistent(false);
        }
        self.channel.set_error_response(status, reason);
        if self.header.is_none() {
            self.header = Some(self.pool.header());
        }
        if self.buffer.is_none() {
            self.buffer = Some(self.pool.buffer());
        }
        self.generate(body, Action::Complete, false).await?;
        Ok(())
    }

    /// The input stream ended. Close outright if nothing is in flight;
    /// otherwise let the parser surface the truncation.
    pub(crate) fn on_input_shutdown(&mut self) -> bool {
        if self.parser.is_idle() && self.generator.is_idle() && !self.channel.is_suspended() {
            trace!("input shutdown while idle: closing");
            self.io.endpoint_mut().close();
            true
        } else {
            self.parser.set_persistent(false);
            false
        }
    }

    /// Keep-alive transition: both sides back to idle, every pooled buffer
    /// returned, per-exchange state cleared. A request buffer still holding
    /// pipelined input is kept.
    pub fn reset(&mut self) {
        trace!("reset for next exchange");
        self.parser.reset();
        self.generator.reset();
        if let Some(request) = self.request.take() {
            if request.is_empty() {
                self.pool.release(request);
            } else {
                self.request = Some(request);
            }
        }
        self.release_response_buffers();
        self.channel.reset();
    }

    /// Return every pooled buffer. Called on close and on fatal errors.
    pub(crate) fn release_buffers(&mut self) {
        if let Some(request) = self.request.take() {
            self.pool.release(request);
        }
        self.release_response_buffers();
    }

    fn release_response_buffers(&mut self) {
        if let Some(header) = self.header.take() {
            self.pool.release(header);
        }
        if let Some(chunk) = self.chunk.take() {
            self.pool.release(chunk);
        }
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
        self.content = None;
        self.pending = PendingFlush::None;
    }

    /// Tear the connection apart for a protocol switch.
    ///
    /// Unconsumed input is copied out so the pooled request buffer can be
    /// returned like any other.
    pub(crate) fn into_parts(mut self) -> (Selectable<C>, Bytes) {
        let leftover = match self.request.take() {
            Some(request) => {
                let bytes = Bytes::copy_from_slice(&request);
                self.pool.release(request);
                bytes
            }
            None => Bytes::new(),
        };
        self.release_buffers();
        (self.io, leftover)
    }

    /// The effective idle timeout, layered: a connector low on resources
    /// tightens connections still running its default idle value.
    pub fn max_idle_time(&self) -> Option<Duration> {
        let endpoint_idle = self.io.endpoint().idle_timeout();
        if self.connector.is_low_on_resources()
            && endpoint_idle == Some(self.connector.default_idle_timeout())
        {
            return Some(self.connector.low_resource_idle_timeout());
        }
        endpoint_idle.or(Some(self.connector.default_idle_timeout()))
    }

    /// Close propagation: buffers back to the pool, channel told.
    pub(crate) fn on_close(&mut self) {
        self.release_buffers();
        self.channel.on_close();
    }
}

impl<C> std::fmt::Debug for Conn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("parser", &self.parser)
            .field("generator", &self.generator)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Endpoint;
    use crate::mock::ScriptedChannel;

    fn conn(ch: ScriptedChannel) -> Conn<ScriptedChannel> {
        let connector = Arc::new(Connector::builder().build());
        let endpoint = Endpoint::new(ch, Some(connector.default_idle_timeout()));
        Conn::new(connector, Selectable::new(endpoint))
    }

    #[tokio::test]
    async fn flush_gathers_header_and_body_in_one_write() {
        let ch = ScriptedChannel::new();
        let mut c = conn(ch.clone());

        let mut header = c.pool.header();
        header.extend_from_slice(b"HDR");
        c.header = Some(header);
        let mut body = c.pool.buffer();
        body.extend_from_slice(b"BODY");
        c.buffer = Some(body);
        c.pending = PendingFlush::from_bits(c.slot_bits(true, false)).unwrap();
        assert_eq!(c.pending, PendingFlush::HeaderBuffer);

        c.flush(false).await.unwrap();
        assert_eq!(ch.written(), b"HDRBODY");
        assert_eq!(ch.num_writes(), 1, "one gather write for the pair");
        assert_eq!(c.pending, PendingFlush::None);
        c.release_buffers();
    }

    #[tokio::test]
    async fn nonblocking_flush_makes_a_single_pass() {
        let ch = ScriptedChannel::new();
        ch.set_write_budget(2);
        let mut c = conn(ch.clone());

        let mut header = c.pool.header();
        header.extend_from_slice(b"HDR");
        c.header = Some(header);
        c.pending = PendingFlush::from_bits(c.slot_bits(true, false)).unwrap();

        c.flush(false).await.unwrap();
        assert_eq!(ch.num_writes(), 1);
        assert_eq!(ch.written(), b"HD");
        assert_eq!(c.pending, PendingFlush::Header, "the rest stays pending");

        ch.allow_write(1024);
        c.flush(true).await.unwrap();
        assert_eq!(ch.written(), b"HDR");
        assert_eq!(c.pending, PendingFlush::None);
        c.release_buffers();
    }

    #[test]
    fn legal_flush_combinations() {
        for (bits, combo) in [
            (0, PendingFlush::None),
            (8, PendingFlush::Header),
            (4, PendingFlush::Chunk),
            (2, PendingFlush::Buffer),
            (1, PendingFlush::Content),
            (10, PendingFlush::HeaderBuffer),
            (9, PendingFlush::HeaderContent),
            (6, PendingFlush::ChunkBuffer),
            (5, PendingFlush::ChunkContent),
        ] {
            let parsed = PendingFlush::from_bits(bits).unwrap();
            assert_eq!(parsed, combo);
            assert_eq!(parsed.bits(), bits);
        }
    }

    #[test]
    fn illegal_flush_combinations_are_rejected() {
        for bits in [3u8, 7, 11, 12, 13, 14, 15] {
            let err = PendingFlush::from_bits(bits).unwrap_err();
            assert!(err.is_user(), "bits {} must be illegal", bits);
        }
    }
}
