//! The byte-stream endpoint.
//!
//! An [`Endpoint`] owns a duplex, non-blocking [`ByteChannel`] and layers the
//! half-shut state machine on top of it: after `shutdown_input`, `fill`
//! reports end-of-stream without touching the channel; after
//! `shutdown_output`, `flush` fails; when both sides are shut, the channel is
//! closed. `fill` and `flush` never block, so they may be driven directly
//! from a readiness event.

use std::future::Future;
use std::io::{self, IoSlice};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

pub use tokio::io::{Interest, Ready};

pub use self::select::{BoxFuture, Driven, Selectable, SwitchProtocol, Turn, WorkUnit};

mod select;
mod tcp;

/// Spare tail capacity ensured before asking the channel for bytes.
const FILL_RESERVE: usize = 4096;

/// A non-blocking duplex byte channel that reports readiness.
///
/// This is the seam between the engine and the transport: implemented for
/// `tokio::net::TcpStream`, and by scripted channels in tests. Reads and
/// writes must never block; `Err(WouldBlock)` means "no progress right now"
/// and `ready` is how a caller waits for the next opportunity.
pub trait ByteChannel {
    /// Read bytes into the tail of `buf`.
    ///
    /// `Ok(0)` means the peer shut its write side (end-of-stream).
    fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write from the given buffers, gathering if the channel supports it.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Whether `write_vectored` writes more than the first buffer.
    fn is_write_vectored(&self) -> bool;

    /// Wait until the channel is ready for any of `interest`.
    fn ready(
        &self,
        interest: Interest,
    ) -> impl Future<Output = io::Result<Ready>> + Send;

    /// Shut down one or both directions of the channel.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// The local address, if the channel has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// The peer address, if the channel has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The result of an [`Endpoint::fill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes were appended to the buffer tail.
    Data(usize),
    /// The channel had no bytes available; wait for readiness.
    Empty,
    /// The stream ended; the input side is now shut.
    Eof,
}

/// A byte-stream endpoint with half-shut semantics and addressability.
pub struct Endpoint<C> {
    channel: C,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    idle_timeout: Option<Duration>,
    open: bool,
    ishut: bool,
    oshut: bool,
}

impl<C: ByteChannel> Endpoint<C> {
    /// Wrap an open channel.
    pub fn new(channel: C, idle_timeout: Option<Duration>) -> Endpoint<C> {
        let local_addr = channel.local_addr();
        let peer_addr = channel.peer_addr();
        Endpoint {
            channel,
            local_addr,
            peer_addr,
            idle_timeout,
            open: true,
            ishut: false,
            oshut: false,
        }
    }

    /// Read available bytes into the tail of `buf` without blocking.
    ///
    /// A read failure is swallowed into `Eof`: the stream is treated as
    /// ended and the input side is shut.
    pub fn fill(&mut self, buf: &mut BytesMut) -> Fill {
        if self.ishut || !self.open {
            return Fill::Eof;
        }
        if buf.capacity() - buf.len() < FILL_RESERVE {
            buf.reserve(FILL_RESERVE);
        }
        match self.channel.read_into(buf) {
            Ok(0) => {
                trace!("fill: eof");
                self.shutdown_input();
                Fill::Eof
            }
            Ok(n) => {
                trace!("filled {} bytes", n);
                Fill::Data(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Fill::Empty,
            Err(e) => {
                debug!("fill failed, treating as eof: {}", e);
                self.shutdown_input();
                Fill::Eof
            }
        }
    }

    /// Write as many bytes as possible from `bufs` in one pass.
    ///
    /// Issues a single plain write for one buffer, a single gather write
    /// when the channel supports it, and otherwise walks the buffers in
    /// order, stopping at the first partial write. Never blocks; a
    /// would-block condition yields the bytes written so far.
    pub fn flush(&mut self, bufs: &[IoSlice<'_>]) -> crate::Result<usize> {
        if self.oshut || !self.open {
            return Err(crate::Error::new_closed());
        }
        if bufs.is_empty() {
            return Ok(0);
        }
        if bufs.len() == 1 || self.channel.is_write_vectored() {
            return match self.channel.write_vectored(bufs) {
                Ok(n) => {
                    trace!("flushed {} bytes", n);
                    Ok(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(crate::Error::new_io(e)),
            };
        }
        // No gather support: one write per buffer, in order.
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            match self.channel.write_vectored(std::slice::from_ref(buf)) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(crate::Error::new_io(e)),
            }
        }
        trace!("flushed {} bytes across {} buffers", total, bufs.len());
        Ok(total)
    }

    /// Shut the input side. Idempotent; closes the channel if the output
    /// side is already shut.
    pub fn shutdown_input(&mut self) {
        if self.ishut || !self.open {
            return;
        }
        self.ishut = true;
        if let Err(e) = self.channel.shutdown(Shutdown::Read) {
            debug!("input shutdown: {}", e);
        }
        if self.oshut {
            self.close();
        }
    }

    /// Shut the output side. Idempotent; closes the channel if the input
    /// side is already shut.
    pub fn shutdown_output(&mut self) {
        if self.oshut || !self.open {
            return;
        }
        trace!("shutdown output");
        self.oshut = true;
        if let Err(e) = self.channel.shutdown(Shutdown::Write) {
            debug!("output shutdown: {}", e);
        }
        if self.ishut {
            self.close();
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        trace!("close");
        self.open = false;
        if let Err(e) = self.channel.shutdown(Shutdown::Both) {
            debug!("close: {}", e);
        }
    }

    /// Wait for channel readiness.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        self.channel.ready(interest).await
    }
}

impl<C> Endpoint<C> {
    /// Whether the channel is still open. Tracks the channel's state, not
    /// the half-shut flags.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether the input side is shut, explicitly or via close.
    pub fn is_input_shutdown(&self) -> bool {
        self.ishut || !self.open
    }

    /// Whether the output side is shut, explicitly or via close.
    pub fn is_output_shutdown(&self) -> bool {
        self.oshut || !self.open
    }

    /// The local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The peer address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The endpoint idle timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Store a new idle timeout.
    ///
    /// Consulted the next time a caller waits; an in-progress wait is not
    /// interrupted.
    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
        self.idle_timeout = idle_timeout;
    }
}

impl<C> std::fmt::Debug for Endpoint<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("open", &self.open)
            .field("ishut", &self.ishut)
            .field("oshut", &self.oshut)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedChannel;

    #[test]
    fn fill_reports_data_empty_eof() {
        let ch = ScriptedChannel::new();
        ch.push_data(b"hello");
        let mut ep = Endpoint::new(ch.clone(), None);
        let mut buf = BytesMut::new();

        assert_eq!(ep.fill(&mut buf), Fill::Data(5));
        assert_eq!(&buf[..], b"hello");
        assert_eq!(ep.fill(&mut buf), Fill::Empty);

        ch.push_eof();
        assert_eq!(ep.fill(&mut buf), Fill::Eof);
        assert!(ep.is_input_shutdown());
        assert!(ch.is_read_shutdown());
        // input is shut: the channel is no longer consulted
        ch.push_data(b"late");
        assert_eq!(ep.fill(&mut buf), Fill::Eof);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn fill_swallows_read_errors() {
        let ch = ScriptedChannel::new();
        ch.push_error(io::ErrorKind::ConnectionReset);
        let mut ep = Endpoint::new(ch, None);
        let mut buf = BytesMut::new();

        assert_eq!(ep.fill(&mut buf), Fill::Eof);
        assert!(ep.is_input_shutdown());
        assert!(ep.is_open());
    }

    #[test]
    fn flush_gathers_in_one_write() {
        let ch = ScriptedChannel::new();
        let mut ep = Endpoint::new(ch.clone(), None);

        let n = ep
            .flush(&[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(ch.written(), b"hello world");
        assert_eq!(ch.num_writes(), 1);
    }

    #[test]
    fn flush_loops_without_gather_support() {
        let ch = ScriptedChannel::new();
        ch.set_vectored(false);
        let mut ep = Endpoint::new(ch.clone(), None);

        let n = ep
            .flush(&[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(ch.written(), b"hello world");
        assert_eq!(ch.num_writes(), 2);
    }

    #[test]
    fn flush_stops_at_partial_write() {
        let ch = ScriptedChannel::new();
        ch.set_vectored(false);
        ch.set_write_budget(4);
        let mut ep = Endpoint::new(ch.clone(), None);

        let n = ep
            .flush(&[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(ch.written(), b"hell");
    }

    #[test]
    fn flush_after_output_shutdown_fails() {
        let ch = ScriptedChannel::new();
        let mut ep = Endpoint::new(ch, None);
        ep.shutdown_output();
        let err = ep.flush(&[IoSlice::new(b"x")]).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn half_shut_is_idempotent_and_both_sides_close() {
        let ch = ScriptedChannel::new();
        let mut ep = Endpoint::new(ch.clone(), None);

        ep.shutdown_input();
        let once = (ep.is_input_shutdown(), ep.is_output_shutdown(), ep.is_open());
        ep.shutdown_input();
        assert_eq!(
            once,
            (ep.is_input_shutdown(), ep.is_output_shutdown(), ep.is_open())
        );
        assert!(ep.is_open());

        ep.shutdown_output();
        assert!(!ep.is_open(), "both sides shut closes the channel");
        assert!(ep.is_input_shutdown());
        assert!(ep.is_output_shutdown());
    }

    #[test]
    fn close_is_idempotent() {
        let ch = ScriptedChannel::new();
        let mut ep = Endpoint::new(ch, None);
        ep.close();
        ep.close();
        assert!(!ep.is_open());
        assert!(ep.is_input_shutdown());
        assert!(ep.is_output_shutdown());
    }
}
