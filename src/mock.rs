//! A scripted byte channel for tests.
//!
//! Reads are queued ahead of time (data, EOF, errors); writes draw from a
//! budget so backpressure can be scripted; every accepted write is captured
//! for wire-level assertions. The channel is a shared handle, so a test can
//! hold a clone and feed it while a connection is being driven on another
//! task.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::Shutdown;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{Interest, Ready};
use tokio::sync::Notify;

use crate::io::ByteChannel;

#[derive(Debug)]
enum ReadOp {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

#[derive(Debug)]
struct Inner {
    reads: VecDeque<ReadOp>,
    eof: bool,
    wrote: Vec<u8>,
    write_calls: Vec<usize>,
    write_budget: usize,
    vectored: bool,
    shutdown_read: bool,
    shutdown_write: bool,
}

/// A scripted in-memory [`ByteChannel`]. Cloning yields a handle to the
/// same channel.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedChannel {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> ScriptedChannel {
        ScriptedChannel {
            inner: Arc::new(Mutex::new(Inner {
                reads: VecDeque::new(),
                eof: false,
                wrote: Vec::new(),
                write_calls: Vec::new(),
                write_budget: usize::MAX,
                vectored: true,
                shutdown_read: false,
                shutdown_write: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn push_data(&self, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .reads
            .push_back(ReadOp::Data(data.to_vec()));
        self.notify.notify_waiters();
    }

    pub(crate) fn push_eof(&self) {
        self.inner.lock().unwrap().reads.push_back(ReadOp::Eof);
        self.notify.notify_waiters();
    }

    pub(crate) fn push_error(&self, kind: io::ErrorKind) {
        self.inner
            .lock()
            .unwrap()
            .reads
            .push_back(ReadOp::Error(kind));
        self.notify.notify_waiters();
    }

    /// Cap how many bytes writes may accept before reporting would-block.
    pub(crate) fn set_write_budget(&self, budget: usize) {
        self.inner.lock().unwrap().write_budget = budget;
        self.notify.notify_waiters();
    }

    /// Grow the write budget, waking a blocked writer.
    pub(crate) fn allow_write(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_budget = inner.write_budget.saturating_add(bytes);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Whether writes gather across buffers.
    pub(crate) fn set_vectored(&self, vectored: bool) {
        self.inner.lock().unwrap().vectored = vectored;
    }

    /// Everything written so far.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().wrote.clone()
    }

    /// How many write calls accepted bytes.
    pub(crate) fn num_writes(&self) -> usize {
        self.inner.lock().unwrap().write_calls.len()
    }

    pub(crate) fn is_read_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown_read
    }

    pub(crate) fn is_write_shutdown(&self) -> bool {
        self.inner.lock().unwrap().shutdown_write
    }
}

impl ByteChannel for ScriptedChannel {
    fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.eof {
            return Ok(0);
        }
        match inner.reads.pop_front() {
            Some(ReadOp::Data(data)) => {
                buf.extend_from_slice(&data);
                Ok(data.len())
            }
            Some(ReadOp::Eof) => {
                inner.eof = true;
                Ok(0)
            }
            Some(ReadOp::Error(kind)) => Err(kind.into()),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown_write {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if inner.write_budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let gather = inner.vectored;
        let mut accepted = 0;
        for buf in bufs {
            let budget = inner.write_budget - accepted;
            let take = std::cmp::min(buf.len(), budget);
            let slice = &buf[..take];
            inner.wrote.extend_from_slice(slice);
            accepted += take;
            if take < buf.len() || !gather {
                break;
            }
        }
        if inner.write_budget != usize::MAX {
            inner.write_budget -= accepted;
        }
        inner.write_calls.push(accepted);
        Ok(accepted)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.lock().unwrap().vectored
    }

    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a concurrent script update
            // cannot slip between the check and the await
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().unwrap();
                let mut ready = Ready::EMPTY;
                if interest.is_readable() && (!inner.reads.is_empty() || inner.eof) {
                    ready |= Ready::READABLE;
                }
                if interest.is_writable() && inner.write_budget > 0 {
                    ready |= Ready::WRITABLE;
                }
                if ready != Ready::EMPTY {
                    return Ok(ready);
                }
            }
            notified.await;
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match how {
            Shutdown::Read => inner.shutdown_read = true,
            Shutdown::Write => inner.shutdown_write = true,
            Shutdown::Both => {
                inner.shutdown_read = true;
                inner.shutdown_write = true;
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }
}
