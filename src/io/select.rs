//! Readiness coordination between a selectable endpoint and its connection.
//!
//! The async runtime's reactor is the selector. [`Selectable`] keeps the
//! interest bits, translates readiness events into work units via
//! [`Selectable::on_readable`]/[`Selectable::on_writeable`], and offers
//! [`Selectable::block_readable`]/[`Selectable::block_writeable`] so a
//! handler can make blocking-style progress without the connection giving
//! up its event-driven integration. At most one caller may be parked per
//! direction; a second one is a programmer error.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{ByteChannel, Endpoint, Interest};

/// A boxed future returned by [`Driven`] work-unit methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of work handed back to the event loop by a readiness callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnit {
    /// Run the connection's read side (`do_read`).
    Read,
    /// Run the connection's write side (`do_write`).
    Write,
}

/// The outcome of running a connection work unit.
pub enum Turn<C> {
    /// The connection consumed what it could and re-registered interest.
    Continue,
    /// The request was suspended; the continuation owns idleness now.
    Suspended,
    /// The connection is being replaced by a new protocol driver.
    Switch(Box<dyn SwitchProtocol<C>>),
    /// The connection is done; the endpoint is closed.
    Closed,
}

impl<C> std::fmt::Debug for Turn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Turn::Continue => f.write_str("Continue"),
            Turn::Suspended => f.write_str("Suspended"),
            Turn::Switch(_) => f.write_str("Switch(..)"),
            Turn::Closed => f.write_str("Closed"),
        }
    }
}

/// Builds the replacement connection after a `101 Switching Protocols`
/// round trip, taking over the endpoint and any bytes already read past the
/// upgrade request.
pub trait SwitchProtocol<C>: Send {
    /// Consume the factory, producing the new protocol driver.
    fn build(self: Box<Self>, io: Selectable<C>, read_buf: Bytes) -> Box<dyn Driven<C>>;
}

/// A connection that can be driven by readiness events.
///
/// Concrete connections override `do_read`/`do_write`; the defaults reject
/// the dispatch, since a connection that never registered interest in a
/// direction must not receive work for it.
pub trait Driven<C>: Send {
    /// The selectable endpoint this connection drives.
    fn io(&self) -> &Selectable<C>;

    /// Mutable access to the selectable endpoint.
    fn io_mut(&mut self) -> &mut Selectable<C>;

    /// Tear the connection apart for a protocol switch, yielding the
    /// endpoint and any unconsumed input bytes.
    fn into_parts(self: Box<Self>) -> (Selectable<C>, Bytes);

    /// The effective idle timeout for this connection.
    fn max_idle_time(&self) -> Option<Duration> {
        self.io().max_idle_time()
    }

    /// Run the read side after a readable event.
    fn do_read(&mut self) -> BoxFuture<'_, crate::Result<Turn<C>>> {
        Box::pin(async { Err(crate::Error::new_dispatch("read")) })
    }

    /// Run the write side after a writable event.
    fn do_write(&mut self) -> BoxFuture<'_, crate::Result<Turn<C>>> {
        Box::pin(async { Err(crate::Error::new_dispatch("write")) })
    }

    /// The connection is going away.
    fn on_close(&mut self) {}
}

#[derive(Debug, Default)]
struct Blocked {
    read: bool,
    write: bool,
}

/// A selectable endpoint: an [`Endpoint`] plus readiness interest bits,
/// blocking helpers, and the idle-expiry policy.
pub struct Selectable<C> {
    endpoint: Endpoint<C>,
    blocked: Mutex<Blocked>,
    readable: Notify,
    writeable: Notify,
    read_interested: AtomicBool,
    write_interested: AtomicBool,
    check_idle: AtomicBool,
    max_idle: Option<Duration>,
    created: Instant,
}

impl<C> Selectable<C> {
    /// Wrap an endpoint.
    pub fn new(endpoint: Endpoint<C>) -> Selectable<C> {
        Selectable {
            endpoint,
            blocked: Mutex::new(Blocked::default()),
            readable: Notify::new(),
            writeable: Notify::new(),
            read_interested: AtomicBool::new(false),
            write_interested: AtomicBool::new(false),
            check_idle: AtomicBool::new(true),
            max_idle: None,
            created: Instant::now(),
        }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint<C> {
        &self.endpoint
    }

    /// Mutable access to the underlying endpoint.
    pub fn endpoint_mut(&mut self) -> &mut Endpoint<C> {
        &mut self.endpoint
    }

    /// Called by the event loop when the endpoint reports read-ready.
    ///
    /// If a caller is parked in `block_readable`, it is signalled and will
    /// drain the event itself; otherwise the event loop receives a read
    /// work unit to dispatch.
    pub fn on_readable(&self) -> Option<WorkUnit> {
        let blocked = self.blocked.lock().unwrap();
        if blocked.read {
            trace!("on_readable: waking blocked reader");
            self.readable.notify_one();
            None
        } else {
            Some(WorkUnit::Read)
        }
    }

    /// Called by the event loop when the endpoint reports write-ready.
    pub fn on_writeable(&self) -> Option<WorkUnit> {
        let blocked = self.blocked.lock().unwrap();
        if blocked.write {
            trace!("on_writeable: waking blocked writer");
            self.writeable.notify_one();
            None
        } else {
            Some(WorkUnit::Write)
        }
    }

    /// Register or clear read interest.
    pub fn set_read_interested(&self, interested: bool) {
        self.read_interested.store(interested, Ordering::Release);
    }

    /// Register or clear write interest.
    pub fn set_write_interested(&self, interested: bool) {
        self.write_interested.store(interested, Ordering::Release);
    }

    /// Whether read interest is registered.
    pub fn is_read_interested(&self) -> bool {
        self.read_interested.load(Ordering::Acquire)
    }

    /// Whether write interest is registered.
    pub fn is_write_interested(&self) -> bool {
        self.write_interested.load(Ordering::Acquire)
    }

    /// The current interest set, if any direction is registered.
    pub fn interest(&self) -> Option<Interest> {
        match (self.is_read_interested(), self.is_write_interested()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Enable or disable idle expiry for this connection.
    pub fn set_check_idle(&self, check: bool) {
        self.check_idle.store(check, Ordering::Release);
    }

    /// Whether idle expiry is currently enabled.
    pub fn check_idle(&self) -> bool {
        self.check_idle.load(Ordering::Acquire)
    }

    /// The effective idle timeout: the connection-local override when set,
    /// else the endpoint's.
    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle.or_else(|| self.endpoint.idle_timeout())
    }

    /// Override the idle timeout for this connection; `None` inherits the
    /// endpoint's.
    pub fn set_max_idle_time(&mut self, max_idle: Option<Duration>) {
        self.max_idle = max_idle;
    }
}

impl<C: ByteChannel> Selectable<C> {
    /// Park the caller until the endpoint is read-ready or the idle timeout
    /// elapses. Returns `true` if woken by readiness, `false` on timeout.
    ///
    /// At most one caller may block per direction; a second concurrent call
    /// fails.
    pub async fn block_readable(&self) -> crate::Result<bool> {
        {
            let mut blocked = self.blocked.lock().unwrap();
            if blocked.read {
                return Err(crate::Error::new_blocked("read"));
            }
            blocked.read = true;
        }
        self.set_read_interested(true);
        let woken = self.await_signal(&self.readable, Interest::READABLE).await;
        self.blocked.lock().unwrap().read = false;
        if !woken {
            trace!("block_readable timed out");
            self.set_read_interested(false);
        }
        Ok(woken)
    }

    /// Park the caller until the endpoint is write-ready or the idle
    /// timeout elapses. Returns `true` if woken by readiness, `false` on
    /// timeout.
    pub async fn block_writeable(&self) -> crate::Result<bool> {
        {
            let mut blocked = self.blocked.lock().unwrap();
            if blocked.write {
                return Err(crate::Error::new_blocked("write"));
            }
            blocked.write = true;
        }
        self.set_write_interested(true);
        let woken = self.await_signal(&self.writeable, Interest::WRITABLE).await;
        self.blocked.lock().unwrap().write = false;
        if !woken {
            trace!("block_writeable timed out");
            self.set_write_interested(false);
        }
        Ok(woken)
    }

    // A blocker wakes on whichever comes first: an explicit signal from the
    // event loop, or the reactor reporting the channel ready. The latter
    // covers connections whose work units run inline on the driving task.
    async fn await_signal(&self, signal: &Notify, interest: Interest) -> bool {
        let wait = async {
            tokio::select! {
                _ = signal.notified() => {}
                _ = self.endpoint.ready(interest) => {}
            }
        };
        match self.max_idle_time() {
            Some(idle) if !idle.is_zero() => {
                tokio::time::timeout(idle, wait).await.is_ok()
            }
            _ => {
                wait.await;
                true
            }
        }
    }

    /// The idle-expiry policy: a connection quiet for its whole idle window
    /// is half-closed so the peer sees an orderly end; if either side was
    /// already shut, the endpoint is closed outright.
    pub fn on_idle_expired(&mut self, idle_for: Duration) {
        debug!(
            "idle expired after {:?} (connection open {:?})",
            idle_for,
            self.created.elapsed()
        );
        if self.endpoint.is_input_shutdown() || self.endpoint.is_output_shutdown() {
            self.endpoint.close();
        } else {
            self.endpoint.shutdown_output();
        }
    }
}

impl<C> std::fmt::Debug for Selectable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selectable")
            .field("read_interested", &self.read_interested)
            .field("write_interested", &self.write_interested)
            .field("check_idle", &self.check_idle)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
