//! Server-side scaffolding: configuration, the shared buffer pool, and the
//! per-connection event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::io::{ByteChannel, Driven, Endpoint, Interest, Selectable, Turn, WorkUnit};
use crate::pool::BufferPool;
use crate::proto::dispatch::Dispatcher;
use crate::service::Handler;
use crate::{Error, Result};

/// Configures a [`Connector`].
#[derive(Debug)]
pub struct Builder {
    header_buffer_size: usize,
    body_buffer_size: usize,
    idle_timeout: Duration,
    low_resource_idle_timeout: Duration,
}

impl Builder {
    /// Default configuration: 4 KiB header buffers, 16 KiB body buffers,
    /// 30 s idle, 5 s idle under low resources.
    pub fn new() -> Builder {
        Builder {
            header_buffer_size: 4 * 1024,
            body_buffer_size: 16 * 1024,
            idle_timeout: Duration::from_secs(30),
            low_resource_idle_timeout: Duration::from_secs(5),
        }
    }

    /// Capacity of pooled header buffers.
    pub fn header_buffer_size(mut self, size: usize) -> Builder {
        self.header_buffer_size = size;
        self
    }

    /// Capacity of pooled body buffers.
    pub fn body_buffer_size(mut self, size: usize) -> Builder {
        self.body_buffer_size = size;
        self
    }

    /// Default idle timeout given to new endpoints.
    pub fn idle_timeout(mut self, idle: Duration) -> Builder {
        self.idle_timeout = idle;
        self
    }

    /// Idle timeout applied while the connector is low on resources.
    pub fn low_resource_idle_timeout(mut self, idle: Duration) -> Builder {
        self.low_resource_idle_timeout = idle;
        self
    }

    /// Build the connector.
    pub fn build(self) -> Connector {
        Connector {
            pool: Arc::new(BufferPool::new(
                self.header_buffer_size,
                self.body_buffer_size,
            )),
            default_idle: self.idle_timeout,
            low_resource_idle: self.low_resource_idle_timeout,
            low_resources: AtomicBool::new(false),
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Shared state behind every connection: the buffer pool, idle-timeout
/// defaults, and the low-resource flag.
#[derive(Debug)]
pub struct Connector {
    pool: Arc<BufferPool>,
    default_idle: Duration,
    low_resource_idle: Duration,
    low_resources: AtomicBool,
}

impl Connector {
    /// Start configuring a connector.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The shared buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The idle timeout given to new endpoints.
    pub fn default_idle_timeout(&self) -> Duration {
        self.default_idle
    }

    /// The tightened idle timeout used while low on resources.
    pub fn low_resource_idle_timeout(&self) -> Duration {
        self.low_resource_idle
    }

    /// Flag the connector as low on resources; idle connections still on
    /// the default timeout are expired sooner.
    pub fn set_low_on_resources(&self, low: bool) {
        self.low_resources.store(low, Ordering::Release);
    }

    /// Whether the connector is low on resources.
    pub fn is_low_on_resources(&self) -> bool {
        self.low_resources.load(Ordering::Acquire)
    }
}

/// Serve HTTP/1.x on one byte channel until the connection closes.
///
/// The per-connection event loop: wait for readiness bounded by the
/// connection's idle timeout, translate events through
/// `on_readable`/`on_writeable`, run the returned work unit, and rebind the
/// driven connection when a protocol switch hands it off.
pub async fn serve_connection<C, H>(
    connector: Arc<Connector>,
    channel: C,
    handler: H,
) -> Result<()>
where
    C: ByteChannel + Send + Sync + 'static,
    H: Handler<C> + Send + 'static,
{
    let endpoint = Endpoint::new(channel, Some(connector.default_idle_timeout()));
    let io = Selectable::new(endpoint);
    io.set_read_interested(true);
    let conn: Box<dyn Driven<C>> = Box::new(Dispatcher::new(connector, io, handler));
    drive(conn).await
}

async fn drive<C: ByteChannel + 'static>(mut conn: Box<dyn Driven<C>>) -> Result<()> {
    loop {
        if !conn.io().endpoint().is_open() {
            conn.on_close();
            return Ok(());
        }
        let interest = conn.io().interest().unwrap_or(Interest::READABLE);
        let readiness = if conn.io().check_idle() {
            match conn.max_idle_time() {
                Some(idle) if !idle.is_zero() => {
                    match tokio::time::timeout(idle, conn.io().endpoint().ready(interest)).await
                    {
                        Ok(ready) => ready,
                        Err(_) => {
                            conn.io_mut().on_idle_expired(idle);
                            continue;
                        }
                    }
                }
                _ => conn.io().endpoint().ready(interest).await,
            }
        } else {
            conn.io().endpoint().ready(interest).await
        };
        let ready = match readiness {
            Ok(ready) => ready,
            Err(e) => {
                conn.on_close();
                return Err(Error::new_io(e));
            }
        };
        trace!("connection ready: {:?}", ready);

        let mut switch = None;
        if ready.is_readable() || ready.is_read_closed() {
            if let Some(WorkUnit::Read) = conn.io().on_readable() {
                conn.io().set_read_interested(false);
                match conn.do_read().await {
                    Ok(Turn::Continue) | Ok(Turn::Suspended) => {}
                    Ok(Turn::Closed) => {
                        conn.on_close();
                        return Ok(());
                    }
                    Ok(Turn::Switch(next)) => switch = Some(next),
                    Err(e) => {
                        conn.on_close();
                        return Err(e);
                    }
                }
            }
        }
        if switch.is_none() && (ready.is_writable() || ready.is_write_closed()) {
            if let Some(WorkUnit::Write) = conn.io().on_writeable() {
                conn.io().set_write_interested(false);
                if let Err(e) = conn.do_write().await {
                    conn.on_close();
                    return Err(e);
                }
            }
        }
        if let Some(next) = switch {
            debug!("rebinding connection after protocol switch");
            let (io, read_buf) = conn.into_parts();
            conn = next.build(io, read_buf);
            conn.io().set_read_interested(true);
        }
    }
}

/// Accepts connections and serves each with a clone of the handler.
#[derive(Debug)]
pub struct Server {
    connector: Arc<Connector>,
}

impl Server {
    /// A server over the given connector.
    pub fn new(connector: Connector) -> Server {
        Server {
            connector: Arc::new(connector),
        }
    }

    /// The connector shared by every served connection.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Accept loop: one spawned connection task per accepted stream.
    pub async fn serve<H>(&self, listener: TcpListener, handler: H) -> Result<()>
    where
        H: Handler<TcpStream> + Clone + Send + 'static,
    {
        loop {
            let (stream, peer) = listener.accept().await.map_err(Error::new_io)?;
            trace!("accepted {}", peer);
            let connector = self.connector.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(connector, stream, handler).await {
                    debug!("connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}
