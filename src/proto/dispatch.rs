//! The protocol driver: the parse loop and handler dispatch.
//!
//! [`Dispatcher`] owns a [`Conn`] and a [`Handler`]. Readiness events reach
//! it as `do_read`/`do_write` work units; `do_read` drives
//! [`Dispatcher::process_input`], a progress-based loop that fills the
//! request buffer, feeds the parser, and dispatches completed messages,
//! until no further progress can be made, the request suspends, or the
//! connection is replaced by another protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use tracing::{debug, trace};

use super::conn::Conn;
use super::encode::Action;
use super::parse::Parsed;
use crate::io::{BoxFuture, ByteChannel, Driven, Fill, Selectable, SwitchProtocol, Turn};
use crate::server::Connector;
use crate::service::Handler;
use crate::{Error, Result};

/// A request head larger than this is rejected rather than buffered
/// further.
const DEFAULT_MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;

tokio::task_local! {
    static CURRENT: ConnectionInfo;
}

/// What the driving connection looks like, visible to handler code via
/// [`current`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The endpoint's local address.
    pub local_addr: Option<SocketAddr>,
    /// The endpoint's peer address.
    pub peer_addr: Option<SocketAddr>,
}

/// The connection currently dispatching on this task, if any.
///
/// Set on entry to `process_input` and cleared on exit; only code reachable
/// from the dispatched handler sees a value.
pub fn current() -> Option<ConnectionInfo> {
    CURRENT.try_with(|info| info.clone()).ok()
}

/// Drives HTTP/1.x exchanges over a selectable endpoint.
pub struct Dispatcher<C, H> {
    conn: Conn<C>,
    handler: H,
}

impl<C, H> Dispatcher<C, H>
where
    C: ByteChannel + Send + Sync,
    H: Handler<C> + Send,
{
    /// Bind a handler to a selectable endpoint.
    pub fn new(connector: Arc<Connector>, io: Selectable<C>, handler: H) -> Dispatcher<C, H> {
        Dispatcher {
            conn: Conn::new(connector, io),
            handler,
        }
    }

    /// The connection state.
    pub fn conn(&self) -> &Conn<C> {
        &self.conn
    }

    /// Mutable access to the connection state.
    pub fn conn_mut(&mut self) -> &mut Conn<C> {
        &mut self.conn
    }

    /// Drive the parse loop until the buffered and readable input is
    /// exhausted, the request suspends, or the connection is replaced.
    ///
    /// Idle expiry is disabled while a dispatch may be in flight and
    /// re-enabled on exit, unless the request is suspended; from then on
    /// the async continuation owns idleness.
    pub async fn process_input(&mut self) -> Result<Turn<C>> {
        self.conn.io().set_check_idle(false);
        let info = ConnectionInfo {
            local_addr: self.conn.io().endpoint().local_addr(),
            peer_addr: self.conn.io().endpoint().peer_addr(),
        };
        let turn = CURRENT.scope(info, self.parse_loop()).await;
        if !matches!(turn, Ok(Turn::Suspended)) {
            self.conn.io().set_check_idle(true);
        }
        turn
    }

    async fn parse_loop(&mut self) -> Result<Turn<C>> {
        loop {
            // request buffer, lazily: a header-sized buffer between
            // messages, a body-sized one while mid-content
            let mut buf = match self.conn.request.take() {
                Some(buf) => buf,
                None if self.conn.parser.is_in_content() => self.conn.pool.buffer(),
                None => self.conn.pool.header(),
            };

            let parsed = self.conn.parser.parse_next(&mut buf);
            match parsed {
                Ok(Parsed::NeedMore) => {
                    if !self.conn.parser.is_in_content() && buf.len() >= DEFAULT_MAX_HEAD_SIZE {
                        self.conn.request = Some(buf);
                        return self.fail_exchange(Error::new_too_large()).await;
                    }
                    match self.conn.io.endpoint_mut().fill(&mut buf) {
                        Fill::Data(_) => {
                            self.conn.request = Some(buf);
                        }
                        Fill::Empty => {
                            if buf.is_empty() {
                                self.conn.pool.release(buf);
                            } else {
                                self.conn.request = Some(buf);
                            }
                            self.conn.io.set_read_interested(true);
                            return Ok(Turn::Continue);
                        }
                        Fill::Eof => {
                            if buf.is_empty() {
                                self.conn.pool.release(buf);
                            } else {
                                self.conn.request = Some(buf);
                            }
                            self.conn.parser.note_eof();
                            if self.conn.on_input_shutdown() {
                                self.conn.release_buffers();
                                return Ok(Turn::Closed);
                            }
                            // the truncation surfaces on the next parse
                            self.conn.io.set_read_interested(true);
                            return Ok(Turn::Continue);
                        }
                    }
                }
                Ok(Parsed::Request(head)) => {
                    trace!("{} {}", head.method, head.uri);
                    self.conn.request = Some(buf);
                    self.conn.channel.on_request(head);
                    if !self.conn.parser.is_persistent() {
                        // the response must agree that this exchange is the last
                        self.conn.generator.set_persistent(false);
                    }
                }
                Ok(Parsed::Content(content)) => {
                    self.conn.request = Some(buf);
                    self.conn.channel.on_content(content);
                }
                Ok(Parsed::Complete) => {
                    self.conn.request = Some(buf);
                    if let Some(turn) = self.dispatch().await? {
                        return Ok(turn);
                    }
                }
                Err(err) => {
                    self.conn.request = Some(buf);
                    return self.fail_exchange(err).await;
                }
            }
        }
    }

    // Dispatch the completed message. `None` means keep parsing (the
    // exchange finished and the connection was reset for the next one).
    async fn dispatch(&mut self) -> Result<Option<Turn<C>>> {
        let request = match self.conn.channel.take_request() {
            Some(request) => request,
            None => return Err(Error::new_dispatch("a message without a head")),
        };
        let result = {
            let this = &mut *self;
            let responder = Responder {
                conn: &mut this.conn,
            };
            this.handler.handle(request, responder).await
        };
        match result {
            Ok(()) => {
                if !self.conn.channel.is_suspended() && !self.conn.generator.is_ended() {
                    // the handler returned without finishing the response
                    self.conn.generate(None, Action::Complete, false).await?;
                }
            }
            Err(err) => {
                debug!("handler failed: {}", err);
                if self.conn.generator.is_committed() {
                    self.conn.release_buffers();
                    self.conn.io.endpoint_mut().close();
                    return Err(err);
                }
                if let Err(e2) = self
                    .conn
                    .send_error(StatusCode::INTERNAL_SERVER_ERROR, None, None, true)
                    .await
                {
                    debug!("error response failed: {}", e2);
                    self.conn.release_buffers();
                    self.conn.io.endpoint_mut().close();
                    return Err(err);
                }
            }
        }

        if self.conn.channel.is_suspended() {
            return Ok(Some(Turn::Suspended));
        }
        if self.conn.parser.is_complete() && self.conn.generator.is_ended() {
            if self.conn.channel.status() == StatusCode::SWITCHING_PROTOCOLS {
                if let Some(switch) = self.conn.channel.take_switch() {
                    debug!("switching protocols");
                    self.conn.reset();
                    return Ok(Some(Turn::Switch(switch)));
                }
            }
            if !self.conn.generator.is_persistent() || !self.conn.parser.is_persistent() {
                trace!("exchange complete, connection not persistent");
                self.conn.release_buffers();
                self.conn.io.endpoint_mut().close();
                return Ok(Some(Turn::Closed));
            }
            self.conn.reset();
        }
        Ok(None)
    }

    // A protocol failure: one final error response if the response is not
    // yet committed, then the connection is done.
    async fn fail_exchange(&mut self, err: Error) -> Result<Turn<C>> {
        match err.parse_status() {
            Some(status) if !self.conn.generator.is_committed() => {
                if let Err(e2) = self.conn.send_error(status, None, None, true).await {
                    debug!("error response failed: {}", e2);
                }
                self.conn.parser.close();
                self.conn.release_buffers();
                self.conn.io.endpoint_mut().close();
                Ok(Turn::Closed)
            }
            _ => {
                debug!("connection failed: {}", err);
                self.conn.release_buffers();
                self.conn.io.endpoint_mut().close();
                Err(err)
            }
        }
    }
}

impl<C, H> Driven<C> for Dispatcher<C, H>
where
    C: ByteChannel + Send + Sync,
    H: Handler<C> + Send,
{
    fn io(&self) -> &Selectable<C> {
        self.conn.io()
    }

    fn io_mut(&mut self) -> &mut Selectable<C> {
        self.conn.io_mut()
    }

    fn into_parts(self: Box<Self>) -> (Selectable<C>, Bytes) {
        self.conn.into_parts()
    }

    fn max_idle_time(&self) -> Option<std::time::Duration> {
        self.conn.max_idle_time()
    }

    fn do_read(&mut self) -> BoxFuture<'_, Result<Turn<C>>> {
        Box::pin(self.process_input())
    }

    fn do_write(&mut self) -> BoxFuture<'_, Result<Turn<C>>> {
        Box::pin(async move {
            self.conn.flush(false).await?;
            Ok(Turn::Continue)
        })
    }

    fn on_close(&mut self) {
        self.conn.on_close();
    }
}

impl<C, H> std::fmt::Debug for Dispatcher<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("conn", &self.conn).finish()
    }
}

/// The handler's write side of one exchange.
///
/// Writes call back into the connection's generate path; a write with
/// `volatile = true` does not return while the connection still references
/// the caller's bytes.
pub struct Responder<'a, C: ByteChannel> {
    pub(crate) conn: &'a mut Conn<C>,
}

impl<'a, C: ByteChannel + Send + Sync> Responder<'a, C> {
    /// Set the response status. Only meaningful before the first write.
    pub fn set_status(&mut self, status: StatusCode) {
        self.conn.channel.set_status(status);
    }

    /// The response fields, to fill in before the first write.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.conn.channel.headers_mut()
    }

    /// Declare the response body length. Unset means unknown, which frames
    /// the body chunked (HTTP/1.1) or close-delimited.
    pub fn set_content_length(&mut self, content_length: Option<u64>) {
        self.conn.channel.set_content_length(content_length);
    }

    /// Write body content. Commits the response head on first use.
    ///
    /// Returns the number of content bytes consumed.
    pub async fn write(&mut self, content: Bytes, volatile: bool) -> Result<usize> {
        self.conn.generate(Some(content), Action::Prepare, volatile).await
    }

    /// Push everything staged onto the wire.
    pub async fn flush(&mut self) -> Result<()> {
        self.conn.generate(None, Action::Flush, false).await.map(|_| ())
    }

    /// Finish the response, emitting any terminal framing.
    pub async fn complete(&mut self) -> Result<()> {
        self.conn.generate(None, Action::Complete, false).await.map(|_| ())
    }

    /// Set and send a complete response in one step.
    pub async fn send_response(&mut self, response: Response<Bytes>) -> Result<()> {
        let (parts, body) = response.into_parts();
        self.conn.channel.set_response(parts.status, parts.headers);
        self.conn
            .channel
            .set_content_length(Some(body.len() as u64));
        let content = if body.is_empty() { None } else { Some(body) };
        self.conn
            .generate(content, Action::Complete, false)
            .await
            .map(|_| ())
    }

    /// Synthesize and emit an error response; see [`Conn::send_error`].
    pub async fn send_error(
        &mut self,
        status: StatusCode,
        reason: Option<&str>,
        body: Option<Bytes>,
        close: bool,
    ) -> Result<()> {
        self.conn.send_error(status, reason, body, close).await
    }

    /// Stash the replacement connection to take over after this response.
    ///
    /// Only observed when the response status is `101 Switching Protocols`.
    pub fn switch_protocol(&mut self, switch: Box<dyn SwitchProtocol<C>>) {
        self.conn.channel.set_switch(switch);
    }

    /// Suspend the request: the parse loop exits without resetting and the
    /// async continuation owns the connection's idleness.
    pub fn suspend(&mut self) {
        self.conn.channel.suspend();
    }

    /// Block until the endpoint is read-ready or the idle timeout elapses.
    pub async fn block_readable(&mut self) -> Result<bool> {
        self.conn.io().block_readable().await
    }
}

impl<'a, C: ByteChannel> std::fmt::Debug for Responder<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::IoSlice;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use http::header::UPGRADE;
    use http::{HeaderValue, Request, Response, StatusCode};

    use super::*;
    use crate::io::{Endpoint, WorkUnit};
    use crate::mock::ScriptedChannel;
    use crate::service::{service_fn, ServiceFn};

    fn connector() -> Arc<Connector> {
        Arc::new(Connector::builder().build())
    }

    fn dispatcher<H>(
        connector: Arc<Connector>,
        ch: ScriptedChannel,
        handler: H,
    ) -> Dispatcher<ScriptedChannel, H>
    where
        H: Handler<ScriptedChannel> + Send,
    {
        let endpoint = Endpoint::new(ch, Some(connector.default_idle_timeout()));
        Dispatcher::new(connector, Selectable::new(endpoint), handler)
    }

    fn ok_handler() -> ServiceFn<impl FnMut(Request<Bytes>) -> Result<Response<Bytes>> + Send> {
        service_fn(|_req| {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::new())
                .expect("response"))
        })
    }

    fn response_count(wire: &[u8]) -> usize {
        String::from_utf8_lossy(wire)
            .matches("HTTP/1.1 200 OK\r\n")
            .count()
    }

    // S1: two pipelined GETs over one keep-alive connection
    #[tokio::test]
    async fn keep_alive_serves_back_to_back_requests() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n");

        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = paths.clone();
        let handler = service_fn(move |req: Request<Bytes>| {
            seen.lock().unwrap().push(req.uri().path().to_string());
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::new())
                .expect("response"))
        });

        let mut d = dispatcher(connector.clone(), ch.clone(), handler);
        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Continue));

        assert_eq!(*paths.lock().unwrap(), vec!["/a", "/b"]);
        assert_eq!(response_count(&ch.written()), 2);
        assert!(d.conn().io().endpoint().is_open());
        assert!(d.conn().parser.is_idle());
        assert!(d.conn().generator.is_idle());
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // S2: streaming handler produces a chunked response
    #[tokio::test]
    async fn streamed_writes_are_chunked() {
        struct Chunky;
        impl Handler<ScriptedChannel> for Chunky {
            async fn handle(
                &mut self,
                _req: Request<Bytes>,
                mut res: Responder<'_, ScriptedChannel>,
            ) -> Result<()> {
                res.write(Bytes::from_static(b"one"), false).await?;
                res.write(Bytes::from_static(b"two"), false).await?;
                res.write(Bytes::from_static(b"three"), false).await?;
                res.complete().await
            }
        }

        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut d = dispatcher(connector.clone(), ch.clone(), Chunky);
        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Continue));

        let wire = ch.written();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("transfer-encoding: chunked\r\n"), "{}", text);
        let body_at = text.find("\r\n\r\n").unwrap() + 4;
        assert_eq!(
            &text[body_at..],
            "3\r\none\r\n3\r\ntwo\r\n5\r\nthree\r\n0\r\n\r\n"
        );
        assert!(d.conn().io().endpoint().is_open());
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // S3: a volatile write must block on backpressure and drain fully
    #[tokio::test(start_paused = true)]
    async fn volatile_write_blocks_until_drained() {
        struct Big;
        impl Handler<ScriptedChannel> for Big {
            async fn handle(
                &mut self,
                _req: Request<Bytes>,
                mut res: Responder<'_, ScriptedChannel>,
            ) -> Result<()> {
                res.set_content_length(Some(4096));
                let n = res.write(Bytes::from(vec![b'x'; 4096]), true).await?;
                assert_eq!(n, 4096);
                res.complete().await
            }
        }

        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        ch.set_write_budget(256);

        let mut d = dispatcher(connector.clone(), ch.clone(), Big);
        let pump = {
            let ch = ch.clone();
            async move {
                // free the write side once the dispatcher has parked
                tokio::time::sleep(Duration::from_millis(1)).await;
                ch.allow_write(1 << 20);
            }
        };
        let (turn, ()) = tokio::join!(d.process_input(), pump);
        assert!(matches!(turn.unwrap(), Turn::Continue));

        let wire = ch.written();
        assert!(wire.ends_with(&vec![b'x'; 4096][..]));
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // S4: a protocol error turns into a 400 and a non-persistent close
    #[tokio::test]
    async fn bad_request_line_gets_error_response() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"NOTAMETHOD /\r\n\r\n");

        let handler = service_fn(|_req: Request<Bytes>| -> Result<Response<Bytes>> {
            panic!("handler must not run for an unparseable request")
        });
        let mut d = dispatcher(connector.clone(), ch.clone(), handler);
        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Closed));

        let wire = ch.written();
        assert!(wire.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(!d.conn().generator.is_persistent());
        assert!(ch.is_write_shutdown());
        d.on_close();
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // S5: peer half-close mid-request leaves the connection open; the
    // truncation surfaces on the next parse
    #[tokio::test]
    async fn half_close_mid_request_stays_open_then_errors() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET /a HTTP/1.1\r\n");
        ch.push_eof();

        let handler = service_fn(|_req: Request<Bytes>| -> Result<Response<Bytes>> {
            panic!("handler must not run for a truncated request")
        });
        let mut d = dispatcher(connector.clone(), ch.clone(), handler);

        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Continue));
        assert!(d.conn().io().endpoint().is_open());
        assert!(!d.conn().parser.is_persistent());
        assert!(ch.written().is_empty());

        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Closed));
        assert!(ch.written().starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        d.on_close();
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // eof on an idle connection closes quietly
    #[tokio::test]
    async fn eof_while_idle_closes_quietly() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_eof();
        let mut d = dispatcher(connector.clone(), ch.clone(), ok_handler());

        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Closed));
        assert!(ch.written().is_empty());
        assert!(!d.conn().io().endpoint().is_open());
        d.on_close();
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // S6: a 101 response with a stashed replacement rebinds the connection
    struct EchoSwitch;

    impl SwitchProtocol<ScriptedChannel> for EchoSwitch {
        fn build(
            self: Box<Self>,
            io: Selectable<ScriptedChannel>,
            read_buf: Bytes,
        ) -> Box<dyn Driven<ScriptedChannel>> {
            Box::new(EchoConnection {
                io,
                pending: read_buf,
            })
        }
    }

    struct EchoConnection {
        io: Selectable<ScriptedChannel>,
        pending: Bytes,
    }

    impl Driven<ScriptedChannel> for EchoConnection {
        fn io(&self) -> &Selectable<ScriptedChannel> {
            &self.io
        }

        fn io_mut(&mut self) -> &mut Selectable<ScriptedChannel> {
            &mut self.io
        }

        fn into_parts(self: Box<Self>) -> (Selectable<ScriptedChannel>, Bytes) {
            (self.io, self.pending)
        }

        fn do_read(&mut self) -> BoxFuture<'_, Result<Turn<ScriptedChannel>>> {
            Box::pin(async move {
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&self.pending);
                self.pending = Bytes::new();
                loop {
                    match self.io.endpoint_mut().fill(&mut buf) {
                        Fill::Data(_) => {}
                        Fill::Empty | Fill::Eof => break,
                    }
                }
                if !buf.is_empty() {
                    let bytes = buf.freeze();
                    self.io.endpoint_mut().flush(&[IoSlice::new(&bytes)])?;
                }
                self.io.set_read_interested(true);
                Ok(Turn::Continue)
            })
        }
    }

    struct Upgrader;

    impl Handler<ScriptedChannel> for Upgrader {
        async fn handle(
            &mut self,
            req: Request<Bytes>,
            mut res: Responder<'_, ScriptedChannel>,
        ) -> Result<()> {
            assert_eq!(req.headers().get(UPGRADE).unwrap(), "echo");
            res.set_status(StatusCode::SWITCHING_PROTOCOLS);
            res.headers_mut()
                .insert(UPGRADE, HeaderValue::from_static("echo"));
            res.switch_protocol(Box::new(EchoSwitch));
            res.complete().await
        }
    }

    #[tokio::test]
    async fn upgrade_hands_connection_to_replacement() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET /chat HTTP/1.1\r\nHost: h\r\nUpgrade: echo\r\n\r\nHELLO");

        let mut d = dispatcher(connector.clone(), ch.clone(), Upgrader);
        let turn = d.process_input().await.unwrap();
        let switch = match turn {
            Turn::Switch(switch) => switch,
            other => panic!("expected switch, got {:?}", other),
        };
        let wire = ch.written();
        assert!(wire.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

        // the event loop rebinds: the old connection yields its endpoint
        // and the bytes read past the upgrade request
        let boxed: Box<dyn Driven<ScriptedChannel>> = Box::new(d);
        let (io, leftover) = boxed.into_parts();
        assert_eq!(&leftover[..], b"HELLO");
        assert_eq!(connector.pool().outstanding(), 0);

        let mut echo = switch.build(io, leftover);
        let turn = echo.do_read().await.unwrap();
        assert!(matches!(turn, Turn::Continue));
        assert!(ch.written().ends_with(b"HELLO"));
    }

    // suspension exits the loop without resetting and leaves idle checks off
    struct Suspender;

    impl Handler<ScriptedChannel> for Suspender {
        async fn handle(
            &mut self,
            _req: Request<Bytes>,
            mut res: Responder<'_, ScriptedChannel>,
        ) -> Result<()> {
            res.suspend();
            Ok(())
        }
    }

    #[tokio::test]
    async fn suspended_request_exits_without_reset() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut d = dispatcher(connector.clone(), ch.clone(), Suspender);

        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Suspended));
        assert!(!d.conn().io().check_idle());
        assert!(d.conn().io().endpoint().is_open());
    }

    // handler errors on an uncommitted response become a 500
    #[tokio::test]
    async fn handler_error_becomes_500() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let handler = service_fn(|_req: Request<Bytes>| -> Result<Response<Bytes>> {
            Err(Error::new_service("boom"))
        });
        let mut d = dispatcher(connector.clone(), ch.clone(), handler);

        let turn = d.process_input().await.unwrap();
        assert!(matches!(turn, Turn::Closed));
        assert!(ch
            .written()
            .starts_with(b"HTTP/1.1 500 Internal Server Error\r\n"));
        d.on_close();
        assert_eq!(connector.pool().outstanding(), 0);
    }

    // the task-local connection info is visible during dispatch, gone after
    struct Introspect(Arc<Mutex<Option<ConnectionInfo>>>);

    impl Handler<ScriptedChannel> for Introspect {
        async fn handle(
            &mut self,
            _req: Request<Bytes>,
            mut res: Responder<'_, ScriptedChannel>,
        ) -> Result<()> {
            *self.0.lock().unwrap() = current();
            res.send_response(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Bytes::new())
                    .expect("response"),
            )
            .await
        }
    }

    #[tokio::test]
    async fn current_connection_is_scoped_to_dispatch() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let seen = Arc::new(Mutex::new(None));
        let mut d = dispatcher(connector, ch, Introspect(seen.clone()));

        assert!(current().is_none());
        d.process_input().await.unwrap();
        assert!(seen.lock().unwrap().is_some());
        assert!(current().is_none());
    }

    // head requests get headers but no body bytes
    #[tokio::test]
    async fn head_request_suppresses_body() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        ch.push_data(b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n");
        let handler = service_fn(|_req: Request<Bytes>| {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from_static(b"body bytes"))
                .expect("response"))
        });
        let mut d = dispatcher(connector, ch.clone(), handler);
        d.process_input().await.unwrap();

        let text = String::from_utf8_lossy(&ch.written()).to_string();
        assert!(text.contains("content-length: 10"), "{}", text);
        assert!(text.ends_with("\r\n\r\n"), "{}", text);
    }

    // readiness events become work units when nobody is parked
    #[tokio::test]
    async fn work_units_flow_when_not_blocked() {
        let connector = connector();
        let ch = ScriptedChannel::new();
        let d = dispatcher(connector, ch, ok_handler());
        assert_eq!(d.io().on_readable(), Some(WorkUnit::Read));
        assert_eq!(d.io().on_writeable(), Some(WorkUnit::Write));
    }
}
