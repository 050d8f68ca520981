//! The handler seam between the connection engine and application code.

use std::future::Future;

use bytes::Bytes;
use http::{Request, Response};

use crate::io::ByteChannel;
use crate::proto::dispatch::Responder;
use crate::Result;

/// Dispatches one request and produces its response through the
/// [`Responder`].
///
/// The responder's write methods call back into the connection's generate
/// path; a handler may stream the response in pieces, block on
/// backpressure, upgrade the protocol, or suspend the request. Returned
/// futures must be `Send` so connections can be served from a multi-threaded
/// runtime.
pub trait Handler<C: ByteChannel> {
    /// Handle one complete request.
    fn handle(
        &mut self,
        request: Request<Bytes>,
        responder: Responder<'_, C>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Create a [`Handler`] from a plain request-to-response function.
///
/// The whole response is built up front and sent in one step; use a custom
/// `Handler` for streaming or upgrades.
pub fn service_fn<F>(f: F) -> ServiceFn<F>
where
    F: FnMut(Request<Bytes>) -> Result<Response<Bytes>>,
{
    ServiceFn { f }
}

/// A [`Handler`] wrapping a request-to-response function.
#[derive(Clone)]
pub struct ServiceFn<F> {
    f: F,
}

impl<C, F> Handler<C> for ServiceFn<F>
where
    C: ByteChannel + Send + Sync,
    F: FnMut(Request<Bytes>) -> Result<Response<Bytes>> + Send,
{
    async fn handle(
        &mut self,
        request: Request<Bytes>,
        mut responder: Responder<'_, C>,
    ) -> Result<()> {
        let response = (self.f)(request)?;
        responder.send_response(response).await
    }
}

impl<F> std::fmt::Debug for ServiceFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFn").finish()
    }
}
