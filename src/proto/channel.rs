//! Per-exchange request/response state.
//!
//! The channel is what the connection driver and the handler share: the
//! request being assembled from parser events, the response description the
//! generator will commit from, and the control flags that outlive a single
//! dispatch (suspension, the protocol-switch slot).

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Request, StatusCode, Version};
use tracing::trace;

use super::encode::ResponseInfo;
use super::parse::RequestHead;
use crate::io::SwitchProtocol;

/// Per-request state shared between the connection and the handler.
pub struct HttpChannel<C> {
    request_head: Option<RequestHead>,
    request_body: BytesMut,
    response_version: Version,
    response_status: StatusCode,
    response_reason: Option<String>,
    response_headers: HeaderMap,
    content_length: Option<u64>,
    head_request: bool,
    suspended: bool,
    switch: Option<Box<dyn SwitchProtocol<C>>>,
}

impl<C> HttpChannel<C> {
    /// A channel with no request in flight.
    pub fn new() -> HttpChannel<C> {
        HttpChannel {
            request_head: None,
            request_body: BytesMut::new(),
            response_version: Version::HTTP_11,
            response_status: StatusCode::OK,
            response_reason: None,
            response_headers: HeaderMap::new(),
            content_length: None,
            head_request: false,
            suspended: false,
            switch: None,
        }
    }

    /// A request head was parsed.
    pub fn on_request(&mut self, head: RequestHead) {
        self.head_request = head.method == Method::HEAD;
        self.response_version = head.version;
        self.request_head = Some(head);
    }

    /// A run of request body bytes was parsed.
    pub fn on_content(&mut self, content: Bytes) {
        self.request_body.extend_from_slice(&content);
    }

    /// Take the completed request for dispatch.
    pub fn take_request(&mut self) -> Option<Request<Bytes>> {
        let head = self.request_head.take()?;
        let body = std::mem::take(&mut self.request_body).freeze();
        let mut request = Request::new(body);
        *request.method_mut() = head.method;
        *request.uri_mut() = head.uri;
        *request.version_mut() = head.version;
        *request.headers_mut() = head.headers;
        Some(request)
    }

    /// The descriptor the generator commits the response from.
    pub fn response_info(&self) -> ResponseInfo {
        ResponseInfo {
            version: self.response_version,
            status: self.response_status,
            reason: self.response_reason.clone(),
            headers: self.response_headers.clone(),
            content_length: self.content_length,
            head: self.head_request,
        }
    }

    /// Replace the response status and fields wholesale.
    pub fn set_response(&mut self, status: StatusCode, headers: HeaderMap) {
        self.response_status = status;
        self.response_headers = headers;
    }

    /// Set the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.response_status = status;
    }

    /// The response status as currently described.
    pub fn status(&self) -> StatusCode {
        self.response_status
    }

    /// The response fields, for the handler to fill in.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    /// Declare the response body length; `None` means unknown.
    pub fn set_content_length(&mut self, content_length: Option<u64>) {
        self.content_length = content_length;
    }

    /// Describe a synthesized error response: requested status and reason,
    /// unknown content length, HEAD flag carried over from the request.
    pub fn set_error_response(&mut self, status: StatusCode, reason: Option<&str>) {
        self.response_version = Version::HTTP_11;
        self.response_status = status;
        self.response_reason = reason.map(str::to_owned);
        self.response_headers = HeaderMap::new();
        self.content_length = None;
    }

    /// Mark the request as asynchronously suspended.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Whether the request is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Stash the replacement connection for a protocol switch. Observed by
    /// the parse loop only when a 101 response was emitted.
    pub fn set_switch(&mut self, switch: Box<dyn SwitchProtocol<C>>) {
        self.switch = Some(switch);
    }

    /// Take the replacement connection, if one was stashed.
    pub fn take_switch(&mut self) -> Option<Box<dyn SwitchProtocol<C>>> {
        self.switch.take()
    }

    /// Clear all per-exchange state for the next request.
    pub fn reset(&mut self) {
        self.request_head = None;
        self.request_body.clear();
        self.response_version = Version::HTTP_11;
        self.response_status = StatusCode::OK;
        self.response_reason = None;
        self.response_headers = HeaderMap::new();
        self.content_length = None;
        self.head_request = false;
        self.suspended = false;
        self.switch = None;
    }

    /// The connection is going away.
    pub fn on_close(&mut self) {
        trace!("channel close");
        self.reset();
    }
}

impl<C> Default for HttpChannel<C> {
    fn default() -> HttpChannel<C> {
        HttpChannel::new()
    }
}

impl<C> std::fmt::Debug for HttpChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChannel")
            .field("status", &self.response_status)
            .field("suspended", &self.suspended)
            .field("switch", &self.switch.is_some())
            .finish()
    }
}
