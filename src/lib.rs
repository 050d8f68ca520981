#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # wharf
//!
//! `wharf` is a server-side HTTP/1.x **connection engine**: the layer that
//! sits on top of a non-blocking byte-stream endpoint and drives the
//! request/response lifecycle: pull bytes, parse requests, dispatch a
//! handler, and serialize responses back with correct framing and the
//! minimum number of gather writes.
//!
//! It is deliberately lower-level than a web framework:
//!
//! - [`io::Endpoint`] wraps any [`io::ByteChannel`] (e.g. a
//!   `tokio::net::TcpStream`) with half-shut semantics and non-blocking
//!   `fill`/`flush`.
//! - [`io::Selectable`] adds readiness interest bits, blocking-style
//!   helpers for handlers, and the idle-expiry policy.
//! - [`proto::Dispatcher`] is the protocol driver: the parse loop, the
//!   generate-and-flush state machine over pooled buffers, keep-alive
//!   reset, protocol upgrades, and the error-response path.
//! - [`server`] holds the per-connection event loop and an accept loop.
//!
//! Out of scope: TLS, HTTP/2, routing, sessions.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use wharf::server::{Connector, Server};
//! use wharf::service::service_fn;
//!
//! #[tokio::main]
//! async fn main() -> wharf::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
//!         .await
//!         .map_err(wharf::Error::from_io)?;
//!     let server = Server::new(Connector::builder().build());
//!     server
//!         .serve(
//!             listener,
//!             service_fn(|_req| {
//!                 Ok(http::Response::builder()
//!                     .status(200)
//!                     .body(Bytes::from_static(b"hello"))
//!                     .expect("response"))
//!             }),
//!         )
//!         .await
//! }
//! ```

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

mod error;
pub mod io;
#[cfg(test)]
mod mock;
pub mod pool;
pub mod proto;
pub mod server;
pub mod service;
