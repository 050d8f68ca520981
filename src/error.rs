//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have `wharf` `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while driving an HTTP connection.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request could not be parsed as HTTP.
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// An `io::Error` occurred while reading or writing the byte channel.
    Io,
    /// The output side of the endpoint is shut; no further bytes can be
    /// generated or flushed.
    OutputClosed,
    /// A blocking flush gave up after the connection's idle timeout.
    IdleTimeout,
    /// A programmer error surfaced by the engine.
    User(User),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Uri,
    Version,
    VersionUnsupported,
    Header,
    TooLarge,
    /// Conflicting or malformed framing headers (Content-Length,
    /// Transfer-Encoding).
    TransferFraming,
    /// HTTP/1.1 request without a Host header.
    MissingHost,
}

#[derive(Debug)]
pub(crate) enum User {
    /// A blocking read or write was requested while another caller is
    /// already parked for that direction.
    Blocked(&'static str),
    /// The pending-flush slots formed a combination the wire format cannot
    /// express.
    InvalidFlush(u8),
    /// An error response was requested after the response was committed.
    ResponseCommitted,
    /// The response was completed before the declared content length was
    /// written.
    BodyTooShort(u64),
    /// A work unit was dispatched to a connection that does not implement
    /// that direction, or per-request state was missing at dispatch.
    Dispatch(&'static str),
    /// The handler failed.
    Service,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this error wraps an `io::Error` from the byte channel.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the output side of the endpoint was already shut.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::OutputClosed)
    }

    /// Returns true if a blocking operation gave up on the idle timeout.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::IdleTimeout)
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// The response status an error response for this error should carry,
    /// if this is a protocol-level error.
    pub fn parse_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::TooLarge) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Kind::Parse(Parse::VersionUnsupported) => {
                Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED)
            }
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::IncompleteMessage => Some(StatusCode::BAD_REQUEST),
            _ => None,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    /// Wrap an `io::Error` from outside the engine, e.g. from binding a
    /// listener.
    pub fn from_io(cause: std::io::Error) -> Error {
        Error::new_io(cause)
    }

    /// An error from handler code, carried through the dispatch path.
    pub fn from_handler<E>(cause: E) -> Error
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Error::new_service(cause)
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::OutputClosed)
    }

    pub(crate) fn new_idle_timeout() -> Error {
        Error::new(Kind::IdleTimeout)
    }

    pub(crate) fn new_blocked(direction: &'static str) -> Error {
        Error::new(Kind::User(User::Blocked(direction)))
    }

    pub(crate) fn new_invalid_flush(bits: u8) -> Error {
        Error::new(Kind::User(User::InvalidFlush(bits)))
    }

    pub(crate) fn new_response_committed() -> Error {
        Error::new(Kind::User(User::ResponseCommitted))
    }

    pub(crate) fn new_body_too_short(remaining: u64) -> Error {
        Error::new(Kind::User(User::BodyTooShort(remaining)))
    }

    pub(crate) fn new_dispatch(what: &'static str) -> Error {
        Error::new(Kind::User(User::Dispatch(what)))
    }

    pub(crate) fn new_service<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Service)).with(cause)
    }

    fn description(&self) -> String {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed".into(),
            Kind::Parse(Parse::Uri) => "invalid URI".into(),
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed".into(),
            Kind::Parse(Parse::VersionUnsupported) => {
                "unsupported HTTP version".into()
            }
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed".into(),
            Kind::Parse(Parse::TooLarge) => "message head is too large".into(),
            Kind::Parse(Parse::TransferFraming) => {
                "invalid message framing headers".into()
            }
            Kind::Parse(Parse::MissingHost) => {
                "HTTP/1.1 request without Host header".into()
            }
            Kind::IncompleteMessage => {
                "connection closed before message completed".into()
            }
            Kind::Io => "connection error".into(),
            Kind::OutputClosed => "endpoint output is shut".into(),
            Kind::IdleTimeout => "operation timed out while idle".into(),
            Kind::User(User::Blocked(dir)) => {
                format!("another caller is already blocked for {}", dir)
            }
            Kind::User(User::InvalidFlush(bits)) => {
                format!("illegal flush combination ({:#06b})", bits)
            }
            Kind::User(User::ResponseCommitted) => {
                "response is already committed".into()
            }
            Kind::User(User::BodyTooShort(remaining)) => format!(
                "response completed {} bytes short of content length",
                remaining
            ),
            Kind::User(User::Dispatch(what)) => {
                format!("connection cannot dispatch {}", what)
            }
            Kind::User(User::Service) => "handler failed".into(),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("wharf::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(&self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}
