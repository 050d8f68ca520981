//! The HTTP/1.x protocol engine: parser, generator, connection state, and
//! the dispatcher that ties them to a selectable endpoint.

pub mod channel;
pub mod conn;
pub mod dispatch;
pub mod encode;
pub mod parse;

mod date;

pub use self::channel::HttpChannel;
pub use self::conn::{Conn, PendingFlush};
pub use self::dispatch::{current, ConnectionInfo, Dispatcher, Responder};
pub use self::encode::{Action, ResponseGenerator, ResponseInfo, Step};
pub use self::parse::{Parsed, RequestHead, RequestParser};
