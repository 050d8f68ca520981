//! Incremental HTTP/1.x request parsing.
//!
//! [`RequestParser::parse_next`] consumes bytes from the front of the
//! request buffer and yields one event per call: the request head, body
//! content, or message completion. `NeedMore` means no further progress can
//! be made on what is buffered.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri, Version};
use tracing::{debug, trace};

use crate::error::Parse;
use crate::{Error, Result};

/// Maximum number of headers accepted in a request head.
pub(crate) const MAX_HEADERS: usize = 100;

/// The head of a parsed request: everything before the body.
#[derive(Debug)]
pub struct RequestHead {
    /// The request method.
    pub method: Method,
    /// The request target.
    pub uri: Uri,
    /// The request HTTP version.
    pub version: Version,
    /// The request header fields.
    pub headers: HeaderMap,
}

/// One step of parser progress.
#[derive(Debug)]
pub enum Parsed {
    /// No progress can be made on the buffered bytes.
    NeedMore,
    /// A complete request head was consumed.
    Request(RequestHead),
    /// A run of body bytes was consumed.
    Content(Bytes),
    /// The current message is complete.
    Complete,
}

#[derive(Debug)]
enum State {
    Start,
    Body(Decoder),
    Complete,
    Closed,
}

#[derive(Debug)]
enum Decoder {
    Length(u64),
    Chunked(Chunked, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    Size,
    Data,
    DataEnd,
    Trailer,
}

/// An incremental HTTP/1.x request parser.
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    persistent: bool,
    partial: bool,
    eof: bool,
}

impl RequestParser {
    /// A parser in the idle state.
    pub fn new() -> RequestParser {
        RequestParser {
            state: State::Start,
            persistent: true,
            partial: false,
            eof: false,
        }
    }

    /// Consume what can be consumed from the front of `buf` and report it.
    pub fn parse_next(&mut self, buf: &mut BytesMut) -> Result<Parsed> {
        match self.state {
            State::Start => self.parse_head(buf),
            State::Body(_) => self.parse_body(buf),
            State::Complete => Ok(Parsed::Complete),
            State::Closed => Ok(Parsed::NeedMore),
        }
    }

    fn parse_head(&mut self, buf: &mut BytesMut) -> Result<Parsed> {
        // tolerate stray CRLFs between pipelined messages
        let lines = buf
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        if lines > 0 {
            buf.advance(lines);
        }
        if buf.is_empty() {
            self.partial = false;
            return self.need_more();
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(buf.as_ref()).map_err(|e| {
            debug!("request head parse failed: {}", e);
            match e {
                httparse::Error::Version => Error::new_parse(Parse::Version),
                httparse::Error::TooManyHeaders => Error::new_too_large(),
                httparse::Error::Token => Error::new_parse(Parse::Method),
                _ => Error::new_parse(Parse::Header),
            }
        })?;
        let len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                self.partial = true;
                return self.need_more();
            }
        };
        trace!("parsed request head, {} bytes", len);

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| Error::new_parse(Parse::Method))?;
        let uri = req
            .path
            .and_then(|p| p.parse::<Uri>().ok())
            .ok_or_else(|| Error::new_parse(Parse::Uri))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(Error::new_parse(Parse::VersionUnsupported)),
        };
        let mut fields = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| Error::new_parse(Parse::Header))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| Error::new_parse(Parse::Header))?;
            fields.append(name, value);
        }
        buf.advance(len);
        self.partial = false;

        if version == Version::HTTP_11 && !fields.contains_key(HOST) {
            return Err(Error::new_parse(Parse::MissingHost));
        }

        let chunked = is_chunked(&fields)?;
        let content_length = content_length(&fields)?;
        if chunked && content_length.is_some() {
            return Err(Error::new_parse(Parse::TransferFraming));
        }

        self.persistent = match version {
            Version::HTTP_11 => !wants_close(&fields),
            // 1.0 keep-alive is not negotiated; see enforce-version notes
            _ => false,
        };

        self.state = if chunked {
            State::Body(Decoder::Chunked(Chunked::Size, 0))
        } else {
            match content_length {
                Some(n) if n > 0 => State::Body(Decoder::Length(n)),
                _ => State::Complete,
            }
        };

        Ok(Parsed::Request(RequestHead {
            method,
            uri,
            version,
            headers: fields,
        }))
    }

    fn parse_body(&mut self, buf: &mut BytesMut) -> Result<Parsed> {
        let decoder = match self.state {
            State::Body(ref mut d) => d,
            _ => return Ok(Parsed::NeedMore),
        };
        match decoder {
            Decoder::Length(ref mut remaining) => {
                if buf.is_empty() {
                    return self.need_more();
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                let content = buf.split_to(take).freeze();
                *remaining -= take as u64;
                if *remaining == 0 {
                    self.state = State::Complete;
                }
                Ok(Parsed::Content(content))
            }
            Decoder::Chunked(..) => self.parse_chunked(buf),
        }
    }

    fn parse_chunked(&mut self, buf: &mut BytesMut) -> Result<Parsed> {
        loop {
            let (chunked, remaining) = match self.state {
                State::Body(Decoder::Chunked(ref mut c, ref mut r)) => (c, r),
                _ => return Ok(Parsed::Complete),
            };
            match *chunked {
                Chunked::Size => {
                    let Some(line) = take_line(buf) else {
                        return self.need_more();
                    };
                    let size = parse_chunk_size(&line)?;
                    trace!("chunk size {}", size);
                    if size == 0 {
                        *chunked = Chunked::Trailer;
                    } else {
                        *chunked = Chunked::Data;
                        *remaining = size;
                    }
                }
                Chunked::Data => {
                    if buf.is_empty() {
                        return self.need_more();
                    }
                    let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                    let content = buf.split_to(take).freeze();
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *chunked = Chunked::DataEnd;
                    }
                    return Ok(Parsed::Content(content));
                }
                Chunked::DataEnd => {
                    if buf.len() < 2 {
                        return self.need_more();
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::new_parse(Parse::TransferFraming));
                    }
                    buf.advance(2);
                    *chunked = Chunked::Size;
                }
                Chunked::Trailer => {
                    // trailer fields are consumed and discarded
                    let Some(line) = take_line(buf) else {
                        return self.need_more();
                    };
                    if line.is_empty() {
                        self.state = State::Complete;
                        return Ok(Parsed::Complete);
                    }
                }
            }
        }
    }

    fn need_more(&self) -> Result<Parsed> {
        if self.eof && !self.is_idle() {
            return Err(Error::new_incomplete());
        }
        Ok(Parsed::NeedMore)
    }

    /// Whether the parser is between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Start) && !self.partial
    }

    /// Whether the current message has been fully consumed.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Whether the parser is consuming a message body.
    pub fn is_in_content(&self) -> bool {
        matches!(self.state, State::Body(_))
    }

    /// Whether the connection may carry another request after this message.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Force the parser non-persistent, e.g. after the peer half-closed.
    pub fn set_persistent(&mut self, persistent: bool) {
        if !persistent {
            self.persistent = false;
        }
    }

    /// Record that the input stream has ended. A parser mid-message will
    /// surface an incomplete-message error on the next parse.
    pub fn note_eof(&mut self) {
        self.eof = true;
    }

    /// Whether end of input was recorded.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Return to idle for the next message on a kept-alive connection.
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.partial = false;
        self.persistent = true;
    }

    /// Stop parsing for good.
    pub fn close(&mut self) {
        self.state = State::Closed;
        self.persistent = false;
    }
}

impl Default for RequestParser {
    fn default() -> RequestParser {
        RequestParser::new()
    }
}

pub(crate) fn wants_close(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    })
}

fn is_chunked(headers: &HeaderMap) -> Result<bool> {
    let mut chunked = false;
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| Error::new_parse(Parse::TransferFraming))?;
        for token in value.split(',') {
            // chunked must be the final coding applied
            if chunked {
                return Err(Error::new_parse(Parse::TransferFraming));
            }
            chunked = token.trim().eq_ignore_ascii_case("chunked");
        }
    }
    Ok(chunked)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::new_parse(Parse::TransferFraming))?;
        if let Some(prev) = length {
            if prev != parsed {
                return Err(Error::new_parse(Parse::TransferFraming));
            }
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn take_line(buf: &mut BytesMut) -> Option<Vec<u8>> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = buf.split_to(pos).to_vec();
    buf.advance(2);
    Some(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    // extensions after ';' are ignored
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(line);
    let mut size: u64 = 0;
    let mut any = false;
    for &b in digits.iter() {
        if b == b' ' || b == b'\t' {
            continue;
        }
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(Error::new_parse(Parse::TransferFraming)),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or_else(|| Error::new_parse(Parse::TransferFraming))?;
        any = true;
    }
    if !any {
        return Err(Error::new_parse(Parse::TransferFraming));
    }
    Ok(size)
}
