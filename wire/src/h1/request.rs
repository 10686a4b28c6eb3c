// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 Request
//!
//! [`H1Request`] is a zero-copy scratch parser over a single contiguous
//! slice: the connection buffers bytes until a full request-line + header
//! block (`\r\n\r\n`) has arrived, then parses that block in one pass. This
//! sidesteps the lifetime problem of holding borrowed `&str`s across
//! buffer reallocations that span multiple reads (see the teacher's own
//! note in the original of this file) by requiring the full header block
//! up front, then handing callers an owned [`Request`].

use core::str::from_utf8_unchecked;

use super::tokens::{is_header_value_token, is_request_target_token, is_tchar};
use super::{discard_required_whitespace, discard_whitespace, take_after_newline};
use super::{ParseError, Status};
use crate::raw_request::RawRequest;
use crate::{Method, Version};

const MAX_HEADERS: usize = 64;

/// A single parsed header field: name is lowercased for case-insensitive
/// lookup, value is the raw (trimmed) bytes.
#[derive(Debug, Clone)]
pub struct Header<'a> {
    /// Lower-cased header field name.
    pub name: &'a str,
    /// Raw header field value bytes.
    pub value: &'a [u8],
}

/// Owned, fully-parsed HTTP/1.1 request handed to [`crate`] consumers. Does
/// not borrow from the connection's read buffer, so it can outlive the
/// buffer being reused for the next request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target (origin-form path+query, typically).
    pub target: String,
    /// Negotiated/declared HTTP version.
    pub version: Version,
    /// Headers in receipt order, names lower-cased.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Request body, if any. Populated from a `Content-Length`-delimited
    /// body by `CommTask::read`; always empty for requests with no body
    /// or a `Transfer-Encoding: chunked` body (request dechunking is not
    /// implemented — see that module's doc comment).
    pub body: Vec<u8>,
}

impl Request {
    /// Returns the (lower-cased) header value for `name`, if present.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the request declares `Transfer-Encoding: chunked`.
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case(b"chunked"))
            .unwrap_or(false)
    }

    /// Whether the connection should be kept alive after this request,
    /// per RFC 9112 §9.3 defaults (HTTP/1.1 keeps alive unless told
    /// otherwise; HTTP/1.0 closes unless told otherwise).
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case(b"close") => false,
            Some(v) if v.eq_ignore_ascii_case(b"keep-alive") => true,
            _ => matches!(self.version, Version::H1_1),
        }
    }
}

/// Zero-copy scratch parser for a single HTTP/1.1 request-line + header
/// block.
#[derive(Debug, Default)]
pub struct H1Request<'buf> {
    /// method
    pub method: Option<Method>,
    /// target
    pub target: Option<&'buf str>,
    /// version
    pub version: Option<Version>,
    /// headers
    pub headers: Vec<Header<'buf>>,
}

impl<'buf> H1Request<'buf> {
    /// Creates an empty scratch parser.
    pub fn new() -> Self {
        H1Request {
            method: None,
            target: None,
            version: None,
            headers: Vec::new(),
        }
    }

    /// Parses a full request-line + header block out of `buf`. On
    /// `Status::Complete`, the wrapped value is the number of bytes of
    /// `buf` the request-line and header block occupied — everything
    /// from there on (a request body, or the next pipelined request) is
    /// left untouched for the caller to handle separately.
    ///
    /// # Example
    /// ```
    /// use wire::h1::request::H1Request;
    /// use wire::h1::Status;
    /// use wire::{Method, Version};
    ///
    /// let mut req = H1Request::new();
    /// let consumed = req.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    /// assert_eq!(Status::Complete(19), consumed);
    /// assert_eq!(Some(Method::Get), req.method);
    /// assert_eq!(Some("/"), req.target);
    /// assert_eq!(Some(Version::H1_1), req.version);
    /// ```
    pub fn parse(&mut self, buf: &'buf [u8]) -> Result<Status<usize>, ParseError> {
        // Require the full header block to be present; a partial request
        // is reported as `Status::Partial` rather than an error.
        if !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(Status::Partial);
        }

        let mut req = RawRequest::new(buf);
        self.set_method(&mut req)?;
        self.set_target(&mut req)?;
        self.set_version(&mut req)?;
        take_after_newline(&mut req)?;
        self.set_headers(&mut req)?;

        let consumed = buf.len() - req.len();
        Ok(Status::Complete(consumed))
    }

    /// Converts the zero-copy scratch state into an owned [`Request`].
    /// Panics (via `expect`) if called before a successful `parse` — this
    /// mirrors the teacher's state machine contract that `prepare_response`
    /// is only called after a complete parse transitions the connection to
    /// `Dispatched`.
    pub fn into_owned(self) -> Request {
        Request {
            method: self.method.expect("method must be set after a complete parse"),
            target: self
                .target
                .expect("target must be set after a complete parse")
                .to_owned(),
            version: self.version.expect("version must be set after a complete parse"),
            headers: self
                .headers
                .into_iter()
                .map(|h| (h.name.to_ascii_lowercase(), h.value.to_vec()))
                .collect(),
            body: Vec::new(),
        }
    }

    fn set_method(&mut self, buf: &mut RawRequest<'buf>) -> Result<(), ParseError> {
        let slice = buf
            .take_until(|b| b == b' ')
            .ok_or(ParseError::Method)?;

        self.method = Some(match slice {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            _ => return Err(ParseError::Method),
        });

        discard_whitespace(buf);
        Ok(())
    }

    fn set_target(&mut self, buf: &mut RawRequest<'buf>) -> Result<(), ParseError> {
        for &b in &mut *buf {
            if b == b' ' {
                let slice = buf.slice_skip(1).map_err(|_| ParseError::Target)?;
                // SAFETY: every byte accepted by `is_request_target_token`
                // is non-control, non-DEL ASCII, so this is valid UTF-8.
                self.target = Some(unsafe { from_utf8_unchecked(slice) });
                return Ok(());
            } else if !is_request_target_token(b) {
                return Err(ParseError::Target);
            }
        }

        Err(ParseError::Target)
    }

    fn set_version(&mut self, buf: &mut RawRequest<'buf>) -> Result<(), ParseError> {
        for &expected in b"HTTP/" {
            match buf.next() {
                Some(&b) if b == expected => {}
                _ => return Err(ParseError::Version),
            }
        }

        let version = match buf.next() {
            Some(b'1') => match buf.next() {
                Some(b'.') => match buf.next() {
                    Some(b'0') => Version::H1_0,
                    Some(b'1') => Version::H1_1,
                    _ => return Err(ParseError::Version),
                },
                _ => return Err(ParseError::Version),
            },
            Some(b'2') => Version::H2,
            Some(b'3') => Version::H3,
            _ => return Err(ParseError::Version),
        };

        buf.slice();
        self.version = Some(version);
        Ok(())
    }

    fn set_headers(&mut self, buf: &mut RawRequest<'buf>) -> Result<(), ParseError> {
        loop {
            // A bare CRLF terminates the header block.
            if buf.peek() == Some(b'\r') {
                buf.next();
                if buf.next() != Some(&b'\n') {
                    return Err(ParseError::NewLine);
                }
                buf.slice();
                return Ok(());
            }

            if self.headers.len() >= MAX_HEADERS {
                return Err(ParseError::TooManyHeaders);
            }

            let name = buf
                .take_until(|b| b == b':')
                .ok_or(ParseError::HeaderName)?;
            if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
                return Err(ParseError::HeaderName);
            }
            buf.next(); // consume ':'
            buf.slice();
            discard_required_whitespace_opt(buf);

            let value = buf
                .take_until(|b| b == b'\r')
                .unwrap_or_else(|| buf.slice());
            if !value.iter().all(|&b| is_header_value_token(b)) {
                return Err(ParseError::HeaderValue);
            }
            buf.next(); // consume '\r'
            if buf.next() != Some(&b'\n') {
                return Err(ParseError::NewLine);
            }
            buf.slice();

            // SAFETY: `is_tchar` only accepts ASCII, so `name` is valid UTF-8.
            let name = unsafe { from_utf8_unchecked(name) };
            self.headers.push(Header { name, value });
        }
    }
}

/// Header values may be empty (no required-whitespace guarantee like the
/// request line), so discard OWS without erroring if none is present.
#[inline]
fn discard_required_whitespace_opt(buf: &mut RawRequest<'_>) {
    discard_whitespace(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut req = H1Request::new();
        let input = b"GET /foo?a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let status = req.parse(input).unwrap();
        assert_eq!(Status::Complete(input.len()), status);
        assert_eq!(Some(Method::Get), req.method);
        assert_eq!(Some("/foo?a=1"), req.target);
        assert_eq!(Some(Version::H1_1), req.version);
        assert_eq!(1, req.headers.len());
        assert_eq!("host", req.headers[0].name);
        assert_eq!(b"example.com", req.headers[0].value);
    }

    #[test]
    fn reports_partial_without_full_header_block() {
        let mut req = H1Request::new();
        let status = req.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n").unwrap();
        assert_eq!(Status::Partial, status);
    }

    #[test]
    fn rejects_bad_method() {
        let mut req = H1Request::new();
        assert_eq!(Err(ParseError::Method), req.parse(b"GE T / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn into_owned_copies_out_headers() {
        let mut req = H1Request::new();
        req.parse(b"POST /job HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\n")
            .unwrap();
        let owned = req.into_owned();
        assert_eq!(Some(4), owned.content_length());
        assert!(!owned.keep_alive());
        assert_eq!("/job", owned.target);
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let mut req = H1Request::new();
        req.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.into_owned().keep_alive());

        let mut req = H1Request::new();
        req.parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.into_owned().keep_alive());
    }

    #[test]
    fn reports_bytes_consumed_separately_from_trailing_data() {
        let mut req = H1Request::new();
        let input = b"GET / HTTP/1.1\r\n\r\ntrailing-body-or-next-request";
        let header_len = b"GET / HTTP/1.1\r\n\r\n".len();
        match req.parse(input).unwrap() {
            Status::Complete(consumed) => assert_eq!(header_len, consumed),
            Status::Partial => panic!("expected a complete parse"),
        }
    }
}
