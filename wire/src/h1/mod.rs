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

//! HTTP/1.1 parser implementation

use core::fmt::Display;

use crate::raw_request::RawRequest;

pub mod request;
pub mod response;
mod tokens;

pub use request::{H1Request, Header};
pub use response::{Response, ResponseBuilder};

/// Possible failures while parsing an HTTP/1.1 message.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method.
    Method,
    /// Invalid byte in target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
    /// Invalid whitespace.
    Whitespace,
    /// Too many headers for the fixed-size header slice.
    TooManyHeaders,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "invalid token in method",
            ParseError::Target => "invalid token in target",
            ParseError::Version => "invalid version",
            ParseError::HeaderName => "invalid token in header name",
            ParseError::HeaderValue => "invalid token in header value",
            ParseError::NewLine => "invalid or missing new line",
            ParseError::Whitespace => "invalid whitespace",
            ParseError::TooManyHeaders => "too many headers",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// The outcome of attempting to parse a (possibly incomplete) message.
#[derive(Debug, PartialEq, Eq)]
pub enum Status<T> {
    /// A complete value was parsed, consuming `T::len` or equivalent.
    Complete(T),
    /// Not enough bytes were available yet; the caller should read more and
    /// retry.
    Partial,
}

/// Result whose `Ok` variant reports parse completeness and whose `Err`
/// variant is [`ParseError`].
pub type ParseResult<T> = std::result::Result<Status<T>, ParseError>;

/// Consumes whitespace characters from `buf`.
/// Whitespace is defined by RFC 9110 Section 5.6.3:
/// ```abnf
/// OWS = *( SP / HTAB )
/// ```
#[inline]
pub fn discard_whitespace(buf: &mut RawRequest<'_>) {
    buf.take_until(|b| b != b' ' && b != b'\t');
}

/// Consumes whitespace characters from `buf`, requiring at least one.
/// ```abnf
/// RWS = 1*( SP / HTAB )
/// ```
#[inline]
pub fn discard_required_whitespace(buf: &mut RawRequest<'_>) -> Result<(), ParseError> {
    let pos = buf.pos();
    buf.take_until(|b| b != b' ' && b != b'\t');
    if pos == buf.pos() {
        return Err(ParseError::Whitespace);
    }
    Ok(())
}

/// Consumes `buf` up to and including the next `b"\r\n"` sequence.
#[inline]
pub fn take_after_newline(buf: &mut RawRequest<'_>) -> Result<(), ParseError> {
    loop {
        match buf.next() {
            Some(&b) => {
                if b == b'\r' && buf.peek() == Some(b'\n') {
                    buf.next();
                    buf.slice();
                    return Ok(());
                }
            }
            None => return Err(ParseError::NewLine),
        }
    }
}
