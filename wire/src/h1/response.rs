//! Response model
//!
//! The teacher's original `Response` only supported a bare status line. This
//! generalizes it into a builder that can carry headers and a body, since
//! `dispatch::Handler`s need to produce arbitrary JSON/text responses, not
//! just `204 No Content`.

use crate::{Status, Version};

/// A fully-formed HTTP/1.1 response ready to be written to a socket.
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: Status,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    /// Starts building a response with just a status line.
    pub fn new_with_status_line(version: Version, status: Status) -> Self {
        Response {
            version,
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Returns a [`ResponseBuilder`] for `status`, defaulting to HTTP/1.1.
    pub fn builder(status: Status) -> ResponseBuilder {
        ResponseBuilder::new(status)
    }

    /// The response's status code.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Serializes the response (status line, headers, body) into bytes
    /// ready to be written to the connection's write buffer. A
    /// `Content-Length` header is added automatically unless the caller
    /// already set `Transfer-Encoding: chunked`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason_phrase().as_bytes());
        out.extend_from_slice(b"\r\n");

        let is_chunked = self
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !is_chunked
            && !self
                .headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// The serialized bytes as a `String`, for logging/diagnostics and the
    /// handful of tests that assert on textual output. Not used on the hot
    /// write path (that uses [`Self::serialize`]'s raw bytes directly).
    pub fn get_serialized(&self) -> String {
        String::from_utf8_lossy(&self.serialize()).into_owned()
    }
}

/// Builder for [`Response`].
#[derive(Debug)]
pub struct ResponseBuilder {
    version: Version,
    status: Status,
    headers: Vec<(String, String)>,
}

impl ResponseBuilder {
    /// Starts a new builder for `status`, defaulting to HTTP/1.1.
    pub fn new(status: Status) -> Self {
        ResponseBuilder {
            version: Version::H1_1,
            status,
            headers: Vec::new(),
        }
    }

    /// Overrides the default HTTP/1.1 version (e.g. to echo back a
    /// client's HTTP/1.0 request).
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header field.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Finalizes the response with a body, computing `Content-Length`
    /// unless already set.
    pub fn body(self, body: impl Into<Vec<u8>>) -> Response {
        Response {
            version: self.version,
            status: self.status,
            headers: self.headers,
            body: body.into(),
        }
    }

    /// Finalizes the response with an empty body (e.g. `204 No Content`).
    pub fn empty(self) -> Response {
        self.body(Vec::new())
    }

    /// Finalizes the response with `Transfer-Encoding: chunked` set and no
    /// body of its own; chunk bytes are streamed separately by the
    /// `dispatch` crate's chunked-task machinery.
    pub fn chunked(mut self) -> Response {
        self.headers.push(("transfer-encoding".into(), "chunked".into()));
        Response {
            version: self.version,
            status: self.status,
            headers: self.headers,
            body: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_content_serializes_status_line_only() {
        let resp = Response::new_with_status_line(Version::H1_1, Status::NoContent);
        let serialized = resp.get_serialized();
        assert!(serialized.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(serialized.ends_with("content-length: 0\r\n\r\n"));
    }

    #[test]
    fn builder_adds_content_length_automatically() {
        let resp = Response::builder(Status::Ok)
            .header("content-type", "application/json")
            .body(br#"{"a":1}"#.to_vec());
        let serialized = resp.get_serialized();
        assert!(serialized.contains("content-length: 7"));
        assert!(serialized.contains("content-type: application/json"));
        assert!(serialized.ends_with(r#"{"a":1}"#));
    }

    #[test]
    fn chunked_response_omits_content_length() {
        let resp = Response::builder(Status::Ok).chunked();
        let serialized = resp.get_serialized();
        assert!(serialized.contains("transfer-encoding: chunked"));
        assert!(!serialized.contains("content-length"));
    }
}
