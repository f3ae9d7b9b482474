//! HTTP/1.x request framing.
//!
//! Only requests are understood. A request is complete once its header section has been parsed
//! and its body is fully available, framed either by `Content-Length`, by
//! `Transfer-Encoding: chunked` (decoded here), or absent.

use std::{fmt::Write as _, io, str};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use replay_common::constants::MiB;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// The maximum number of headers in a request.
pub const MAX_HEADERS: usize = 64;

/// The default limit on the size of the header section, in bytes.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// The default limit on the size of a request body, in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * MiB as usize;

/// Size limits applied while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of the request line and headers.
    pub max_header_bytes: usize,
    /// Maximum size of the body. Chunked bodies are measured decoded.
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_header_bytes: DEFAULT_MAX_HEADER_BYTES, max_body_bytes: DEFAULT_MAX_BODY_BYTES }
    }
}

impl Limits {
    pub const fn max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    pub const fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Malformed request: {0}")]
    Parse(#[from] httparse::Error),
    #[error("Invalid method: {0}")]
    Method(#[from] http::method::InvalidMethod),
    #[error("Invalid request target: {0}")]
    Target(#[from] http::uri::InvalidUri),
    #[error("Invalid header: {0}")]
    Header(String),
    #[error("Invalid Content-Length")]
    ContentLength,
    #[error("Malformed chunked body")]
    Chunked,
    #[error("Header section exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("Body exceeds {limit} bytes")]
    BodyTooLarge {
        limit: usize,
        /// Number of bytes the whole request occupies, if its body is length-delimited.
        skip: Option<usize>,
    },
}

/// A complete HTTP/1.x request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpRequest {
    /// Creates an HTTP/1.1 request without headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, version: Version::HTTP_11, headers: HeaderMap::new(), body: Bytes::new() }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the path and query of the request target, `/` if the target has none
    /// (authority-form or `*`).
    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Returns the target host, from an absolute-form target or the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri
            .host()
            .or_else(|| self.headers.get(header::HOST).and_then(|v| v.to_str().ok()))
    }

    pub fn into_parts(self) -> (Method, Uri, HeaderMap, Bytes) {
        (self.method, self.uri, self.headers, self.body)
    }

    /// Serializes the request, headers and body included.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(256 + self.body.len());
        self.write_to(&mut dst);
        dst.freeze()
    }

    /// Writes the request to `dst`. `Transfer-Encoding` is dropped since the body is stored
    /// decoded, and `Content-Length` is rewritten to the stored body length.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let target = self.uri.to_string();
        dst.reserve(self.method.as_str().len() + target.len() + 64 + self.body.len());

        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_slice(match self.version {
            Version::HTTP_10 => b" HTTP/1.0\r\n",
            _ => b" HTTP/1.1\r\n",
        });

        for (name, value) in self.headers.iter() {
            if *name == header::TRANSFER_ENCODING || *name == header::CONTENT_LENGTH {
                continue;
            }
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        if !self.body.is_empty() || self.headers.contains_key(header::CONTENT_LENGTH) {
            dst.put_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }

        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
    }
}

/// How the body of a request is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

impl Framing {
    fn from_headers(headers: &HeaderMap) -> Result<Self, HttpError> {
        // Transfer-Encoding overrides Content-Length (RFC 7230 §3.3.3)
        let chunked = headers.get_all(header::TRANSFER_ENCODING).iter().any(|v| {
            v.to_str().map(|s| s.to_ascii_lowercase().contains("chunked")).unwrap_or(false)
        });
        if chunked {
            return Ok(Self::Chunked);
        }

        let mut length = None;
        for value in headers.get_all(header::CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or(HttpError::ContentLength)?;

            // Repeated Content-Length headers must agree
            if length.is_some_and(|l| l != parsed) {
                return Err(HttpError::ContentLength);
            }
            length = Some(parsed);
        }

        Ok(match length {
            Some(0) | None => Self::Empty,
            Some(n) => Self::Length(n),
        })
    }
}

/// Tries to parse one request from the front of `src`.
///
/// Returns `Ok(None)` if more bytes are needed, or the request together with the number of
/// bytes it occupies in `src`. A body declared larger than the limit fails as soon as the
/// header section is parsed, without waiting for the body.
pub fn parse_request(src: &[u8], limits: Limits) -> Result<Option<(HttpRequest, usize)>, HttpError> {
    let max_header_bytes = limits.max_header_bytes;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(src)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if src.len() > max_header_bytes {
                return Err(HttpError::HeaderTooLarge(max_header_bytes));
            }
            return Ok(None);
        }
    };

    if head_len > max_header_bytes {
        return Err(HttpError::HeaderTooLarge(max_header_bytes));
    }

    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())?;
    let uri = parse_target(req.path.unwrap_or_default())?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| HttpError::Header(e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| HttpError::Header(e.to_string()))?;
        header_map.append(name, value);
    }

    let body_src = &src[head_len..];
    let (body, body_len) = match Framing::from_headers(&header_map)? {
        Framing::Empty => (Bytes::new(), 0),
        Framing::Length(n) => {
            if n > limits.max_body_bytes {
                return Err(HttpError::BodyTooLarge { limit: limits.max_body_bytes, skip: head_len.checked_add(n) });
            }
            if body_src.len() < n {
                return Ok(None);
            }
            (Bytes::copy_from_slice(&body_src[..n]), n)
        }
        Framing::Chunked => match decode_chunked(body_src, limits.max_body_bytes)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        },
    };

    let request = HttpRequest { method, uri, version, headers: header_map, body };

    Ok(Some((request, head_len + body_len)))
}

/// Parses a request target. Characters a lenient client sends but [`Uri`] rejects, like the
/// braces of JSON in a query string, are percent-encoded first.
fn parse_target(raw: &str) -> Result<Uri, HttpError> {
    match raw.parse::<Uri>() {
        Ok(uri) => Ok(uri),
        Err(_) => Ok(escape_target(raw).parse::<Uri>()?),
    }
}

fn escape_target(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 16);
    for &b in raw.as_bytes() {
        if needs_escape(b) {
            let _ = write!(escaped, "%{b:02X}");
        } else {
            escaped.push(char::from(b));
        }
    }
    escaped
}

const fn needs_escape(b: u8) -> bool {
    matches!(b, 0..=0x20 | b'"' | b'<' | b'>' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}' | 0x7F..=0xFF)
}

/// Returns `true` if `src` starts with a complete HTTP/1.1 request head carrying
/// `Expect: 100-continue`.
pub fn expects_continue(src: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(src) {
        Ok(httparse::Status::Complete(_)) if req.version == Some(1) => req.headers.iter().any(|h| {
            h.name.eq_ignore_ascii_case("expect") && h.value.eq_ignore_ascii_case(b"100-continue")
        }),
        _ => false,
    }
}

/// Decodes a chunked body. Returns the decoded bytes and the number of encoded bytes consumed,
/// trailers included, or `None` if the body is incomplete.
fn decode_chunked(src: &[u8], max_body_bytes: usize) -> Result<Option<(Bytes, usize)>, HttpError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = find_crlf(&src[pos..]) else {
            return Ok(None);
        };

        // Chunk extensions after `;` are ignored
        let size_field = src[pos..pos + line_len].split(|b| *b == b';').next().unwrap_or_default();
        let size_field = str::from_utf8(size_field).map_err(|_| HttpError::Chunked)?.trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|_| HttpError::Chunked)?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section, terminated by an empty line
            loop {
                let Some(len) = find_crlf(&src[pos..]) else {
                    return Ok(None);
                };
                pos += len + 2;
                if len == 0 {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        if body.len().saturating_add(size) > max_body_bytes {
            return Err(HttpError::BodyTooLarge { limit: max_body_bytes, skip: None });
        }

        let data_end = pos.checked_add(size).ok_or(HttpError::Chunked)?;
        let chunk_end = data_end.checked_add(2).ok_or(HttpError::Chunked)?;
        if src.len() < chunk_end {
            return Ok(None);
        }

        body.extend_from_slice(&src[pos..data_end]);
        if &src[data_end..chunk_end] != b"\r\n" {
            return Err(HttpError::Chunked);
        }
        pos = chunk_end;
    }
}

#[inline]
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

/// Discards bytes up to and including the next line terminator, or everything if there is none.
/// Returns the number of bytes discarded. Used to resynchronize after a malformed request.
pub fn discard_line(src: &mut BytesMut) -> usize {
    let n = src.iter().position(|b| *b == b'\n').map_or(src.len(), |i| i + 1);
    src.advance(n);
    n
}

/// Returns `true` if `data` starts like an HTTP/1.x response.
#[inline]
pub fn looks_like_response(data: &[u8]) -> bool {
    data.starts_with(b"HTTP/1.")
}

/// Codec for HTTP/1.x requests, usable with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone, Default)]
pub struct RequestCodec {
    limits: Limits,
}

impl RequestCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum size of a request header section.
    pub fn max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.limits.max_header_bytes = max_header_bytes;
        self
    }

    /// Sets the maximum size of a request body.
    pub fn max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.limits.max_body_bytes = max_body_bytes;
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

impl Decoder for RequestCodec {
    type Item = HttpRequest;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_request(src, self.limits)? {
            Some((request, consumed)) => {
                src.advance(consumed);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<HttpRequest> for RequestCodec {
    type Error = HttpError;

    fn encode(&mut self, item: HttpRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}
