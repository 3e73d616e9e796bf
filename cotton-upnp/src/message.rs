//! The HTTP-style message codec shared by SSDP and description fetches
//!
//! SSDP reuses HTTP/1.1 framing over UDP: a start line, CRLF-separated
//! headers, a blank line, and an optional body. This module parses and
//! serializes that framing; the SSDP-specific meaning of individual
//! headers lives in [`crate::ssdp`].

use tracing::trace;

/// Errors from [`parse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The header block is not terminated yet; more bytes are needed
    #[error("incomplete message: no blank line terminating the headers")]
    UnexpectedEof,

    /// The bytes cannot be a message at all
    #[error("invalid message data")]
    InvalidData,
}

/// The first line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// For example `M-SEARCH * HTTP/1.1`
    Request {
        /// Upper-case method name, e.g. `NOTIFY`
        method: String,
        /// The request target, e.g. `*` or a path
        target: String,
    },

    /// For example `HTTP/1.1 200 OK`
    Response {
        /// Numeric status; `None` when the status text was not a number
        status: Option<u16>,
        /// The reason phrase, possibly empty
        reason: String,
    },
}

/// Ordered, case-insensitively-keyed, multi-valued header map
///
/// Headers keep the order in which they were first inserted, and the
/// spelling of the name as first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// The first value of the named header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
    }

    /// Every value of the named header, in arrival order
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    /// Whether the named header is present
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replace all values of the named header with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1 = vec![value],
            None => self.entries.push((name.to_string(), vec![value])),
        }
    }

    /// Add a further value for the named header
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((name.to_string(), vec![value])),
        }
    }

    /// Remove the named header; returns whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Every (name, value) pair, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| {
            values.iter().map(move |v| (name.as_str(), v.as_str()))
        })
    }

    /// Number of distinct header names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn extend_last(&mut self, text: &str) {
        if let Some(value) =
            self.entries.last_mut().and_then(|(_, v)| v.last_mut())
        {
            let text = text.trim_start();
            if !text.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(text);
            }
        }
    }
}

/// One parsed (or to-be-serialized) HTTP-style message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    start: StartLine,
    version: String,
    headers: Headers,
    body: Vec<u8>,
    body_pending: bool,
    compute_content_length: bool,
}

impl Message {
    /// A new HTTP/1.1 request
    pub fn request(method: &str, target: &str) -> Self {
        Self::with_start(StartLine::Request {
            method: method.to_ascii_uppercase(),
            target: target.to_string(),
        })
    }

    /// A new HTTP/1.1 response
    pub fn response(status: u16, reason: &str) -> Self {
        Self::with_start(StartLine::Response {
            status: Some(status),
            reason: reason.to_string(),
        })
    }

    fn with_start(start: StartLine) -> Self {
        Self {
            start,
            version: "1.1".to_string(),
            headers: Headers::default(),
            body: Vec::new(),
            body_pending: false,
            compute_content_length: true,
        }
    }

    /// The request line or status line
    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    /// Whether this is a request rather than a response
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// The request method, or `None` for a response
    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// The request target, or `None` for a response
    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// The response status, or `None` for a request or a non-numeric status
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => *status,
            StartLine::Request { .. } => None,
        }
    }

    /// The reason phrase, for responses
    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// Protocol version without the `HTTP/` prefix, e.g. "1.1"
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Set the HTTP version, e.g. `1.0`
    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    /// The version as (major, minor), if it is numeric
    pub fn version_number(&self) -> Option<(u32, u32)> {
        let (major, minor) = self.version.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Shorthand for `headers().get(name)`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Replace all values of the named header with one
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.body_pending = false;
    }

    /// True when the headers promised more body than the datagram held
    pub fn body_pending(&self) -> bool {
        self.body_pending
    }

    /// The parsed Content-Length header, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether serializing adds a Content-Length header (default: true)
    pub fn set_compute_content_length(&mut self, compute: bool) {
        self.compute_content_length = compute;
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all("Transfer-Encoding")
            .iter()
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Render to bytes
    ///
    /// HTTP/1.0 (and 0.9) responses have no framing worth sending, so
    /// for those only the body is produced.
    pub fn serialize(&self) -> Vec<u8> {
        let is_old = self.version == "1.0" || self.version == "0.9";
        if !self.is_request() && is_old {
            return self.body.clone();
        }

        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, target } => {
                // An empty path is sent as "/"
                let target = if target.is_empty() { "/" } else { target };
                out.push_str(&format!(
                    "{method} {target} HTTP/{}\r\n",
                    self.version
                ));
            }
            StartLine::Response { status, reason } => {
                let status = status.unwrap_or(0);
                out.push_str(&format!(
                    "HTTP/{} {status:03} {reason}\r\n",
                    self.version
                ));
            }
        }
        for (name, value) in self.headers.iter() {
            if self.compute_content_length
                && name.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if self.compute_content_length {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_start_line(line: &str) -> Result<(StartLine, String), Error> {
    if line.trim().is_empty() {
        return Err(Error::InvalidData);
    }

    if let Some(rest) = line.strip_prefix("HTTP/") {
        let (version, rest) = split_token(rest);
        let (status, reason) = split_token(rest);
        return Ok((
            StartLine::Response {
                status: status.parse::<u16>().ok(),
                reason: reason.trim_end().to_string(),
            },
            version.to_string(),
        ));
    }

    let tokens = line.split_whitespace().collect::<Vec<_>>();
    let Some((method, rest)) = tokens.split_first() else {
        return Err(Error::InvalidData);
    };
    let (target, version) =
        match rest.split_last().map(|(v, t)| (t, v.strip_prefix("HTTP/"))) {
            Some((target, Some(version))) => (target, version),
            _ => (rest, "0.9"),
        };
    if target.is_empty() {
        return Err(Error::InvalidData);
    }
    Ok((
        StartLine::Request {
            method: (*method).to_string(),
            target: target.join(" "),
        },
        version.to_string(),
    ))
}

/// The first whitespace-delimited token, and what follows it
fn split_token(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim_start()),
        None => (text, ""),
    }
}

/// Decode a chunked body; `None` when the final chunk hasn't arrived
fn decode_chunked(mut data: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let eol = data.windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&data[..eol]).ok()?;
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16).ok()?;
        data = &data[eol + 2..];
        if size == 0 {
            return Some(body);
        }
        if data.len() < size + 2 {
            return None;
        }
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

/// Parse one complete message from a datagram or buffer
///
/// Returns [`Error::UnexpectedEof`] if the blank line ending the headers
/// is missing, and [`Error::InvalidData`] if the header block is not
/// UTF-8 or has no start line.
pub fn parse(buf: &[u8]) -> Result<Message, Error> {
    let header_end = find_header_end(buf).ok_or(Error::UnexpectedEof)?;
    let text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::InvalidData)?;

    let mut lines = text.split("\r\n");
    let first = lines.next().ok_or(Error::InvalidData)?;
    let (start, version) = parse_start_line(first)?;

    let mut message = Message::with_start(start);
    message.version = version;

    let headerless =
        message.is_request() && message.version.as_str() == "0.9";
    if !headerless {
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                message.headers.extend_last(line);
            } else if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if name.is_empty() {
                    trace!("ignoring header line with empty name");
                    continue;
                }
                message.headers.append(name, value.trim_start());
            } else {
                // Not a header; maybe a broken continuation
                message.headers.extend_last(line);
            }
        }
    }

    let rest = &buf[header_end + 4..];
    if message.is_chunked() {
        match decode_chunked(rest) {
            Some(body) => message.body = body,
            None => message.body_pending = true,
        }
    } else {
        match message.content_length() {
            Some(0) => {}
            Some(n) if rest.len() >= n => message.body = rest[..n].to_vec(),
            Some(_) => message.body_pending = true,
            None => message.body = rest.to_vec(),
        }
    }

    Ok(message)
}
