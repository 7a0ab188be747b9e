//! HTTP/1.x request inspection for tunneled conversations.
//!
//! Sits in the tunnel-to-upstream direction of an HTTP conversation. It finds
//! request header blocks, rewrites the `Host` header, and tracks where each
//! request body ends so the next request on a keep-alive connection can be
//! rewritten too. Only header blocks are ever held back; body bytes are
//! forwarded as soon as they arrive.
//!
//! Anything the inspector does not understand switches it off for the rest of
//! the conversation, after which bytes pass through untouched.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tpot_proto::ConversationId;
use tracing::{debug, trace};

use crate::config::HostRewrite;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Largest header block buffered while looking for its terminator
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Longest accepted chunk-size or trailer line
const MAX_CHUNK_LINE: usize = 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons inspection gives up on a conversation
#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("header block exceeds {MAX_HEADER_BLOCK} bytes")]
    HeaderTooLarge,

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head ends before the header terminator")]
    Incomplete,

    #[error("no Host header")]
    MissingHost,

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("body longer than its Content-Length by {0} bytes")]
    BodyOverflow(usize),

    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("chunk line longer than {MAX_CHUNK_LINE} bytes")]
    ChunkLineTooLong,

    #[error("chunk data not followed by CRLF")]
    MissingChunkCrlf,

    #[error("{0} bytes after the end of a chunked body")]
    TrailingBytes(usize),
}

#[derive(Debug)]
enum State {
    /// Waiting for (the rest of) a request header block
    Headers,
    /// Inside a body with a known length
    Length { remaining: u64 },
    /// Inside a chunked body
    Chunked(ChunkedBody),
    /// Request without keep-alive; everything after its head is raw
    Unframed,
    /// Inspection switched off for good
    Disabled,
}

/// HTTP request tracker for one conversation
#[derive(Debug)]
pub struct HttpInspector {
    id: ConversationId,
    rewrite: HostRewrite,
    state: State,
    /// Partial header block
    pending: BytesMut,
    completed_requests: u64,
}

impl HttpInspector {
    pub fn new(id: ConversationId, rewrite: HostRewrite) -> Self {
        Self {
            id,
            rewrite,
            state: State::Headers,
            pending: BytesMut::new(),
            completed_requests: 0,
        }
    }

    /// Whether the inspector is still interpreting bytes
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, State::Disabled)
    }

    /// Whether a request head has been seen whose body has not finished
    pub fn request_in_flight(&self) -> bool {
        matches!(
            self.state,
            State::Length { .. } | State::Chunked(_) | State::Unframed
        )
    }

    /// Number of requests whose end was observed
    pub fn completed_requests(&self) -> u64 {
        self.completed_requests
    }

    /// Feed bytes travelling towards the upstream. Returns the bytes that may
    /// be written upstream now, in order.
    pub fn inspect(&mut self, chunk: Bytes) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut input = chunk;

        loop {
            match &mut self.state {
                State::Disabled | State::Unframed => {
                    push_nonempty(&mut out, input);
                    return out;
                }

                State::Headers => {
                    if input.is_empty() {
                        return out;
                    }

                    let search_from = self.pending.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
                    self.pending.extend_from_slice(&input);

                    let Some(end) = find_terminator(&self.pending[search_from..])
                        .map(|at| search_from + at + HEADER_TERMINATOR.len())
                    else {
                        if self.pending.len() > MAX_HEADER_BLOCK {
                            self.disable(InspectionError::HeaderTooLarge);
                            push_nonempty(&mut out, self.pending.split().freeze());
                        }
                        return out;
                    };

                    let head = self.pending.split_to(end).freeze();
                    let rest = self.pending.split().freeze();

                    match self.begin_request(&head) {
                        Ok(rewritten) => {
                            out.push(rewritten);
                            input = rest;
                        }
                        Err(e) => {
                            self.disable(e);
                            out.push(head);
                            push_nonempty(&mut out, rest);
                            return out;
                        }
                    }
                }

                State::Length { remaining } => {
                    if input.is_empty() {
                        return out;
                    }

                    let len = input.len() as u64;
                    if len > *remaining {
                        let excess = (len - *remaining) as usize;
                        self.disable(InspectionError::BodyOverflow(excess));
                        out.push(input);
                        return out;
                    }

                    *remaining -= len;
                    let done = *remaining == 0;
                    out.push(input);
                    if done {
                        self.complete_request();
                    }
                    return out;
                }

                State::Chunked(body) => {
                    if input.is_empty() {
                        return out;
                    }

                    match body.feed(&input) {
                        Ok(None) => {
                            out.push(input);
                        }
                        Ok(Some(end)) if end == input.len() => {
                            out.push(input);
                            self.complete_request();
                        }
                        Ok(Some(end)) => {
                            self.disable(InspectionError::TrailingBytes(input.len() - end));
                            out.push(input);
                        }
                        Err(e) => {
                            self.disable(e);
                            out.push(input);
                        }
                    }
                    return out;
                }
            }
        }
    }

    /// Parse a complete header block, pick the body framing and return the
    /// block to forward.
    fn begin_request(&mut self, head: &Bytes) -> Result<Bytes, InspectionError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(head)? {
            httparse::Status::Complete(len) if len == head.len() => {}
            _ => return Err(InspectionError::Incomplete),
        }

        let (Some(method), Some(path)) = (req.method, req.path) else {
            return Err(InspectionError::Incomplete);
        };
        debug!("[http-{}] {} {}", self.id, method, path);

        let host = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .ok_or(InspectionError::MissingHost)?;
        let host_span = value_span(head, host.value).ok_or(InspectionError::MissingHost)?;

        let keep_alive = match find_header(req.headers, "connection") {
            Some(value) => contains_ignore_case(value, b"keep-alive"),
            None => true,
        };

        let framing = if !keep_alive {
            State::Unframed
        } else if find_header(req.headers, "transfer-encoding")
            .is_some_and(|v| contains_ignore_case(v, b"chunked"))
        {
            State::Chunked(ChunkedBody::new())
        } else if let Some(value) = find_header(req.headers, "content-length") {
            let text = String::from_utf8_lossy(value);
            let length: u64 = text
                .trim()
                .parse()
                .map_err(|_| InspectionError::InvalidContentLength(text.to_string()))?;
            State::Length { remaining: length }
        } else {
            State::Length { remaining: 0 }
        };

        let forwarded = match self.rewrite.host() {
            Some(new_host) => {
                let (start, end) = host_span;
                let mut buf = BytesMut::with_capacity(head.len() - (end - start) + new_host.len());
                buf.extend_from_slice(&head[..start]);
                buf.extend_from_slice(new_host.as_bytes());
                buf.extend_from_slice(&head[end..]);
                buf.freeze()
            }
            None => head.clone(),
        };

        match framing {
            State::Length { remaining: 0 } => self.complete_request(),
            State::Unframed => {
                debug!("[http-{}] Request is not keep-alive, forwarding the rest raw", self.id);
                self.state = State::Unframed;
            }
            other => self.state = other,
        }

        Ok(forwarded)
    }

    fn complete_request(&mut self) {
        self.completed_requests += 1;
        self.state = State::Headers;
        trace!(
            "[http-{}] Request {} complete",
            self.id,
            self.completed_requests
        );
    }

    fn disable(&mut self, reason: InspectionError) {
        debug!("[http-{}] Disabling HTTP inspection: {}", self.id, reason);
        self.state = State::Disabled;
    }
}

fn push_nonempty(out: &mut Vec<Bytes>, bytes: Bytes) {
    if !bytes.is_empty() {
        out.push(bytes);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn find_header<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Byte range of `value` inside `head`, if it really points into it
fn value_span(head: &[u8], value: &[u8]) -> Option<(usize, usize)> {
    let start = (value.as_ptr() as usize).checked_sub(head.as_ptr() as usize)?;
    let end = start.checked_add(value.len())?;
    (end <= head.len()).then_some((start, end))
}

#[derive(Debug)]
enum ChunkPhase {
    /// Reading a chunk-size line
    Size(Vec<u8>),
    /// Inside chunk data
    Data(u64),
    /// Expecting the CRLF after chunk data; holds how much of it was seen
    DataCrlf(usize),
    /// Reading trailer lines after the last chunk
    Trailer(Vec<u8>),
}

/// Incremental chunked transfer-coding tracker
#[derive(Debug)]
struct ChunkedBody {
    phase: ChunkPhase,
}

impl ChunkedBody {
    fn new() -> Self {
        Self {
            phase: ChunkPhase::Size(Vec::new()),
        }
    }

    /// Consume body bytes. Returns the offset just past the final empty
    /// trailer line once the body is complete.
    fn feed(&mut self, data: &[u8]) -> Result<Option<usize>, InspectionError> {
        let mut pos = 0;

        while pos < data.len() {
            let next = match &mut self.phase {
                ChunkPhase::Size(line) => {
                    let (taken, line_done) = take_line(line, &data[pos..])?;
                    pos += taken;
                    if !line_done {
                        None
                    } else {
                        match parse_chunk_size(line)? {
                            0 => Some(ChunkPhase::Trailer(Vec::new())),
                            size => Some(ChunkPhase::Data(size)),
                        }
                    }
                }

                ChunkPhase::Data(remaining) => {
                    let available = (data.len() - pos) as u64;
                    let take = available.min(*remaining);
                    pos += take as usize;
                    *remaining -= take;
                    (*remaining == 0).then_some(ChunkPhase::DataCrlf(0))
                }

                ChunkPhase::DataCrlf(seen) => {
                    if data[pos] != b"\r\n"[*seen] {
                        return Err(InspectionError::MissingChunkCrlf);
                    }
                    pos += 1;
                    *seen += 1;
                    (*seen == 2).then(|| ChunkPhase::Size(Vec::new()))
                }

                ChunkPhase::Trailer(line) => {
                    let (taken, line_done) = take_line(line, &data[pos..])?;
                    pos += taken;
                    if line_done {
                        if line.as_slice() == b"\r\n" {
                            return Ok(Some(pos));
                        }
                        line.clear();
                    }
                    None
                }
            };

            if let Some(phase) = next {
                self.phase = phase;
            }
        }

        Ok(None)
    }
}

/// Append bytes up to and including the next `\n` to `line`. Returns how many
/// bytes were taken and whether the line is now complete.
fn take_line(line: &mut Vec<u8>, data: &[u8]) -> Result<(usize, bool), InspectionError> {
    let (taken, done) = match data.iter().position(|&b| b == b'\n') {
        Some(at) => (at + 1, true),
        None => (data.len(), false),
    };

    if line.len() + taken > MAX_CHUNK_LINE {
        return Err(InspectionError::ChunkLineTooLong);
    }
    line.extend_from_slice(&data[..taken]);
    Ok((taken, done))
}

/// Parse `<hex>[;ext]\r\n`
fn parse_chunk_size(line: &[u8]) -> Result<u64, InspectionError> {
    let line = line
        .strip_suffix(b"\r\n")
        .ok_or(InspectionError::InvalidChunkSize)?;
    let size = match line.iter().position(|&b| b == b';') {
        Some(at) => &line[..at],
        None => line,
    };
    let is_space = |b: &u8| *b == b' ' || *b == b'\t';
    let start = size.iter().position(|b| !is_space(b)).unwrap_or(size.len());
    let end = size.iter().rposition(|b| !is_space(b)).map_or(start, |at| at + 1);
    let size = &size[start..end];

    if size.is_empty() || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(InspectionError::InvalidChunkSize);
    }

    let text = std::str::from_utf8(size).map_err(|_| InspectionError::InvalidChunkSize)?;
    u64::from_str_radix(text, 16).map_err(|_| InspectionError::InvalidChunkSize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector(rewrite: &str) -> HttpInspector {
        HttpInspector::new(1, HostRewrite::To(rewrite.to_string()))
    }

    fn feed_all(inspector: &mut HttpInspector, pieces: &[&[u8]]) -> Vec<u8> {
        let mut forwarded = Vec::new();
        for piece in pieces {
            for out in inspector.inspect(Bytes::copy_from_slice(piece)) {
                forwarded.extend_from_slice(&out);
            }
        }
        forwarded
    }

    #[test]
    fn test_host_rewrite_preserves_everything_else() {
        let mut inspector = inspector("new.example");
        let out = feed_all(
            &mut inspector,
            &[b"GET /x HTTP/1.1\r\nHost: old.example:1234\r\n\r\n"],
        );

        assert_eq!(out, b"GET /x HTTP/1.1\r\nHost: new.example\r\n\r\n");
        assert_eq!(inspector.completed_requests(), 1);
        assert!(!inspector.request_in_flight());
    }

    #[test]
    fn test_header_block_forwarded_as_one_write() {
        let mut inspector = inspector("backend:8080");
        let request = b"POST /api HTTP/1.1\r\nhost: public.example\r\nX-Other: 1\r\n\r\n";

        assert!(inspector.inspect(Bytes::copy_from_slice(&request[..10])).is_empty());
        assert!(inspector.inspect(Bytes::copy_from_slice(&request[10..30])).is_empty());
        let out = inspector.inspect(Bytes::copy_from_slice(&request[30..]));

        assert_eq!(out.len(), 1);
        assert_eq!(
            &out[0][..],
            b"POST /api HTTP/1.1\r\nhost: backend:8080\r\nX-Other: 1\r\n\r\n"
        );
    }

    #[test]
    fn test_terminator_split_across_writes() {
        let mut inspector = inspector("b");
        let out = feed_all(&mut inspector, &[b"GET / HTTP/1.1\r\nHost: a\r\n\r", b"\n"]);

        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: b\r\n\r\n");
        assert_eq!(inspector.completed_requests(), 1);
    }

    #[test]
    fn test_rewrite_disabled_keeps_host() {
        let mut inspector = HttpInspector::new(1, HostRewrite::Disabled);
        let request = b"GET / HTTP/1.1\r\nHost: keep.me\r\nContent-Length: 2\r\n\r\nok";
        let out = feed_all(&mut inspector, &[request]);

        assert_eq!(out, request);
        assert_eq!(inspector.completed_requests(), 1);
        assert!(inspector.is_enabled());
    }

    #[test]
    fn test_content_length_body_then_next_request() {
        let mut inspector = inspector("up");
        let out = feed_all(
            &mut inspector,
            &[
                b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhel",
                b"lo",
                b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n",
            ],
        );

        assert_eq!(
            out,
            b"POST / HTTP/1.1\r\nHost: up\r\nContent-Length: 5\r\n\r\nhelloGET /2 HTTP/1.1\r\nHost: up\r\n\r\n"
        );
        assert_eq!(inspector.completed_requests(), 2);
        assert!(inspector.is_enabled());
    }

    #[test]
    fn test_content_length_overflow_disables() {
        let mut inspector = inspector("up");
        let out = feed_all(
            &mut inspector,
            &[
                b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\n",
                b"abcGET / HTTP/1.1\r\nHost: a\r\n\r\n",
            ],
        );

        assert!(!inspector.is_enabled());
        assert_eq!(inspector.completed_requests(), 0);
        assert!(out.ends_with(b"abcGET / HTTP/1.1\r\nHost: a\r\n\r\n"));
    }

    #[test]
    fn test_invalid_content_length_disables() {
        let mut inspector = inspector("up");
        let request = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: lots\r\n\r\n";
        let out = feed_all(&mut inspector, &[request]);

        assert_eq!(out, request);
        assert!(!inspector.is_enabled());
    }

    #[test]
    fn test_chunked_body_survives_every_split() {
        let head = b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n";
        let body = b"3\r\nabc\r\n0\r\n\r\n";

        for split in 1..body.len() {
            let mut inspector = inspector("a");
            let mut forwarded = feed_all(&mut inspector, &[head]);
            assert!(inspector.request_in_flight());

            forwarded.extend(feed_all(&mut inspector, &[&body[..split], &body[split..]]));

            assert_eq!(&forwarded[head.len()..], body, "split at {}", split);
            assert_eq!(inspector.completed_requests(), 1, "split at {}", split);
            assert!(inspector.is_enabled(), "split at {}", split);

            let next = feed_all(&mut inspector, &[b"GET /n HTTP/1.1\r\nHost: z\r\n\r\n"]);
            assert_eq!(next, b"GET /n HTTP/1.1\r\nHost: a\r\n\r\n");
            assert_eq!(inspector.completed_requests(), 2);
        }
    }

    #[test]
    fn test_chunked_body_byte_by_byte() {
        let mut inspector = inspector("a");
        feed_all(
            &mut inspector,
            &[b"PUT / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n"],
        );

        let body = b"a;name=val\r\n0123456789\r\n1\r\nx\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut forwarded = Vec::new();
        for byte in body.iter() {
            for out in inspector.inspect(Bytes::copy_from_slice(&[*byte])) {
                forwarded.extend_from_slice(&out);
            }
        }

        assert_eq!(forwarded, body);
        assert_eq!(inspector.completed_requests(), 1);
    }

    #[test]
    fn test_chunked_trailing_bytes_disable() {
        let mut inspector = inspector("a");
        feed_all(
            &mut inspector,
            &[b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n"],
        );
        let out = feed_all(&mut inspector, &[b"0\r\n\r\nGET"]);

        assert_eq!(out, b"0\r\n\r\nGET");
        assert!(!inspector.is_enabled());
        assert_eq!(inspector.completed_requests(), 0);
    }

    #[test]
    fn test_chunked_bad_size_disables() {
        let mut inspector = inspector("a");
        feed_all(
            &mut inspector,
            &[b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n"],
        );
        feed_all(&mut inspector, &[b"zz\r\n"]);
        assert!(!inspector.is_enabled());
    }

    #[test]
    fn test_chunk_data_without_crlf_disables() {
        let mut inspector = inspector("a");
        feed_all(
            &mut inspector,
            &[b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n"],
        );
        feed_all(&mut inspector, &[b"2\r\nabX"]);
        assert!(!inspector.is_enabled());
    }

    #[test]
    fn test_missing_host_disables_permanently() {
        let mut inspector = inspector("rewritten");
        let first = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        let second = b"GET / HTTP/1.1\r\nHost: original\r\n\r\n";

        let out = feed_all(&mut inspector, &[first, second]);

        let mut expected = first.to_vec();
        expected.extend_from_slice(second);
        assert_eq!(out, expected);
        assert!(!inspector.is_enabled());
        assert_eq!(inspector.completed_requests(), 0);
    }

    #[test]
    fn test_garbage_request_line_disables() {
        let mut inspector = inspector("x");
        let junk = b"\x16\x03\x01 not http at all\r\n\r\nmore";
        let out = feed_all(&mut inspector, &[junk]);

        assert_eq!(out, junk);
        assert!(!inspector.is_enabled());
    }

    #[test]
    fn test_oversized_header_block_is_flushed() {
        let mut inspector = inspector("x");
        let mut big = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        big.resize(MAX_HEADER_BLOCK + 1, b'a');

        let out = feed_all(&mut inspector, &[&big]);
        assert_eq!(out, big);
        assert!(!inspector.is_enabled());
    }

    #[test]
    fn test_connection_close_forwards_rest_raw() {
        let mut inspector = inspector("up");
        let out = feed_all(
            &mut inspector,
            &[
                b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
                b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
            ],
        );

        assert_eq!(
            out,
            b"GET / HTTP/1.1\r\nHost: up\r\nConnection: close\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n"
        );
        assert!(inspector.request_in_flight());
        assert_eq!(inspector.completed_requests(), 0);
    }

    #[test]
    fn test_explicit_keep_alive_header() {
        let mut inspector = inspector("up");
        feed_all(
            &mut inspector,
            &[b"GET / HTTP/1.0\r\nHost: a\r\nConnection: Keep-Alive\r\n\r\n"],
        );
        assert_eq!(inspector.completed_requests(), 1);
        assert!(!inspector.request_in_flight());
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1A\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0\r\n").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"ff ; ext=1\r\n").unwrap(), 255);
        assert!(parse_chunk_size(b"\r\n").is_err());
        assert!(parse_chunk_size(b"+5\r\n").is_err());
        assert!(parse_chunk_size(b"5\n").is_err());
    }
}
