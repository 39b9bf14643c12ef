//! Incremental HTTP/1.x wire parser.
//!
//! The parser is a plain state machine: every call to [`WireParser::feed`]
//! consumes as much of the chunk as it can, keeps an unfinished line in its
//! own buffer and reports what it saw as a list of [`ParserEvent`]s. Input may
//! be split at any byte; the produced events do not depend on where the
//! splits fall (body data aside, which is reported as it arrives).

use bytes::Bytes;
use http::Method;
use thiserror::Error;

/// Default limit for the start line plus header section of one message.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    MessageBegin,
    /// Method and request target are known.
    RequestLine { method: Method, target: String },
    StatusLine { code: u16, reason: String },
    HeaderField(Bytes),
    HeaderValue(Bytes),
    HeadersComplete,
    Body(Bytes),
    /// Size of the chunk that follows; the terminating chunk reports 0.
    ChunkHeader(u64),
    ChunkComplete,
    MessageComplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request method")]
    InvalidMethod,
    #[error("malformed start line")]
    InvalidStartLine,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("invalid status code")]
    InvalidStatus,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("missing CRLF after chunk data")]
    InvalidChunkTerminator,
    #[error("header section exceeds {0} bytes")]
    HeaderTooLarge(usize),
}

/// Result of one [`WireParser::feed`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub consumed: usize,
    pub events: Vec<ParserEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StartLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    UntilClose,
    /// A CONNECT head was completed; the rest of the stream is not HTTP.
    Upgraded,
}

impl Phase {
    fn is_head(self) -> bool {
        matches!(self, Phase::StartLine | Phase::Headers)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Framing {
    content_length: Option<u64>,
    transfer_encoding: bool,
    chunked: bool,
    connect: bool,
    bodyless: bool,
}

#[derive(Debug)]
pub struct WireParser {
    kind: MessageKind,
    phase: Phase,
    line: Vec<u8>,
    head_len: usize,
    max_header_size: usize,
    framing: Framing,
}

impl WireParser {
    pub fn new(kind: MessageKind, max_header_size: usize) -> Self {
        Self {
            kind,
            phase: Phase::StartLine,
            line: Vec::with_capacity(256),
            head_len: 0,
            max_header_size,
            framing: Framing::default(),
        }
    }

    pub fn request(max_header_size: usize) -> Self {
        Self::new(MessageKind::Request, max_header_size)
    }

    pub fn response(max_header_size: usize) -> Self {
        Self::new(MessageKind::Response, max_header_size)
    }

    #[cfg(test)]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// True once a CONNECT head has been parsed. The parser consumes nothing
    /// after that point.
    pub fn is_upgraded(&self) -> bool {
        self.phase == Phase::Upgraded
    }

    /// True when the parser sits between messages with no partial input.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::StartLine && self.line.is_empty()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Parsed, ParseError> {
        let mut parsed = Parsed::default();
        let mut pos = 0;

        while pos < chunk.len() {
            match self.phase {
                Phase::Upgraded => break,
                Phase::Body { remaining } => {
                    let n = take_len(remaining, chunk.len() - pos);
                    parsed
                        .events
                        .push(ParserEvent::Body(Bytes::copy_from_slice(&chunk[pos..pos + n])));
                    pos += n;
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.finish_message(&mut parsed.events);
                    } else {
                        self.phase = Phase::Body { remaining };
                    }
                }
                Phase::ChunkData { remaining } => {
                    let n = take_len(remaining, chunk.len() - pos);
                    parsed
                        .events
                        .push(ParserEvent::Body(Bytes::copy_from_slice(&chunk[pos..pos + n])));
                    pos += n;
                    let remaining = remaining - n as u64;
                    self.phase = if remaining == 0 {
                        Phase::ChunkDataEnd
                    } else {
                        Phase::ChunkData { remaining }
                    };
                }
                Phase::UntilClose => {
                    parsed
                        .events
                        .push(ParserEvent::Body(Bytes::copy_from_slice(&chunk[pos..])));
                    pos = chunk.len();
                }
                Phase::StartLine
                | Phase::Headers
                | Phase::ChunkSize
                | Phase::ChunkDataEnd
                | Phase::Trailers => {
                    let Some(line) = self.take_line(chunk, &mut pos)? else {
                        break;
                    };
                    self.on_line(&line, &mut parsed.events)?;
                }
            }
        }

        parsed.consumed = pos;
        Ok(parsed)
    }

    /// Appends bytes up to the next LF to the line buffer. Returns the
    /// completed line without its line terminator, or `None` when the chunk
    /// ran out first.
    fn take_line(&mut self, chunk: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, ParseError> {
        let rest = &chunk[*pos..];
        let (segment, complete) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], true),
            None => (rest, false),
        };

        if self.phase.is_head() {
            self.head_len += segment.len() + usize::from(complete);
            if self.head_len > self.max_header_size {
                return Err(ParseError::HeaderTooLarge(self.max_header_size));
            }
        } else if self.line.len() + segment.len() > self.max_header_size {
            return Err(ParseError::HeaderTooLarge(self.max_header_size));
        }

        self.line.extend_from_slice(segment);
        *pos += segment.len() + usize::from(complete);

        if !complete {
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn on_line(&mut self, line: &[u8], events: &mut Vec<ParserEvent>) -> Result<(), ParseError> {
        match self.phase {
            Phase::StartLine => {
                // Stray CRLFs between messages are tolerated.
                if line.is_empty() {
                    return Ok(());
                }
                events.push(ParserEvent::MessageBegin);
                match self.kind {
                    MessageKind::Request => {
                        let (method, target) = parse_request_line(line)?;
                        self.framing = Framing {
                            connect: method == Method::CONNECT,
                            ..Framing::default()
                        };
                        events.push(ParserEvent::RequestLine { method, target });
                    }
                    MessageKind::Response => {
                        let (code, reason) = parse_status_line(line)?;
                        self.framing = Framing {
                            bodyless: (100..200).contains(&code) || code == 204 || code == 304,
                            ..Framing::default()
                        };
                        events.push(ParserEvent::StatusLine { code, reason });
                    }
                }
                self.phase = Phase::Headers;
            }
            Phase::Headers if line.is_empty() => {
                events.push(ParserEvent::HeadersComplete);
                self.start_body(events)?;
            }
            Phase::Headers => {
                let (name, value) = split_header(line)?;
                self.observe_header(name, value)?;
                events.push(ParserEvent::HeaderField(Bytes::copy_from_slice(name)));
                events.push(ParserEvent::HeaderValue(Bytes::copy_from_slice(value)));
            }
            Phase::ChunkSize => {
                let size = parse_chunk_size(line)?;
                events.push(ParserEvent::ChunkHeader(size));
                self.phase = if size == 0 {
                    Phase::Trailers
                } else {
                    Phase::ChunkData { remaining: size }
                };
            }
            Phase::ChunkDataEnd => {
                if !line.is_empty() {
                    return Err(ParseError::InvalidChunkTerminator);
                }
                events.push(ParserEvent::ChunkComplete);
                self.phase = Phase::ChunkSize;
            }
            Phase::Trailers => {
                // Trailer fields are dropped.
                if line.is_empty() {
                    self.finish_message(events);
                }
            }
            Phase::Body { .. } | Phase::ChunkData { .. } | Phase::UntilClose | Phase::Upgraded => {}
        }
        Ok(())
    }

    fn observe_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), ParseError> {
        if name.eq_ignore_ascii_case(b"content-length") {
            let length = parse_content_length(value)?;
            match self.framing.content_length {
                Some(existing) if existing != length => return Err(ParseError::InvalidContentLength),
                _ => self.framing.content_length = Some(length),
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            let last = value
                .rsplit(|&b| b == b',')
                .next()
                .map(trim_ows)
                .unwrap_or_default();
            self.framing.transfer_encoding = true;
            self.framing.chunked = last.eq_ignore_ascii_case(b"chunked");
        }
        Ok(())
    }

    fn start_body(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), ParseError> {
        let framing = self.framing;
        match self.kind {
            MessageKind::Request => {
                if framing.connect {
                    events.push(ParserEvent::MessageComplete);
                    self.phase = Phase::Upgraded;
                    return Ok(());
                }
                if framing.transfer_encoding && !framing.chunked {
                    return Err(ParseError::InvalidTransferEncoding);
                }
                if framing.chunked {
                    self.phase = Phase::ChunkSize;
                } else {
                    match framing.content_length {
                        Some(length) if length > 0 => self.phase = Phase::Body { remaining: length },
                        _ => self.finish_message(events),
                    }
                }
            }
            MessageKind::Response => {
                if framing.bodyless {
                    self.finish_message(events);
                } else if framing.chunked {
                    self.phase = Phase::ChunkSize;
                } else if framing.transfer_encoding {
                    self.phase = Phase::UntilClose;
                } else {
                    match framing.content_length {
                        Some(0) => self.finish_message(events),
                        Some(length) => self.phase = Phase::Body { remaining: length },
                        None => self.phase = Phase::UntilClose,
                    }
                }
            }
        }
        Ok(())
    }

    fn finish_message(&mut self, events: &mut Vec<ParserEvent>) {
        events.push(ParserEvent::MessageComplete);
        self.phase = Phase::StartLine;
        self.framing = Framing::default();
        self.head_len = 0;
    }
}

fn take_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidStartLine)?;
    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidStartLine);
    };
    if method.is_empty() || target.is_empty() {
        return Err(ParseError::InvalidStartLine);
    }
    check_version(version)?;
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
    Ok((method, target.to_string()))
}

fn parse_status_line(line: &[u8]) -> Result<(u16, String), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidStartLine)?;
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStartLine)?;
    check_version(version)?;
    let code = parts.next().ok_or(ParseError::InvalidStatus)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidStatus);
    }
    let code = code.parse::<u16>().map_err(|_| ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((code, reason))
}

fn check_version(version: &str) -> Result<(), ParseError> {
    match version {
        "HTTP/1.1" | "HTTP/1.0" => Ok(()),
        _ => Err(ParseError::InvalidVersion),
    }
}

fn split_header(line: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
        return Err(ParseError::InvalidHeader);
    }
    Ok((name, trim_ows(&line[colon + 1..])))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn parse_content_length(value: &[u8]) -> Result<u64, ParseError> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::InvalidContentLength);
    }
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(ParseError::InvalidContentLength)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|&b| b == b';').next().map(trim_ows).unwrap_or_default();
    if size.is_empty() || size.len() > 16 {
        return Err(ParseError::InvalidChunkSize);
    }
    std::str::from_utf8(size)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or(ParseError::InvalidChunkSize)
}
