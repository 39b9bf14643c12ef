//! Request relay: turns wire parser events into upstream actions.
//!
//! The relay does no I/O. The session feeds it [`ParserEvent`]s and connect
//! results, and executes the [`RelayAction`]s it hands back in order.

use crate::error::ProxyError;
use crate::parser::ParserEvent;
use crate::upstream::{Origin, Target};
use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use log::debug;

pub const CONNECT_FAILED_RESPONSE: &[u8] =
    b"HTTP/1.0 500 Unable to connect\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n";

pub const DEFAULT_PROXY_AGENT: &str = "MetaGate Proxy";

/// Hop-by-hop header that never leaves the proxy.
const PROXY_CONNECTION: &[u8] = b"proxy-connection";

pub fn connection_established(proxy_agent: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.0 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
        proxy_agent
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    MethodKnown,
    HeadersStreaming,
    HeadersDone,
    BodyStreaming,
    Complete,
    /// CONNECT seen, waiting for the end of its head.
    TunnelPending,
    /// CONNECT acknowledged; the session now relays raw bytes.
    TunnelReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    Connect(Target),
    WriteUpstream(Bytes),
    /// Send these bytes to the client, then end the session.
    RespondAndClose(Bytes),
    /// Send the acknowledgement to the client and switch to tunnelling.
    AcknowledgeTunnel(Bytes),
    /// End the session without writing anything.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    TunnelPending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderSlot {
    Idle,
    AwaitingValue(Bytes),
}

/// Request line and header bookkeeping, alive from the request line until
/// the header section is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub method: Method,
    pub path: String,
    pub headers_forwarded: usize,
    pub headers_dropped: usize,
}

impl PendingRequest {
    fn request_line(&self) -> Bytes {
        Bytes::from(format!("{} {} HTTP/1.1\r\n", self.method, self.path))
    }
}

#[derive(Debug)]
pub struct RequestRelay {
    state: RelayState,
    slot: HeaderSlot,
    pending: Option<PendingRequest>,
    connecting: Option<Origin>,
    upstream: Option<Origin>,
    upstream_open: bool,
    tunnel_host: Option<String>,
    chunked: bool,
    proxy_agent: String,
}

impl RequestRelay {
    pub fn new(proxy_agent: impl Into<String>) -> Self {
        Self {
            state: RelayState::Idle,
            slot: HeaderSlot::Idle,
            pending: None,
            connecting: None,
            upstream: None,
            upstream_open: false,
            tunnel_host: None,
            chunked: false,
            proxy_agent: proxy_agent.into(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_tunnel(&self) -> bool {
        self.tunnel_host.is_some()
    }

    pub fn tunnel_host(&self) -> Option<&str> {
        self.tunnel_host.as_deref()
    }

    pub fn upstream_origin(&self) -> Option<&Origin> {
        self.upstream.as_ref()
    }

    /// The upstream connection went away; later writes become no-ops.
    pub fn upstream_closed(&mut self) {
        self.upstream_open = false;
    }

    pub fn apply(&mut self, event: ParserEvent) -> Result<Vec<RelayAction>, ProxyError> {
        let actions = match event {
            ParserEvent::MessageBegin => {
                self.state = RelayState::Idle;
                self.slot = HeaderSlot::Idle;
                self.chunked = false;
                Vec::new()
            }
            ParserEvent::RequestLine { method, target } => self.on_request_line(method, &target)?,
            ParserEvent::HeaderField(name) => {
                self.slot = HeaderSlot::AwaitingValue(name);
                Vec::new()
            }
            ParserEvent::HeaderValue(value) => self.on_header_value(value),
            ParserEvent::HeadersComplete => self.on_headers_complete(),
            ParserEvent::Body(data) => {
                self.state = RelayState::BodyStreaming;
                self.write_upstream(data)
            }
            ParserEvent::ChunkHeader(size) => {
                self.state = RelayState::BodyStreaming;
                self.chunked = true;
                self.write_upstream(Bytes::from(format!("{:X}\r\n", size)))
            }
            ParserEvent::ChunkComplete => self.write_upstream(Bytes::from_static(b"\r\n")),
            ParserEvent::MessageComplete => self.on_message_complete(),
            ParserEvent::StatusLine { .. } => Vec::new(),
        };
        Ok(actions)
    }

    /// Feeds back the result of a [`RelayAction::Connect`].
    pub fn on_connect(&mut self, status: ConnectStatus) -> Vec<RelayAction> {
        match status {
            ConnectStatus::Connected => {
                self.upstream = self.connecting.take();
                self.upstream_open = true;
                self.state = RelayState::HeadersStreaming;
                self.pending
                    .as_ref()
                    .map(|p| vec![RelayAction::WriteUpstream(p.request_line())])
                    .unwrap_or_default()
            }
            ConnectStatus::TunnelPending => {
                self.state = RelayState::TunnelPending;
                Vec::new()
            }
            ConnectStatus::Failed => {
                self.connecting = None;
                self.upstream_open = false;
                self.tunnel_host = None;
                self.state = RelayState::Complete;
                vec![RelayAction::RespondAndClose(Bytes::from_static(CONNECT_FAILED_RESPONSE))]
            }
        }
    }

    fn on_request_line(&mut self, method: Method, target: &str) -> Result<Vec<RelayAction>, ProxyError> {
        self.state = RelayState::MethodKnown;
        let resolved = Target::resolve(&method, target)?;

        match &resolved {
            Target::Tunnel { host } => {
                if self.upstream.is_some() {
                    debug!("CONNECT on a forwarding session, closing");
                    return Ok(vec![RelayAction::Close]);
                }
                self.tunnel_host = Some(host.clone());
                self.pending = Some(PendingRequest {
                    method,
                    path: String::new(),
                    headers_forwarded: 0,
                    headers_dropped: 0,
                });
                Ok(vec![RelayAction::Connect(resolved)])
            }
            Target::Forward { origin, path } => {
                let pending = PendingRequest {
                    method,
                    path: path.clone(),
                    headers_forwarded: 0,
                    headers_dropped: 0,
                };
                match &self.upstream {
                    Some(current) if current == origin && self.upstream_open => {
                        self.state = RelayState::HeadersStreaming;
                        let line = pending.request_line();
                        self.pending = Some(pending);
                        Ok(vec![RelayAction::WriteUpstream(line)])
                    }
                    Some(current) => {
                        debug!("Request for {} on a session bound to {}, closing", origin, current);
                        Ok(vec![RelayAction::Close])
                    }
                    None => {
                        self.connecting = Some(origin.clone());
                        self.pending = Some(pending);
                        Ok(vec![RelayAction::Connect(resolved)])
                    }
                }
            }
        }
    }

    fn on_header_value(&mut self, value: Bytes) -> Vec<RelayAction> {
        let HeaderSlot::AwaitingValue(name) = std::mem::replace(&mut self.slot, HeaderSlot::Idle) else {
            return Vec::new();
        };
        if self.is_tunnel() {
            return Vec::new();
        }

        if name.eq_ignore_ascii_case(PROXY_CONNECTION) {
            if let Some(pending) = self.pending.as_mut() {
                pending.headers_dropped += 1;
            }
            return Vec::new();
        }
        if !self.upstream_open {
            return Vec::new();
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.headers_forwarded += 1;
        }

        let mut line = BytesMut::with_capacity(name.len() + value.len() + 4);
        line.put_slice(&name);
        line.put_slice(b": ");
        line.put_slice(&value);
        line.put_slice(b"\r\n");
        vec![RelayAction::WriteUpstream(line.freeze())]
    }

    fn on_headers_complete(&mut self) -> Vec<RelayAction> {
        if self.is_tunnel() {
            return Vec::new();
        }
        self.state = RelayState::HeadersDone;
        if let Some(pending) = self.pending.take() {
            debug!(
                "{} {} headers flushed ({} forwarded, {} dropped)",
                pending.method, pending.path, pending.headers_forwarded, pending.headers_dropped
            );
        }
        self.write_upstream(Bytes::from_static(b"\r\n"))
    }

    fn on_message_complete(&mut self) -> Vec<RelayAction> {
        if self.is_tunnel() {
            self.pending = None;
            self.state = RelayState::TunnelReady;
            return vec![RelayAction::AcknowledgeTunnel(connection_established(&self.proxy_agent))];
        }
        let actions = if self.chunked {
            self.write_upstream(Bytes::from_static(b"\r\n"))
        } else {
            Vec::new()
        };
        self.state = RelayState::Complete;
        actions
    }

    fn write_upstream(&self, data: Bytes) -> Vec<RelayAction> {
        if self.upstream_open && !data.is_empty() {
            vec![RelayAction::WriteUpstream(data)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{DEFAULT_MAX_HEADER_SIZE, WireParser};

    /// Runs `input` through a parser and the relay, answering every connect
    /// with `status`. Returns the bytes written upstream and every other action.
    fn drive(relay: &mut RequestRelay, input: &[u8], status: ConnectStatus) -> (Vec<u8>, Vec<RelayAction>) {
        let mut parser = WireParser::request(DEFAULT_MAX_HEADER_SIZE);
        let parsed = parser.feed(input).unwrap();
        let mut upstream = Vec::new();
        let mut other = Vec::new();

        let mut queue: std::collections::VecDeque<RelayAction> = Default::default();
        for event in parsed.events {
            queue.extend(relay.apply(event).unwrap());
            while let Some(action) = queue.pop_front() {
                match action {
                    RelayAction::WriteUpstream(data) => upstream.extend_from_slice(&data),
                    RelayAction::Connect(_) => {
                        other.push(action);
                        queue.extend(relay.on_connect(status));
                    }
                    action => other.push(action),
                }
            }
        }
        (upstream, other)
    }

    #[test]
    fn test_request_line_rewritten_to_origin_form() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        let (upstream, other) = drive(
            &mut relay,
            b"GET http://example.com/a/b?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
            ConnectStatus::Connected,
        );

        assert_eq!(
            String::from_utf8(upstream).unwrap(),
            "GET /a/b?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
        assert_eq!(
            other,
            vec![RelayAction::Connect(Target::Forward {
                origin: Origin::new("example.com", 80),
                path: "/a/b?x=1".to_string(),
            })]
        );
        assert_eq!(relay.state(), RelayState::Complete);
        assert_eq!(relay.upstream_origin(), Some(&Origin::new("example.com", 80)));
    }

    #[test]
    fn test_proxy_connection_never_forwarded() {
        for name in ["Proxy-Connection", "proxy-connection", "PROXY-CONNECTION", "pRoXy-CoNnEcTiOn"] {
            let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
            let input = format!(
                "GET http://example.com/ HTTP/1.1\r\n{}: keep-alive\r\nHost: example.com\r\n{}: close\r\n\r\n",
                name, name
            );
            let (upstream, _) = drive(&mut relay, input.as_bytes(), ConnectStatus::Connected);
            let text = String::from_utf8(upstream).unwrap().to_ascii_lowercase();
            assert!(!text.contains("proxy-connection"), "{}", text);
            assert!(text.contains("host: example.com\r\n"));
        }
    }

    #[test]
    fn test_connect_failure_answers_500_and_stops_writing() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        let (upstream, other) = drive(
            &mut relay,
            b"POST http://unreachable.test/ HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
            ConnectStatus::Failed,
        );

        assert!(upstream.is_empty());
        assert_eq!(
            other[1],
            RelayAction::RespondAndClose(Bytes::from_static(CONNECT_FAILED_RESPONSE))
        );
        assert_eq!(
            CONNECT_FAILED_RESPONSE,
            b"HTTP/1.0 500 Unable to connect\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_acknowledged_without_upstream_writes() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        let (upstream, other) = drive(
            &mut relay,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Connection: keep-alive\r\n\r\n",
            ConnectStatus::TunnelPending,
        );

        assert!(upstream.is_empty());
        assert_eq!(
            other,
            vec![
                RelayAction::Connect(Target::Tunnel { host: "example.com".to_string() }),
                RelayAction::AcknowledgeTunnel(Bytes::from_static(
                    b"HTTP/1.0 200 Connection established\r\nProxy-agent: MetaGate Proxy\r\n\r\n"
                )),
            ]
        );
        assert_eq!(relay.state(), RelayState::TunnelReady);
        assert_eq!(relay.tunnel_host(), Some("example.com"));
    }

    #[test]
    fn test_chunked_body_reaches_upstream_framed() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        let (upstream, _) = drive(
            &mut relay,
            b"POST http://h/up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1a\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\n\r\n",
            ConnectStatus::Connected,
        );
        assert_eq!(
            String::from_utf8(upstream).unwrap(),
            "POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1A\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn test_follow_up_request_reuses_or_closes() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        drive(&mut relay, b"GET http://h/1 HTTP/1.1\r\n\r\n", ConnectStatus::Connected);

        let (upstream, other) = drive(&mut relay, b"GET http://h/2 HTTP/1.1\r\n\r\n", ConnectStatus::Failed);
        assert_eq!(upstream, b"GET /2 HTTP/1.1\r\n\r\n");
        assert!(other.is_empty());

        let (_, other) = drive(&mut relay, b"GET http://elsewhere/ HTTP/1.1\r\n\r\n", ConnectStatus::Connected);
        assert_eq!(other.first(), Some(&RelayAction::Close));
    }

    #[test]
    fn test_writes_after_upstream_close_are_dropped() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        relay.apply(ParserEvent::MessageBegin).unwrap();
        let actions = relay
            .apply(ParserEvent::RequestLine {
                method: Method::GET,
                target: "http://h/".to_string(),
            })
            .unwrap();
        assert!(matches!(actions[0], RelayAction::Connect(_)));
        assert_eq!(relay.state(), RelayState::MethodKnown);
        relay.on_connect(ConnectStatus::Connected);
        assert_eq!(relay.state(), RelayState::HeadersStreaming);

        relay.upstream_closed();
        assert!(relay.apply(ParserEvent::HeaderField(Bytes::from_static(b"Host"))).unwrap().is_empty());
        assert!(relay.apply(ParserEvent::HeaderValue(Bytes::from_static(b"h"))).unwrap().is_empty());
        assert!(relay.apply(ParserEvent::HeadersComplete).unwrap().is_empty());
        assert_eq!(relay.state(), RelayState::HeadersDone);
    }

    #[test]
    fn test_bad_target_is_an_error() {
        let mut relay = RequestRelay::new(DEFAULT_PROXY_AGENT);
        let err = relay
            .apply(ParserEvent::RequestLine {
                method: Method::CONNECT,
                target: ":443".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedMethodShape(_)));
    }
}
