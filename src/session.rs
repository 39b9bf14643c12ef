//! One client connection, from the first request byte to close.
//!
//! A session starts by parsing the client's request head. The first
//! request decides what the session becomes: a forwarding session bound to
//! one upstream origin, or a CONNECT tunnel. Parse failures close the
//! client without a response.

use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::parser::{ParserEvent, WireParser};
use crate::relay::{ConnectStatus, RelayAction, RelayState, RequestRelay};
use crate::tunnel::{ClosedBy, RELAY_BUFFER_SIZE, TunnelRelay};
use crate::upstream::{ConnectOutcome, Origin, UpstreamConnector};
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client bytes buffered while an upstream dial is in flight. Past this the
/// session stops reading and just waits for the dial.
const BACKLOG_LIMIT: usize = 64 * 1024;

/// Shared, read-only state handed to every session.
#[derive(Debug)]
pub struct SessionContext {
    pub connector: UpstreamConnector,
    pub metrics: Arc<ProxyMetrics>,
    pub max_header_size: usize,
    pub proxy_agent: String,
}

impl SessionContext {
    pub fn new(settings: &ProxySettings, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            connector: UpstreamConnector::new(settings.connect_timeout, settings.tunnel_port),
            metrics,
            max_header_size: settings.max_header_size,
            proxy_agent: settings.proxy_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away, or closed before sending a full request.
    ClientClosed,
    /// The upstream finished its side of a forwarding session.
    UpstreamClosed,
    /// The upstream could not be reached and the client was answered with 500.
    ConnectFailed,
    /// The relay refused to continue, e.g. a request for another origin.
    Refused,
    Tunnel(ClosedBy),
}

/// Client read side plus the parsing and relay state fed from it.
struct Inbound {
    client_rd: OwnedReadHalf,
    parser: WireParser,
    relay: RequestRelay,
    backlog: BytesMut,
    events: VecDeque<ParserEvent>,
    actions: VecDeque<RelayAction>,
    /// The client shut down its write side.
    client_eof: bool,
    metrics: Arc<ProxyMetrics>,
    peer: SocketAddr,
}

impl Inbound {
    fn new(client_rd: OwnedReadHalf, ctx: &SessionContext, peer: SocketAddr) -> Self {
        Self {
            client_rd,
            parser: WireParser::request(ctx.max_header_size),
            relay: RequestRelay::new(ctx.proxy_agent.clone()),
            backlog: BytesMut::with_capacity(RELAY_BUFFER_SIZE),
            events: VecDeque::new(),
            actions: VecDeque::new(),
            client_eof: false,
            metrics: Arc::clone(&ctx.metrics),
            peer,
        }
    }

    /// Next action for the session to execute, reading from the client as
    /// needed. `None` once the client has closed.
    ///
    /// Events are applied one at a time so that a connect result is fed
    /// back to the relay before it sees anything that follows the request
    /// line.
    async fn next_action(&mut self) -> Result<Option<RelayAction>, ProxyError> {
        loop {
            if let Some(action) = self.actions.pop_front() {
                return Ok(Some(action));
            }

            if let Some(event) = self.events.pop_front() {
                let request_line = matches!(event, ParserEvent::RequestLine { .. });
                if let ParserEvent::RequestLine { method, target } = &event {
                    info!("{} {} {}", self.peer, method, target);
                }
                let actions = self.relay.apply(event)?;
                if request_line && matches!(actions.first(), Some(RelayAction::WriteUpstream(_))) {
                    // Follow-up request on an open upstream.
                    self.metrics.increment_requests();
                }
                self.actions.extend(actions);
                continue;
            }

            if self.parser.is_upgraded() {
                return Ok(None);
            }

            if !self.backlog.is_empty() {
                let parsed = self.parser.feed(&self.backlog)?;
                self.backlog.advance(parsed.consumed);
                self.events.extend(parsed.events);
                if parsed.consumed > 0 {
                    continue;
                }
            }

            if self.client_eof || self.read_more().await? == 0 {
                self.client_eof = true;
                return Ok(None);
            }
        }
    }

    /// Whether the client has sent a whole request, counting bytes and
    /// events not yet handed to the relay.
    fn request_received(&mut self) -> bool {
        if !self.backlog.is_empty() && !self.parser.is_upgraded() {
            match self.parser.feed(&self.backlog) {
                Ok(parsed) => {
                    self.backlog.advance(parsed.consumed);
                    self.events.extend(parsed.events);
                }
                Err(_) => return false,
            }
        }
        self.relay.state() == RelayState::Complete || self.events.contains(&ParserEvent::MessageComplete)
    }

    /// Feeds a connect result back to the relay. Its actions run before
    /// anything already queued.
    fn resolve_connect(&mut self, status: ConnectStatus) {
        for action in self.relay.on_connect(status).into_iter().rev() {
            self.actions.push_front(action);
        }
    }

    async fn read_more(&mut self) -> Result<usize, ProxyError> {
        self.backlog.reserve(RELAY_BUFFER_SIZE);
        Ok(self.client_rd.read_buf(&mut self.backlog).await?)
    }

    /// Drives `work` to completion unless the client disconnects first, in
    /// which case `work` is dropped. Client bytes that arrive meanwhile are
    /// kept for later parsing.
    ///
    /// A client that half-closes after a complete request is still waiting
    /// for the response, so its EOF does not cancel `work`.
    async fn until_client_leaves<F: Future>(&mut self, work: F) -> Option<F::Output> {
        tokio::pin!(work);
        loop {
            if self.client_eof || self.backlog.len() >= BACKLOG_LIMIT {
                return Some(work.await);
            }
            tokio::select! {
                output = &mut work => return Some(output),
                read = self.read_more() => match read {
                    Ok(0) => {
                        if !self.request_received() {
                            return None;
                        }
                        debug!("{} half-closed after a complete request", self.peer);
                        self.client_eof = true;
                    }
                    Err(_) => return None,
                    Ok(_) => {}
                },
            }
        }
    }
}

pub struct ClientSession {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
}

impl ClientSession {
    pub fn new(ctx: Arc<SessionContext>, peer: SocketAddr) -> Self {
        Self { ctx, peer }
    }

    pub async fn run(self, stream: TcpStream) -> Result<SessionEnd, ProxyError> {
        let _ = stream.set_nodelay(true);
        let (client_rd, mut client_wr) = stream.into_split();
        let mut inbound = Inbound::new(client_rd, &self.ctx, self.peer);

        let result = self.drive(&mut inbound, &mut client_wr).await;
        if let Err(e) = &result {
            if e.closes_silently() {
                self.ctx.metrics.increment_parse_errors();
            }
        }
        let _ = client_wr.shutdown().await;
        result
    }

    /// Runs the session until the first request has picked a mode, then
    /// hands over to forwarding or tunnelling.
    async fn drive(&self, inbound: &mut Inbound, client_wr: &mut OwnedWriteHalf) -> Result<SessionEnd, ProxyError> {
        loop {
            let Some(action) = inbound.next_action().await? else {
                return Ok(SessionEnd::ClientClosed);
            };

            match action {
                RelayAction::Connect(target) => {
                    let outcome = match inbound.until_client_leaves(self.ctx.connector.connect(&target)).await {
                        Some(outcome) => outcome,
                        None => {
                            debug!("{} left while connecting to {:?}", self.peer, target);
                            return Ok(SessionEnd::ClientClosed);
                        }
                    };

                    match outcome {
                        ConnectOutcome::Connected(upstream) => {
                            inbound.resolve_connect(ConnectStatus::Connected);
                            self.ctx.metrics.increment_requests();
                            let origin = inbound.relay.upstream_origin().cloned();
                            return self.forward(inbound, client_wr, upstream, origin).await;
                        }
                        ConnectOutcome::TunnelPending(host) => {
                            debug!("{} CONNECT {} pending", self.peer, host);
                            inbound.resolve_connect(ConnectStatus::TunnelPending);
                        }
                        ConnectOutcome::Failed(e) => {
                            warn!("{} {}", self.peer, e);
                            self.ctx.metrics.increment_connect_failures();
                            inbound.resolve_connect(ConnectStatus::Failed);
                        }
                    }
                }
                RelayAction::RespondAndClose(response) => {
                    client_wr.write_all(&response).await?;
                    client_wr.flush().await?;
                    return Ok(SessionEnd::ConnectFailed);
                }
                RelayAction::AcknowledgeTunnel(ack) => {
                    client_wr.write_all(&ack).await?;
                    client_wr.flush().await?;
                    return self.tunnel(inbound, client_wr).await;
                }
                RelayAction::Close => return Ok(SessionEnd::Refused),
                RelayAction::WriteUpstream(data) => {
                    debug!("{} dropping {} bytes with no upstream", self.peer, data.len());
                }
            }
        }
    }

    async fn forward(
        &self,
        inbound: &mut Inbound,
        client_wr: &mut OwnedWriteHalf,
        upstream: TcpStream,
        origin: Option<Origin>,
    ) -> Result<SessionEnd, ProxyError> {
        let origin = origin.map(|o| o.to_string()).unwrap_or_default();
        info!("{} forwarding to {}", self.peer, origin);

        let (mut up_rd, mut up_wr) = upstream.into_split();
        let outbound = AtomicU64::new(0);
        let returned = AtomicU64::new(0);

        let requests = send_requests(inbound, &mut up_wr, &outbound);
        let responses = relay_responses(&mut up_rd, client_wr, self.ctx.max_header_size, &returned);
        tokio::pin!(requests, responses);

        let finished = tokio::select! {
            r = &mut requests => r.transpose(),
            r = &mut responses => Some(r.map(|_| SessionEnd::UpstreamClosed)),
        };
        let result = match finished {
            Some(result) => result,
            None => {
                debug!("{} finished sending, waiting for {}", self.peer, origin);
                responses.await.map(|_| SessionEnd::UpstreamClosed)
            }
        };

        let (sent, received) = (outbound.load(Ordering::Relaxed), returned.load(Ordering::Relaxed));
        self.ctx.metrics.record_relayed(sent, received);
        debug!(
            "{} forwarding to {} ended ({} bytes out, {} bytes in)",
            self.peer, origin, sent, received
        );
        result
    }

    /// CONNECT acknowledged. The upstream is dialled once the client sends
    /// its first tunnelled byte; a failed dial just closes the client.
    async fn tunnel(&self, inbound: &mut Inbound, client_wr: &mut OwnedWriteHalf) -> Result<SessionEnd, ProxyError> {
        let Some(host) = inbound.relay.tunnel_host().map(str::to_owned) else {
            return Ok(SessionEnd::Refused);
        };
        let origin = self.ctx.connector.tunnel_origin(&host);
        self.ctx.metrics.increment_tunnels();

        if inbound.backlog.is_empty() && inbound.read_more().await? == 0 {
            debug!("{} closed tunnel to {} before sending data", self.peer, origin);
            return Ok(SessionEnd::ClientClosed);
        }

        let upstream = match inbound.until_client_leaves(self.ctx.connector.dial(&origin)).await {
            None => return Ok(SessionEnd::ClientClosed),
            Some(Err(e)) => {
                warn!("{} {}", self.peer, e);
                self.ctx.metrics.increment_connect_failures();
                return Ok(SessionEnd::ClientClosed);
            }
            Some(Ok(stream)) => stream,
        };

        let early: Bytes = inbound.backlog.split().freeze();
        let report = TunnelRelay::new(origin, &self.ctx.metrics)
            .run(&mut inbound.client_rd, client_wr, upstream, &early)
            .await?;
        Ok(SessionEnd::Tunnel(report.closed_by))
    }
}

/// Client to upstream half of a forwarding session. `None` means the client
/// half-closed after a complete request and the response should still be
/// relayed.
async fn send_requests(
    inbound: &mut Inbound,
    up_wr: &mut OwnedWriteHalf,
    counter: &AtomicU64,
) -> Result<Option<SessionEnd>, ProxyError> {
    loop {
        let Some(action) = inbound.next_action().await? else {
            if inbound.relay.state() == RelayState::Complete {
                return Ok(None);
            }
            return Ok(Some(SessionEnd::ClientClosed));
        };
        match action {
            RelayAction::WriteUpstream(data) => {
                if let Err(e) = up_wr.write_all(&data).await {
                    debug!("Upstream write failed: {}", e);
                    inbound.relay.upstream_closed();
                    return Ok(Some(SessionEnd::UpstreamClosed));
                }
                counter.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            RelayAction::Close => return Ok(Some(SessionEnd::Refused)),
            other => {
                debug!("Unexpected {:?} on a forwarding session", other);
                return Ok(Some(SessionEnd::Refused));
            }
        }
    }
}

/// Upstream to client half. Bytes go through untouched; a response parser
/// watches them only to log status lines, and is dropped on the first
/// framing it does not understand.
async fn relay_responses(
    up_rd: &mut OwnedReadHalf,
    client_wr: &mut OwnedWriteHalf,
    max_header_size: usize,
    counter: &AtomicU64,
) -> Result<(), ProxyError> {
    let mut observer = Some(WireParser::response(max_header_size));
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = up_rd.read(&mut buf).await?;
        if n == 0 {
            client_wr.flush().await?;
            return Ok(());
        }

        if let Some(parser) = observer.as_mut() {
            match parser.feed(&buf[..n]) {
                Ok(parsed) => {
                    for event in &parsed.events {
                        if let ParserEvent::StatusLine { code, reason } = event {
                            debug!("Upstream answered {} {}", code, reason);
                        }
                    }
                    if parsed.consumed < n {
                        observer = None;
                    }
                }
                Err(e) => {
                    debug!("Not tracking upstream responses: {}", e);
                    observer = None;
                }
            }
        }

        client_wr.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::CONNECT_FAILED_RESPONSE;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_session(settings: ProxySettings) -> (TcpStream, tokio::task::JoinHandle<Result<SessionEnd, ProxyError>>, Arc<ProxyMetrics>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(ProxyMetrics::new());
        let ctx = Arc::new(SessionContext::new(&settings, Arc::clone(&metrics)));

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let handle = tokio::spawn(ClientSession::new(ctx, peer).run(stream));
        (client, handle, metrics)
    }

    fn settings() -> ProxySettings {
        ProxySettings {
            connect_timeout: Duration::from_secs(2),
            ..ProxySettings::default()
        }
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_response() {
        let (mut client, handle, metrics) = start_session(settings()).await;
        client.write_all(b"BREW /pot HTCPCP/1.0\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.closes_silently());
        assert_eq!(metrics.summary().parse_errors, 1);
    }

    #[tokio::test]
    async fn test_refused_upstream_gets_500() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (mut client, handle, metrics) = start_session(settings()).await;
        let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n", port);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, CONNECT_FAILED_RESPONSE);
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::ConnectFailed);
        assert_eq!(metrics.summary().upstream_connect_failures, 1);
    }

    #[tokio::test]
    async fn test_client_leaving_before_request_ends_quietly() {
        let (client, handle, _) = start_session(settings()).await;
        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::ClientClosed);
    }

    async fn inbound_pair() -> (TcpStream, Inbound) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let ctx = SessionContext::new(&settings(), Arc::new(ProxyMetrics::new()));
        let (client_rd, _) = stream.into_split();
        (client, Inbound::new(client_rd, &ctx, peer))
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_pending_work() {
        let (client, mut inbound) = inbound_pair().await;
        drop(client);

        let outcome = timeout(WAIT, inbound.until_client_leaves(std::future::pending::<()>())).await;
        assert_eq!(outcome.unwrap(), None);
    }

    #[tokio::test]
    async fn test_half_close_after_full_request_keeps_work() {
        let (mut client, mut inbound) = inbound_pair().await;
        client.write_all(b"GET http://example.com/ HTTP/1.0\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let work = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            "connected"
        };
        let outcome = timeout(WAIT, inbound.until_client_leaves(work)).await;
        assert_eq!(outcome.unwrap(), Some("connected"));
        assert!(inbound.client_eof);
        assert!(matches!(inbound.next_action().await.unwrap(), Some(RelayAction::Connect(_))));
    }

    #[tokio::test]
    async fn test_half_close_mid_request_still_cancels() {
        let (mut client, mut inbound) = inbound_pair().await;
        client.write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: exa").await.unwrap();
        client.shutdown().await.unwrap();

        let outcome = timeout(WAIT, inbound.until_client_leaves(std::future::pending::<()>())).await;
        assert_eq!(outcome.unwrap(), None);
    }

    /// A listener whose accept queue is full, so dials to it hang.
    async fn stalled_upstream() -> (TcpListener, Vec<TcpStream>, u16) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..8 {
            match timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }
        (listener, queued, addr.port())
    }

    #[tokio::test]
    async fn test_client_leaving_during_dial_cancels_it() {
        let (_listener, _queued, port) = stalled_upstream().await;
        let slow_dial = ProxySettings {
            connect_timeout: Duration::from_secs(10),
            ..ProxySettings::default()
        };

        let (mut client, handle, metrics) = start_session(slow_dial).await;
        let head = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n", port);
        client.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        let end = timeout(WAIT, handle).await.expect("dial was not cancelled");
        assert_eq!(end.unwrap().unwrap(), SessionEnd::ClientClosed);
        assert_eq!(metrics.summary().upstream_connect_failures, 0);
    }
}
