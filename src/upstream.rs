//! Upstream target resolution and connection establishment.

use crate::error::ProxyError;
use http::Method;
use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

/// Port dialled for every CONNECT tunnel unless configured otherwise.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where a request goes, decided from its method and request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Plain HTTP forwarding. `path` is the path and query sent upstream.
    Forward { origin: Origin, path: String },
    /// CONNECT tunnel. Only the host is kept; the port written in the
    /// request is ignored and the configured tunnel port is dialled.
    Tunnel { host: String },
}

impl Target {
    pub fn resolve(method: &Method, target: &str) -> Result<Self, ProxyError> {
        if *method == Method::CONNECT {
            return resolve_connect(target);
        }
        resolve_forward(target)
    }
}

fn resolve_connect(target: &str) -> Result<Target, ProxyError> {
    let host = if let Some(rest) = target.strip_prefix('[') {
        rest.split_once(']').map(|(host, _)| host).unwrap_or_default()
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => target,
        }
    };

    if host.is_empty() || host.contains(['/', '@', ' ']) {
        return Err(ProxyError::UnsupportedMethodShape(format!(
            "CONNECT target without a usable host: {:?}",
            target
        )));
    }
    Ok(Target::Tunnel { host: host.to_string() })
}

fn resolve_forward(target: &str) -> Result<Target, ProxyError> {
    if target.starts_with('/') || target == "*" {
        return Err(ProxyError::UnsupportedMethodShape(format!(
            "request target has no authority: {:?}",
            target
        )));
    }

    let absolute = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    };
    let url = Url::parse(&absolute)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::UnsupportedMethodShape(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    // Requests always go upstream as plain HTTP, so the port defaults to 80
    // whatever the scheme says. An explicit port is kept as written.
    let plain = match absolute.split_once("://") {
        Some((_, rest)) if url.scheme() != "http" => Url::parse(&format!("http://{}", rest))?,
        _ => url,
    };
    let host = plain
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::UnsupportedMethodShape(format!("no host in {:?}", target)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = plain.port_or_known_default().unwrap_or(80);

    Ok(Target::Forward {
        origin: Origin::new(host, port),
        path: path_and_query(&absolute),
    })
}

/// Path and query exactly as the client wrote them, without scheme,
/// authority or fragment.
fn path_and_query(absolute: &str) -> String {
    let after_scheme = absolute
        .split_once("://")
        .map_or(absolute, |(_, rest)| rest);
    let rest = after_scheme
        .find(['/', '?', '#'])
        .map_or("", |i| &after_scheme[i..]);
    let rest = rest.split('#').next().unwrap_or_default();

    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('?') {
        format!("/{}", rest)
    } else {
        rest.to_string()
    }
}

pub enum ConnectOutcome {
    Connected(TcpStream),
    TunnelPending(String),
    Failed(ProxyError),
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected(stream) => f
                .debug_tuple("Connected")
                .field(&stream.peer_addr().ok())
                .finish(),
            ConnectOutcome::TunnelPending(host) => f.debug_tuple("TunnelPending").field(host).finish(),
            ConnectOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    connect_timeout: Duration,
    tunnel_port: u16,
}

impl UpstreamConnector {
    pub fn new(connect_timeout: Duration, tunnel_port: u16) -> Self {
        Self {
            connect_timeout,
            tunnel_port,
        }
    }

    /// Forward targets are dialled right away. Tunnel targets only record
    /// the host; [`UpstreamConnector::dial`] is called later once the client
    /// starts talking through the tunnel.
    pub async fn connect(&self, target: &Target) -> ConnectOutcome {
        match target {
            Target::Tunnel { host } => ConnectOutcome::TunnelPending(host.clone()),
            Target::Forward { origin, .. } => match self.dial(origin).await {
                Ok(stream) => ConnectOutcome::Connected(stream),
                Err(e) => ConnectOutcome::Failed(e),
            },
        }
    }

    pub fn tunnel_origin(&self, host: &str) -> Origin {
        Origin::new(host, self.tunnel_port)
    }

    pub async fn dial(&self, origin: &Origin) -> Result<TcpStream, ProxyError> {
        debug!("Dialling upstream {} (timeout {:?})", origin, self.connect_timeout);
        let attempt = TcpStream::connect((origin.host.as_str(), origin.port));
        match timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
                target: origin.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::UpstreamConnect {
                target: origin.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn forward(host: &str, port: u16, path: &str) -> Target {
        Target::Forward {
            origin: Origin::new(host, port),
            path: path.to_string(),
        }
    }

    #[test]
    fn test_forward_target_resolution() {
        let cases = [
            ("http://example.com/a/b?x=1", forward("example.com", 80, "/a/b?x=1")),
            ("http://example.com", forward("example.com", 80, "/")),
            ("http://example.com:8080?q", forward("example.com", 8080, "/?q")),
            ("example.com/plain", forward("example.com", 80, "/plain")),
            ("https://secure.example/x#frag", forward("secure.example", 80, "/x")),
            ("https://secure.example:8443/", forward("secure.example", 8443, "/")),
            ("https://secure.example:443/", forward("secure.example", 443, "/")),
            ("http://[::1]:9000/v6", forward("::1", 9000, "/v6")),
            ("http://example.com/%7Euser/../raw", forward("example.com", 80, "/%7Euser/../raw")),
        ];

        for (raw, expected) in cases {
            assert_eq!(Target::resolve(&Method::GET, raw).unwrap(), expected, "{}", raw);
        }
    }

    #[test]
    fn test_connect_target_ignores_port() {
        let tunnel = |host: &str| Target::Tunnel { host: host.to_string() };
        assert_eq!(Target::resolve(&Method::CONNECT, "example.com:443").unwrap(), tunnel("example.com"));
        assert_eq!(Target::resolve(&Method::CONNECT, "example.com:8443").unwrap(), tunnel("example.com"));
        assert_eq!(Target::resolve(&Method::CONNECT, "example.com").unwrap(), tunnel("example.com"));
        assert_eq!(Target::resolve(&Method::CONNECT, "[2001:db8::1]:443").unwrap(), tunnel("2001:db8::1"));
    }

    #[test]
    fn test_unsupported_target_shapes() {
        for (method, raw) in [
            (Method::CONNECT, ":443"),
            (Method::CONNECT, "[]:443"),
            (Method::GET, "/relative/path"),
            (Method::GET, "*"),
            (Method::GET, "ftp://example.com/file"),
        ] {
            let err = Target::resolve(&method, raw).unwrap_err();
            assert!(err.closes_silently(), "{} {} -> {}", method, raw, err);
        }
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::new("example.com", 80).to_string(), "example.com:80");
        assert_eq!(Origin::new("::1", 443).to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_tunnel_target_opens_nothing() {
        let connector = UpstreamConnector::new(Duration::from_secs(1), DEFAULT_TUNNEL_PORT);
        let outcome = connector
            .connect(&Target::Tunnel { host: "example.com".to_string() })
            .await;
        assert!(matches!(outcome, ConnectOutcome::TunnelPending(ref host) if host == "example.com"));
        assert_eq!(connector.tunnel_origin("example.com"), Origin::new("example.com", 443));
    }

    #[tokio::test]
    async fn test_connect_success_and_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let connector = UpstreamConnector::new(Duration::from_secs(2), DEFAULT_TUNNEL_PORT);

        let outcome = connector.connect(&forward("127.0.0.1", open_port, "/")).await;
        assert!(matches!(outcome, ConnectOutcome::Connected(_)));

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let outcome = connector.connect(&forward("127.0.0.1", closed_port, "/")).await;
        match outcome {
            ConnectOutcome::Failed(ProxyError::UpstreamConnect { target, .. }) => {
                assert_eq!(target, format!("127.0.0.1:{}", closed_port));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
