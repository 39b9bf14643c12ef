use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::session::{ClientSession, SessionContext, SessionEnd};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Decrements the active-session gauge when a session task ends, however
/// it ends.
struct SessionGuard(Arc<ProxyMetrics>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.session_finished();
    }
}

/// Accepts client connections and runs one session task per connection.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    max_connections: usize,
}

impl ProxyServer {
    pub async fn bind(settings: &ProxySettings) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(settings.listen_addr).await?;
        let metrics = Arc::new(ProxyMetrics::new());
        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext::new(settings, metrics)),
            max_connections: settings.max_connections,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Accept loop. Only returns on a listener error; a failing session never
    /// affects the others.
    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Forward proxy listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
                Err(e) => return Err(ProxyError::Io(e)),
            };

            let metrics = Arc::clone(&self.ctx.metrics);
            if metrics.active_sessions() >= self.max_connections as u64 {
                metrics.increment_rejected();
                warn!(
                    "Rejecting {}: {} sessions already active",
                    peer, self.max_connections
                );
                drop(stream);
                continue;
            }

            metrics.session_started();
            let guard = SessionGuard(metrics);
            let session = ClientSession::new(Arc::clone(&self.ctx), peer);

            tokio::spawn(async move {
                let _guard = guard;
                match session.run(stream).await {
                    Ok(SessionEnd::Tunnel(closed_by)) => {
                        debug!("{} tunnel session closed by {:?}", peer, closed_by)
                    }
                    Ok(end) => debug!("{} session ended: {:?}", peer, end),
                    Err(e) if e.closes_silently() => debug!("{} dropped: {}", peer, e),
                    Err(e) if e.is_disconnect() => debug!("{} disconnected: {}", peer, e),
                    Err(e) => warn!("{} session error: {}", peer, e),
                }
            });
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
