//! Opaque byte relaying for CONNECT tunnels.

use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;
use crate::upstream::Origin;
use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Copies `reader` into `writer` until EOF, counting bytes as they are
/// written. Returns the total on a clean EOF.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
}

#[derive(Debug)]
pub struct RelayReport {
    pub closed_by: ClosedBy,
    pub error: Option<io::Error>,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

pub struct TunnelRelay<'a> {
    origin: Origin,
    metrics: &'a ProxyMetrics,
}

impl<'a> TunnelRelay<'a> {
    pub fn new(origin: Origin, metrics: &'a ProxyMetrics) -> Self {
        Self { origin, metrics }
    }

    /// Writes `early` (client bytes that arrived before the upstream was
    /// open) and then copies both ways. Returns as soon as either direction
    /// ends; the other direction is dropped with it.
    pub async fn run<CR, CW, U>(
        self,
        client_rd: &mut CR,
        client_wr: &mut CW,
        upstream: U,
        early: &[u8],
    ) -> Result<RelayReport, ProxyError>
    where
        CR: AsyncRead + Unpin + ?Sized,
        CW: AsyncWrite + Unpin + ?Sized,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut up_rd, mut up_wr) = tokio::io::split(upstream);
        let outbound = AtomicU64::new(0);
        let inbound = AtomicU64::new(0);

        if !early.is_empty() {
            up_wr.write_all(early).await?;
            outbound.fetch_add(early.len() as u64, Ordering::Relaxed);
        }
        info!("Tunnel to {} open", self.origin);

        let (closed_by, result) = tokio::select! {
            r = pump(client_rd, &mut up_wr, &outbound) => (ClosedBy::Client, r),
            r = pump(&mut up_rd, client_wr, &inbound) => (ClosedBy::Upstream, r),
        };

        let report = RelayReport {
            closed_by,
            error: result.err(),
            client_to_upstream: outbound.load(Ordering::Relaxed),
            upstream_to_client: inbound.load(Ordering::Relaxed),
        };
        self.metrics.record_relayed(report.client_to_upstream, report.upstream_to_client);

        match &report.error {
            Some(e) => debug!("Tunnel to {} ended by {:?}: {}", self.origin, report.closed_by, e),
            None => debug!("Tunnel to {} ended by {:?}", self.origin, report.closed_by),
        }
        info!(
            "Tunnel to {} closed ({} bytes out, {} bytes in)",
            self.origin, report.client_to_upstream, report.upstream_to_client
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pump_counts_bytes() {
        let (mut a, mut b) = duplex(64);
        let counter = AtomicU64::new(0);
        a.write_all(b"0123456789").await.unwrap();
        drop(a);

        let mut sink = Vec::new();
        let total = pump(&mut b, &mut sink, &counter).await.unwrap();
        assert_eq!(total, 10);
        assert_eq!(sink, b"0123456789");
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_tunnel_relays_arbitrary_bytes_both_ways() {
        let metrics = ProxyMetrics::new();
        let (client_side, proxy_client) = duplex(1024);
        let (proxy_upstream, mut upstream_side) = duplex(1024);
        let (mut client_rd, mut client_wr) = tokio::io::split(proxy_client);
        let (mut user_rd, mut user_wr) = tokio::io::split(client_side);

        let relay = TunnelRelay::new(Origin::new("example.com", 443), &metrics);
        let task = async {
            relay
                .run(&mut client_rd, &mut client_wr, proxy_upstream, b"\x16\x03\x01")
                .await
                .unwrap()
        };

        let peers = async {
            // Not HTTP, and must arrive untouched.
            user_wr.write_all(b"GARBAGE \x00\xff\r\n\r\n").await.unwrap();
            let mut got = [0u8; 17];
            upstream_side.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"\x16\x03\x01GARBAGE \x00\xff\r\n\r\n");

            upstream_side.write_all(b"\x17\x03\x03reply").await.unwrap();
            let mut reply = [0u8; 8];
            user_rd.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"\x17\x03\x03reply");

            drop(upstream_side);
            (user_rd, user_wr)
        };

        let (report, _client) = tokio::join!(task, peers);
        assert_eq!(report.closed_by, ClosedBy::Upstream);
        assert_eq!(report.client_to_upstream, 17);
        assert_eq!(report.upstream_to_client, 8);
        assert_eq!(metrics.summary().bytes_client_to_upstream, 17);
    }

    #[tokio::test]
    async fn test_client_close_ends_tunnel() {
        let metrics = ProxyMetrics::new();
        let (client_side, proxy_client) = duplex(1024);
        let (proxy_upstream, _upstream_side) = duplex(1024);
        let (mut client_rd, mut client_wr) = tokio::io::split(proxy_client);
        drop(client_side);

        let report = TunnelRelay::new(Origin::new("example.com", 443), &metrics)
            .run(&mut client_rd, &mut client_wr, proxy_upstream, b"")
            .await
            .unwrap();
        assert_eq!(report.closed_by, ClosedBy::Client);
        assert_eq!(report.client_to_upstream, 0);
    }
}
