//! Bidirectional socket splice with idle timeout and byte accounting,
//! grounded in `shared/proxy.py`'s `proxy_sockets`.

use crate::errors::{ProxyError, ProxyResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceStats {
    pub client_to_upstream_bytes: u64,
    pub upstream_to_client_bytes: u64,
}

/// Copies bytes in both directions between `client` and `upstream`
/// until either side closes or goes idle for `idle_timeout`. A timeout
/// on one leg ends only that leg's copy loop, not the other, matching
/// the original's per-direction `select()` read loop.
pub async fn splice<A, B>(client: A, upstream: B, idle_timeout: Duration) -> ProxyResult<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let to_upstream = copy_with_idle_timeout(&mut client_r, &mut upstream_w, idle_timeout);
    let to_client = copy_with_idle_timeout(&mut upstream_r, &mut client_w, idle_timeout);
    let (sent, received) = tokio::join!(to_upstream, to_client);

    Ok(SpliceStats {
        client_to_upstream_bytes: sent?,
        upstream_to_client_bytes: received?,
    })
}

async fn copy_with_idle_timeout<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let read = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(ProxyError::Io(err)),
            Err(_) => break,
        };
        writer
            .write_all(&buf[..read])
            .await
            .map_err(ProxyError::Io)?;
        total += read as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn splice_relays_both_directions_and_counts_bytes() {
        let (client_near, client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);

        let feeder = tokio::spawn(async move {
            let mut client_far = client_far;
            client_far.write_all(b"ping").await.unwrap();
            client_far.shutdown().await.unwrap();
            let mut upstream_far = upstream_far;
            let mut buf = [0u8; 16];
            let n = upstream_far.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            upstream_far.write_all(b"pong").await.unwrap();
            upstream_far.shutdown().await.unwrap();
        });

        let stats = splice(client_near, upstream_near, Duration::from_millis(200))
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!(stats.client_to_upstream_bytes, 4);
        assert_eq!(stats.upstream_to_client_bytes, 4);
    }
}
