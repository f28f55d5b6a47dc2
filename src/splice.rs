//! Splicer - full-duplex byte pump joining two stream endpoints.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pump bytes both ways until one direction sees EOF or an error, or
/// the token fires. Both write halves are shut down exactly once before
/// returning; the endpoints are consumed and dropped here.
pub async fn splice<A, B>(a: A, b: B, cancel: CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    {
        let forward = tokio::io::copy(&mut a_read, &mut b_write);
        let backward = tokio::io::copy(&mut b_read, &mut a_write);
        tokio::pin!(forward, backward);

        tokio::select! {
            result = &mut forward => {
                debug!("splice a->b ended: {:?}", result.as_ref().map_err(|e| e.kind()));
            }
            result = &mut backward => {
                debug!("splice b->a ended: {:?}", result.as_ref().map_err(|e| e.kind()));
            }
            _ = cancel.cancelled() => {
                debug!("splice cancelled");
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pumps_bytes_both_ways() {
        // client_a <-> left  spliced to  right <-> client_b
        let (mut client_a, left) = tokio::io::duplex(1024);
        let (right, mut client_b) = tokio::io::duplex(1024);
        let handle = tokio::spawn(splice(left, right, CancellationToken::new()));

        client_a.write_all(&[0x42]).await.unwrap();
        let mut byte = [0u8; 1];
        client_b.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x42]);

        client_b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // EOF on one side unwinds the splice and propagates.
        drop(client_a);
        handle.await.unwrap().unwrap();
        let mut rest = Vec::new();
        client_b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_splice() {
        let (client_a, left) = tokio::io::duplex(64);
        let (right, client_b) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(splice(left, right, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice must return promptly after cancel")
            .unwrap()
            .unwrap();
        drop((client_a, client_b));
    }
}
