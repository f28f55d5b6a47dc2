//! Direct TCP transport - LAN dial straight to the responder daemon.
//!
//! No signaling involved: the dialer opens a TCP connection to the
//! responder's IPC port, sends the bring-up envelope carrying the
//! dialer-allocated pair id, and on a zero-status reply the same
//! connection becomes the session byte stream.

use crate::protocol::{self, ServiceRequest};
use crate::transport::ByteStream;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Budget for connect plus the request/reply exchange. Expiry makes the
/// caller fall back to the data-channel transport.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn dial(addr: SocketAddr, request: &ServiceRequest) -> Result<ByteStream> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("direct dial timed out")?
        .with_context(|| format!("direct dial to {addr} failed"))?;

    protocol::write_frame(&mut stream, request).await?;
    let reply: ServiceRequest = timeout(DIAL_TIMEOUT, protocol::read_frame(&mut stream))
        .await
        .context("direct reply timed out")??;
    if reply.status != 0 {
        bail!("remote daemon refused direct session: status {}", reply.status);
    }

    debug!("direct transport open to {addr}");
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, ServiceCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_exchanges_envelopes_then_streams() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request: ServiceRequest = protocol::read_frame(&mut socket).await.unwrap();
            assert_eq!(request.service(), Some(ServiceCode::Shell));
            request.status = 0;
            protocol::write_frame(&mut socket, &request).await.unwrap();

            // After the exchange the socket is a plain byte stream.
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            socket.write_all(&byte).await.unwrap();
        });

        let request = ServiceRequest::new(ServiceCode::Shell, Operation::Up, vec![]);
        let mut stream = dial(addr, &request).await.unwrap();

        stream.write_all(&[0x42]).await.unwrap();
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x42]);
    }

    #[tokio::test]
    async fn nonzero_status_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request: ServiceRequest = protocol::read_frame(&mut socket).await.unwrap();
            request.status = 1;
            protocol::write_frame(&mut socket, &request).await.unwrap();
        });

        let request = ServiceRequest::new(ServiceCode::Shell, Operation::Up, vec![]);
        assert!(dial(addr, &request).await.is_err());
    }
}
