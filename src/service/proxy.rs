//! Proxy service - a detached binding. Bring-up binds a local listener
//! and returns; every accepted connection issues a fresh bring-up to
//! the daemon's own IPC endpoint, so each proxied stream rides its own
//! independently handshaken session.

use super::{connect_local, BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, Operation, ServiceCode, ServiceRequest};
use crate::transport::ByteStream;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProxyBinding {
    pub base: BindingBase,
    /// Local port the proxy front listens on.
    pub listen_port: u16,
}

#[async_trait]
impl ServiceBinding for ProxyBinding {
    fn code(&self) -> ServiceCode {
        ServiceCode::Proxy
    }

    fn base(&self) -> &BindingBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BindingBase {
        &mut self.base
    }

    fn decode_payload(&mut self, payload: &[u8]) -> Result<()> {
        *self = protocol::decode(payload)?;
        Ok(())
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        protocol::encode(self)
    }

    /// Remote end of a proxied session: hand over the local web endpoint.
    async fn respond(&mut self, config: &Config) -> Result<ByteStream> {
        connect_local(config.http_port).await
    }

    async fn serve_detached(&mut self, config: &Config, cancel: CancellationToken) -> Result<()> {
        if self.host_id().is_empty() {
            bail!("proxy needs a target host id");
        }
        let listener = TcpListener::bind(("127.0.0.1", self.listen_port))
            .await
            .with_context(|| format!("failed to bind proxy port {}", self.listen_port))?;
        info!(
            "proxy for {} listening on {}",
            self.host_id(),
            listener.local_addr()?
        );
        spawn_front(
            listener,
            config.ipc_addr(),
            self.host_id().to_string(),
            format!("proxy_{}", self.listen_port),
            cancel,
        );
        Ok(())
    }
}

/// Accept loop for a bound proxy front. Split from `serve_detached` so
/// the listener can be prepared independently.
pub(crate) fn spawn_front(
    listener: TcpListener,
    ipc_addr: String,
    host_id: String,
    parent_id: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("proxy front for {host_id} shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("proxy accept failed: {e}");
                            break;
                        }
                    };
                    debug!("proxy accepted {peer}");
                    let ipc_addr = ipc_addr.clone();
                    let host_id = host_id.clone();
                    let parent_id = parent_id.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = proxy_one(conn, &ipc_addr, &host_id, &parent_id, cancel).await {
                            warn!("proxied session failed: {e:#}");
                        }
                    });
                }
            }
        }
    });
}

/// Open one session for one accepted connection and splice the two.
async fn proxy_one(
    conn: TcpStream,
    ipc_addr: &str,
    host_id: &str,
    parent_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let mut child = ProxyBinding::default();
    child.set_host_id(host_id);
    child.set_parent_id(parent_id);

    let mut request = ServiceRequest::new(ServiceCode::Proxy, Operation::Up, child.encode_payload()?);
    request.local_entry = ipc_addr.to_string();

    let mut daemon = TcpStream::connect(ipc_addr)
        .await
        .context("daemon IPC unreachable")?;
    protocol::write_frame(&mut daemon, &request).await?;
    let reply: ServiceRequest = protocol::read_frame(&mut daemon).await?;
    if reply.status != 0 {
        bail!("daemon refused proxied session: status {}", reply.status);
    }

    crate::splice::splice(conn, daemon, cancel).await
}
