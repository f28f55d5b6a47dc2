//! Service registry and bindings - the pluggable layer that joins a
//! session byte stream to a concrete local service endpoint.
//!
//! The daemon treats binding payloads as opaque bytes; each binding
//! decodes its own configuration. Service internals (SSH, VNC, SFTP,
//! HTTP pages) live behind the local ports the bindings connect to.

pub mod copy;
pub mod filesystem;
pub mod framebuffer;
pub mod message;
pub mod proxy;
pub mod shell;
pub mod status;
pub mod transfer;

use crate::config::Config;
use crate::protocol::ServiceCode;
use crate::transport::ByteStream;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identity fields every binding carries on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingBase {
    /// Peer id of the remote host this binding targets.
    pub host_id: String,
    /// Session pair id, set by the daemon once a session exists.
    pub pair_id: String,
    /// Owning context for child sessions (detached listeners).
    pub parent_id: String,
    /// False for detached services that keep their own listener.
    pub connect_now: bool,
}

impl Default for BindingBase {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            pair_id: String::new(),
            parent_id: String::new(),
            connect_now: true,
        }
    }
}

/// Contract between the daemon and a service implementation.
#[async_trait]
pub trait ServiceBinding: Send + Sync {
    fn code(&self) -> ServiceCode;
    fn base(&self) -> &BindingBase;
    fn base_mut(&mut self) -> &mut BindingBase;

    /// Replace this binding's fields from the opaque request payload.
    fn decode_payload(&mut self, payload: &[u8]) -> Result<()>;
    /// Encode this binding's configuration for the wire.
    fn encode_payload(&self) -> Result<Vec<u8>>;

    /// Side-effect-free setup before signaling; may set the host id.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn need_connect(&self) -> bool {
        self.base().connect_now
    }

    /// Dialer-side hook once the session stream is open.
    async fn dial(&mut self) -> Result<()> {
        Ok(())
    }

    /// Responder side: produce the local endpoint to splice against.
    async fn respond(&mut self, config: &Config) -> Result<ByteStream>;

    /// Detached services start their long-running front here and
    /// return once the listener is bound.
    async fn serve_detached(&mut self, _config: &Config, _cancel: CancellationToken) -> Result<()> {
        bail!("{:?} is not a detached service", self.code())
    }

    fn close(&mut self) {}

    fn host_id(&self) -> &str {
        &self.base().host_id
    }

    fn set_host_id(&mut self, id: &str) {
        self.base_mut().host_id = id.to_string();
    }

    fn pair_id(&self) -> &str {
        &self.base().pair_id
    }

    fn set_pair_id(&mut self, id: &str) {
        self.base_mut().pair_id = id.to_string();
    }

    fn parent_id(&self) -> &str {
        &self.base().parent_id
    }

    fn set_parent_id(&mut self, id: &str) {
        self.base_mut().parent_id = id.to_string();
    }
}

/// Compile-time registry: opcode to a fresh binding.
pub fn new_binding(code: ServiceCode) -> Box<dyn ServiceBinding> {
    match code {
        ServiceCode::Shell => Box::new(shell::ShellBinding::default()),
        ServiceCode::FramebufferClient => Box::new(framebuffer::FramebufferClient::default()),
        ServiceCode::FileCopy => Box::new(copy::CopyBinding::default()),
        ServiceCode::Filesystem => Box::new(filesystem::FilesystemBinding::default()),
        ServiceCode::Proxy => Box::new(proxy::ProxyBinding::default()),
        ServiceCode::Status => Box::new(status::StatusBinding::default()),
        ServiceCode::FramebufferServer => Box::new(framebuffer::FramebufferServer::default()),
        ServiceCode::Message => Box::new(message::MessageBinding::default()),
        ServiceCode::TransferServer => Box::new(transfer::TransferServer::default()),
        ServiceCode::TransferClient => Box::new(transfer::TransferClient::default()),
    }
}

/// Decode a request payload straight into a fresh binding.
pub fn binding_from_payload(code: ServiceCode, payload: &[u8]) -> Result<Box<dyn ServiceBinding>> {
    let mut binding = new_binding(code);
    if !payload.is_empty() {
        binding.decode_payload(payload)?;
    }
    Ok(binding)
}

/// Connect to a service endpoint on the loopback interface.
pub(crate) async fn connect_local(port: u16) -> Result<ByteStream> {
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("local service on port {port} unreachable"))?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_opcode() {
        for code in 0..10 {
            let service = ServiceCode::from_code(code).unwrap();
            let binding = new_binding(service);
            assert_eq!(binding.code(), service);
        }
    }

    #[test]
    fn payload_round_trips_through_a_binding() {
        let mut shell = shell::ShellBinding::default();
        shell.set_host_id("peer-b");
        shell.username = "root".to_string();
        let payload = shell.encode_payload().unwrap();

        let binding = binding_from_payload(ServiceCode::Shell, &payload).unwrap();
        assert_eq!(binding.host_id(), "peer-b");
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(binding_from_payload(ServiceCode::Shell, &[0xff]).is_err());
    }

    #[test]
    fn id_accessors_hit_the_base() {
        let mut binding = new_binding(ServiceCode::Message);
        binding.set_pair_id("conn_7_1_0");
        binding.set_parent_id("proxy_8080");
        assert_eq!(binding.pair_id(), "conn_7_1_0");
        assert_eq!(binding.parent_id(), "proxy_8080");
        assert!(binding.need_connect());
    }
}
