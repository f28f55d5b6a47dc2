//! Remote-desktop framebuffer services. The client side views a remote
//! display; the server side exposes the local one. Both end at the
//! framebuffer daemon on the responder's loopback.

use super::{connect_local, BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, ServiceCode};
use crate::transport::ByteStream;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FramebufferClient {
    pub base: BindingBase,
}

#[async_trait]
impl ServiceBinding for FramebufferClient {
    fn code(&self) -> ServiceCode {
        ServiceCode::FramebufferClient
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

    async fn respond(&mut self, config: &Config) -> Result<ByteStream> {
        connect_local(config.framebuffer_port).await
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FramebufferServer {
    pub base: BindingBase,
    /// Display the local framebuffer daemon serves.
    pub display: String,
}

#[async_trait]
impl ServiceBinding for FramebufferServer {
    fn code(&self) -> ServiceCode {
        ServiceCode::FramebufferServer
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

    async fn respond(&mut self, config: &Config) -> Result<ByteStream> {
        connect_local(config.framebuffer_port).await
    }
}
