//! File-transfer services - client fetches from, server exposes, the
//! peer's transfer endpoint.

use super::{connect_local, BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, ServiceCode};
use crate::transport::ByteStream;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransferServer {
    pub base: BindingBase,
    /// Directory the transfer endpoint serves.
    pub root: String,
}

#[async_trait]
impl ServiceBinding for TransferServer {
    fn code(&self) -> ServiceCode {
        ServiceCode::TransferServer
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
        connect_local(config.transfer_port).await
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransferClient {
    pub base: BindingBase,
}

#[async_trait]
impl ServiceBinding for TransferClient {
    fn code(&self) -> ServiceCode {
        ServiceCode::TransferClient
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
        connect_local(config.transfer_port).await
    }
}
