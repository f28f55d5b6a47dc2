//! Messaging service - splices the caller onto the peer's message console.

use super::{connect_local, BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, ServiceCode};
use crate::transport::ByteStream;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MessageBinding {
    pub base: BindingBase,
    pub nickname: String,
}

#[async_trait]
impl ServiceBinding for MessageBinding {
    fn code(&self) -> ServiceCode {
        ServiceCode::Message
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
        connect_local(config.message_port).await
    }
}
