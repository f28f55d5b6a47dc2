//! File-copy service - rides the same login daemon the shell uses.

use super::{connect_local, BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, ServiceCode};
use crate::transport::ByteStream;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CopyBinding {
    pub base: BindingBase,
    pub remote_path: String,
    /// True when the caller is sending, false when fetching.
    pub upload: bool,
}

#[async_trait]
impl ServiceBinding for CopyBinding {
    fn code(&self) -> ServiceCode {
        ServiceCode::FileCopy
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
        connect_local(config.shell_port).await
    }
}
