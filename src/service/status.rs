//! Status service - the daemon answers status queries from the pool
//! itself; this binding only anchors the opcode in the registry.

use super::{BindingBase, ServiceBinding};
use crate::config::Config;
use crate::protocol::{self, ServiceCode};
use crate::transport::ByteStream;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBinding {
    pub base: BindingBase,
}

impl Default for StatusBinding {
    fn default() -> Self {
        Self {
            base: BindingBase {
                connect_now: false,
                ..BindingBase::default()
            },
        }
    }
}

#[async_trait]
impl ServiceBinding for StatusBinding {
    fn code(&self) -> ServiceCode {
        ServiceCode::Status
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

    async fn respond(&mut self, _config: &Config) -> Result<ByteStream> {
        bail!("status sessions have no remote endpoint")
    }
}
