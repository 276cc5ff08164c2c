use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::outcome::{CheckContext, Explain, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};
use crate::wire;

/// Passes when a TCP connection can be established.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Tcp {
    #[serde(flatten)]
    pub service: Service,
}

#[async_trait]
impl Probe for Tcp {
    const TYPE: ServiceType = ServiceType::Tcp;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.service.port == 0 {
            return Err(self.service.invalid("port is required"));
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let address = ctx.address();
        wire::connect(&address, ctx.timeout)
            .await
            .explain("connection error")?;
        Ok(format!("{} responded to request", address))
    }
}
