use anyhow::{ensure, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::Service;
use crate::wire;

/// Without credlists only the X.224 negotiation is checked; with them, an
/// authentication-only login through `xfreerdp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Rdp {
    #[serde(flatten)]
    pub service: Service,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

/// TPKT + X.224 Connection Request carrying an RDP negotiation request for TLS and CredSSP.
const CONNECTION_REQUEST: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, // TPKT, length 19
    0x0E, 0xE0, 0x00, 0x00, 0x00, 0x00, 0x00, // X.224 CR
    0x01, 0x00, 0x08, 0x00, 0x03, 0x00, 0x00, 0x00, // RDP_NEG_REQ
];

async fn negotiate(ctx: &CheckContext<'_>) -> anyhow::Result<()> {
    let mut stream = wire::connect(&ctx.address(), ctx.timeout).await?;
    stream.write_all(&CONNECTION_REQUEST).await?;
    let mut reply = [0u8; 11];
    timeout(ctx.timeout, stream.read_exact(&mut reply))
        .await
        .context("timed out waiting for connection confirm")??;
    ensure!(reply[0] == 0x03, "not a TPKT reply");
    ensure!(reply[5] & 0xF0 == 0xD0, "not an X.224 connection confirm");
    Ok(())
}

/// `DOMAIN\user` and `user@domain` override the configured domain.
fn split_user<'a>(username: &'a str, domain: &'a str) -> (&'a str, &'a str) {
    if let Some((domain, user)) = username.split_once('\\') {
        (user, domain)
    } else if let Some((user, domain)) = username.split_once('@') {
        (user, domain)
    } else {
        (username, domain)
    }
}

#[async_trait]
impl Probe for Rdp {
    const TYPE: ServiceType = ServiceType::Rdp;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(3389)
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let Some(cred) = ctx.credential_if(!self.service.credlists.is_empty())? else {
            negotiate(ctx).await.explain("connection error")?;
            return Ok(format!("{} confirmed the connection request", ctx.address()));
        };
        let (username, domain) = split_user(&cred.username, &self.domain);
        let mut command = Command::new("xfreerdp");
        command
            .arg(format!("/v:{}", ctx.address()))
            .arg(format!("/u:{}", username))
            .arg(format!("/p:{}", cred.password))
            .arg("/cert:ignore")
            .arg(format!("/timeout:{}", ctx.timeout.as_millis()))
            .arg("+auth-only")
            .kill_on_drop(true);
        if !domain.is_empty() {
            command.arg(format!("/d:{}", domain));
        }
        let output = command.output().await.explain("rdp connection failed")?;
        if !output.status.success() {
            return Err(Failure::new(
                format!("rdp authentication failed for {}:{}", username, cred.password),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(format!("creds used were {}:{}", username, cred.password))
    }
}
