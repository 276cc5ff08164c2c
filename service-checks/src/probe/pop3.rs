use anyhow::ensure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::Service;
use crate::wire::LineConn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Pop3 {
    #[serde(flatten)]
    pub service: Service,
    pub domain: String,
    pub encrypted: bool,
}

async fn ok(conn: &mut LineConn, command: &str) -> anyhow::Result<String> {
    let line = conn.command(command).await?;
    ensure!(line.starts_with("+OK"), "server said {}", line);
    Ok(line)
}

#[async_trait]
impl Probe for Pop3 {
    const TYPE: ServiceType = ServiceType::Pop3;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(110)
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let mut conn = LineConn::open(&ctx.address(), self.encrypted, ctx.timeout)
            .await
            .explain("connection to server failed")?;
        let greeting = conn.read_line().await.explain("connection to server failed")?;
        if !greeting.starts_with("+OK") {
            return Err(Failure::new("connection to server failed", greeting));
        }

        let Some(cred) = ctx.credential_if(!self.service.credlists.is_empty())? else {
            return Ok("pop3 server responded to request (anonymous)".to_string());
        };
        let username = format!("{}{}", cred.username, self.domain);
        let login = async {
            ok(&mut conn, &format!("USER {}", username)).await?;
            ok(&mut conn, &format!("PASS {}", cred.password)).await
        };
        login.await.map_err(|e| {
            Failure::new(
                "login failed",
                format!("creds {}:{}, error: {:#}", username, cred.password, e),
            )
        })?;
        let stat = ok(&mut conn, "STAT").await.explain("listing mailbox failed")?;
        let _ = conn.send("QUIT").await;
        Ok(format!(
            "mailbox listed successfully with creds {}:{} ({})",
            username, cred.password, stat
        ))
    }
}
