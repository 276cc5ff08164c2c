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
pub struct Imap {
    #[serde(flatten)]
    pub service: Service,
    /// Appended verbatim to the username, e.g. `@corp.local`.
    pub domain: String,
    /// Implicit TLS.
    pub encrypted: bool,
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Sends a tagged command and waits for its tagged completion.
async fn tagged(conn: &mut LineConn, tag: &str, command: &str) -> anyhow::Result<()> {
    conn.send(&format!("{} {}", tag, command)).await?;
    loop {
        let line = conn.read_line().await?;
        if let Some(status) = line.strip_prefix(tag).map(str::trim_start) {
            ensure!(status.starts_with("OK"), "server said {}", status);
            return Ok(());
        }
    }
}

#[async_trait]
impl Probe for Imap {
    const TYPE: ServiceType = ServiceType::Imap;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(143)
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let mut conn = LineConn::open(&ctx.address(), self.encrypted, ctx.timeout)
            .await
            .explain("connection to server failed")?;
        let greeting = conn.read_line().await.explain("connection to server failed")?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(Failure::new("connection to server failed", greeting));
        }

        let Some(cred) = ctx.credential_if(!self.service.credlists.is_empty())? else {
            return Ok("imap server responded to request (anonymous)".to_string());
        };
        let username = format!("{}{}", cred.username, self.domain);
        let login = format!("LOGIN {} {}", quote(&username), quote(&cred.password));
        tagged(&mut conn, "a1", &login).await.map_err(|e| {
            Failure::new(
                "login failed",
                format!("creds {}:{}, error: {:#}", username, cred.password, e),
            )
        })?;
        tagged(&mut conn, "a2", "LIST \"\" \"*\"")
            .await
            .explain("listing mailboxes failed")?;
        let _ = conn.send("a3 LOGOUT").await;
        Ok(format!(
            "mailbox listed successfully with creds {}:{}",
            username, cred.password
        ))
    }
}
