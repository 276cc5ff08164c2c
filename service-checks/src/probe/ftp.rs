use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use crate::matching::RemoteFile;
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};
use crate::wire::{self, LineConn};

/// Logs in (anonymously unless credlists are configured) and optionally fetches a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ftp {
    #[serde(flatten)]
    pub service: Service,
    pub file: Vec<RemoteFile>,
}

#[async_trait]
impl Probe for Ftp {
    const TYPE: ServiceType = ServiceType::Ftp;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(21)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        self.file
            .iter()
            .try_for_each(|file| file.validate(&self.service))
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let (username, password) = match ctx.credential_if(!self.service.credlists.is_empty())? {
            Some(cred) => (cred.username.as_str(), cred.password.as_str()),
            None => ("anonymous", "anonymous"),
        };
        let creds = format!("creds used were {}:{}", username, password);

        let mut conn = LineConn::open(&ctx.address(), false, ctx.timeout)
            .await
            .explain("ftp connection failed")?;
        conn.expect(2).await.explain("ftp connection failed")?;
        login(&mut conn, username, password)
            .await
            .map_err(|e| Failure::new("ftp login failed", format!("{} with error {:#}", creds, e)))?;

        let Some(file) = self.file.choose(&mut rand::thread_rng()) else {
            let _ = conn.send("QUIT").await;
            return Ok(creds);
        };
        let content = retrieve(&mut conn, ctx, &file.name).await.map_err(|e| {
            Failure::new(
                format!("failed to retrieve file {}", file.name),
                format!("{}: {:#}", creds, e),
            )
        })?;
        let _ = conn.send("QUIT").await;
        let verdict = file.compare(&content)?;
        Ok(format!("{}; {}", creds, verdict))
    }
}

async fn login(conn: &mut LineConn, username: &str, password: &str) -> anyhow::Result<()> {
    let reply = conn.exchange(&format!("USER {}", username), 2).await;
    match reply {
        Ok(_) => Ok(()), // no password needed
        Err(_) => {
            conn.exchange(&format!("PASS {}", password), 2).await?;
            Ok(())
        }
    }
}

async fn retrieve(conn: &mut LineConn, ctx: &CheckContext<'_>, name: &str) -> anyhow::Result<Vec<u8>> {
    conn.exchange("TYPE I", 2).await?;
    let pasv = conn.exchange("PASV", 2).await?;
    let port = passive_port(&pasv.text())?;
    // The announced address is ignored; teams may sit behind NAT.
    let data_address = format!("{}:{}", ctx.target, port);
    let mut data = wire::connect(&data_address, ctx.timeout).await?;
    conn.send(&format!("RETR {}", name)).await?;
    conn.expect(1).await?;
    let mut content = vec![];
    timeout(ctx.timeout, data.read_to_end(&mut content))
        .await
        .context("timed out reading the file")??;
    conn.expect(2).await?;
    Ok(content)
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
fn passive_port(reply: &str) -> anyhow::Result<u16> {
    let inner = reply
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inner, _)| inner)
        .with_context(|| format!("unexpected PASV reply {:?}", reply))?;
    let numbers: Vec<u16> = inner
        .split(',')
        .map(|it| it.trim().parse())
        .collect::<Result<_, _>>()
        .with_context(|| format!("unexpected PASV reply {:?}", reply))?;
    if numbers.len() != 6 || numbers[4] > 255 || numbers[5] > 255 {
        bail!("unexpected PASV reply {:?}", reply);
    }
    Ok(numbers[4] * 256 + numbers[5])
}
