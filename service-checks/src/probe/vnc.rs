use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::outcome::{CheckContext, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::Service;
use crate::wire;

const SECURITY_VNC_AUTH: u8 = 2;

/// RFB handshake with VNC authentication, up to the server's init message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Vnc {
    #[serde(flatten)]
    pub service: Service,
}

/// DES of the challenge keyed by the password, with each key byte bit-reversed.
fn challenge_response(password: &str, challenge: &[u8; 16]) -> anyhow::Result<[u8; 16]> {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    let cipher = Des::new_from_slice(&key).map_err(|e| anyhow::anyhow!("bad key: {}", e))?;
    let mut response = *challenge;
    for chunk in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(response)
}

async fn read_reason<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let Ok(len) = stream.read_u32().await else {
        return String::new();
    };
    let mut reason = vec![0u8; len.min(4096) as usize];
    match stream.read_exact(&mut reason).await {
        Ok(_) => String::from_utf8_lossy(&reason).into_owned(),
        Err(_) => String::new(),
    }
}

/// Returns the desktop name announced by the server.
pub(crate) async fn handshake<S>(stream: &mut S, password: &str) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.context("no protocol version")?;
    let text = String::from_utf8_lossy(&version).into_owned();
    ensure!(text.starts_with("RFB "), "not a VNC server: {:?}", text);
    let minor: u32 = text
        .get(8..11)
        .and_then(|it| it.parse().ok())
        .with_context(|| format!("bad protocol version {:?}", text))?;
    let minor = match minor {
        m if m >= 8 => 8,
        7 => 7,
        _ => 3,
    };
    stream
        .write_all(format!("RFB 003.{:03}\n", minor).as_bytes())
        .await?;

    if minor == 3 {
        match stream.read_u32().await? {
            2 => {}
            0 => bail!("server refused: {}", read_reason(stream).await),
            other => bail!("server does not offer VNC authentication (type {})", other),
        }
    } else {
        let count = stream.read_u8().await?;
        if count == 0 {
            bail!("server refused: {}", read_reason(stream).await);
        }
        let mut types = vec![0u8; count as usize];
        stream.read_exact(&mut types).await?;
        ensure!(
            types.contains(&SECURITY_VNC_AUTH),
            "server does not offer VNC authentication (offers {:?})",
            types
        );
        stream.write_u8(SECURITY_VNC_AUTH).await?;
    }

    let mut challenge = [0u8; 16];
    stream.read_exact(&mut challenge).await?;
    stream
        .write_all(&challenge_response(password, &challenge)?)
        .await?;
    if stream.read_u32().await? != 0 {
        let reason = if minor == 8 {
            read_reason(stream).await
        } else {
            String::new()
        };
        bail!("authentication failed {}", reason);
    }

    stream.write_u8(1).await?; // shared session
    let mut init = [0u8; 20];
    stream.read_exact(&mut init).await?;
    Ok(read_reason(stream).await)
}

#[async_trait]
impl Probe for Vnc {
    const TYPE: ServiceType = ServiceType::Vnc;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(5900)
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let cred = ctx.credential()?;
        let mut stream = wire::connect(&ctx.address(), ctx.timeout)
            .await
            .map_err(|e| Failure::new("connection to vnc server failed", format!("{:#}", e)))?;
        let desktop = timeout(ctx.timeout, handshake(&mut stream, &cred.password))
            .await
            .map_err(|_| Failure::new("vnc handshake timed out", ""))?
            .map_err(|e| {
                Failure::new(
                    "vnc login failed",
                    format!("password {}, error: {:#}", cred.password, e),
                )
            })?;
        Ok(format!(
            "logged into desktop {:?} with password {}",
            desktop, cred.password
        ))
    }
}
