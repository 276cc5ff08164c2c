//! Small helpers for the line-based protocols that are probed by hand.

use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::native_tls;

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub async fn connect(address: &str, limit: Duration) -> anyhow::Result<TcpStream> {
    timeout(limit, TcpStream::connect(address))
        .await
        .with_context(|| format!("timed out connecting to {}", address))?
        .with_context(|| format!("unable to connect to {}", address))
}

/// TLS without certificate or hostname verification; team services use self-signed certs.
pub async fn wrap_tls(stream: TcpStream, domain: &str) -> anyhow::Result<Box<dyn Stream>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .context("unable to set up TLS")?;
    let stream = tokio_native_tls::TlsConnector::from(connector)
        .connect(domain, stream)
        .await
        .context("TLS handshake failed")?;
    Ok(Box::new(stream))
}

/// A reply of an SMTP- or FTP-style server, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

pub struct LineConn {
    inner: BufReader<Box<dyn Stream>>,
    limit: Duration,
}

impl LineConn {
    pub async fn open(address: &str, tls: bool, limit: Duration) -> anyhow::Result<Self> {
        let stream = connect(address, limit).await?;
        let stream: Box<dyn Stream> = if tls {
            let host = address
                .rsplit_once(':')
                .map(|(host, _)| host.trim_matches(|c| c == '[' || c == ']'))
                .unwrap_or(address);
            wrap_tls(stream, host).await?
        } else {
            Box::new(stream)
        };
        Ok(Self::new(stream, limit))
    }

    pub fn new(stream: Box<dyn Stream>, limit: Duration) -> Self {
        Self {
            inner: BufReader::new(stream),
            limit,
        }
    }

    /// One line without its terminator.
    pub async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut buf = vec![];
        let read = timeout(self.limit, self.inner.read_until(b'\n', &mut buf))
            .await
            .context("timed out waiting for the server")?
            .context("connection broke")?;
        if read == 0 {
            bail!("connection closed by the server");
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        let stream = self.inner.get_mut();
        let payload = format!("{}\r\n", line);
        timeout(self.limit, stream.write_all(payload.as_bytes()))
            .await
            .context("timed out writing to the server")?
            .context("connection broke")?;
        Ok(())
    }

    pub async fn command(&mut self, line: &str) -> anyhow::Result<String> {
        self.send(line).await?;
        self.read_line().await
    }

    /// Reads a coded reply; `250-` continues it, `250 ` ends it.
    pub async fn reply(&mut self) -> anyhow::Result<Reply> {
        let mut lines = vec![];
        loop {
            let line = self.read_line().await?;
            let code = line
                .get(..3)
                .and_then(|it| it.parse::<u16>().ok())
                .with_context(|| format!("unexpected reply {:?}", line))?;
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.get(4..).unwrap_or_default().to_string());
            if last {
                return Ok(Reply { code, lines });
            }
        }
    }

    /// Reads a reply and insists on the given class of code (2 for 2xx and so on).
    pub async fn expect(&mut self, class: u16) -> anyhow::Result<Reply> {
        let reply = self.reply().await?;
        if reply.code / 100 != class {
            bail!("server replied {} {}", reply.code, reply.text());
        }
        Ok(reply)
    }

    pub async fn exchange(&mut self, line: &str, class: u16) -> anyhow::Result<Reply> {
        self.send(line).await?;
        self.expect(class).await
    }
}
