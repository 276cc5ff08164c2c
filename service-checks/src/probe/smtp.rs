use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::Service;
use crate::wire::LineConn;

/// Authenticates when possible and delivers a random message from one user to another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Smtp {
    #[serde(flatten)]
    pub service: Service,
    pub encrypted: bool,
    pub domain: String,
    /// Authenticate even if the server does not advertise AUTH.
    pub require_auth: bool,
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn plain_auth(username: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{}\0{}", username, password))
}

#[async_trait]
impl Probe for Smtp {
    const TYPE: ServiceType = ServiceType::Smtp;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(25)
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let sender = ctx.credential()?;
        let recipient = ctx.credential()?;
        let from = format!("{}{}", sender.username, self.domain);
        let to = format!("{}{}", recipient.username, self.domain);

        let mut conn = LineConn::open(&ctx.address(), self.encrypted, ctx.timeout)
            .await
            .explain("connection to server failed")?;
        conn.expect(2).await.explain("smtp client creation failed")?;
        let ehlo = conn
            .exchange("EHLO scoring-engine", 2)
            .await
            .explain("smtp client creation failed")?;
        let advertises_auth = ehlo
            .lines
            .iter()
            .any(|it| it.to_ascii_uppercase().starts_with("AUTH"));

        if self.require_auth || advertises_auth {
            conn.exchange(
                &format!("AUTH PLAIN {}", plain_auth(&from, &sender.password)),
                2,
            )
            .await
            .map_err(|e| {
                Failure::new(
                    format!("login failed for {}:{}", from, sender.password),
                    format!("{:#}", e),
                )
            })?;
        }
        conn.exchange(&format!("MAIL FROM:<{}>", from), 2)
            .await
            .explain("setting sender failed")?;
        conn.exchange(&format!("RCPT TO:<{}>", to), 2)
            .await
            .explain("setting receiver failed")?;
        conn.exchange("DATA", 3)
            .await
            .explain("creating email writer failed")?;

        let subject = random_hex(8);
        let body = random_hex(32);
        let message = format!("Subject: {}\r\n\r\n{}\r\n.", subject, body);
        conn.exchange(&message, 2)
            .await
            .explain("writing message failed")?;
        let _ = conn.send("QUIT").await;
        Ok(format!(
            "successfully wrote '{}' to {} from {}",
            subject, to, from
        ))
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion, ResultAssertion};
    use queue_models::Credential;

    use super::*;
    use crate::outcome::test_support::context;
    use crate::outcome::ProbeEnv;
    use crate::wire::test_support::scripted;

    #[test]
    fn plain_auth_encoding() {
        assert_that!(plain_auth("user", "pass")).is_equal_to("AHVzZXIAcGFzcw==".to_string());
    }

    #[tokio::test]
    async fn credentials_required() {
        let env = ProbeEnv::default();

        let result = Smtp::default()
            .check(&context("127.0.0.1", 25, &[], &env))
            .await;

        assert_that!(result.unwrap_err().error).is_equal_to("error getting creds".to_string());
    }

    #[tokio::test]
    async fn delivers_with_auth_when_advertised() {
        // given
        let (port, server) = scripted(
            "220 mail ESMTP\r\n",
            vec![
                ("EHLO", "250-mail\r\n250 AUTH PLAIN\r\n"),
                ("AUTH", "235 ok\r\n"),
                ("MAIL", "250 ok\r\n"),
                ("RCPT", "250 ok\r\n"),
                ("DATA", "354 go ahead\r\n"),
                (".", "250 queued\r\n"),
            ],
        )
        .await;
        let env = ProbeEnv::default();
        let creds = [Credential::new("carol", "pw")];
        let smtp = Smtp {
            domain: "@corp.local".to_string(),
            ..Default::default()
        };

        // when
        let result = smtp.check(&context("127.0.0.1", port, &creds, &env)).await;

        // then
        assert_that!(result).is_ok();
        let seen = server.await.unwrap();
        assert_that!(seen.contains(&"MAIL FROM:<carol@corp.local>".to_string())).is_true();
        assert_that!(seen.iter().any(|it| it.starts_with("AUTH PLAIN "))).is_true();
    }
}
