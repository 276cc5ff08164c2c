use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings};
use serde::{Deserialize, Serialize};

use crate::outcome::{CheckContext, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

/// Simple bind as `user@Domain`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ldap {
    #[serde(flatten)]
    pub service: Service,
    /// `name.tld`
    pub domain: String,
    /// `ldaps` instead of `ldap`.
    pub encrypted: bool,
}

impl Ldap {
    fn url(&self, ctx: &CheckContext<'_>) -> String {
        let scheme = if self.encrypted { "ldaps" } else { "ldap" };
        format!("{}://{}", scheme, ctx.address())
    }
}

#[async_trait]
impl Probe for Ldap {
    const TYPE: ServiceType = ServiceType::Ldap;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(636)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        let parts: Vec<&str> = self.domain.split('.').collect();
        if parts.len() != 2 || parts.iter().any(|it| it.is_empty()) {
            return Err(self.service.invalid(format!(
                "domain {:?} is not of the form name.tld",
                self.domain
            )));
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let cred = ctx.credential()?;
        let auth = format!("{}@{}", cred.username, self.domain);
        let settings = LdapConnSettings::new()
            .set_conn_timeout(ctx.timeout)
            .set_no_tls_verify(true);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url(ctx))
            .await
            .map_err(|e| {
                Failure::new(
                    "failed to connect",
                    format!(
                        "login {} password {} failed with error: {}",
                        cred.username, cred.password, e
                    ),
                )
            })?;
        ldap3::drive!(conn);
        ldap.with_timeout(ctx.timeout);

        let bound = ldap
            .simple_bind(&auth, &cred.password)
            .await
            .and_then(|res| res.success());
        let _ = ldap.unbind().await;
        bound.map_err(|e| {
            Failure::new(
                format!("login failed for {}", cred.username),
                format!(
                    "auth string {}, login {} password {} failed with error: {}",
                    auth, cred.username, cred.password, e
                ),
            )
        })?;
        Ok(format!(
            "login successful for username {} password {}",
            cred.username, cred.password
        ))
    }
}
