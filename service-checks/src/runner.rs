use async_trait::async_trait;
use queue_models::{Credential, RoundId, TeamId};

use crate::outcome::{CheckContext, Outcome, ProbeEnv, ProbeResult};
use crate::registry::ServiceType;
use crate::service::{Service, ServiceDefaults, VerifyError};

/// The capability every configured service offers, whatever its kind.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Probes the team's copy of the service once. Never fails; failures are in the outcome.
    async fn run(
        &self,
        team_id: TeamId,
        team_identifier: &str,
        round_id: RoundId,
        env: &ProbeEnv,
    ) -> Outcome;

    /// Fills in defaults and validates the configuration. Idempotent.
    fn verify(
        &mut self,
        box_name: &str,
        ip: &str,
        defaults: &ServiceDefaults,
    ) -> Result<(), VerifyError>;

    fn service_type(&self) -> ServiceType;

    fn service(&self) -> &Service;

    fn name(&self) -> &str {
        &self.service().name
    }

    fn attempts(&self) -> u32 {
        self.service().attempts.max(1)
    }

    fn credlists(&self) -> &[String] {
        &self.service().credlists
    }

    fn set_task_credentials(&mut self, credentials: Vec<Credential>);
}

/// Protocol-specific part of a service. [Runner] is derived from this.
#[async_trait]
pub trait Probe: Send + Sync {
    const TYPE: ServiceType;

    fn service(&self) -> &Service;

    fn service_mut(&mut self) -> &mut Service;

    fn default_port(&self) -> Option<u16> {
        None
    }

    /// Type-specific defaults and validation, run after the common part.
    fn validate(&mut self) -> Result<(), VerifyError> {
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult;
}

#[async_trait]
impl<P: Probe> Runner for P {
    async fn run(
        &self,
        team_id: TeamId,
        team_identifier: &str,
        round_id: RoundId,
        env: &ProbeEnv,
    ) -> Outcome {
        let service = Probe::service(self);
        let ctx = CheckContext {
            team_id,
            team_identifier,
            round_id,
            target: service.target.replace('_', team_identifier),
            port: service.port,
            timeout: service.timeout(),
            credentials: &service.credentials,
            env,
        };
        match self.check(&ctx).await {
            Ok(debug) => Outcome::passed(debug),
            Err(failure) => Outcome::failed(failure),
        }
    }

    fn verify(
        &mut self,
        box_name: &str,
        ip: &str,
        defaults: &ServiceDefaults,
    ) -> Result<(), VerifyError> {
        let default_display = P::TYPE.default_display();
        let default_port = self.default_port();
        self.service_mut()
            .configure(box_name, ip, defaults, &default_display, default_port)?;
        self.validate()
    }

    fn service_type(&self) -> ServiceType {
        P::TYPE
    }

    fn service(&self) -> &Service {
        Probe::service(self)
    }

    fn set_task_credentials(&mut self, credentials: Vec<Credential>) {
        self.service_mut().credentials = credentials;
    }
}
