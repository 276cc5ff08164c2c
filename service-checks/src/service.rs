use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_models::Credential;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event-wide values for everything a service leaves unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDefaults {
    pub points: i32,
    pub timeout: u64,
    pub sla_penalty: i32,
    pub sla_threshold: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{service}: credlist name {credlist:?} does not end in .credlist")]
    CredlistName { service: String, credlist: String },
    #[error("{service}: invalid regex {pattern:?} ({reason})")]
    Regex {
        service: String,
        pattern: String,
        reason: String,
    },
    #[error("{service}: {problem}")]
    Invalid { service: String, problem: String },
}

/// Fields common to every kind of service. Zero and empty mean "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Service {
    /// `<box>-<display>`, assigned by [Service::configure].
    pub name: String,
    pub display: String,
    /// Address of the box; `_` is replaced with the team identifier at run time.
    pub target: String,
    pub port: u16,
    pub points: i32,
    /// Seconds per attempt.
    pub timeout: u64,
    pub sla_penalty: i32,
    pub sla_threshold: u32,
    pub launch_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub attempts: u32,
    #[serde(rename = "CredLists", alias = "Credlists")]
    pub credlists: Vec<String>,
    /// Only ever set on the worker side, from the task.
    #[serde(skip)]
    pub credentials: Vec<Credential>,
}

impl Service {
    /// Fills in everything left unset. Applying this twice yields the same service.
    pub fn configure(
        &mut self,
        box_name: &str,
        ip: &str,
        defaults: &ServiceDefaults,
        default_display: &str,
        default_port: Option<u16>,
    ) -> Result<(), VerifyError> {
        if self.target.is_empty() {
            self.target = ip.to_string();
        }
        if self.points == 0 {
            self.points = defaults.points;
        }
        if self.timeout == 0 {
            self.timeout = defaults.timeout;
        }
        if self.sla_penalty == 0 {
            self.sla_penalty = defaults.sla_penalty;
        }
        if self.sla_threshold == 0 {
            self.sla_threshold = defaults.sla_threshold;
        }
        if self.attempts == 0 {
            self.attempts = 1;
        }
        if self.display.is_empty() {
            self.display = default_display.to_string();
        }
        self.name = format!("{}-{}", box_name, self.display);
        if self.port == 0 {
            if let Some(port) = default_port {
                self.port = port;
            }
        }
        if let Some(bad) = self.credlists.iter().find(|it| !it.ends_with(".credlist")) {
            return Err(VerifyError::CredlistName {
                service: self.name.clone(),
                credlist: bad.clone(),
            });
        }
        if self.points < 0 || self.sla_penalty < 0 {
            return Err(self.invalid("points and SLA penalty must not be negative"));
        }
        Ok(())
    }

    pub fn invalid(&self, problem: impl Into<String>) -> VerifyError {
        VerifyError::Invalid {
            service: self.name.clone(),
            problem: problem.into(),
        }
    }

    /// Not disabled and inside its launch window.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        if matches!(self.launch_time, Some(launch) if now < launch) {
            return false;
        }
        !matches!(self.stop_time, Some(stop) if now >= stop)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}
