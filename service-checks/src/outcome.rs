use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use queue_models::{Credential, RoundId, TeamId};
use rand::seq::SliceRandom;
use thiserror::Error;

/// What a single probe run concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub passed: bool,
    pub error: String,
    pub debug: String,
}

impl Outcome {
    pub fn passed(debug: impl Into<String>) -> Self {
        Self {
            passed: true,
            error: String::new(),
            debug: debug.into(),
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            passed: false,
            error: failure.error,
            debug: failure.debug,
        }
    }
}

/// Why a probe failed: a short `error` for the scoreboard and a `debug` text for the admins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error}")]
pub struct Failure {
    pub error: String,
    pub debug: String,
}

impl Failure {
    pub fn new(error: impl Into<String>, debug: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            debug: debug.into(),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            error: err.to_string(),
            debug: format!("{:#}", err),
        }
    }
}

/// `Ok` carries the debug text of a pass.
pub type ProbeResult = Result<String, Failure>;

pub(crate) trait Explain<T> {
    /// Turns any error into a [Failure] with the given summary, keeping the original as debug.
    fn explain(self, error: &str) -> Result<T, Failure>;
}

impl<T, E: Display> Explain<T> for Result<T, E> {
    fn explain(self, error: &str) -> Result<T, Failure> {
        self.map_err(|e| Failure::new(error, format!("{:#}", e)))
    }
}

/// Worker-local settings that probes may need.
#[derive(Debug, Clone)]
pub struct ProbeEnv {
    /// Where key material and reference files referenced by the configuration live.
    pub scored_files: PathBuf,
}

impl Default for ProbeEnv {
    fn default() -> Self {
        Self {
            scored_files: PathBuf::from("config/scoredfiles"),
        }
    }
}

/// Everything a probe knows about the run it is part of.
pub struct CheckContext<'a> {
    pub team_id: TeamId,
    pub team_identifier: &'a str,
    pub round_id: RoundId,
    /// Host with `_` already replaced by the team identifier.
    pub target: String,
    pub port: u16,
    pub timeout: Duration,
    pub credentials: &'a [Credential],
    pub env: &'a ProbeEnv,
}

impl CheckContext<'_> {
    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.target.contains(':') && !self.target.starts_with('[') {
            format!("[{}]:{}", self.target, self.port)
        } else {
            format!("{}:{}", self.target, self.port)
        }
    }

    /// One of the task credentials, chosen uniformly at random.
    pub fn credential(&self) -> Result<&Credential, Failure> {
        self.credentials
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| {
                Failure::new(
                    "error getting creds",
                    "no credentials available for this team and service",
                )
            })
    }

    /// Like [Self::credential], but only when the service is configured to use credentials.
    pub fn credential_if(&self, configured: bool) -> Result<Option<&Credential>, Failure> {
        if configured {
            self.credential().map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn context<'a>(
        target: &str,
        port: u16,
        credentials: &'a [Credential],
        env: &'a ProbeEnv,
    ) -> CheckContext<'a> {
        CheckContext {
            team_id: 1,
            team_identifier: "01",
            round_id: 1,
            target: target.to_string(),
            port,
            timeout: Duration::from_secs(3),
            credentials,
            env,
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, ResultAssertion};

    use super::test_support::context;
    use super::*;

    #[test]
    fn address_brackets_ipv6() {
        let env = ProbeEnv::default();

        assert_that!(context("::1", 22, &[], &env).address()).is_equal_to("[::1]:22".to_string());
        assert_that!(context("10.1.1.5", 22, &[], &env).address())
            .is_equal_to("10.1.1.5:22".to_string());
    }

    #[test]
    fn credential_missing() {
        // given
        let env = ProbeEnv::default();
        let ctx = context("10.1.1.5", 22, &[], &env);

        // when
        let result = ctx.credential();

        // then
        assert_that!(result).is_err();
        assert_that!(ctx.credential_if(false)).is_equal_to(Ok(None));
    }

    #[test]
    fn failure_from_anyhow_keeps_chain() {
        // given
        let err = anyhow::anyhow!("connection refused").context("ftp connection failed");

        // when
        let failure = Failure::from(err);

        // then
        assert_that!(failure.error).is_equal_to("ftp connection failed".to_string());
        assert_that!(failure.debug)
            .is_equal_to("ftp connection failed: connection refused".to_string());
    }
}
