use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::matching::{self, shell_quote};
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

/// Runs an arbitrary shell command against the target.
///
/// `ROUND`, `TARGET`, `TEAMIDENTIFIER`, `USERNAME` and `PASSWORD` in the command are replaced
/// before it runs; credentials are only picked when credlists are configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Custom {
    #[serde(flatten)]
    pub service: Service,
    pub command: String,
    /// Searched for in stdout and stderr, when set.
    pub regex: String,
}

impl Custom {
    fn form_command(&self, ctx: &CheckContext<'_>) -> Result<String, Failure> {
        let (username, password) = match ctx.credential_if(!self.service.credlists.is_empty())? {
            Some(cred) => (cred.username.as_str(), cred.password.as_str()),
            None => ("", ""),
        };
        Ok(self
            .command
            .replace("ROUND", &ctx.round_id.to_string())
            .replace("TARGET", &ctx.target)
            .replace("TEAMIDENTIFIER", ctx.team_identifier)
            .replace("USERNAME", &shell_quote(username))
            .replace("PASSWORD", &shell_quote(password)))
    }
}

#[async_trait]
impl Probe for Custom {
    const TYPE: ServiceType = ServiceType::Custom;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.command.is_empty() {
            return Err(self.service.invalid("no command configured"));
        }
        if !self.regex.is_empty() {
            matching::compile(&self.service, &self.regex)?;
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let command = self.form_command(ctx)?;
        debug!("Custom check {} runs {}", self.service.name, command);
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .kill_on_drop(true)
            .output()
            .await
            .explain("error starting command")?;
        let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Failure::new(
                format!("command returned error: {}", output.status),
                format!("{}\noutput:\n{}", command, out),
            ));
        }
        if self.regex.is_empty() {
            return Ok(format!("{} {}", command, out));
        }
        if matching::regex(&self.regex)?.is_match(&out) {
            Ok(format!("{} found regex {:?} in {}", command, self.regex, out))
        } else {
            Err(Failure::new(
                "output incorrect",
                format!("{} couldn't find regex {:?} in {}", command, self.regex, out),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion, ResultAssertion};
    use queue_models::Credential;

    use super::*;
    use crate::outcome::test_support::context;
    use crate::outcome::ProbeEnv;

    fn custom(command: &str, regex: &str) -> Custom {
        Custom {
            command: command.to_string(),
            regex: regex.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn substitutes_placeholders() {
        // given
        let env = ProbeEnv::default();
        let creds = [Credential::new("bob", "it's")];
        let mut check = custom("probe TARGET ROUND TEAMIDENTIFIER USERNAME PASSWORD", "");
        check.service.credlists = vec!["users.credlist".to_string()];

        // when
        let formed = check.form_command(&context("10.1.1.5", 0, &creds, &env)).unwrap();

        // then
        assert_that!(formed).is_equal_to(r"probe 10.1.1.5 1 01 'bob' 'it'\''s'".to_string());
    }

    #[test]
    fn missing_credentials_fail_when_configured() {
        let env = ProbeEnv::default();
        let mut check = custom("true", "");
        check.service.credlists = vec!["users.credlist".to_string()];

        let formed = check.form_command(&context("10.1.1.5", 0, &[], &env));

        assert_that!(formed.unwrap_err().error).is_equal_to("error getting creds".to_string());
    }

    #[tokio::test]
    async fn exit_status_and_regex() {
        // given
        let env = ProbeEnv::default();
        let ctx = context("127.0.0.1", 0, &[], &env);

        // when
        let found = custom("echo round ROUND", "round [0-9]+").check(&ctx).await;
        let missing = custom("echo nothing", "^flag").check(&ctx).await;
        let failing = custom("exit 3", "").check(&ctx).await;

        // then
        assert_that!(found).is_ok();
        assert_that!(missing.unwrap_err().error).is_equal_to("output incorrect".to_string());
        assert_that!(failing.unwrap_err().error.starts_with("command returned error")).is_true();
    }
}
