use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::matching::RemoteFile;
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

/// Logs in through `smbclient` (as guest unless credlists are configured) and optionally
/// fetches a file from `Share`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Smb {
    #[serde(flatten)]
    pub service: Service,
    pub domain: String,
    pub share: String,
    pub file: Vec<RemoteFile>,
}

impl Smb {
    fn args(&self, ctx: &CheckContext<'_>, username: &str, file: Option<&RemoteFile>) -> Vec<String> {
        let mut args = match file {
            Some(file) => vec![
                format!("//{}/{}", ctx.target, self.share),
                "-c".to_string(),
                format!("get \"{}\" -", file.name),
            ],
            None => vec!["-L".to_string(), format!("//{}", ctx.target)],
        };
        args.extend([
            "-p".to_string(),
            ctx.port.to_string(),
            "-t".to_string(),
            ctx.timeout.as_secs().max(1).to_string(),
            "-U".to_string(),
            username.to_string(),
        ]);
        if !self.domain.is_empty() {
            args.extend(["-W".to_string(), self.domain.clone()]);
        }
        args
    }
}

#[async_trait]
impl Probe for Smb {
    const TYPE: ServiceType = ServiceType::Smb;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(445)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if !self.file.is_empty() && self.share.is_empty() {
            return Err(self.service.invalid("files configured without a share"));
        }
        self.file
            .iter()
            .try_for_each(|file| file.validate(&self.service))
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let (username, password) = match ctx.credential_if(!self.service.credlists.is_empty())? {
            Some(cred) => (cred.username.as_str(), cred.password.as_str()),
            None => ("guest", ""),
        };
        let creds = format!("creds {}:{}", username, password);
        let file = self.file.choose(&mut rand::thread_rng());

        let mut command = Command::new("smbclient");
        command
            .args(self.args(ctx, username, file))
            .env("PASSWD", password)
            .kill_on_drop(true);
        if password.is_empty() {
            command.arg("-N");
        }
        let output = command.output().await.explain("smb connection failed")?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let error = match file {
                Some(file) => format!("failed to open file {}", file.name),
                None => "smb login failed".to_string(),
            };
            return Err(Failure::new(error, format!("{}, error: {}", creds, stderr.trim())));
        }
        let Some(file) = file else {
            return Ok(format!("smb login succeeded, {}", creds));
        };
        let verdict = file.compare(&output.stdout)?;
        Ok(format!("smb {}, {}", verdict, creds))
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, ResultAssertion};

    use super::*;
    use crate::outcome::test_support::context;
    use crate::outcome::ProbeEnv;

    #[test]
    fn lists_shares_without_files() {
        let env = ProbeEnv::default();
        let smb = Smb {
            domain: "CORP".to_string(),
            ..Default::default()
        };

        let args = smb.args(&context("10.1.1.9", 445, &[], &env), "guest", None);

        assert_that!(args.join(" "))
            .is_equal_to("-L //10.1.1.9 -p 445 -t 3 -U guest -W CORP".to_string());
    }

    #[test]
    fn fetches_file_from_share() {
        let env = ProbeEnv::default();
        let file = RemoteFile {
            name: "policy.txt".to_string(),
            ..Default::default()
        };
        let smb = Smb {
            share: "public".to_string(),
            ..Default::default()
        };

        let args = smb.args(&context("10.1.1.9", 445, &[], &env), "bob", Some(&file));

        assert_that!(args[..3].to_vec()).is_equal_to(vec![
            "//10.1.1.9/public".to_string(),
            "-c".to_string(),
            "get \"policy.txt\" -".to_string(),
        ]);
    }

    #[test]
    fn files_need_a_share() {
        let mut smb = Smb {
            file: vec![RemoteFile {
                name: "a.txt".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_that!(smb.validate()).is_err();
    }
}
