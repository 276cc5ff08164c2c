use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use ssh2::Session;
use uuid::Uuid;

use crate::matching;
use crate::outcome::{CheckContext, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SshCommand {
    pub use_regex: bool,
    /// Plain substring search in stdout.
    pub contains: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl SshCommand {
    /// Without `Contains` or `UseRegex` the command passes when it wrote nothing to stderr.
    fn judge(&self, stdout: &str, stderr: &str) -> Result<(), Failure> {
        if self.contains {
            if !stdout.contains(&self.output) {
                return Err(Failure::new(
                    "command output didn't contain string",
                    format!(
                        "command output of '{}' didn't contain string '{}': {}, {}",
                        self.command, self.output, stdout, stderr
                    ),
                ));
            }
        } else if self.use_regex {
            if !matching::regex(&self.output)?.is_match(stdout) {
                return Err(Failure::new(
                    "command output didn't match regex",
                    format!(
                        "command output of '{}' didn't match regex '{}': {}",
                        self.command, self.output, stdout
                    ),
                ));
            }
        } else if !stderr.is_empty() {
            return Err(Failure::new(
                "command returned an error",
                format!("command stderr was not empty: {}", stderr),
            ));
        }
        Ok(())
    }
}

/// Logs in by password or private key and optionally runs a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ssh {
    #[serde(flatten)]
    pub service: Service,
    /// Key file name, relative to the scored files directory.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub priv_key: String,
    /// Failed logins with random passwords before the real one.
    pub bad_attempts: u32,
    pub command: Vec<SshCommand>,
}

enum Auth {
    Password(String),
    Key(PathBuf),
}

struct Login {
    address: String,
    timeout: Duration,
    username: String,
    auth: Auth,
}

impl Login {
    fn session(&self) -> anyhow::Result<Session> {
        let addr = self
            .address
            .to_socket_addrs()
            .context("unable to resolve target")?
            .next()
            .context("target did not resolve")?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).context("connection failed")?;
        let mut session = Session::new().context("unable to create ssh session")?;
        session.set_timeout(self.timeout.as_millis().try_into().unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().context("ssh handshake failed")?;
        Ok(session)
    }

    fn bad_attempt(&self) {
        let garbage = Uuid::new_v4().to_string();
        if let Ok(session) = self.session() {
            let _ = session.userauth_password(&self.username, &garbage);
        }
    }

    fn authenticated(&self) -> anyhow::Result<Session> {
        let session = self.session()?;
        match &self.auth {
            Auth::Password(password) => session.userauth_password(&self.username, password)?,
            Auth::Key(path) => {
                let key = std::fs::read_to_string(path)
                    .with_context(|| format!("error opening key {}", path.display()))?;
                session.userauth_pubkey_memory(&self.username, None, &key, None)?
            }
        }
        if !session.authenticated() {
            bail!("authentication rejected");
        }
        Ok(session)
    }
}

fn run_command(session: &Session, command: &str) -> anyhow::Result<(String, String)> {
    let mut channel = session.channel_session().context("unable to open a channel")?;
    channel.exec(command).context("failed to start command")?;
    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;
    channel.wait_close()?;
    Ok((stdout, stderr))
}

#[async_trait]
impl Probe for Ssh {
    const TYPE: ServiceType = ServiceType::Ssh;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(22)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if !self.priv_key.is_empty() && self.bad_attempts != 0 {
            return Err(self
                .service
                .invalid("cannot use both private key and bad attempts"));
        }
        for command in self.command.iter().filter(|it| it.use_regex) {
            matching::compile(&self.service, &command.output)?;
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let cred = ctx.credential()?.clone();
        let auth = if self.priv_key.is_empty() {
            Auth::Password(cred.password.clone())
        } else {
            Auth::Key(ctx.env.scored_files.join(&self.priv_key))
        };
        let login = Login {
            address: ctx.address(),
            timeout: ctx.timeout,
            username: cred.username.clone(),
            auth,
        };
        let bad_attempts = self.bad_attempts;
        let command = self.command.choose(&mut rand::thread_rng()).cloned();
        let login_error = if self.priv_key.is_empty() {
            format!(
                "error logging in to ssh server for creds {}:{}",
                cred.username, cred.password
            )
        } else {
            format!(
                "error logging in to ssh server with private key {}",
                self.priv_key
            )
        };

        let probe = tokio::task::spawn_blocking(move || -> Result<String, Failure> {
            for _ in 0..bad_attempts {
                login.bad_attempt();
            }
            let session = login
                .authenticated()
                .map_err(|e| Failure::new(login_error, format!("error: {:#}", e)))?;
            if let Some(command) = command {
                let (stdout, stderr) = run_command(&session, &command.command)
                    .map_err(|e| Failure::new("unable to run command", format!("{:#}", e)))?;
                command.judge(&stdout, &stderr)?;
            }
            let _ = session.disconnect(None, "done", None);
            Ok(format!("creds used were {}:{}", cred.username, cred.password))
        });
        probe
            .await
            .map_err(|e| Failure::new("ssh probe crashed", e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, ResultAssertion};

    use super::*;

    fn command(contains: bool, use_regex: bool, output: &str) -> SshCommand {
        SshCommand {
            use_regex,
            contains,
            command: "id".to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn contains_searches_stdout() {
        assert_that!(command(true, false, "uid=0").judge("uid=0(root) gid=0", "")).is_ok();
        assert_that!(command(true, false, "uid=0").judge("uid=1000", "").unwrap_err().error)
            .is_equal_to("command output didn't contain string".to_string());
    }

    #[test]
    fn regex_searches_stdout() {
        assert_that!(command(false, true, r"^uid=\d+").judge("uid=33(www-data)", "")).is_ok();
        assert_that!(command(false, true, r"^gid").judge("uid=33", "")).is_err();
    }

    #[test]
    fn plain_command_needs_clean_stderr() {
        assert_that!(command(false, false, "").judge("anything", "")).is_ok();
        assert_that!(command(false, false, "").judge("", "sh: id: not found")).is_err();
    }

    #[test]
    fn key_and_bad_attempts_exclusive() {
        let mut ssh = Ssh {
            priv_key: "team.pem".to_string(),
            bad_attempts: 2,
            ..Default::default()
        };

        assert_that!(ssh.validate()).is_err();
    }
}
