//! WinRM over plain WS-Management SOAP, authenticated with HTTP basic auth.
//!
//! A round trip is: create a `cmd` shell, start `powershell.exe -EncodedCommand`, poll
//! `Receive` until the command state is `Done`, delete the shell.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matching;
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

const SHELL_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const STATE_DONE: &str = "CommandState/Done";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WinRmCommand {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_regex: bool,
    pub command: String,
    pub output: String,
}

/// Logs in over WinRM and optionally runs a PowerShell command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WinRm {
    #[serde(flatten)]
    pub service: Service,
    /// HTTPS instead of HTTP.
    pub encrypted: bool,
    pub bad_attempts: u32,
    pub command: Vec<WinRmCommand>,
}

/// `powershell.exe -EncodedCommand` wants base64 of UTF-16LE.
pub(crate) fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    STANDARD.encode(bytes)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Received {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    done: bool,
}

fn capture(pattern: &str, xml: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .captures(xml)
        .map(|it| it[1].trim().to_string())
}

fn shell_id(xml: &str) -> Option<String> {
    capture(r"<(?:\w+:)?ShellId>([^<]+)<", xml)
        .or_else(|| capture(r#"Name="ShellId"\s*>([^<]+)<"#, xml))
}

fn command_id(xml: &str) -> Option<String> {
    capture(r"<(?:\w+:)?CommandId>([^<]+)<", xml)
}

pub(crate) fn parse_receive(xml: &str) -> anyhow::Result<Received> {
    let streams = Regex::new(r"<(?:\w+:)?Stream\s+([^>]*)>([^<]*)</")?;
    let mut received = Received {
        done: xml.contains(STATE_DONE),
        ..Default::default()
    };
    for found in streams.captures_iter(xml) {
        let chunk = STANDARD
            .decode(found[2].trim())
            .context("undecodable output stream")?;
        if found[1].contains(r#"Name="stderr""#) {
            received.stderr.extend(chunk);
        } else {
            received.stdout.extend(chunk);
        }
    }
    Ok(received)
}

struct WsMan {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl WsMan {
    fn envelope(&self, action: &str, shell: Option<&str>, extra_header: &str, body: &str) -> String {
        let selector = shell
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    id
                )
            })
            .unwrap_or_default();
        format!(
            concat!(
                r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
                r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
                r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
                r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">"#,
                "<s:Header><a:To>{to}</a:To>",
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>"#,
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT{secs}S</w:OperationTimeout>",
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{extra}</s:Header><s:Body>{body}</s:Body></s:Envelope>"
            ),
            to = self.endpoint,
            id = Uuid::new_v4(),
            secs = self.timeout.as_secs().max(1),
            resource = SHELL_URI,
            action = action,
            selector = selector,
            extra = extra_header,
            body = body,
        )
    }

    async fn post(&self, envelope: String) -> anyhow::Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .context("http request failed")?;
        let status = response.status();
        let text = response.text().await.context("unable to read response")?;
        if status == StatusCode::UNAUTHORIZED {
            bail!("http response error: 401 - invalid content type or credentials");
        }
        if !status.is_success() {
            let fault = capture(r"<(?:\w+:)?Text[^>]*>([^<]+)<", &text).unwrap_or_default();
            bail!("http error {}: {}", status, fault);
        }
        Ok(text)
    }

    async fn create_shell(&self) -> anyhow::Result<String> {
        let options = concat!(
            r#"<w:OptionSet><w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option></w:OptionSet>"#
        );
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
            <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let reply = self
            .post(self.envelope(ACTION_CREATE, None, options, body))
            .await?;
        shell_id(&reply).context("no shell id in response")
    }

    async fn delete_shell(&self, shell: &str) -> anyhow::Result<()> {
        self.post(self.envelope(ACTION_DELETE, Some(shell), "", ""))
            .await
            .map(|_| ())
    }

    async fn run_powershell(&self, shell: &str, script: &str) -> anyhow::Result<Received> {
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command>\
            <rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {}</rsp:Arguments></rsp:CommandLine>",
            encode_powershell(script)
        );
        let reply = self
            .post(self.envelope(ACTION_COMMAND, Some(shell), "", &body))
            .await?;
        let command = command_id(&reply).context("no command id in response")?;

        let mut output = Received::default();
        while !output.done {
            let body = format!(
                r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
                command
            );
            let reply = self
                .post(self.envelope(ACTION_RECEIVE, Some(shell), "", &body))
                .await?;
            let chunk = parse_receive(&reply)?;
            output.stdout.extend(chunk.stdout);
            output.stderr.extend(chunk.stderr);
            output.done = chunk.done;
        }
        Ok(output)
    }
}

impl WinRmCommand {
    fn judge(&self, stdout: &str) -> Result<(), Failure> {
        if self.output.is_empty() {
            return Ok(());
        }
        if matching::output_matches(stdout, &self.output, self.use_regex)? {
            return Ok(());
        }
        let error = if self.use_regex {
            "command output didn't match regex"
        } else {
            "command output didn't match string"
        };
        Err(Failure::new(
            error,
            format!(
                "command output of '{}' didn't match '{}': {}",
                self.command, self.output, stdout
            ),
        ))
    }
}

#[async_trait]
impl Probe for WinRm {
    const TYPE: ServiceType = ServiceType::WinRm;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        if self.encrypted {
            Some(443)
        } else {
            Some(80)
        }
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        for command in self.command.iter().filter(|it| it.use_regex) {
            matching::compile(&self.service, &command.output)?;
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let cred = ctx.credential()?;
        let scheme = if self.encrypted { "https" } else { "http" };
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(ctx.timeout)
            .build()
            .explain("error creating winrm client")?;
        let endpoint = format!("{}://{}/wsman", scheme, ctx.address());

        for _ in 0..self.bad_attempts {
            let wrong = WsMan {
                client: client.clone(),
                endpoint: endpoint.clone(),
                username: cred.username.clone(),
                password: Uuid::new_v4().to_string(),
                timeout: ctx.timeout,
            };
            let _ = wrong.create_shell().await;
        }

        let wsman = WsMan {
            client,
            endpoint,
            username: cred.username.clone(),
            password: cred.password.clone(),
            timeout: ctx.timeout,
        };
        let creds = format!("{}:{}", cred.username, cred.password);
        let shell = wsman
            .create_shell()
            .await
            .map_err(|e| Failure::new(format!("failed with creds {}", creds), format!("{:#}", e)))?;

        let command = self.command.choose(&mut rand::thread_rng());
        let verdict = match command {
            Some(command) => match wsman.run_powershell(&shell, &command.command).await {
                Ok(output) if !output.stderr.is_empty() => Err(Failure::new(
                    "command produced an error message",
                    format!("error: {}", String::from_utf8_lossy(&output.stderr)),
                )),
                Ok(output) => command.judge(&String::from_utf8_lossy(&output.stdout)),
                Err(e) => Err(Failure::new(
                    format!("failed with creds {}", creds),
                    format!("{:#}", e),
                )),
            },
            None => Ok(()),
        };
        let _ = wsman.delete_shell(&shell).await;
        verdict?;
        Ok(format!("creds used were {}", creds))
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion, ResultAssertion};
    use queue_models::Credential;

    use super::*;
    use crate::outcome::test_support::context;
    use crate::outcome::ProbeEnv;
    use crate::probe::web::test_support::stub_http;

    #[test]
    fn encodes_utf16le() {
        assert_that!(encode_powershell("hi")).is_equal_to("aABpAA==".to_string());
    }

    #[test]
    fn finds_ids() {
        let created = r#"<s:Body><x:ResourceCreated><a:ReferenceParameters><w:SelectorSet>
            <w:Selector Name="ShellId">11AA-22BB</w:Selector></w:SelectorSet>
            </a:ReferenceParameters></x:ResourceCreated><rsp:Shell><rsp:ShellId>11AA-22BB</rsp:ShellId>"#;
        let started = "<rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse>";

        assert_that!(shell_id(created)).is_equal_to(Some("11AA-22BB".to_string()));
        assert_that!(command_id(started)).is_equal_to(Some("CMD-1".to_string()));
    }

    #[test]
    fn collects_streams_until_done() {
        // given
        let xml = r#"<rsp:ReceiveResponse>
            <rsp:Stream Name="stdout" CommandId="CMD-1">aGVsbG8=</rsp:Stream>
            <rsp:Stream Name="stdout" CommandId="CMD-1" End="true"></rsp:Stream>
            <rsp:Stream Name="stderr" CommandId="CMD-1" End="true"></rsp:Stream>
            <rsp:CommandState CommandId="CMD-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
            <rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse>"#;

        // when
        let received = parse_receive(xml).unwrap();

        // then
        assert_that!(received.stdout).is_equal_to(b"hello".to_vec());
        assert_that!(received.stderr.is_empty()).is_true();
        assert_that!(received.done).is_true();
    }

    #[test]
    fn output_comparison() {
        let exact = WinRmCommand {
            command: "hostname".to_string(),
            output: "DC01".to_string(),
            use_regex: false,
        };

        assert_that!(exact.judge("DC01\r\n")).is_ok();
        assert_that!(exact.judge("WS02").unwrap_err().error)
            .is_equal_to("command output didn't match string".to_string());
    }

    #[tokio::test]
    async fn rejected_credentials() {
        // given
        let port = stub_http(401, "").await;
        let env = ProbeEnv::default();
        let creds = [Credential::new("Administrator", "wrong")];

        // when
        let result = WinRm::default()
            .check(&context("127.0.0.1", port, &creds, &env))
            .await;

        // then
        assert_that!(result.unwrap_err().error)
            .is_equal_to("failed with creds Administrator:wrong".to_string());
    }
}
