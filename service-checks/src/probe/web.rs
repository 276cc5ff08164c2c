use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::matching;
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WebUrl {
    pub path: String,
    /// Expected status code; any status passes when zero.
    #[serde(skip_serializing_if = "is_zero")]
    pub status: u16,
    /// Allowed difference to `CompareFile`, in percent. Accepted but not scored.
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub diff: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub regex: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub compare_file: String,
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

fn is_zero_i32(value: &i32) -> bool {
    *value == 0
}

/// Fetches one of the configured pages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Web {
    #[serde(flatten)]
    pub service: Service,
    pub url: Vec<WebUrl>,
    pub scheme: String,
}

impl Web {
    fn request_url(&self, ctx: &CheckContext<'_>, path: &str) -> Result<Url, Failure> {
        let raw = format!("{}://{}{}", self.scheme_or_default(), ctx.address(), path);
        match Url::parse(&raw) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(url),
            _ => Err(Failure::new(
                "invalid request URL",
                format!("URL failed validation: {}", raw),
            )),
        }
    }

    fn scheme_or_default(&self) -> &str {
        if self.scheme.is_empty() {
            "http"
        } else {
            &self.scheme
        }
    }
}

#[async_trait]
impl Probe for Web {
    const TYPE: ServiceType = ServiceType::Web;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        if self.scheme_or_default() == "https" {
            Some(443)
        } else {
            Some(80)
        }
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.scheme.is_empty() {
            self.scheme = "http".to_string();
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(self
                .service
                .invalid(format!("unsupported scheme {:?}", self.scheme)));
        }
        if self.url.is_empty() {
            return Err(self.service.invalid("no urls defined"));
        }
        for url in &mut self.url {
            if url.path.is_empty() {
                url.path = "/".to_string();
            }
        }
        for url in &self.url {
            if url.diff != 0 && url.compare_file.is_empty() {
                return Err(self.service.invalid("need compare file for diff in web"));
            }
            if !url.regex.is_empty() {
                matching::compile(&self.service, &url.regex)?;
            }
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let (page, user_agent) = {
            let mut rng = rand::thread_rng();
            let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or_default();
            (self.url.choose(&mut rng), user_agent)
        };
        let page = page.ok_or_else(|| Failure::new("no urls defined", ""))?;
        let path = if page.path.is_empty() { "/" } else { &page.path };
        let url = self.request_url(ctx, path)?;

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(ctx.timeout)
            .pool_max_idle_per_host(0)
            .user_agent(user_agent)
            .build()
            .explain("error creating web request")?;
        let response = client.get(url.clone()).send().await.map_err(|e| {
            let debug = if e.is_timeout() {
                format!(
                    "HTTP request to {} timed out after {:?} (TCP connection may have succeeded but server did not respond)",
                    url, ctx.timeout
                )
            } else {
                format!("{} for url {}", e, path)
            };
            Failure::new("web request errored out", debug)
        })?;

        let status = response.status().as_u16();
        if page.status != 0 && status != page.status {
            return Err(Failure::new(
                "status returned by webserver was incorrect",
                format!("status was {} wanted {} for url {}", status, page.status, path),
            ));
        }
        let body = response.text().await.map_err(|e| {
            Failure::new(
                "error reading page content",
                format!("error was '{}' for url {}", e, path),
            )
        })?;
        if page.regex.is_empty() {
            return Ok(format!("GET {} returned {}", url, status));
        }
        if matching::regex(&page.regex)?.is_match(&body) {
            Ok(format!("matched regex {:?} for {}", page.regex, path))
        } else {
            Err(Failure::new(
                "didn't find regex on page",
                format!("couldn't find regex {:?} for {}", page.regex, path),
            ))
        }
    }
}
