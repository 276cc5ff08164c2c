use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

/// ICMP echo through the system `ping`, which already holds the privileges raw sockets need.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ping {
    #[serde(flatten)]
    pub service: Service,
    pub count: u32,
    pub allow_packet_loss: bool,
    /// Loss percentage at which the check fails, with `AllowPacketLoss`.
    pub percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Statistics {
    received: u32,
    loss: f64,
}

fn statistics(output: &str) -> Option<Statistics> {
    let received = Regex::new(r"(\d+) (?:packets )?received").ok()?;
    let loss = Regex::new(r"([\d.]+)% packet loss").ok()?;
    Some(Statistics {
        received: received.captures(output)?[1].parse().ok()?,
        loss: loss.captures(output)?[1].parse().ok()?,
    })
}

impl Ping {
    fn judge(&self, stats: Statistics) -> ProbeResult {
        if self.allow_packet_loss {
            if stats.loss >= self.percent as f64 {
                return Err(Failure::new(
                    "not enough pings succeeded",
                    format!(
                        "ping failed: packet loss of {:.0}% higher than limit of {}%",
                        stats.loss, self.percent
                    ),
                ));
            }
        } else if stats.received != self.count {
            return Err(Failure::new(
                "not all pings succeeded",
                format!("packet loss of {}%", stats.loss),
            ));
        }
        Ok(format!(
            "{} of {} echo requests answered",
            stats.received, self.count
        ))
    }
}

#[async_trait]
impl Probe for Ping {
    const TYPE: ServiceType = ServiceType::Ping;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.count == 0 {
            self.count = 1;
        }
        if self.percent > 100 {
            return Err(self.service.invalid("packet loss percent above 100"));
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let count = self.count.max(1);
        let output = Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg(count.to_string())
            .arg("-W")
            .arg(ctx.timeout.as_secs().max(1).to_string())
            .arg(&ctx.target)
            .kill_on_drop(true)
            .output()
            .await
            .explain("ping creation failed")?;
        let text = String::from_utf8_lossy(&output.stdout);
        let stats = statistics(&text).ok_or_else(|| {
            Failure::new(
                "ping failed",
                format!(
                    "{}{}",
                    text,
                    String::from_utf8_lossy(&output.stderr)
                ),
            )
        })?;
        self.judge(stats)
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, ResultAssertion};

    use super::*;

    const LINUX: &str = "--- 10.1.1.5 ping statistics ---\n\
        3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms\n";
    const BUSYBOX: &str = "--- 10.1.1.5 ping statistics ---\n\
        1 packets transmitted, 1 packets received, 0% packet loss\n";

    fn ping(count: u32, allow_packet_loss: bool, percent: u32) -> Ping {
        Ping {
            count,
            allow_packet_loss,
            percent,
            ..Default::default()
        }
    }

    #[test]
    fn parses_summaries() {
        assert_that!(statistics(LINUX)).is_equal_to(Some(Statistics {
            received: 2,
            loss: 33.3333,
        }));
        assert_that!(statistics(BUSYBOX)).is_equal_to(Some(Statistics {
            received: 1,
            loss: 0.0,
        }));
        assert_that!(statistics("ping: unknown host")).is_equal_to(None);
    }

    #[test]
    fn all_must_answer_by_default() {
        let stats = statistics(LINUX).unwrap();

        assert_that!(ping(3, false, 0).judge(stats)).is_err();
        assert_that!(ping(2, false, 0).judge(stats)).is_ok();
    }

    #[test]
    fn loss_below_limit_passes() {
        let stats = statistics(LINUX).unwrap();

        assert_that!(ping(3, true, 50).judge(stats)).is_ok();
        assert_that!(ping(3, true, 30).judge(stats)).is_err();
    }

    #[test]
    fn count_defaults_to_one() {
        let mut check = Ping::default();

        check.validate().unwrap();

        assert_that!(check.count).is_equal_to(1);
    }
}
