use std::sync::Arc;

use chrono::Utc;
use log::{trace, warn};
use queue_models::{CheckResult, Task};
use service_checks::{build, Outcome, ProbeEnv, RegistryError, Runner};
use tokio::time::timeout;

/// Runs the task's probe up to `attempts` times while the deadline allows, stopping at the
/// first pass. Every attempt is bounded by the service timeout and by what is left of the round.
pub async fn execute(task: &Task, env: Arc<ProbeEnv>) -> CheckResult {
    let mut check = match build(&task.service_type, task.check_data.clone()) {
        Ok(check) => check,
        Err(e) => {
            warn!("Round {}: cannot rebuild {}: {:#}", task.round_id, task.service_name, e);
            let error = match e {
                RegistryError::UnknownType(_) => "unknown service type",
                RegistryError::MalformedCheckData { .. } => "malformed check data",
            };
            return CheckResult::failure(task, error, format!("{:#}", anyhow::Error::from(e)));
        }
    };
    check.set_task_credentials(task.credentials.clone());
    let check = Arc::new(check);
    let per_attempt = check.service().timeout();

    let mut last: Option<Outcome> = None;
    for attempt in 1..=task.attempts.max(1) {
        let remaining = match (task.deadline - Utc::now()).to_std() {
            Ok(left) if !left.is_zero() => left,
            _ => break,
        };
        let limit = per_attempt.min(remaining);
        trace!("{}: attempt {} with {:?}", task.service_name, attempt, limit);

        let probe = {
            let check = check.clone();
            let env = env.clone();
            let team_identifier = task.team_identifier.clone();
            let (team_id, round_id) = (task.team_id, task.round_id);
            tokio::spawn(async move { check.run(team_id, &team_identifier, round_id, &env).await })
        };
        let abort = probe.abort_handle();

        let outcome = match timeout(limit, probe).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => Outcome {
                passed: false,
                error: "probe crashed".to_string(),
                debug: join_err.to_string(),
            },
            Err(_) => {
                abort.abort();
                if limit < per_attempt {
                    // cut short by the end of the round, not by the service timeout
                    return CheckResult::timed_out(
                        task,
                        format!("attempt {} still running at the deadline", attempt),
                    );
                }
                Outcome {
                    passed: false,
                    error: "timeout".to_string(),
                    debug: format!("attempt {} took longer than {:?}", attempt, per_attempt),
                }
            }
        };
        if outcome.passed {
            return passed(task, check.service().points, outcome.debug);
        }
        last = Some(outcome);
    }

    match last {
        Some(outcome) => CheckResult::failure(task, outcome.error, outcome.debug),
        None => CheckResult::timed_out(task, "deadline passed before the probe could start"),
    }
}

fn passed(task: &Task, points: i32, debug: String) -> CheckResult {
    CheckResult {
        status: true,
        points,
        error: String::new(),
        ..CheckResult::failure(task, String::new(), debug)
    }
}
