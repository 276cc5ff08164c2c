use std::collections::HashMap;
use std::time::Duration;

use db_model::models::ServiceKey;
use log::{debug, warn};
use queue_models::{codec, CheckResult, RoundId, Task};
use thiserror::Error;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use score_crab::transport::{Queue, Transport};

/// Upper bound for one pop, so deadline and abort are noticed promptly.
const POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("round aborted while collecting")]
    Aborted,
    #[error("transport failed while collecting")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, Default)]
pub struct Collected {
    /// One per task, in task order.
    pub results: Vec<CheckResult>,
    pub synthesized: usize,
    pub discarded: usize,
}

/// Gathers the results for `tasks` until all are in or `deadline` passes; whatever is missing
/// then is recorded as timed out.
pub async fn collect(
    transport: &dyn Transport,
    round_id: RoundId,
    tasks: &[Task],
    deadline: Instant,
    abort: &CancellationToken,
) -> Result<Collected, CollectError> {
    let expected: HashMap<ServiceKey, &Task> = tasks
        .iter()
        .map(|it| ((it.team_id, it.service_name.clone()), it))
        .collect();
    let mut received: HashMap<ServiceKey, CheckResult> = HashMap::with_capacity(expected.len());
    let mut discarded = 0;

    while received.len() < expected.len() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let popped = select! {
            biased;
            _ = abort.cancelled() => return Err(CollectError::Aborted),
            popped = transport.blocking_pop(Queue::Results, (deadline - now).min(POLL)) => popped,
        };
        let raw = match popped.map_err(CollectError::Transport)? {
            Some(raw) => raw,
            None => continue,
        };
        match accept(&raw, round_id, &expected) {
            Some(result) => {
                received.insert((result.team_id, result.service_name.clone()), result);
            }
            None => discarded += 1,
        }
    }

    let mut collected = Collected {
        discarded,
        ..Collected::default()
    };
    for task in tasks {
        match received.remove(&(task.team_id, task.service_name.clone())) {
            Some(result) => collected.results.push(result),
            None => {
                collected.synthesized += 1;
                collected
                    .results
                    .push(CheckResult::timed_out(task, "no result before the round deadline"));
            }
        }
    }
    Ok(collected)
}

fn accept(raw: &[u8], round_id: RoundId, expected: &HashMap<ServiceKey, &Task>) -> Option<CheckResult> {
    let result: CheckResult = match codec::decode(raw) {
        Ok(result) => result,
        Err(e) => {
            warn!("Discarding undecodable result: {:#}", e);
            return None;
        }
    };
    if result.team_id == 0 || result.service_name.is_empty() {
        warn!("Rejecting result without team or service: {:?}", result);
        return None;
    }
    if result.round_id != round_id {
        debug!(
            "Discarding late result of round {} for {} (now round {})",
            result.round_id, result.service_name, round_id
        );
        return None;
    }
    let Some(task) = expected.get(&(result.team_id, result.service_name.clone())) else {
        warn!(
            "Discarding unexpected result for team {} service {}",
            result.team_id, result.service_name
        );
        return None;
    };
    if result.dispatch_id != task.dispatch_id {
        debug!(
            "Discarding result of an abandoned dispatch of round {} for {}",
            result.round_id, result.service_name
        );
        return None;
    }
    Some(result)
}
