//! The round loop: pace rounds, dispatch one task per enabled (team, service), collect the
//! results, commit the round and keep the SLA books.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use db_model::models::{NewSla, Round, ServiceCheck};
use db_model::sanitize::sanitize;
use db_model::ScoreStore;
use log::{debug, error, info, warn};
use queue_models::{codec, CheckResult, ControlEvent, RoundId};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use score_crab::transport::{Queue, Transport};

use crate::config::{EngineConfig, EventType};
use crate::control::Control;
use crate::uptime::SlaState;

pub use collect::{collect, CollectError, Collected};
pub use plan::{plan_round, Snapshot};

mod collect;
mod plan;
#[cfg(test)]
mod scenarios;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Committed(RoundSummary),
    /// Nothing persisted; the round id is reused by the next round.
    Dropped,
    /// Abandoned because of a reset or stop.
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub expected: usize,
    pub passed: usize,
    pub synthesized: usize,
    pub discarded: usize,
    pub violations: usize,
}

pub struct RoundKeeper {
    store: Arc<dyn ScoreStore>,
    transport: Arc<dyn Transport>,
    control: Arc<Control>,
    config: watch::Receiver<Arc<EngineConfig>>,
    sla: SlaState,
    next_round_id: RoundId,
    next_start: Instant,
    koth_warned: bool,
}

impl RoundKeeper {
    /// Picks up where the persisted rounds left off, rebuilding the SLA state.
    pub fn new(
        store: Arc<dyn ScoreStore>,
        transport: Arc<dyn Transport>,
        control: Arc<Control>,
        config: watch::Receiver<Arc<EngineConfig>>,
    ) -> Result<Self> {
        let current = config.borrow().clone();
        let sla = SlaState::rebuild(store.as_ref(), |name| current.sla_terms(name).0)
            .context("rebuilding SLA state")?;
        let next_round_id = store.last_round_id().context("reading last round")? + 1;
        info!("Next round will be round {}", next_round_id);
        Ok(RoundKeeper {
            store,
            transport,
            control,
            config,
            sla,
            next_round_id,
            next_start: Instant::now(),
            koth_warned: false,
        })
    }

    pub fn sla(&self) -> &SlaState {
        &self.sla
    }

    pub fn next_round_id(&self) -> RoundId {
        self.next_round_id
    }

    /// Runs rounds until stopped. Only startup problems are returned; a failing round is dropped.
    pub async fn start(&mut self, stop_rx: CancellationToken) -> Result<()> {
        loop {
            if stop_rx.is_cancelled() {
                info!("Round keeper stopping");
                return Ok(());
            }
            if self.control.take_reset() {
                self.reset().await;
            }
            let abort = self.control.abort_signal();
            if !self.control.wait_resumed(&abort).await {
                continue;
            }

            match self.run_round(&abort).await {
                RoundOutcome::Committed(summary) => debug!("Round summary: {:?}", summary),
                RoundOutcome::Dropped => {}
                RoundOutcome::Aborted => continue,
            }

            select! {
                biased;
                _ = abort.cancelled() => {}
                _ = sleep_until(self.next_start) => {}
            }
        }
    }

    /// One full round, from snapshot to `round_finish`.
    pub async fn run_round(&mut self, abort: &CancellationToken) -> RoundOutcome {
        let config = self.config.borrow_and_update().clone();
        let round_id = self.next_round_id;
        let start = Utc::now();
        let pace = config.misc.pace(&mut rand::thread_rng());
        let deadline = Instant::now() + pace;
        let deadline_utc = start + chrono::Duration::from_std(pace).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.next_start = deadline;
        self.control.set_round(round_id, start, deadline_utc);
        info!("Round {} started; next round due at {}", round_id, deadline_utc);

        match self.play(&config, round_id, start, deadline, deadline_utc, abort).await {
            Ok(Some(summary)) => RoundOutcome::Committed(summary),
            Ok(None) => {
                info!("Round {} abandoned", round_id);
                RoundOutcome::Aborted
            }
            Err(e) => {
                error!("Round {} dropped: {:?}", round_id, e);
                RoundOutcome::Dropped
            }
        }
    }

    async fn play(
        &mut self,
        config: &EngineConfig,
        round_id: RoundId,
        start: DateTime<Utc>,
        deadline: Instant,
        deadline_utc: DateTime<Utc>,
        abort: &CancellationToken,
    ) -> Result<Option<RoundSummary>> {
        let tasks = match config.event_type {
            EventType::Rvb => {
                let snapshot = self.snapshot().context("taking round snapshot")?;
                plan_round(config, &snapshot, round_id, Uuid::new_v4(), deadline_utc, start)?
            }
            EventType::Koth => {
                if !self.koth_warned {
                    warn!("King of the hill scoring is not implemented; rounds dispatch nothing");
                    self.koth_warned = true;
                }
                vec![]
            }
        };
        info!("Round {}: {} checks expected", round_id, tasks.len());

        let collected = if tasks.is_empty() {
            Collected::default()
        } else {
            let cleared = select! {
                biased;
                _ = abort.cancelled() => return Ok(None),
                cleared = self.transport.drain_all() => cleared.context("clearing transport")?,
            };
            if cleared > 0 {
                debug!("Cleared {} leftover messages", cleared);
            }
            for task in tasks.iter() {
                self.transport
                    .push(Queue::Tasks, codec::encode(task)?)
                    .await
                    .context("enqueueing task")?;
            }
            debug!("Round {}: {} tasks enqueued", round_id, tasks.len());
            match collect(self.transport.as_ref(), round_id, &tasks, deadline, abort).await {
                Ok(collected) => collected,
                Err(CollectError::Aborted) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            "Round {}: collected {}, synthesized {}, discarded {}",
            round_id,
            collected.results.len() - collected.synthesized,
            collected.synthesized,
            collected.discarded
        );

        let checks: Vec<ServiceCheck> = collected.results.iter().map(service_check).collect();
        self.store
            .create_round(&Round { id: round_id, start_time: start }, &checks)
            .context("persisting round")?;
        self.next_round_id = round_id + 1;
        info!("Round {} committed with {} checks", round_id, checks.len());

        let violations = self.keep_books(config, round_id, &collected.results);
        if let Err(e) = self.store.refresh_scores() {
            error!("Refreshing scores after round {} failed: {:?}", round_id, e);
        }
        if let Err(e) = self.transport.publish(ControlEvent::RoundFinish).await {
            warn!("Publishing round_finish for round {} failed: {:?}", round_id, e);
        }
        info!("Round {} finished", round_id);

        Ok(Some(RoundSummary {
            round_id,
            expected: tasks.len(),
            passed: collected.results.iter().filter(|it| it.status).count(),
            synthesized: collected.synthesized,
            discarded: collected.discarded,
            violations,
        }))
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let teams = self.store.active_teams()?;
        let disabled = self.store.disabled_services()?;
        let mut credentials = HashMap::with_capacity(teams.len());
        for team in teams.iter() {
            credentials.insert(team.id, self.store.team_credentials(team.id)?);
        }
        Ok(Snapshot {
            teams,
            disabled,
            credentials,
        })
    }

    /// Updates the SLA state with the committed results and records violations.
    fn keep_books(&mut self, config: &EngineConfig, round_id: RoundId, results: &[CheckResult]) -> usize {
        let mut violations = 0;
        for result in results {
            let (threshold, penalty) = config.sla_terms(&result.service_name);
            if !self.sla.record(result.team_id, &result.service_name, result.status, threshold) {
                continue;
            }
            violations += 1;
            warn!(
                "Round {}: SLA violation for team {} on {} (penalty {})",
                round_id, result.team_id, result.service_name, penalty
            );
            let violation = NewSla {
                team_id: result.team_id,
                round_id,
                service_name: result.service_name.clone(),
                penalty,
            };
            if let Err(e) = self.store.create_sla(&violation) {
                error!("Recording SLA violation {:?} failed: {:?}", violation, e);
            }
        }
        violations
    }

    /// Wipes rounds, checks, SLAs, queues and counters. Pause state is left as it was.
    async fn reset(&mut self) {
        info!("Resetting scores");
        if let Err(e) = self.store.reset_scores() {
            error!("Truncating round data failed; keeping state: {:?}", e);
        } else {
            self.sla.clear();
        }
        match self.transport.drain_all().await {
            Ok(dropped) => debug!("Dropped {} queued messages", dropped),
            Err(e) => warn!("Clearing transport during reset failed: {:?}", e),
        }
        self.next_round_id = match self.store.last_round_id() {
            Ok(last) => last + 1,
            Err(e) => {
                error!("Reading last round after reset failed: {:?}", e);
                1
            }
        };
        self.control.clear_round();
        self.next_start = Instant::now();
        info!("Reset complete; next round is round {}", self.next_round_id);
    }
}

fn service_check(result: &CheckResult) -> ServiceCheck {
    ServiceCheck {
        team_id: result.team_id,
        round_id: result.round_id,
        service_name: result.service_name.clone(),
        points: if result.status { result.points } else { 0 },
        result: result.status,
        error: sanitize(&result.error).into_owned(),
        debug: sanitize(&result.debug).into_owned(),
    }
}
