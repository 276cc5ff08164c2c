use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use log::{debug, error, info, warn};
use queue_models::{codec, CheckResult, Task};
use service_checks::ProbeEnv;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use score_crab::helpers::rabbit;
use score_crab::loop_with_stop;
use score_crab::transport::{Queue, RabbitTransport, Transport};

mod execute;

pub use execute::execute;

#[derive(Args, Debug, Clone)]
#[group(id = "worker")]
pub struct Params {
    /// How many probes this process runs at the same time
    #[arg(long, env = "MAX_CONCURRENT_CHECKS", default_value = "64")]
    pub max_concurrent_checks: usize,

    /// How long one pop on the task queue waits before polling again
    #[arg(long, default_value = "5")]
    pub pop_timeout_secs: u64,

    /// Directory with private keys and reference files named in the engine configuration
    #[arg(long, env = "SCORED_FILES_DIR", default_value = "config/scoredfiles")]
    pub scored_files_dir: PathBuf,
}

pub async fn run(rabbit: rabbit::Params, params: Params, stop_rx: CancellationToken) -> Result<()> {
    let transport = RabbitTransport::connect(&rabbit, "probe-buddy")
        .await
        .context("connecting to RabbitMQ")?;
    Worker::new(Arc::new(transport), &params, stop_rx).run().await
}

/// Pops tasks and runs each in its own Tokio task, at most `max_concurrent_checks` at once.
pub struct Worker {
    transport: Arc<dyn Transport>,
    env: Arc<ProbeEnv>,
    permits: Arc<Semaphore>,
    max_permits: u32,
    pop_timeout: Duration,
    halt: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
    fatal_rx: mpsc::UnboundedReceiver<anyhow::Error>,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>, params: &Params, stop_rx: CancellationToken) -> Self {
        let max_permits = params.max_concurrent_checks.clamp(1, Semaphore::MAX_PERMITS) as u32;
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Worker {
            transport,
            env: Arc::new(ProbeEnv {
                scored_files: params.scored_files_dir.clone(),
            }),
            permits: Arc::new(Semaphore::new(max_permits as usize)),
            max_permits,
            pop_timeout: Duration::from_secs(params.pop_timeout_secs.max(1)),
            halt: stop_rx.child_token(),
            fatal_tx,
            fatal_rx,
        }
    }

    /// Returns when stopped, or with an error once the result queue becomes unusable.
    pub async fn run(mut self) -> Result<()> {
        info!("Probe buddy is ready to receive tasks!");
        let served = self.serve().await;

        debug!("Waiting for probes in flight");
        let all = self.permits.acquire_many(self.max_permits);
        if timeout(self.pop_timeout, all).await.is_err() {
            warn!("Some probes were still running on shutdown; their results are lost");
        }
        served?;
        match self.fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    async fn serve(&self) -> Result<()> {
        let stop_rx = self.halt.clone();
        let transport = &self.transport;
        loop_with_stop!(
            "probe buddy", stop_rx,
            transport.blocking_pop(Queue::Tasks, self.pop_timeout) => self.dispatch(it) as try_async
        )
    }

    async fn dispatch(&self, payload: Vec<u8>) -> Result<()> {
        let task: Task = match codec::decode(&payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("Dropping task that cannot be decoded: {:#}", e);
                return Ok(());
            }
        };
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("probe permits closed")?;
        debug!(
            "Round {}: probing {} for team {}",
            task.round_id, task.service_name, task.team_id
        );

        let transport = self.transport.clone();
        let env = self.env.clone();
        let halt = self.halt.clone();
        let fatal_tx = self.fatal_tx.clone();
        tokio::spawn(async move {
            let result = execute(&task, env).await;
            if !result.status {
                debug!(
                    "Round {}: {} failed for team {}: {}",
                    result.round_id, result.service_name, result.team_id, result.error
                );
            }
            if let Err(e) = push_result(transport.as_ref(), &result).await {
                error!("Unable to push result, stopping: {:?}", e);
                let _ = fatal_tx.send(e);
                halt.cancel();
            }
            drop(permit);
        });
        Ok(())
    }
}

async fn push_result(transport: &dyn Transport, result: &CheckResult) -> Result<()> {
    let payload = codec::encode(result)?;
    transport
        .push(Queue::Results, payload)
        .await
        .with_context(|| format!("pushing result of {}", result.service_name))
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
    use chrono::Utc;
    use queue_models::codec;
    use serde_json::json;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use score_crab::transport::MemoryTransport;

    use super::*;

    fn params() -> Params {
        Params {
            max_concurrent_checks: 4,
            pop_timeout_secs: 1,
            scored_files_dir: PathBuf::from("config/scoredfiles"),
        }
    }

    fn task(service_type: &str, check_data: serde_json::Value) -> Task {
        Task {
            team_id: 1,
            team_identifier: "01".to_string(),
            service_type: service_type.to_string(),
            service_name: "box01-svc".to_string(),
            deadline: Utc::now() + chrono::Duration::seconds(5),
            round_id: 1,
            dispatch_id: Uuid::new_v4(),
            attempts: 1,
            credentials: vec![],
            check_data,
        }
    }

    async fn next_result(transport: &MemoryTransport) -> CheckResult {
        let raw = transport
            .blocking_pop(Queue::Results, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("a result");
        codec::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn probes_and_reports() {
        // given
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = Arc::new(MemoryTransport::new());
        let stop = CancellationToken::new();
        let worker = Worker::new(transport.clone(), &params(), stop.clone());
        let handle = tokio::spawn(worker.run());
        let tcp = task(
            "Tcp",
            json!({"Target": "127.0.0.1", "Port": port, "Points": 7, "Timeout": 2}),
        );

        // when
        transport
            .push(Queue::Tasks, codec::encode(&tcp).unwrap())
            .await
            .unwrap();
        let result = next_result(&transport).await;

        // then
        assert_that!(result.status).is_true();
        assert_that!(result.points).is_equal_to(7);
        assert_that!(result.round_id).is_equal_to(1);
        stop.cancel();
        assert_that!(handle.await.unwrap().is_ok()).is_true();
    }

    #[tokio::test]
    async fn garbage_is_dropped_and_unknown_types_fail() {
        // given
        let transport = Arc::new(MemoryTransport::new());
        let stop = CancellationToken::new();
        tokio::spawn(Worker::new(transport.clone(), &params(), stop.clone()).run());

        // when
        transport
            .push(Queue::Tasks, b"{not json".to_vec())
            .await
            .unwrap();
        transport
            .push(Queue::Tasks, codec::encode(&task("Gopher", json!({}))).unwrap())
            .await
            .unwrap();
        let result = next_result(&transport).await;

        // then
        assert_that!(result.status).is_false();
        assert_that!(result.error).is_equal_to("unknown service type".to_string());
        assert_that!(transport.length(Queue::Results).await.unwrap()).is_equal_to(0);
        stop.cancel();
    }

    #[tokio::test]
    async fn broken_result_queue_stops_the_worker() {
        // given
        let transport = Arc::new(MemoryTransport::new());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Worker::new(transport.clone(), &params(), stop.clone()).run());
        transport
            .push(Queue::Tasks, codec::encode(&task("Gopher", json!({}))).unwrap())
            .await
            .unwrap();

        // when
        transport.set_broken(true);
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await;

        // then
        assert_that!(outcome.unwrap().unwrap().is_err()).is_true();
        assert_that!(stop.is_cancelled()).is_false();
    }
}
