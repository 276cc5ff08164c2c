use std::sync::Arc;
use std::time::Duration;

use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
use db_model::models::{NewSla, Uptime};
use db_model::test_utils::MemoryStore;
use queue_models::result::CHECK_TIMEOUT_EXCEEDED;
use queue_models::Task;
use score_crab::transport::MemoryTransport;
use service_checks::{build, ProbeEnv, Runner};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::*;
use crate::config::test_support::config_text;

const PACING: &str = "Delay = 5\nJitter = 0\nTimeout = 3\nSlaThreshold = 3\nSlaPenalty = 30";
const WEB: &str = "[[Box.Web]]\nPort = 80\nPoints = 10\n[[Box.Web.Url]]\nPath = \"/\"";

struct Harness {
    store: Arc<MemoryStore>,
    transport: Arc<MemoryTransport>,
    control: Arc<Control>,
    config_tx: watch::Sender<Arc<EngineConfig>>,
    stop: CancellationToken,
}

impl Harness {
    fn new(store: MemoryStore, services: &str) -> Self {
        let config = EngineConfig::parse(&config_text(PACING, services)).unwrap();
        let (config_tx, _) = watch::channel(Arc::new(config));
        let stop = CancellationToken::new();
        Harness {
            store: Arc::new(store),
            transport: Arc::new(MemoryTransport::new()),
            control: Arc::new(Control::new(false, stop.clone())),
            config_tx,
            stop,
        }
    }

    fn keeper(&self) -> RoundKeeper {
        RoundKeeper::new(
            self.store.clone(),
            self.transport.clone(),
            self.control.clone(),
            self.config_tx.subscribe(),
        )
        .unwrap()
    }

    /// Answers every task with the verdict of `judge`, or not at all for `None`.
    fn scripted_worker(&self, judge: impl Fn(&Task) -> Option<bool> + Send + 'static) -> JoinHandle<()> {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            loop {
                let raw = match transport.blocking_pop(Queue::Tasks, Duration::from_secs(1)).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(_) => return,
                };
                let task: Task = codec::decode(&raw).unwrap();
                let Some(passed) = judge(&task) else { continue };
                let mut result = CheckResult::failure(&task, if passed { "" } else { "connection error" }, "");
                result.status = passed;
                result.points = if passed { 10 } else { 0 };
                let _ = transport.push(Queue::Results, codec::encode(&result).unwrap()).await;
            }
        })
    }

    /// Runs the real probe of every task, like a probe buddy would.
    fn probing_worker(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            while let Ok(Some(raw)) = transport.blocking_pop(Queue::Tasks, Duration::from_secs(10)).await {
                let task: Task = codec::decode(&raw).unwrap();
                let mut check = build(&task.service_type, task.check_data.clone()).unwrap();
                check.set_task_credentials(task.credentials.clone());
                let outcome = check
                    .run(task.team_id, &task.team_identifier, task.round_id, &ProbeEnv::default())
                    .await;
                let mut result = CheckResult::failure(&task, outcome.error, outcome.debug);
                result.status = outcome.passed;
                result.points = if outcome.passed { check.service().points } else { 0 };
                let _ = transport.push(Queue::Results, codec::encode(&result).unwrap()).await;
            }
        })
    }

    async fn rounds(&self, keeper: &mut RoundKeeper, count: usize) -> Vec<RoundOutcome> {
        let mut outcomes = vec![];
        for _ in 0..count {
            outcomes.push(keeper.run_round(&self.control.abort_signal()).await);
        }
        outcomes
    }
}

async fn stub_http_ok() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

fn violation(team_id: i32, round_id: i32, service_name: &str) -> NewSla {
    NewSla {
        team_id,
        round_id,
        service_name: service_name.to_string(),
        penalty: 30,
    }
}

#[tokio::test]
async fn happy_path() {
    // given
    let port = stub_http_ok().await;
    let services = format!("[[Box.Web]]\nPort = {}\nPoints = 10\nTimeout = 3\n[[Box.Web.Url]]\nPath = \"/\"", port);
    let harness = Harness::new(MemoryStore::with_teams(&[1]), &services);
    let mut keeper = harness.keeper();
    harness.probing_worker();

    // when
    let outcome = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    assert_that!(matches!(outcome, RoundOutcome::Committed(_))).is_true();
    let state = harness.store.snapshot();
    assert_that!(state.rounds.iter().map(|it| it.id).collect::<Vec<_>>()).is_equal_to(vec![1]);
    let checks = harness.store.checks_of(1, "box01-web");
    assert_that!(checks.len()).is_equal_to(1);
    assert_that!(checks[0].result).is_true();
    assert_that!(checks[0].points).is_equal_to(10);
    assert_that!(keeper.sla().uptime(1, "box01-web")).is_equal_to(Uptime { passed: 1, total: 1 });
    assert_that!(harness.transport.published()).is_equal_to(vec![ControlEvent::RoundFinish]);
    assert_that!(keeper.next_round_id()).is_equal_to(2);
}

#[tokio::test(start_paused = true)]
async fn sla_after_three_failures() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    harness.scripted_worker(|_| Some(false));

    // when
    harness.rounds(&mut keeper, 3).await;

    // then
    let checks = harness.store.checks_of(1, "box01-web");
    assert_that!(checks.len()).is_equal_to(3);
    assert_that!(checks.iter().all(|it| !it.result && it.points == 0)).is_true();
    assert_that!(harness.store.snapshot().slas).is_equal_to(vec![violation(1, 3, "box01-web")]);
    assert_that!(keeper.sla().consecutive_failures(1, "box01-web")).is_equal_to(0);
}

#[tokio::test(start_paused = true)]
async fn pass_resets_the_streak() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    harness.scripted_worker(|task| Some(task.round_id == 3));

    // when
    harness.rounds(&mut keeper, 5).await;

    // then
    assert_that!(harness.store.snapshot().slas.len()).is_equal_to(0);
    assert_that!(keeper.sla().consecutive_failures(1, "box01-web")).is_equal_to(2);
}

#[tokio::test(start_paused = true)]
async fn reset_mid_round() {
    // given
    let store = MemoryStore::with_teams(&[1]);
    for id in 1..=6 {
        store
            .create_round(&Round { id, start_time: Utc::now() }, &[])
            .unwrap();
    }
    let harness = Harness::new(store, WEB);
    let mut keeper = harness.keeper();
    let stop = harness.stop.clone();
    let running = tokio::spawn(async move {
        keeper.start(stop).await.unwrap();
        keeper
    });
    while harness.control.round_info().current_round_id != 7 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // when
    harness.control.pause();
    harness.control.request_reset();
    while !harness.store.snapshot().rounds.is_empty() || harness.control.round_info().current_round_id != 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // then
    assert_that!(harness.transport.length(Queue::Tasks).await.unwrap()).is_equal_to(0);
    assert_that!(harness.transport.length(Queue::Results).await.unwrap()).is_equal_to(0);
    assert_that!(harness.control.is_paused()).is_true();
    harness.control.resume();
    while harness.control.round_info().current_round_id != 1 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.stop.cancel();
    let keeper = running.await.unwrap();
    assert_that!(harness.store.snapshot().rounds.iter().any(|it| it.id == 7)).is_false();
    assert_that!(keeper.next_round_id()).is_equal_to(1);
}

#[tokio::test(start_paused = true)]
async fn teams_are_independent() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1, 2]), "[[Box.Tcp]]\nDisplay = \"svc\"\nPort = 22");
    let mut keeper = harness.keeper();
    harness.scripted_worker(|task| Some(task.team_id == 2));

    // when
    harness.rounds(&mut keeper, 3).await;

    // then
    assert_that!(harness.store.snapshot().slas).is_equal_to(vec![violation(1, 3, "box01-svc")]);
    assert_that!(keeper.sla().uptime(2, "box01-svc")).is_equal_to(Uptime { passed: 3, total: 3 });
    assert_that!(keeper.sla().uptime(1, "box01-svc")).is_equal_to(Uptime { passed: 0, total: 3 });
}

#[tokio::test(start_paused = true)]
async fn disabled_pair_is_skipped() {
    // given
    let services = format!("{}\n[[Box.Ssh]]\nCredLists = [\"users.credlist\"]", WEB);
    let harness = Harness::new(MemoryStore::with_teams(&[1, 2]), &services);
    harness
        .store
        .lock()
        .unwrap()
        .disabled
        .insert((2, "box01-ssh".to_string()));
    let mut keeper = harness.keeper();
    harness.scripted_worker(|_| Some(true));

    // when
    let outcome = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    let RoundOutcome::Committed(summary) = outcome else { panic!("round not committed") };
    assert_that!(summary.expected).is_equal_to(3);
    assert_that!(harness.store.checks_of(2, "box01-ssh").is_empty()).is_true();
    assert_that!(harness.store.checks_of(2, "box01-web").len()).is_equal_to(1);
    assert_that!(harness.store.checks_of(1, "box01-ssh").len()).is_equal_to(1);
    assert_that!(keeper.sla().uptime(2, "box01-ssh")).is_equal_to(Uptime::default());
}

#[tokio::test(start_paused = true)]
async fn silence_is_a_timeout() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1, 2]), WEB);
    let mut keeper = harness.keeper();

    // when
    let outcome = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    let RoundOutcome::Committed(summary) = outcome else { panic!("round not committed") };
    assert_that!(summary.synthesized).is_equal_to(2);
    let checks = harness.store.snapshot().checks;
    assert_that!(checks.len()).is_equal_to(2);
    assert_that!(checks.iter().all(|it| it.error == CHECK_TIMEOUT_EXCEEDED)).is_true();
}

#[tokio::test(start_paused = true)]
async fn no_teams_still_makes_a_round() {
    // given
    let harness = Harness::new(MemoryStore::new(), WEB);
    let mut keeper = harness.keeper();

    // when
    let outcomes = harness.rounds(&mut keeper, 2).await;

    // then
    assert_that!(outcomes.iter().all(|it| matches!(it, RoundOutcome::Committed(_)))).is_true();
    assert_that!(harness.store.snapshot().rounds.len()).is_equal_to(2);
    assert_that!(harness.store.snapshot().checks.is_empty()).is_true();
    assert_that!(keeper.next_round_id()).is_equal_to(3);
}

#[tokio::test(start_paused = true)]
async fn failed_commit_reuses_the_round_id() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    harness.scripted_worker(|_| Some(true));
    harness.store.lock().unwrap().fail_rounds = true;

    // when
    let dropped = keeper.run_round(&harness.control.abort_signal()).await;
    harness.store.lock().unwrap().fail_rounds = false;
    let committed = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    assert_that!(dropped).is_equal_to(RoundOutcome::Dropped);
    assert_that!(keeper.sla().uptime(1, "box01-web")).is_equal_to(Uptime { passed: 1, total: 1 });
    let RoundOutcome::Committed(summary) = committed else { panic!("round not committed") };
    assert_that!(summary.round_id).is_equal_to(1);
    assert_that!(harness.store.snapshot().rounds.len()).is_equal_to(1);
}

#[tokio::test(start_paused = true)]
async fn restart_continues_the_streak() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut first = harness.keeper();
    harness.scripted_worker(|_| Some(false));
    harness.rounds(&mut first, 2).await;
    drop(first);

    // when
    let mut restarted = harness.keeper();
    assert_that!(restarted.sla().consecutive_failures(1, "box01-web")).is_equal_to(2);
    harness.rounds(&mut restarted, 1).await;

    // then
    assert_that!(harness.store.snapshot().slas).is_equal_to(vec![violation(1, 3, "box01-web")]);
}

#[tokio::test(start_paused = true)]
async fn reloaded_config_applies_to_next_round() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    harness.scripted_worker(|_| Some(true));
    harness.rounds(&mut keeper, 1).await;

    // when
    let reloaded = EngineConfig::parse(&config_text(PACING, &format!("{}\n[[Box.Tcp]]\nPort = 22", WEB))).unwrap();
    harness.config_tx.send_replace(Arc::new(reloaded));
    harness.rounds(&mut keeper, 1).await;

    // then
    assert_that!(harness.store.checks_of(1, "box01-tcp").len()).is_equal_to(1);
    assert_that!(harness.store.checks_of(1, "box01-web").len()).is_equal_to(2);
}

#[tokio::test(start_paused = true)]
async fn probe_output_is_sanitized() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    let transport = harness.transport.clone();
    tokio::spawn(async move {
        let raw = transport.blocking_pop(Queue::Tasks, Duration::from_secs(5)).await.unwrap().unwrap();
        let task: Task = codec::decode(&raw).unwrap();
        let result = CheckResult::failure(&task, "bad\0bytes", "debug\0");
        transport.push(Queue::Results, codec::encode(&result).unwrap()).await.unwrap();
    });

    // when
    keeper.run_round(&harness.control.abort_signal()).await;

    // then
    let checks = harness.store.checks_of(1, "box01-web");
    assert_that!(checks[0].error.clone()).is_equal_to("badbytes".to_string());
    assert_that!(checks[0].debug.clone()).is_equal_to("debug".to_string());
}

#[tokio::test(start_paused = true)]
async fn round_ids_stay_contiguous() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1, 2]), WEB);
    let mut keeper = harness.keeper();
    harness.scripted_worker(|task| Some(task.round_id % 2 == 0));

    // when
    harness.rounds(&mut keeper, 6).await;

    // then
    let state = harness.store.snapshot();
    let ids: Vec<i32> = state.rounds.iter().map(|it| it.id).collect();
    assert_that!(ids).is_equal_to(vec![1, 2, 3, 4, 5, 6]);
    for id in 1..=6 {
        assert_that!(state.checks.iter().filter(|it| it.round_id == id).count()).is_equal_to(2);
    }
}

#[tokio::test(start_paused = true)]
async fn lost_transport_drops_the_round() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    harness.transport.set_broken(true);

    // when
    let dropped = keeper.run_round(&harness.control.abort_signal()).await;
    let id_after_drop = keeper.next_round_id();
    harness.transport.set_broken(false);
    harness.scripted_worker(|_| Some(true));
    let retried = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    assert_that!(dropped).is_equal_to(RoundOutcome::Dropped);
    assert_that!(id_after_drop).is_equal_to(1);
    let RoundOutcome::Committed(summary) = retried else { panic!("round not committed") };
    assert_that!(summary.round_id).is_equal_to(1);
    let state = harness.store.snapshot();
    assert_that!(state.rounds.iter().map(|it| it.id).collect::<Vec<_>>()).is_equal_to(vec![1]);
    assert_that!(harness.transport.published()).is_equal_to(vec![ControlEvent::RoundFinish]);
    assert_that!(keeper.sla().uptime(1, "box01-web")).is_equal_to(Uptime { passed: 1, total: 1 });
}

#[tokio::test(start_paused = true)]
async fn transport_lost_while_collecting_drops_the_round() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    let transport = harness.transport.clone();
    tokio::spawn(async move {
        if let Ok(Some(_)) = transport.blocking_pop(Queue::Tasks, Duration::from_secs(60)).await {
            transport.set_broken(true);
        }
    });

    // when
    let outcome = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    assert_that!(outcome).is_equal_to(RoundOutcome::Dropped);
    assert_that!(keeper.next_round_id()).is_equal_to(1);
    let state = harness.store.snapshot();
    assert_that!(state.rounds.is_empty()).is_true();
    assert_that!(state.checks.is_empty()).is_true();
    assert_that!(harness.transport.published().is_empty()).is_true();
    assert_that!(keeper.sla().uptime(1, "box01-web")).is_equal_to(Uptime::default());
}

#[tokio::test(start_paused = true)]
async fn late_result_of_a_dropped_round_is_not_counted() {
    // given
    let harness = Harness::new(MemoryStore::with_teams(&[1]), WEB);
    let mut keeper = harness.keeper();
    let transport = harness.transport.clone();
    let straggler = tokio::spawn(async move {
        let raw = transport.blocking_pop(Queue::Tasks, Duration::from_secs(60)).await.unwrap().unwrap();
        let stale: Task = codec::decode(&raw).unwrap();
        // answer only once the round is dispatched again under the same id
        while transport.length(Queue::Tasks).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let mut result = CheckResult::failure(&stale, "", "");
        result.status = true;
        result.points = 10;
        transport.push(Queue::Results, codec::encode(&result).unwrap()).await.unwrap();
        stale.dispatch_id
    });
    harness.store.lock().unwrap().fail_rounds = true;

    // when
    let dropped = keeper.run_round(&harness.control.abort_signal()).await;
    harness.store.lock().unwrap().fail_rounds = false;
    let retried = keeper.run_round(&harness.control.abort_signal()).await;

    // then
    assert_that!(dropped).is_equal_to(RoundOutcome::Dropped);
    let RoundOutcome::Committed(summary) = retried else { panic!("round not committed") };
    assert_that!(summary.round_id).is_equal_to(1);
    assert_that!(summary.discarded).is_equal_to(1);
    assert_that!(summary.passed).is_equal_to(0);
    let checks = harness.store.checks_of(1, "box01-web");
    assert_that!(checks.len()).is_equal_to(1);
    assert_that!(checks[0].result).is_false();
    let stale_dispatch = straggler.await.unwrap();
    let pending = harness.transport.peek_all(Queue::Tasks);
    assert_that!(pending.len()).is_equal_to(1);
    let redispatched: Task = codec::decode(&pending[0]).unwrap();
    assert_that!(redispatched.round_id).is_equal_to(1);
    assert_that!(redispatched.dispatch_id == stale_dispatch).is_false();
}
