//! Pause, resume and reset, plus the round observables read by the outside world.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use queue_models::{ControlEvent, RoundId};
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use score_crab::loop_with_stop;
use score_crab::transport::{EventStream, Transport};

/// What the scoreboard shows about the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundInfo {
    pub current_round_id: RoundId,
    pub current_round_start_time: Option<DateTime<Utc>>,
    pub next_round_start_time: Option<DateTime<Utc>>,
    pub is_paused: bool,
}

struct ResetState {
    requested: bool,
    abort: CancellationToken,
}

pub struct Control {
    paused: watch::Sender<bool>,
    stop_rx: CancellationToken,
    reset: Mutex<ResetState>,
    round: Mutex<RoundInfo>,
}

impl Control {
    /// Abort signals handed out are children of `stop_rx`, so stopping the process also aborts
    /// whatever the scheduler is waiting on.
    pub fn new(start_paused: bool, stop_rx: CancellationToken) -> Self {
        let (paused, _) = watch::channel(start_paused);
        let abort = stop_rx.child_token();
        Control {
            paused,
            stop_rx,
            reset: Mutex::new(ResetState {
                requested: false,
                abort,
            }),
            round: Mutex::new(RoundInfo::default()),
        }
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Engine paused; the current round finishes first");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Engine resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Aborts whatever the scheduler is waiting on; the reset itself happens at the top of its loop.
    pub fn request_reset(&self) {
        let mut reset = self.reset_state();
        reset.requested = true;
        reset.abort.cancel();
        info!("Reset requested");
    }

    /// Consumes a pending reset request and arms a fresh abort signal.
    pub(crate) fn take_reset(&self) -> bool {
        let mut reset = self.reset_state();
        if !reset.requested {
            return false;
        }
        reset.requested = false;
        reset.abort = self.stop_rx.child_token();
        true
    }

    /// Fires on reset or stop.
    pub fn abort_signal(&self) -> CancellationToken {
        self.reset_state().abort.clone()
    }

    /// Returns false if aborted while paused.
    pub async fn wait_resumed(&self, abort: &CancellationToken) -> bool {
        let mut paused = self.paused.subscribe();
        if *paused.borrow_and_update() {
            debug!("Paused; waiting for resume");
        }
        select! {
            biased;
            _ = abort.cancelled() => false,
            resumed = paused.wait_for(|it| !*it) => resumed.is_ok(),
        }
    }

    pub fn round_info(&self) -> RoundInfo {
        let mut info = self.round_state().clone();
        info.is_paused = self.is_paused();
        info
    }

    pub(crate) fn set_round(&self, id: RoundId, start: DateTime<Utc>, next: DateTime<Utc>) {
        let mut round = self.round_state();
        round.current_round_id = id;
        round.current_round_start_time = Some(start);
        round.next_round_start_time = Some(next);
    }

    pub(crate) fn clear_round(&self) {
        *self.round_state() = RoundInfo::default();
    }

    pub fn apply(&self, event: ControlEvent) {
        match event {
            ControlEvent::Pause => self.pause(),
            ControlEvent::Resume => self.resume(),
            ControlEvent::Reset => self.request_reset(),
            ControlEvent::RoundFinish => {}
        }
    }

    fn reset_state(&self) -> MutexGuard<'_, ResetState> {
        self.reset.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn round_state(&self) -> MutexGuard<'_, RoundInfo> {
        self.round.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies control events from the events channel until stopped or the channel closes.
pub async fn listen(control: Arc<Control>, transport: Arc<dyn Transport>, stop_rx: CancellationToken) -> Result<()> {
    let events = transport
        .subscribe()
        .await
        .context("subscribing to control events")?;
    Listener { control }.run(events, stop_rx.clone()).await?;
    if !stop_rx.is_cancelled() {
        warn!("Control event channel closed");
    }
    Ok(())
}

struct Listener {
    control: Arc<Control>,
}

impl Listener {
    async fn run(&self, mut events: EventStream, stop_rx: CancellationToken) -> Result<()> {
        loop_with_stop!(recv "control listener", stop_rx, events => self.on_event(it))
    }

    async fn on_event(&self, event: ControlEvent) -> Result<()> {
        debug!("Control event: {}", event);
        self.control.apply(event);
        Ok(())
    }
}
