use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use db_model::ScoreStore;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use score_crab::loop_with_stop;

use super::EngineConfig;
use crate::startup;

/// A change is only picked up once the file has stopped changing for this long.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

/// Polls the configuration file and publishes every valid new version. Invalid versions are
/// logged and the previous configuration stays in effect.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_every: Duration,
    seen: Option<SystemTime>,
    changed_at: Option<Instant>,
    tx: watch::Sender<Arc<EngineConfig>>,
    provisioning: Option<Provisioning>,
}

struct Provisioning {
    store: Arc<dyn ScoreStore>,
    credlist_dir: PathBuf,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, initial: EngineConfig) -> (Self, watch::Receiver<Arc<EngineConfig>>) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        let seen = std::fs::metadata(&path).and_then(|it| it.modified()).ok();
        let watcher = ConfigWatcher {
            path,
            poll_every: Duration::from_millis(250),
            seen,
            changed_at: None,
            tx,
            provisioning: None,
        };
        (watcher, rx)
    }

    /// Teams and credlists added by a reload are created in `store` before the new
    /// configuration is published. If that fails, the reload is rejected.
    pub fn provisioning(mut self, store: Arc<dyn ScoreStore>, credlist_dir: PathBuf) -> Self {
        self.provisioning = Some(Provisioning { store, credlist_dir });
        self
    }

    pub async fn run(mut self, stop_rx: CancellationToken) -> Result<()> {
        info!("Watching {} for changes", self.path.display());
        let mut ticker = time::interval(self.poll_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop_with_stop!(
            "config watcher", stop_rx,
            ticker.tick() => self.poll(it) as simple_async
        )
    }

    async fn poll(&mut self, now: Instant) -> Result<()> {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                debug!("Cannot stat {}: {}", self.path.display(), e);
                return Ok(());
            }
        };
        if modified != self.seen {
            self.seen = modified;
            self.changed_at = Some(now);
            return Ok(());
        }
        match self.changed_at {
            Some(at) if now.duration_since(at) >= DEBOUNCE => {
                self.changed_at = None;
                self.reload();
            }
            _ => {}
        }
        Ok(())
    }

    fn reload(&self) {
        match EngineConfig::load(&self.path) {
            Ok(config) => {
                if let Some(provisioning) = &self.provisioning {
                    let prepared = startup::prepare(
                        provisioning.store.as_ref(),
                        &config,
                        &provisioning.credlist_dir,
                    );
                    if let Err(e) = prepared {
                        error!("Configuration change rejected, keeping previous: {:#}", e);
                        return;
                    }
                }
                info!(
                    "Reloaded configuration with {} services; next round uses it",
                    config.checks().count()
                );
                self.tx.send_replace(Arc::new(config));
            }
            Err(e) => error!("Configuration change rejected, keeping previous: {:#}", anyhow::Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
    use db_model::test_utils::MemoryStore;
    use queue_models::Credential;

    use super::*;
    use crate::config::test_support::config_text;

    fn scratch_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("round-keeper-{}.conf", uuid::Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn valid_change_is_published() {
        // given
        let path = scratch_file(&config_text("", ""));
        let initial = EngineConfig::load(&path).unwrap();
        let (watcher, mut rx) = ConfigWatcher::new(path.clone(), initial);
        let stop = CancellationToken::new();
        tokio::spawn(watcher.run(stop.clone()));
        time::sleep(Duration::from_millis(300)).await;

        // when
        fs::write(&path, config_text("Points = 7", "[[Box.Tcp]]\nPort = 22")).unwrap();
        let changed = time::timeout(Duration::from_secs(5), rx.changed()).await;

        // then
        assert_that!(changed.is_ok()).is_true();
        assert_that!(rx.borrow().misc.points).is_equal_to(7);
        assert_that!(rx.borrow().checks().count()).is_equal_to(1);
        stop.cancel();
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_change_keeps_previous() {
        // given
        let path = scratch_file(&config_text("Points = 3", ""));
        let initial = EngineConfig::load(&path).unwrap();
        let (watcher, mut rx) = ConfigWatcher::new(path.clone(), initial);
        let stop = CancellationToken::new();
        tokio::spawn(watcher.run(stop.clone()));
        time::sleep(Duration::from_millis(300)).await;

        // when
        fs::write(&path, config_text("Delay = 5\nJitter = 10", "")).unwrap();
        let changed = time::timeout(Duration::from_secs(2), rx.changed()).await;

        // then
        assert_that!(changed.is_err()).is_true();
        assert_that!(rx.borrow().misc.points).is_equal_to(3);
        stop.cancel();
        let _ = fs::remove_file(&path);
    }

    fn with_credlist(path: &str) -> String {
        config_text("", "")
            + &format!(
                "\n[CredlistSettings]\n[[CredlistSettings.Credlist]]\n\
                 CredlistName = \"Admins\"\nCredlistPath = \"{}\"\n",
                path
            )
    }

    #[tokio::test]
    async fn added_credlist_is_seeded_before_publishing() {
        // given
        let dir = std::env::temp_dir().join(format!("credlists-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("admins.credlist"), "root,toor\n").unwrap();
        let path = scratch_file(&config_text("", ""));
        let store = Arc::new(MemoryStore::new());
        let initial = EngineConfig::load(&path).unwrap();
        let (watcher, mut rx) = ConfigWatcher::new(path.clone(), initial);
        let watcher = watcher.provisioning(store.clone(), dir.clone());
        let stop = CancellationToken::new();
        tokio::spawn(watcher.run(stop.clone()));
        time::sleep(Duration::from_millis(300)).await;

        // when
        fs::write(&path, with_credlist("admins.credlist")).unwrap();
        let changed = time::timeout(Duration::from_secs(5), rx.changed()).await;

        // then
        assert_that!(changed.is_ok()).is_true();
        let team = store.snapshot().teams[0].id;
        let credentials = store.team_credentials(team).unwrap();
        assert_that!(credentials["admins.credlist"].clone()).is_equal_to(vec![Credential::new("root", "toor")]);
        stop.cancel();
        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_credlist_file_rejects_the_change() {
        // given
        let dir = std::env::temp_dir().join(format!("credlists-{}", uuid::Uuid::new_v4()));
        let path = scratch_file(&config_text("Points = 3", ""));
        let initial = EngineConfig::load(&path).unwrap();
        let (watcher, mut rx) = ConfigWatcher::new(path.clone(), initial);
        let watcher = watcher.provisioning(Arc::new(MemoryStore::new()), dir);
        let stop = CancellationToken::new();
        tokio::spawn(watcher.run(stop.clone()));
        time::sleep(Duration::from_millis(300)).await;

        // when
        fs::write(&path, with_credlist("gone.credlist")).unwrap();
        let changed = time::timeout(Duration::from_secs(2), rx.changed()).await;

        // then
        assert_that!(changed.is_err()).is_true();
        assert_that!(rx.borrow().credlists.is_empty()).is_true();
        stop.cancel();
        let _ = fs::remove_file(&path);
    }
}
