use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use db_model::{persist, PgStore};
use futures::executor;
use log::info;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use round_keeper::config::watch::ConfigWatcher;
use round_keeper::config::EngineConfig;
use round_keeper::control::{self, Control};
use round_keeper::keeper::RoundKeeper;
use round_keeper::startup;
use score_crab::helpers::rabbit;
use score_crab::helpers::{bootstrap, logging, stop};
use score_crab::transport::{RabbitTransport, Transport};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[clap(flatten)]
    rabbit: rabbit::Params,

    #[clap(flatten)]
    database: persist::Params,

    #[clap(flatten)]
    keeper: Params,
}

#[derive(Args, Debug, Clone)]
#[group(id = "keeper")]
struct Params {
    /// Engine configuration file (TOML)
    #[arg(long = "config", env = "ENGINE_CONFIG", default_value = "config/event.conf")]
    config_path: PathBuf,

    /// Directory containing the credlist files named in the configuration
    #[arg(long, env = "CREDLIST_DIR", default_value = "config/credlists")]
    credlist_dir: PathBuf,

    /// Reload the configuration when the file changes
    #[arg(long)]
    watch_config: bool,
}

fn main() -> Result<()> {
    bootstrap::run(Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(&cli.keeper.config_path)
        .with_context(|| format!("loading {}", cli.keeper.config_path.display()))?;
    info!(
        "Event {:?} ({}) with {} boxes and {} services",
        config.required.event_name,
        config.event_type,
        config.boxes.len(),
        config.checks().count()
    );

    cli.database.migrate()?;
    let store = Arc::new(PgStore::connect(&cli.database, "round-keeper")?);
    startup::prepare(store.as_ref(), &config, &cli.keeper.credlist_dir)?;

    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    tokio::spawn(sig_handler.wait_for_signal());

    let main_handle = tokio::spawn(run(cli, config, store, stop_rx.clone()));
    let result = executor::block_on(stop::flatten(main_handle));
    stop_rx.cancel();
    result
}

async fn run(cli: Cli, config: EngineConfig, store: Arc<PgStore>, stop_rx: CancellationToken) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(
        RabbitTransport::connect(&cli.rabbit, "round-keeper")
            .await
            .context("connecting to RabbitMQ")?,
    );
    let control = Arc::new(Control::new(config.misc.start_paused, stop_rx.clone()));

    let config_rx = if cli.keeper.watch_config {
        let (watcher, config_rx) = ConfigWatcher::new(cli.keeper.config_path.clone(), config);
        let watcher = watcher.provisioning(store.clone(), cli.keeper.credlist_dir.clone());
        tokio::spawn(watcher.run(stop_rx.clone()));
        config_rx
    } else {
        watch::channel(Arc::new(config)).1
    };

    let listener_handle = tokio::spawn(control::listen(control.clone(), transport.clone(), stop_rx.clone()));

    let mut keeper = RoundKeeper::new(store, transport, control, config_rx)?;
    let keeper_stop = stop_rx.clone();
    let keeper_handle = tokio::spawn(async move { keeper.start(keeper_stop).await });

    wait_for_exit(keeper_handle, listener_handle).await
}

async fn wait_for_exit(
    keeper_handle: JoinHandle<Result<()>>, listener_handle: JoinHandle<Result<()>>,
) -> Result<()> {
    let inner_res = select! {
        res = keeper_handle => res.with_context(|| "failed to join round keeper"),
        res = listener_handle => res.with_context(|| "failed to join control listener"),
    }?;
    inner_res.with_context(|| "a task exited unexpectedly")
}
