use anyhow::Result;
use clap::Parser;
use futures::executor;

use score_crab::helpers::rabbit;
use score_crab::helpers::{bootstrap, logging, stop};

mod worker;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[clap(flatten)]
    logging: logging::Params,

    #[clap(flatten)]
    rabbit: rabbit::Params,

    #[clap(flatten)]
    worker: worker::Params,
}

fn main() -> Result<()> {
    bootstrap::run(Cli::parse, |cli: &Cli| &cli.logging, do_run)
}

fn do_run(cli: Cli) -> Result<()> {
    let sig_handler = stop::new();
    let stop_rx = sig_handler.subscribe_stop();
    tokio::spawn(sig_handler.wait_for_signal());

    let worker_handle = tokio::spawn(worker::run(cli.rabbit, cli.worker, stop_rx));

    executor::block_on(stop::flatten(worker_handle))
}
