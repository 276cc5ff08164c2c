use std::time::Duration;

use anyhow::{Context, Result};
use human_panic::setup_panic;
use log::{debug, info, warn};

use crate::helpers::logging;

/// Common entry point of all binaries: panic handler, `.env`, logging, Tokio runtime.
/// `fn_run` is called inside the runtime context and may `tokio::spawn`.
pub fn run<CliType>(
    fn_cli_parse: fn() -> CliType,
    fn_extract_logging: fn(&CliType) -> &logging::Params,
    fn_run: fn(CliType) -> Result<()>,
) -> Result<()> {
    setup_panic!();
    if let Err(env_err) = dotenvy::dotenv() {
        if env_err.not_found() {
            warn!("No `.env` file found (recursively). Relying on arguments and environment only.")
        } else {
            return Err(env_err).context("Failed to load `.env` file");
        }
    }

    let cli = fn_cli_parse();
    let logger_handle = logging::configure_from(fn_extract_logging(&cli))?;
    info!("{} {} starting up", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start Tokio runtime")?;
    let _guard = runtime.enter();

    let command_result = fn_run(cli);
    if let Err(e) = &command_result {
        log::error!("Exiting due to error: {:?}", e);
    }

    debug!("Waiting up to 15 seconds for remaining tasks to finish");
    runtime.shutdown_timeout(Duration::from_secs(15));

    // Async write mode buffers; the handle must live until here
    logger_handle.flush();

    command_result
}
