use anyhow::Result;
use clap::Subcommand;
use log::debug;
use queue_models::ControlEvent;

mod engine;
mod pcr;
mod scores;
mod services;
mod teams;

pub fn handle(cmd: Commands) -> Result<()> {
    let command_result = match cmd {
        Commands::Pause(params) => engine::handle(params, ControlEvent::Pause),
        Commands::Resume(params) => engine::handle(params, ControlEvent::Resume),
        Commands::Reset(params) => engine::handle(params, ControlEvent::Reset),
        Commands::Teams(params) => teams::handle(params),
        Commands::Services(params) => services::handle(params),
        Commands::Scores(params) => scores::handle(params),
        Commands::Pcr(params) => pcr::handle(params),
    };
    debug!("Finished command execution. Result: {:?}", command_result);
    command_result
}

#[derive(Subcommand)]
pub enum Commands {
    /// Hold the round keeper at the next round boundary.
    Pause(engine::Params),
    /// Let a paused round keeper continue.
    Resume(engine::Params),
    /// Abandon the running round and wipe all scores. Teams and credentials are kept.
    Reset(engine::Params),
    /// Inspect or change teams.
    Teams(teams::Params),
    /// Enable or disable checking of a service for a single team.
    Services(services::Params),
    /// Read scores, per-service breakdowns and raw check results.
    Scores(scores::Params),
    /// Password change requests: teams rotating the credentials a check logs in with.
    Pcr(pcr::Params),
}
