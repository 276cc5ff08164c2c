use anyhow::Result;
use clap::{Args, Subcommand};
use db_model::persist::{self, toggle};
use log::info;
use queue_models::TeamId;
use serde::Serialize;

use crate::output;

#[derive(Args, Clone)]
pub struct Params {
    #[clap(flatten)]
    persist: persist::Params,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Clone)]
enum Action {
    Enable { team: TeamId, service: String },
    /// Disabled pairs are skipped entirely: no task, no points, no SLA.
    Disable { team: TeamId, service: String },
    /// Explicit toggles only. Pairs never toggled are enabled.
    List,
    Status { team: TeamId, service: String },
}

#[derive(Serialize)]
struct Status<'a> {
    team_id: TeamId,
    service_name: &'a str,
    enabled: bool,
}

pub fn handle(params: Params) -> Result<()> {
    let mut conn = params.persist.connect("crab-tools")?;
    match params.action {
        Action::Enable { team, service } => set(&mut conn, team, &service, true),
        Action::Disable { team, service } => set(&mut conn, team, &service, false),
        Action::List => output::print_rows(&toggle::list_all(&mut conn)?),
        Action::Status { team, service } => output::print_one(&Status {
            team_id: team,
            service_name: &service,
            enabled: toggle::is_enabled(&mut conn, team, &service)?,
        }),
    }
}

fn set(
    conn: &mut diesel::PgConnection,
    team_id: TeamId,
    service_name: &str,
    enabled: bool,
) -> Result<()> {
    toggle::set_enabled(conn, team_id, service_name, enabled)?;
    info!(
        "Service {} of team {} is now {}.",
        service_name,
        team_id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
