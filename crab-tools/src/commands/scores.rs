use anyhow::Result;
use clap::{Args, Subcommand};
use db_model::persist::{self, round, score, sla};
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
    /// Leaderboard: points from passed checks minus SLA penalties.
    Totals,
    /// Points from passed checks only.
    Earned,
    /// Cumulative score of every team after every round.
    ByRound,
    Team { id: TeamId },
    /// Points, violations and penalties per team and service.
    Services,
    /// Pass counts and points per service of one team.
    Summary { id: TeamId },
    /// Raw check results of one team and service, newest first.
    Checks { team: TeamId, service: String },
    /// SLA violations of one team.
    Slas { team: TeamId },
    Rounds {
        #[arg(long, default_value = "10")]
        limit: i64,
    },
}

#[derive(Serialize)]
struct TeamTotal {
    team_id: TeamId,
    points: i64,
}

pub fn handle(params: Params) -> Result<()> {
    let mut conn = params.persist.connect("crab-tools")?;
    match params.action {
        Action::Totals => output::print_rows(&score::totals(&mut conn)?),
        Action::Earned => output::print_rows(&score::check_sum_by_team(&mut conn)?),
        Action::ByRound => output::print_rows(&score::by_round(&mut conn)?),
        Action::Team { id } => output::print_one(&TeamTotal {
            team_id: id,
            points: score::team_score(&mut conn, id)?,
        }),
        Action::Services => output::print_rows(&score::service_scores(&mut conn)?),
        Action::Summary { id } => output::print_rows(&score::team_summary(&mut conn, id)?),
        Action::Checks { team, service } => {
            output::print_rows(&round::checks_by_team(&mut conn, team, &service)?)
        }
        Action::Slas { team } => output::print_rows(&sla::by_team(&mut conn, team)?),
        Action::Rounds { limit } => output::print_rows(&round::recent(&mut conn, limit)?),
    }
}
