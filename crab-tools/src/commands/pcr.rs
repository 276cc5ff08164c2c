use anyhow::Result;
use clap::{Args, Subcommand};
use db_model::persist::{self, credential};
use log::info;
use queue_models::TeamId;

use crate::output;

#[derive(Args, Clone)]
pub struct Params {
    #[clap(flatten)]
    persist: persist::Params,

    /// Recorded in the change history.
    #[arg(long, default_value = "admin")]
    changed_by: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Clone)]
enum Action {
    /// Changes the password of an existing user. Checks pick it up in the next round.
    Set {
        team: TeamId,
        credlist: String,
        user: String,
        password: String,
    },
    /// Restores every credential of the credlist to the seeded originals.
    Reset { team: TeamId, credlist: String },
    History { team: TeamId },
}

pub fn handle(params: Params) -> Result<()> {
    let mut conn = params.persist.connect("crab-tools")?;
    match params.action {
        Action::Set {
            team,
            credlist,
            user,
            password,
        } => {
            credential::update(&mut conn, team, &credlist, &user, &password, &params.changed_by)?;
            info!("Password of {} in {} changed for team {}.", user, credlist, team);
            Ok(())
        }
        Action::Reset { team, credlist } => {
            let restored = credential::reset_credlist(&mut conn, team, &credlist, &params.changed_by)?;
            info!("Restored {} credentials of {} for team {}.", restored, credlist, team);
            Ok(())
        }
        Action::History { team } => output::print_rows(&credential::history(&mut conn, team)?),
    }
}
