use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use db_model::persist::{self, team};
use log::info;
use queue_models::TeamId;

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
    /// All teams, including inactive ones.
    List,
    /// Looks a team up by its configured name.
    Find { name: String },
    /// Changes what the round keeper needs to schedule checks for a team.
    Update {
        id: TeamId,
        /// Replaces the `_` in box IP templates.
        #[arg(long)]
        identifier: Option<String>,
        /// Inactive teams get no tasks.
        #[arg(long)]
        active: Option<bool>,
    },
}

pub fn handle(params: Params) -> Result<()> {
    let mut conn = params.persist.connect("crab-tools")?;
    match params.action {
        Action::List => output::print_rows(&team::list(&mut conn)?),
        Action::Find { name } => match team::find_by_name(&mut conn, &name)? {
            Some(found) => output::print_one(&found),
            None => bail!("No team named {:?}", name),
        },
        Action::Update {
            id,
            identifier,
            active,
        } => {
            if identifier.is_none() && active.is_none() {
                bail!("Nothing to update, pass --identifier and/or --active");
            }
            let updated = team::update(&mut conn, id, identifier.as_deref(), active)?;
            info!("Team {} updated, changes apply from the next round on.", id);
            output::print_one(&updated)
        }
    }
}
