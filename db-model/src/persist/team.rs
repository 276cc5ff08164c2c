use anyhow::{bail, Result};
use diesel::prelude::*;
use diesel::PgConnection;
use queue_models::TeamId;
use tracing::instrument;

use crate::models::{NewTeam, Team};
use crate::persist::DieselErrorFixCause;
use crate::schema::team;

pub fn list(conn: &mut PgConnection) -> Result<Vec<Team>> {
    team::table
        .select(Team::as_select())
        .order(team::id)
        .load(conn)
        .fix_cause()
}

pub fn active(conn: &mut PgConnection) -> Result<Vec<Team>> {
    team::table
        .filter(team::active.eq(true))
        .select(Team::as_select())
        .order(team::id)
        .load(conn)
        .fix_cause()
}

pub fn find_by_name(conn: &mut PgConnection, name: &str) -> Result<Option<Team>> {
    team::table
        .filter(team::name.eq(name))
        .select(Team::as_select())
        .first(conn)
        .optional()
        .fix_cause()
}

/// Creates the team if no team of that name exists yet. Returns whether it was created.
#[instrument(skip(conn))]
pub fn provision(conn: &mut PgConnection, new_team: &NewTeam) -> Result<bool> {
    let inserted = diesel::insert_into(team::table)
        .values(new_team)
        .on_conflict(team::name)
        .do_nothing()
        .execute(conn)
        .fix_cause()?;
    Ok(inserted > 0)
}

/// Admin path for the attributes that matter to scheduling.
#[instrument(skip(conn))]
pub fn update(
    conn: &mut PgConnection,
    team_id: TeamId,
    identifier: Option<&str>,
    active: Option<bool>,
) -> Result<Team> {
    let updated = conn.transaction(|conn| {
        if let Some(identifier) = identifier {
            diesel::update(team::table.find(team_id))
                .set(team::identifier.eq(identifier))
                .execute(conn)?;
        }
        if let Some(active) = active {
            diesel::update(team::table.find(team_id))
                .set(team::active.eq(active))
                .execute(conn)?;
        }
        team::table
            .find(team_id)
            .select(Team::as_select())
            .first(conn)
            .optional()
    });
    match updated.fix_cause()? {
        Some(team) => Ok(team),
        None => bail!("No team with id {}", team_id),
    }
}
