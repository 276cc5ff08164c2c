use std::collections::HashSet;

use anyhow::Result;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::PgConnection;
use queue_models::TeamId;
use tracing::instrument;

use crate::models::{ServiceKey, TeamServiceToggle};
use crate::persist::DieselErrorFixCause;
use crate::schema::team_service_check;

/// A pair without a row is enabled.
pub fn is_enabled(conn: &mut PgConnection, team_id: TeamId, service_name: &str) -> Result<bool> {
    let enabled = team_service_check::table
        .find((team_id, service_name))
        .select(team_service_check::enabled)
        .first::<bool>(conn)
        .optional()
        .fix_cause()?;
    Ok(enabled.unwrap_or(true))
}

#[instrument(skip(conn))]
pub fn set_enabled(
    conn: &mut PgConnection,
    team_id: TeamId,
    service_name: &str,
    enabled: bool,
) -> Result<()> {
    use crate::schema::team_service_check::dsl;

    diesel::insert_into(dsl::team_service_check)
        .values((
            dsl::team_id.eq(team_id),
            dsl::service_name.eq(service_name),
            dsl::enabled.eq(enabled),
        ))
        .on_conflict((dsl::team_id, dsl::service_name))
        .do_update()
        .set(dsl::enabled.eq(excluded(dsl::enabled)))
        .execute(conn)
        .fix_cause()?;
    Ok(())
}

pub fn list_all(conn: &mut PgConnection) -> Result<Vec<TeamServiceToggle>> {
    team_service_check::table
        .select(TeamServiceToggle::as_select())
        .order((team_service_check::team_id, team_service_check::service_name))
        .load(conn)
        .fix_cause()
}

pub fn disabled(conn: &mut PgConnection) -> Result<HashSet<ServiceKey>> {
    let pairs = team_service_check::table
        .filter(team_service_check::enabled.eq(false))
        .select((team_service_check::team_id, team_service_check::service_name))
        .load::<ServiceKey>(conn)
        .fix_cause()?;
    Ok(pairs.into_iter().collect())
}
