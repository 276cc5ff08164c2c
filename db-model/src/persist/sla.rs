use anyhow::Result;
use diesel::prelude::*;
use diesel::PgConnection;
use queue_models::TeamId;
use tracing::instrument;

use crate::models::{NewSla, Sla};
use crate::persist::DieselErrorFixCause;
use crate::schema::sla;

/// Each violation is written in its own transaction, independently of the round commit.
#[instrument(skip(conn))]
pub fn create(conn: &mut PgConnection, violation: &NewSla) -> Result<()> {
    conn.transaction(|conn| {
        diesel::insert_into(sla::table)
            .values(violation)
            .execute(conn)
            .fix_cause()
    })?;
    Ok(())
}

pub fn by_team(conn: &mut PgConnection, team_id: TeamId) -> Result<Vec<Sla>> {
    sla::table
        .filter(sla::team_id.eq(team_id))
        .select(Sla::as_select())
        .order((sla::round_id.asc(), sla::service_name.asc()))
        .load(conn)
        .fix_cause()
}
