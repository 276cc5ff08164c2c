//! Per-team credential store. Teams start with a copy of the seeded originals; password changes
//! (PCRs) are applied per team and recorded in `pcr_history`.
//!
//! Snapshot and mutations serialise on a per-team advisory lock, so that a snapshot never sees a
//! half-applied credlist reset.

use anyhow::{bail, Result};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel::PgConnection;
use itertools::Itertools;
use queue_models::{Credential, TeamId};
use tracing::instrument;

use crate::models::{CredentialSnapshot, PcrEntry};
use crate::persist::DieselErrorFixCause;
use crate::schema::{credential, original_credential, pcr_history};

const LOCK_NAMESPACE: i64 = 0x5C0E_C0DE << 32;

fn lock_team(conn: &mut PgConnection, team_id: TeamId) -> QueryResult<()> {
    diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
        .bind::<BigInt, _>(LOCK_NAMESPACE | i64::from(team_id))
        .execute(conn)?;
    Ok(())
}

/// Inserts originals that don't exist yet. Existing originals keep their password.
#[instrument(skip(conn, rows), fields(rows = rows.len()))]
pub fn seed_originals(
    conn: &mut PgConnection,
    credlist_name: &str,
    rows: &[Credential],
) -> Result<usize> {
    let values = rows
        .iter()
        .map(|it| {
            (
                original_credential::credlist_name.eq(credlist_name),
                original_credential::username.eq(&it.username),
                original_credential::password.eq(&it.password),
            )
        })
        .collect_vec();
    diesel::insert_into(original_credential::table)
        .values(values)
        .on_conflict_do_nothing()
        .execute(conn)
        .fix_cause()
}

/// Copies originals the team doesn't have yet. Changed passwords are left alone.
#[instrument(skip(conn))]
pub fn seed_team(conn: &mut PgConnection, team_id: TeamId) -> Result<usize> {
    conn.transaction(|conn| {
        lock_team(conn, team_id)?;
        copy_originals(conn, team_id, None)
    })
    .fix_cause()
}

fn copy_originals(
    conn: &mut PgConnection,
    team_id: TeamId,
    only_credlist: Option<&str>,
) -> QueryResult<usize> {
    diesel::sql_query(
        "
        INSERT INTO credential (team_id, credlist_name, username, password, updated_at)
        SELECT $1, credlist_name, username, password, NOW()
        FROM original_credential
        WHERE $2::TEXT IS NULL OR credlist_name = $2
        ON CONFLICT DO NOTHING
    ",
    )
    .bind::<Integer, _>(team_id)
    .bind::<diesel::sql_types::Nullable<Text>, _>(only_credlist)
    .execute(conn)
}

/// Consistent view of the team's credentials, taken under the team lock.
pub fn snapshot(conn: &mut PgConnection, team_id: TeamId) -> Result<CredentialSnapshot> {
    let rows = conn
        .transaction(|conn| {
            lock_team(conn, team_id)?;
            credential::table
                .filter(credential::team_id.eq(team_id))
                .select((
                    credential::credlist_name,
                    credential::username,
                    credential::password,
                ))
                .order((credential::credlist_name, credential::username))
                .load::<(String, String, String)>(conn)
        })
        .fix_cause()?;
    Ok(rows
        .into_iter()
        .map(|(credlist, username, password)| (credlist, Credential::new(username, password)))
        .into_group_map())
}

#[instrument(skip(conn, password))]
pub fn update(
    conn: &mut PgConnection,
    team_id: TeamId,
    credlist_name: &str,
    username: &str,
    password: &str,
    changed_by: &str,
) -> Result<()> {
    let updated = conn
        .transaction::<_, diesel::result::Error, _>(|conn| {
            lock_team(conn, team_id)?;
            let updated = diesel::update(credential::table.find((team_id, credlist_name, username)))
                .set((
                    credential::password.eq(password),
                    credential::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            if updated > 0 {
                record_change(conn, team_id, credlist_name, username, changed_by)?;
            }
            Ok(updated)
        })
        .fix_cause()?;
    if updated == 0 {
        bail!(
            "Team {} has no user {:?} in credlist {:?}",
            team_id,
            username,
            credlist_name
        );
    }
    Ok(())
}

/// Restores the originals of one credlist for one team.
#[instrument(skip(conn))]
pub fn reset_credlist(
    conn: &mut PgConnection,
    team_id: TeamId,
    credlist_name: &str,
    changed_by: &str,
) -> Result<usize> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        lock_team(conn, team_id)?;
        diesel::delete(
            credential::table
                .filter(credential::team_id.eq(team_id))
                .filter(credential::credlist_name.eq(credlist_name)),
        )
        .execute(conn)?;
        let restored = copy_originals(conn, team_id, Some(credlist_name))?;
        record_change(conn, team_id, credlist_name, "*", changed_by)?;
        Ok(restored)
    })
    .fix_cause()
}

fn record_change(
    conn: &mut PgConnection,
    team_id: TeamId,
    credlist_name: &str,
    username: &str,
    changed_by: &str,
) -> QueryResult<usize> {
    diesel::insert_into(pcr_history::table)
        .values((
            pcr_history::team_id.eq(team_id),
            pcr_history::credlist_name.eq(credlist_name),
            pcr_history::username.eq(username),
            pcr_history::changed_by.eq(changed_by),
        ))
        .execute(conn)
}

pub fn history(conn: &mut PgConnection, team_id: TeamId) -> Result<Vec<PcrEntry>> {
    pcr_history::table
        .filter(pcr_history::team_id.eq(team_id))
        .select(PcrEntry::as_select())
        .order(pcr_history::changed_at.desc())
        .load(conn)
        .fix_cause()
}
