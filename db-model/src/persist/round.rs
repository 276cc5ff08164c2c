use std::collections::HashMap;

use anyhow::{Context, Result};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::PgConnection;
use itertools::Itertools;
use log::{debug, warn};
use queue_models::RoundId;
use tracing::instrument;

use crate::models::{CheckOutcome, Round, ServiceCheck, ServiceKey, Uptime, UptimeRow};
use crate::persist::{score, DieselErrorFixCause};
use crate::schema::{round, service_check};

const INSERT_CHUNK_SIZE: usize = 1000;

/// Zero if no round was persisted yet.
pub fn last_id(conn: &mut PgConnection) -> Result<RoundId> {
    let last = round::table
        .select(max(round::id))
        .first::<Option<RoundId>>(conn)
        .fix_cause()?;
    Ok(last.unwrap_or(0))
}

/// Inserts the round and all its checks in a single serializable transaction, so that the
/// round becomes visible together with its checks or not at all.
#[instrument(skip_all, fields(round = new_round.id, checks = checks.len()))]
pub fn create(conn: &mut PgConnection, new_round: &Round, checks: &[ServiceCheck]) -> Result<()> {
    conn.build_transaction()
        .serializable()
        .run(|conn| {
            diesel::insert_into(round::table)
                .values(new_round)
                .execute(conn)
                .fix_cause()
                .context("inserting round")?;
            let mut inserted = 0;
            for chunk in checks.chunks(INSERT_CHUNK_SIZE) {
                inserted += diesel::insert_into(service_check::table)
                    .values(chunk)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .fix_cause()
                    .context("inserting service checks")?;
            }
            if inserted != checks.len() {
                warn!(
                    "Round {}: {} of {} checks conflicted with existing rows and were skipped.",
                    new_round.id,
                    checks.len() - inserted,
                    checks.len()
                );
            }
            Ok(())
        })
}

/// Every persisted check in round order.
pub fn result_history(conn: &mut PgConnection) -> Result<Vec<CheckOutcome>> {
    service_check::table
        .select((
            service_check::team_id,
            service_check::round_id,
            service_check::service_name,
            service_check::result,
        ))
        .order((service_check::round_id.asc(), service_check::team_id.asc()))
        .load::<CheckOutcome>(conn)
        .fix_cause()
}

pub fn uptimes(conn: &mut PgConnection) -> Result<HashMap<ServiceKey, Uptime>> {
    let rows = diesel::sql_query(
        "
        SELECT team_id, service_name,
               COUNT(*) FILTER (WHERE result) AS passed,
               COUNT(*) AS total
        FROM service_check
        GROUP BY team_id, service_name
    ",
    )
    .load::<UptimeRow>(conn)
    .fix_cause()?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let uptime = Uptime {
                passed: row.passed as u64,
                total: row.total as u64,
            };
            ((row.team_id, row.service_name), uptime)
        })
        .collect())
}

/// All checks of one team and service, newest first.
pub fn checks_by_team(
    conn: &mut PgConnection,
    team_id: i32,
    service_name: &str,
) -> Result<Vec<ServiceCheck>> {
    service_check::table
        .filter(service_check::team_id.eq(team_id))
        .filter(service_check::service_name.eq(service_name))
        .select(ServiceCheck::as_select())
        .order(service_check::round_id.desc())
        .load(conn)
        .fix_cause()
}

/// The most recent `limit` rounds, newest first.
pub fn recent(conn: &mut PgConnection, limit: i64) -> Result<Vec<Round>> {
    round::table
        .select(Round::as_select())
        .order(round::id.desc())
        .limit(limit)
        .load(conn)
        .fix_cause()
}

/// Wipes everything round-scoped. Teams, toggles and credentials survive.
#[instrument(skip_all)]
pub fn reset_scores(conn: &mut PgConnection) -> Result<()> {
    conn.transaction(|conn| {
        diesel::sql_query("TRUNCATE service_check, round, sla CASCADE")
            .execute(conn)
            .fix_cause()
    })?;
    debug!("Round-scoped tables truncated.");
    score::refresh_view(conn)
}

/// Groups outcomes into per-pair sequences, keeping round order.
pub fn outcomes_by_pair(history: Vec<CheckOutcome>) -> HashMap<ServiceKey, Vec<bool>> {
    history
        .into_iter()
        .sorted_by_key(|it| it.round_id)
        .map(|it| ((it.team_id, it.service_name), it.result))
        .into_group_map()
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, MapAssertion};

    use super::*;

    fn outcome(team_id: i32, round_id: i32, service: &str, result: bool) -> CheckOutcome {
        CheckOutcome {
            team_id,
            round_id,
            service_name: service.to_string(),
            result,
        }
    }

    #[test]
    fn groups_in_round_order() {
        // given
        let history = vec![
            outcome(1, 2, "box01-web", false),
            outcome(2, 1, "box01-web", true),
            outcome(1, 1, "box01-web", true),
            outcome(1, 3, "box01-web", false),
        ];

        // when
        let grouped = outcomes_by_pair(history);

        // then
        assert_that!(grouped).has_length(2);
        assert_that!(grouped).contains_entry(
            (1, "box01-web".to_string()),
            vec![true, false, false],
        );
        assert_that!(grouped).contains_entry((2, "box01-web".to_string()), vec![true]);
    }
}
