use anyhow::Result;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Integer};
use diesel::PgConnection;
use log::trace;
use queue_models::TeamId;
use tracing::instrument;

use crate::models::{RoundScore, ServiceScore, ServiceSummary, TeamScore};
use crate::persist::DieselErrorFixCause;
use crate::schema::cumulative_scores;

#[derive(QueryableByName)]
struct Populated {
    #[diesel(sql_type = Bool)]
    relispopulated: bool,
}

/// Refreshes `cumulative_scores`. Concurrent refresh keeps readers unblocked but is refused by
/// Postgres for a view that was never populated, so the first refresh is a plain one.
#[instrument(skip_all)]
pub fn refresh_view(conn: &mut PgConnection) -> Result<()> {
    let populated = diesel::sql_query(
        "SELECT relispopulated FROM pg_class WHERE relname = 'cumulative_scores'",
    )
    .get_result::<Populated>(conn)
    .fix_cause()?
    .relispopulated;
    let statement = if populated {
        "REFRESH MATERIALIZED VIEW CONCURRENTLY cumulative_scores"
    } else {
        "REFRESH MATERIALIZED VIEW cumulative_scores"
    };
    trace!("{}", statement);
    diesel::sql_query(statement).execute(conn).fix_cause()?;
    Ok(())
}

/// Latest cumulative score per team, best first. Teams without rounds have zero.
pub fn totals(conn: &mut PgConnection) -> Result<Vec<TeamScore>> {
    diesel::sql_query(
        "
        SELECT t.id AS team_id, t.name, COALESCE(c.cumulative_points, 0) AS points
        FROM team t
        LEFT JOIN (
            SELECT DISTINCT ON (team_id) team_id, cumulative_points
            FROM cumulative_scores
            ORDER BY team_id, round_id DESC
        ) c ON c.team_id = t.id
        ORDER BY points DESC, t.id
    ",
    )
    .load(conn)
    .fix_cause()
}

pub fn team_score(conn: &mut PgConnection, team_id: TeamId) -> Result<i64> {
    let latest = cumulative_scores::table
        .filter(cumulative_scores::team_id.eq(team_id))
        .order(cumulative_scores::round_id.desc())
        .select(cumulative_scores::cumulative_points)
        .first::<i64>(conn)
        .optional()
        .fix_cause()?;
    Ok(latest.unwrap_or(0))
}

/// Score progression: cumulative points of every team after every round.
pub fn by_round(conn: &mut PgConnection) -> Result<Vec<RoundScore>> {
    cumulative_scores::table
        .select(RoundScore::as_select())
        .order((cumulative_scores::round_id, cumulative_scores::team_id))
        .load(conn)
        .fix_cause()
}

/// Points earned from passed checks per team, without SLA penalties.
pub fn check_sum_by_team(conn: &mut PgConnection) -> Result<Vec<TeamScore>> {
    diesel::sql_query(
        "
        SELECT t.id AS team_id, t.name, COALESCE(SUM(sc.points), 0)::BIGINT AS points
        FROM team t
        LEFT JOIN service_check sc ON sc.team_id = t.id AND sc.result
        GROUP BY t.id, t.name
        ORDER BY points DESC, t.id
    ",
    )
    .load(conn)
    .fix_cause()
}

pub fn team_summary(conn: &mut PgConnection, team_id: TeamId) -> Result<Vec<ServiceSummary>> {
    diesel::sql_query(
        "
        SELECT service_name,
               COUNT(*) FILTER (WHERE result) AS passed,
               COUNT(*) AS total,
               COALESCE(SUM(points) FILTER (WHERE result), 0)::BIGINT AS points
        FROM service_check
        WHERE team_id = $1
        GROUP BY service_name
        ORDER BY service_name
    ",
    )
    .bind::<Integer, _>(team_id)
    .load(conn)
    .fix_cause()
}

/// Points, SLA violations and penalties per (team, service).
#[instrument(skip_all)]
pub fn service_scores(conn: &mut PgConnection) -> Result<Vec<ServiceScore>> {
    diesel::sql_query(
        "
        SELECT p.team_id, p.service_name, p.points,
               COALESCE(s.violations, 0)::BIGINT AS violations,
               COALESCE(s.penalty, 0)::BIGINT AS penalty
        FROM (
            SELECT team_id, service_name,
                   COALESCE(SUM(points) FILTER (WHERE result), 0)::BIGINT AS points
            FROM service_check
            GROUP BY team_id, service_name
        ) p
        LEFT JOIN (
            SELECT team_id, service_name, COUNT(*) AS violations, SUM(penalty) AS penalty
            FROM sla
            GROUP BY team_id, service_name
        ) s ON s.team_id = p.team_id AND s.service_name = p.service_name
        ORDER BY p.team_id, p.service_name
    ",
    )
    .load(conn)
    .fix_cause()
}
