use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use queue_models::{Credential, RoundId, TeamId};
use serde::Serialize;

use crate::schema::*;

/// Uptime and SLA counters are kept per (team, service name).
pub type ServiceKey = (TeamId, String);

/// Credentials of one team, grouped by credlist name.
pub type CredentialSnapshot = HashMap<String, Vec<Credential>>;

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = team)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub identifier: String,
    pub active: bool,
}

#[derive(Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = team)]
pub struct NewTeam {
    pub name: String,
    pub identifier: String,
    pub active: bool,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = round)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Round {
    pub id: RoundId,
    pub start_time: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = service_check)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ServiceCheck {
    pub team_id: TeamId,
    pub round_id: RoundId,
    pub service_name: String,
    pub points: i32,
    pub result: bool,
    pub error: String,
    pub debug: String,
}

#[derive(Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = sla)]
pub struct NewSla {
    pub team_id: TeamId,
    pub round_id: RoundId,
    pub service_name: String,
    pub penalty: i32,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = sla)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Sla {
    pub id: i64,
    pub team_id: TeamId,
    pub round_id: RoundId,
    pub service_name: String,
    pub penalty: i32,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = team_service_check)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TeamServiceToggle {
    pub team_id: TeamId,
    pub service_name: String,
    pub enabled: bool,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = pcr_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PcrEntry {
    pub id: i64,
    pub team_id: TeamId,
    pub credlist_name: String,
    pub username: String,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

/// Minimal view of a persisted check, in round order, to replay failure streaks.
#[derive(Queryable, Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub team_id: TeamId,
    pub round_id: RoundId,
    pub service_name: String,
    pub result: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Uptime {
    pub passed: u64,
    pub total: u64,
}

impl Uptime {
    pub fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.passed += 1;
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 * 100.0 / self.total as f64
    }
}

#[derive(QueryableByName, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UptimeRow {
    #[diesel(sql_type = Integer)]
    pub team_id: TeamId,
    #[diesel(sql_type = Text)]
    pub service_name: String,
    #[diesel(sql_type = BigInt)]
    pub passed: i64,
    #[diesel(sql_type = BigInt)]
    pub total: i64,
}

#[derive(QueryableByName, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamScore {
    #[diesel(sql_type = Integer)]
    pub team_id: TeamId,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = BigInt)]
    pub points: i64,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, Serialize)]
#[diesel(table_name = cumulative_scores)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RoundScore {
    pub round_id: RoundId,
    pub team_id: TeamId,
    pub cumulative_points: i64,
}

/// Per-service breakdown of one team's checks.
#[derive(QueryableByName, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    #[diesel(sql_type = Text)]
    pub service_name: String,
    #[diesel(sql_type = BigInt)]
    pub passed: i64,
    #[diesel(sql_type = BigInt)]
    pub total: i64,
    #[diesel(sql_type = BigInt)]
    pub points: i64,
}

#[derive(QueryableByName, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceScore {
    #[diesel(sql_type = Integer)]
    pub team_id: TeamId,
    #[diesel(sql_type = Text)]
    pub service_name: String,
    #[diesel(sql_type = BigInt)]
    pub points: i64,
    #[diesel(sql_type = BigInt)]
    pub violations: i64,
    #[diesel(sql_type = BigInt)]
    pub penalty: i64,
}
