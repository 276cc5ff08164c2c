use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use diesel::PgConnection;
use queue_models::{Credential, RoundId, TeamId};

use crate::models::{
    CheckOutcome, CredentialSnapshot, NewSla, NewTeam, Round, ServiceCheck, ServiceKey, Team,
    Uptime,
};
use crate::persist::{self, credential, round, score, sla, team, toggle};

/// Everything the round keeper needs from persistence. Read paths for the outside world live
/// in [crate::persist] directly.
pub trait ScoreStore: Send + Sync {
    /// Zero if no round exists.
    fn last_round_id(&self) -> Result<RoundId>;

    fn active_teams(&self) -> Result<Vec<Team>>;

    /// Pairs administratively switched off.
    fn disabled_services(&self) -> Result<HashSet<ServiceKey>>;

    fn team_credentials(&self, team_id: TeamId) -> Result<CredentialSnapshot>;

    /// Atomic: either the round and all checks are committed, or nothing is.
    fn create_round(&self, round: &Round, checks: &[ServiceCheck]) -> Result<()>;

    fn create_sla(&self, violation: &NewSla) -> Result<()>;

    fn refresh_scores(&self) -> Result<()>;

    fn load_uptimes(&self) -> Result<HashMap<ServiceKey, Uptime>>;

    /// Every persisted check in round order.
    fn load_result_history(&self) -> Result<Vec<CheckOutcome>>;

    /// Truncates round-scoped data and refreshes the score view.
    fn reset_scores(&self) -> Result<()>;

    /// Returns whether a team was created.
    fn provision_team(&self, team: &NewTeam) -> Result<bool>;

    /// Seeds originals for the credlist and copies them to every team that lacks them.
    fn seed_credentials(&self, credlist_name: &str, rows: &[Credential]) -> Result<()>;
}

pub struct PgStore {
    conn: Mutex<PgConnection>,
}

impl PgStore {
    pub fn connect(params: &persist::Params, app_name: &str) -> Result<Self> {
        Ok(PgStore {
            conn: Mutex::new(params.connect(app_name)?),
        })
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut PgConnection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        op(&mut conn)
    }
}

impl ScoreStore for PgStore {
    fn last_round_id(&self) -> Result<RoundId> {
        self.with_conn(round::last_id)
    }

    fn active_teams(&self) -> Result<Vec<Team>> {
        self.with_conn(team::active)
    }

    fn disabled_services(&self) -> Result<HashSet<ServiceKey>> {
        self.with_conn(toggle::disabled)
    }

    fn team_credentials(&self, team_id: TeamId) -> Result<CredentialSnapshot> {
        self.with_conn(|conn| credential::snapshot(conn, team_id))
    }

    fn create_round(&self, new_round: &Round, checks: &[ServiceCheck]) -> Result<()> {
        self.with_conn(|conn| round::create(conn, new_round, checks))
    }

    fn create_sla(&self, violation: &NewSla) -> Result<()> {
        self.with_conn(|conn| sla::create(conn, violation))
    }

    fn refresh_scores(&self) -> Result<()> {
        self.with_conn(score::refresh_view)
    }

    fn load_uptimes(&self) -> Result<HashMap<ServiceKey, Uptime>> {
        self.with_conn(round::uptimes)
    }

    fn load_result_history(&self) -> Result<Vec<CheckOutcome>> {
        self.with_conn(round::result_history)
    }

    fn reset_scores(&self) -> Result<()> {
        self.with_conn(round::reset_scores)
    }

    fn provision_team(&self, new_team: &NewTeam) -> Result<bool> {
        self.with_conn(|conn| team::provision(conn, new_team))
    }

    fn seed_credentials(&self, credlist_name: &str, rows: &[Credential]) -> Result<()> {
        self.with_conn(|conn| {
            credential::seed_originals(conn, credlist_name, rows)?;
            for team in team::list(conn)? {
                credential::seed_team(conn, team.id)?;
            }
            Ok(())
        })
    }
}
