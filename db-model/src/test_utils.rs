//! In-memory [ScoreStore] for exercising the round keeper without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use queue_models::{Credential, RoundId, TeamId};

use crate::models::{
    CheckOutcome, CredentialSnapshot, NewSla, NewTeam, Round, ServiceCheck, ServiceKey, Team,
    Uptime,
};
use crate::store::ScoreStore;

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default, Clone)]
pub struct State {
    pub teams: Vec<Team>,
    pub rounds: Vec<Round>,
    pub checks: Vec<ServiceCheck>,
    pub slas: Vec<NewSla>,
    pub disabled: HashSet<ServiceKey>,
    pub originals: HashMap<String, Vec<Credential>>,
    pub credentials: HashMap<TeamId, CredentialSnapshot>,
    pub refreshes: usize,
    /// Makes `create_round` fail, to simulate an unavailable database.
    pub fail_rounds: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_teams(ids: &[TeamId]) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            state.teams = ids.iter().map(|id| team(*id)).collect();
        }
        store
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Copy of the current contents, for assertions.
    pub fn snapshot(&self) -> State {
        self.lock().map(|it| it.clone()).unwrap_or_default()
    }

    pub fn checks_of(&self, team_id: TeamId, service_name: &str) -> Vec<ServiceCheck> {
        self.snapshot()
            .checks
            .into_iter()
            .filter(|it| it.team_id == team_id && it.service_name == service_name)
            .collect()
    }
}

pub fn team(id: TeamId) -> Team {
    Team {
        id,
        name: format!("team{:02}", id),
        identifier: id.to_string(),
        active: true,
    }
}

impl ScoreStore for MemoryStore {
    fn last_round_id(&self) -> Result<RoundId> {
        Ok(self.lock()?.rounds.iter().map(|it| it.id).max().unwrap_or(0))
    }

    fn active_teams(&self) -> Result<Vec<Team>> {
        Ok(self
            .lock()?
            .teams
            .iter()
            .filter(|it| it.active)
            .cloned()
            .collect())
    }

    fn disabled_services(&self) -> Result<HashSet<ServiceKey>> {
        Ok(self.lock()?.disabled.clone())
    }

    fn team_credentials(&self, team_id: TeamId) -> Result<CredentialSnapshot> {
        Ok(self
            .lock()?
            .credentials
            .get(&team_id)
            .cloned()
            .unwrap_or_default())
    }

    fn create_round(&self, round: &Round, checks: &[ServiceCheck]) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_rounds {
            bail!("database unavailable");
        }
        if state.rounds.iter().any(|it| it.id == round.id) {
            bail!("duplicate key value violates unique constraint \"round_pkey\"");
        }
        state.rounds.push(round.clone());
        for check in checks {
            let exists = state.checks.iter().any(|it| {
                it.team_id == check.team_id
                    && it.round_id == check.round_id
                    && it.service_name == check.service_name
            });
            if !exists {
                state.checks.push(check.clone());
            }
        }
        Ok(())
    }

    fn create_sla(&self, violation: &NewSla) -> Result<()> {
        self.lock()?.slas.push(violation.clone());
        Ok(())
    }

    fn refresh_scores(&self) -> Result<()> {
        self.lock()?.refreshes += 1;
        Ok(())
    }

    fn load_uptimes(&self) -> Result<HashMap<ServiceKey, Uptime>> {
        let mut uptimes: HashMap<ServiceKey, Uptime> = HashMap::new();
        for check in self.lock()?.checks.iter() {
            uptimes
                .entry((check.team_id, check.service_name.clone()))
                .or_default()
                .record(check.result);
        }
        Ok(uptimes)
    }

    fn load_result_history(&self) -> Result<Vec<CheckOutcome>> {
        let mut history: Vec<CheckOutcome> = self
            .lock()?
            .checks
            .iter()
            .map(|it| CheckOutcome {
                team_id: it.team_id,
                round_id: it.round_id,
                service_name: it.service_name.clone(),
                result: it.result,
            })
            .collect();
        history.sort_by_key(|it| (it.round_id, it.team_id));
        Ok(history)
    }

    fn reset_scores(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.rounds.clear();
        state.checks.clear();
        state.slas.clear();
        state.refreshes += 1;
        Ok(())
    }

    fn provision_team(&self, new_team: &NewTeam) -> Result<bool> {
        let mut state = self.lock()?;
        if state.teams.iter().any(|it| it.name == new_team.name) {
            return Ok(false);
        }
        let id = state.teams.iter().map(|it| it.id).max().unwrap_or(0) + 1;
        state.teams.push(Team {
            id,
            name: new_team.name.clone(),
            identifier: new_team.identifier.clone(),
            active: new_team.active,
        });
        Ok(true)
    }

    fn seed_credentials(&self, credlist_name: &str, rows: &[Credential]) -> Result<()> {
        let mut state = self.lock()?;
        let originals = state
            .originals
            .entry(credlist_name.to_string())
            .or_default();
        for row in rows {
            if !originals.iter().any(|it| it.username == row.username) {
                originals.push(row.clone());
            }
        }
        let originals = originals.clone();
        let team_ids: Vec<TeamId> = state.teams.iter().map(|it| it.id).collect();
        for team_id in team_ids {
            let list = state
                .credentials
                .entry(team_id)
                .or_default()
                .entry(credlist_name.to_string())
                .or_default();
            for original in originals.iter() {
                if !list.iter().any(|it| it.username == original.username) {
                    list.push(original.clone());
                }
            }
        }
        Ok(())
    }
}
