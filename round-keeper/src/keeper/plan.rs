use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use db_model::models::{CredentialSnapshot, ServiceKey, Team};
use queue_models::{RoundId, Task, TeamId};
use service_checks::Runner;
use uuid::Uuid;

use crate::config::EngineConfig;

/// Facts captured at round start and held for the whole round.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub teams: Vec<Team>,
    pub disabled: HashSet<ServiceKey>,
    pub credentials: HashMap<TeamId, CredentialSnapshot>,
}

/// One task per active team and service that is runnable at `now` and not switched off for
/// that team. Credentials are copied in from the snapshot, per credlist of the service.
pub fn plan_round(
    config: &EngineConfig,
    snapshot: &Snapshot,
    round_id: RoundId,
    dispatch_id: Uuid,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let runnable: Vec<_> = config
        .checks()
        .filter(|it| it.service().is_runnable(now))
        .collect();
    let mut tasks = Vec::with_capacity(snapshot.teams.len() * runnable.len());
    for team in snapshot.teams.iter().filter(|it| it.active) {
        let team_credentials = snapshot.credentials.get(&team.id);
        for check in runnable.iter() {
            if snapshot.disabled.contains(&(team.id, check.name().to_string())) {
                continue;
            }
            let credentials = match team_credentials {
                Some(lists) => check
                    .credlists()
                    .iter()
                    .filter_map(|name| lists.get(name))
                    .flatten()
                    .cloned()
                    .collect(),
                None => vec![],
            };
            tasks.push(Task {
                team_id: team.id,
                team_identifier: team.identifier.clone(),
                service_type: check.service_type().to_string(),
                service_name: check.name().to_string(),
                deadline,
                round_id,
                dispatch_id,
                attempts: check.attempts(),
                credentials,
                check_data: check
                    .check_data()
                    .with_context(|| format!("serializing {}", check.name()))?,
            });
        }
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
    use chrono::Duration;
    use db_model::test_utils::team;
    use queue_models::Credential;

    use super::*;
    use crate::config::test_support::config_text;

    fn config(services: &str) -> EngineConfig {
        EngineConfig::parse(&config_text("", services)).unwrap()
    }

    fn snapshot(team_ids: &[TeamId]) -> Snapshot {
        Snapshot {
            teams: team_ids.iter().map(|id| team(*id)).collect(),
            ..Snapshot::default()
        }
    }

    fn names(tasks: &[Task]) -> Vec<(TeamId, String)> {
        tasks
            .iter()
            .map(|it| (it.team_id, it.service_name.clone()))
            .collect()
    }

    #[test]
    fn every_team_gets_every_service() {
        // given
        let config = config("[[Box.Tcp]]\nPort = 22\n[[Box.Ping]]");
        let dispatch = Uuid::new_v4();
        let now = Utc::now();

        // when
        let tasks = plan_round(&config, &snapshot(&[1, 2]), 3, dispatch, now + Duration::seconds(60), now).unwrap();

        // then
        assert_that!(tasks.len()).is_equal_to(4);
        let first = &tasks[0];
        assert_that!(first.round_id).is_equal_to(3);
        assert_that!(tasks.iter().all(|it| it.dispatch_id == dispatch)).is_true();
        assert_that!(first.team_identifier.clone()).is_equal_to("1".to_string());
        assert_that!(first.attempts).is_equal_to(1);
        assert_that!(first.check_data["Target"].clone()).is_equal_to(serde_json::json!("127.0.0._"));
    }

    #[test]
    fn launch_and_stop_times_apply() {
        // given
        let now = Utc::now();
        let services = format!(
            "[[Box.Tcp]]\nDisplay = \"late\"\nPort = 1\nLaunchTime = \"{}\"\n\
             [[Box.Tcp]]\nDisplay = \"over\"\nPort = 2\nStopTime = \"{}\"\n\
             [[Box.Tcp]]\nDisplay = \"off\"\nPort = 3\nDisabled = true\n\
             [[Box.Tcp]]\nDisplay = \"on\"\nPort = 4",
            (now + Duration::hours(1)).to_rfc3339(),
            (now - Duration::hours(1)).to_rfc3339(),
        );

        // when
        let tasks = plan_round(&config(&services), &snapshot(&[1]), 1, Uuid::nil(), now, now).unwrap();

        // then
        assert_that!(names(&tasks)).is_equal_to(vec![(1, "box01-on".to_string())]);
    }

    #[test]
    fn toggles_and_inactive_teams_are_skipped() {
        // given
        let config = config("[[Box.Tcp]]\nPort = 22\n[[Box.Ssh]]\nCredLists = [\"users.credlist\"]");
        let mut snapshot = snapshot(&[1, 2, 3]);
        snapshot.teams[2].active = false;
        snapshot.disabled.insert((2, "box01-ssh".to_string()));
        let now = Utc::now();

        // when
        let tasks = plan_round(&config, &snapshot, 1, Uuid::nil(), now, now).unwrap();

        // then
        assert_that!(names(&tasks)).is_equal_to(vec![
            (1, "box01-tcp".to_string()),
            (1, "box01-ssh".to_string()),
            (2, "box01-tcp".to_string()),
        ]);
    }

    #[test]
    fn credentials_follow_credlists() {
        // given
        let config = config("[[Box.Tcp]]\nPort = 22\n[[Box.Ssh]]\nCredLists = [\"users.credlist\"]");
        let mut snapshot = snapshot(&[1]);
        snapshot.credentials.insert(
            1,
            HashMap::from([
                ("users.credlist".to_string(), vec![Credential::new("alice", "pw1")]),
                ("admins.credlist".to_string(), vec![Credential::new("root", "pw2")]),
            ]),
        );
        let now = Utc::now();

        // when
        let tasks = plan_round(&config, &snapshot, 1, Uuid::nil(), now, now).unwrap();

        // then
        let ssh = tasks.iter().find(|it| it.service_type == "Ssh").unwrap();
        assert_that!(ssh.credentials.clone()).is_equal_to(vec![Credential::new("alice", "pw1")]);
        let tcp = tasks.iter().find(|it| it.service_type == "Tcp").unwrap();
        assert_that!(tcp.credentials.is_empty()).is_true();
    }
}
