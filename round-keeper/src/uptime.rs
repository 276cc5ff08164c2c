//! In-memory SLA and uptime counters, per (team, service).
//!
//! Only the round keeper's loop mutates these, so there is no locking. They are derived state:
//! [SlaState::rebuild] recreates them from the persisted checks.

use std::collections::HashMap;

use anyhow::Result;
use db_model::models::{ServiceKey, Uptime};
use db_model::persist::round::outcomes_by_pair;
use db_model::ScoreStore;
use log::debug;
use queue_models::TeamId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaState {
    failures: HashMap<ServiceKey, u32>,
    uptime: HashMap<ServiceKey, Uptime>,
}

impl SlaState {
    /// Replays persisted history. `threshold_of` gives the SLA threshold of a service by name.
    pub fn rebuild(store: &dyn ScoreStore, threshold_of: impl Fn(&str) -> u32) -> Result<Self> {
        let uptime = store.load_uptimes()?;
        let mut failures = HashMap::new();
        for (key, outcomes) in outcomes_by_pair(store.load_result_history()?) {
            let threshold = threshold_of(&key.1).max(1);
            let streak = outcomes
                .into_iter()
                .fold(0, |streak, passed| if passed { 0 } else { (streak + 1) % threshold });
            if streak > 0 {
                failures.insert(key, streak);
            }
        }
        debug!(
            "Rebuilt SLA state: {} pairs with uptime, {} with open failure streaks",
            uptime.len(),
            failures.len()
        );
        Ok(SlaState { failures, uptime })
    }

    /// Counts one result. Returns true if this failure completes an SLA violation, in which case
    /// the streak starts over.
    pub fn record(&mut self, team_id: TeamId, service_name: &str, passed: bool, threshold: u32) -> bool {
        let key = (team_id, service_name.to_string());
        self.uptime.entry(key.clone()).or_default().record(passed);
        if passed {
            self.failures.remove(&key);
            return false;
        }
        let streak = self.failures.entry(key).or_default();
        *streak += 1;
        if *streak >= threshold.max(1) {
            *streak = 0;
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self, team_id: TeamId, service_name: &str) -> u32 {
        self.failures
            .get(&(team_id, service_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn uptime(&self, team_id: TeamId, service_name: &str) -> Uptime {
        self.uptime
            .get(&(team_id, service_name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn uptimes(&self) -> &HashMap<ServiceKey, Uptime> {
        &self.uptime
    }

    pub fn clear(&mut self) {
        self.failures.clear();
        self.uptime.clear();
    }
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, BooleanAssertion, EqualityAssertion};
    use chrono::Utc;
    use db_model::models::{Round, ServiceCheck};
    use db_model::test_utils::MemoryStore;

    use super::*;

    fn replay(state: &mut SlaState, results: &[bool], threshold: u32) -> usize {
        results
            .iter()
            .filter(|passed| state.record(1, "box01-web", **passed, threshold))
            .count()
    }

    #[test]
    fn threshold_reached_resets_streak() {
        // given
        let mut state = SlaState::default();

        // when
        let violations = replay(&mut state, &[false, false, false], 3);

        // then
        assert_that!(violations).is_equal_to(1);
        assert_that!(state.consecutive_failures(1, "box01-web")).is_equal_to(0);
        assert_that!(state.uptime(1, "box01-web")).is_equal_to(Uptime { passed: 0, total: 3 });
    }

    #[test]
    fn pass_clears_streak() {
        let mut state = SlaState::default();

        let violations = replay(&mut state, &[false, false, true, false, false], 3);

        assert_that!(violations).is_equal_to(0);
        assert_that!(state.consecutive_failures(1, "box01-web")).is_equal_to(2);
    }

    #[test]
    fn streak_stays_below_threshold() {
        // given
        let mut state = SlaState::default();
        let pattern = [false, true, false, false, false, false, false, true, false, false, false, false];

        // when
        for passed in pattern {
            state.record(1, "box01-web", passed, 4);

            // then
            assert_that!(state.consecutive_failures(1, "box01-web") < 4).is_true();
        }
    }

    #[test]
    fn rebuild_matches_continuous_run() {
        // given
        let store = MemoryStore::with_teams(&[1]);
        let results = [true, false, false, false, false, true, false, false, false, false];
        let mut continuous = SlaState::default();
        for (index, passed) in results.iter().enumerate() {
            let round_id = index as i32 + 1;
            let check = ServiceCheck {
                team_id: 1,
                round_id,
                service_name: "box01-web".to_string(),
                points: if *passed { 1 } else { 0 },
                result: *passed,
                error: String::new(),
                debug: String::new(),
            };
            store
                .create_round(&Round { id: round_id, start_time: Utc::now() }, &[check])
                .unwrap();
            continuous.record(1, "box01-web", *passed, 3);
        }

        // when
        let rebuilt = SlaState::rebuild(&store, |_| 3).unwrap();

        // then
        assert_that!(rebuilt.consecutive_failures(1, "box01-web"))
            .is_equal_to(continuous.consecutive_failures(1, "box01-web"));
        assert_that!(rebuilt.uptime(1, "box01-web")).is_equal_to(Uptime { passed: 2, total: 10 });
    }
}
