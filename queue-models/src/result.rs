use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RoundId, Task, TeamId};

pub const CHECK_TIMEOUT_EXCEEDED: &str = "check timeout exceeded";

/// Outcome of one probe of one service of one team in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub team_id: TeamId,
    pub service_name: String,
    pub service_type: String,
    pub round_id: RoundId,
    /// Echoed from [Task::dispatch_id].
    pub dispatch_id: Uuid,
    pub status: bool,
    pub points: i32,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub debug: String,
}

impl CheckResult {
    pub fn failure(task: &Task, error: impl Into<String>, debug: impl Into<String>) -> Self {
        Self {
            team_id: task.team_id,
            service_name: task.service_name.clone(),
            service_type: task.service_type.clone(),
            round_id: task.round_id,
            dispatch_id: task.dispatch_id,
            status: false,
            points: 0,
            error: error.into(),
            debug: debug.into(),
        }
    }

    /// Result recorded when no probe finished before the round deadline.
    pub fn timed_out(task: &Task, debug: impl Into<String>) -> Self {
        Self::failure(task, CHECK_TIMEOUT_EXCEEDED, debug)
    }

    pub fn is_timeout(&self) -> bool {
        !self.status && self.error == CHECK_TIMEOUT_EXCEEDED
    }
}
