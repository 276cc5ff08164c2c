use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RoundId, TeamId};

/// Unit of work handed to a probe buddy: probe one service of one team, once, before the deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub team_id: TeamId,
    pub team_identifier: String,
    pub service_type: String,
    pub service_name: String,
    /// End of the round; no result will be accepted after this point.
    pub deadline: DateTime<Utc>,
    pub round_id: RoundId,
    /// Fresh for every dispatch of a round. A round id is reused after a dropped round, so
    /// results are matched on this as well.
    pub dispatch_id: Uuid,
    pub attempts: u32,
    /// Snapshot of the team's credentials for the credlists of this service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<Credential>,
    /// The configured service as JSON; its shape depends on `service_type`.
    pub check_data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}
