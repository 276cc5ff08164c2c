use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection, Executor, Row};
use tokio::time::timeout;

use crate::matching;
use crate::outcome::{CheckContext, Explain, Failure, ProbeResult};
use crate::registry::ServiceType;
use crate::runner::Probe;
use crate::service::{Service, VerifyError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SqlQuery {
    pub use_regex: bool,
    /// Without a command only the login is checked.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub database: String,
    /// Expected first column of some row; anything goes when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Logs into a database and optionally runs a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Sql {
    #[serde(flatten)]
    pub service: Service,
    pub kind: String,
    pub query: Vec<SqlQuery>,
}

fn first_column(row: &MySqlRow) -> String {
    row.try_get_unchecked::<Option<String>, _>(0)
        .ok()
        .flatten()
        .unwrap_or_default()
}

fn find_match(values: &[String], query: &SqlQuery) -> Result<Option<String>, Failure> {
    if query.use_regex {
        let pattern = matching::regex(&query.output)?;
        return Ok(values.iter().find(|it| pattern.is_match(it)).cloned());
    }
    Ok(values
        .iter()
        .find(|it| it.trim() == query.output)
        .cloned())
}

#[async_trait]
impl Probe for Sql {
    const TYPE: ServiceType = ServiceType::Sql;

    fn service(&self) -> &Service {
        &self.service
    }

    fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    fn default_port(&self) -> Option<u16> {
        Some(3306)
    }

    fn validate(&mut self) -> Result<(), VerifyError> {
        if self.kind.is_empty() {
            self.kind = "mysql".to_string();
        }
        if self.kind != "mysql" {
            return Err(self
                .service
                .invalid(format!("unsupported database kind {:?}", self.kind)));
        }
        for query in self.query.iter().filter(|it| it.use_regex) {
            matching::compile(&self.service, &query.output)?;
        }
        Ok(())
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> ProbeResult {
        let cred = ctx.credential()?;
        let creds = format!("creds used were {}:{}", cred.username, cred.password);
        let query = self
            .query
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default();

        let mut options = MySqlConnectOptions::new()
            .host(&ctx.target)
            .port(ctx.port)
            .username(&cred.username)
            .password(&cred.password);
        if !query.database.is_empty() {
            options = options.database(&query.database);
        }
        let mut conn = timeout(ctx.timeout, MySqlConnection::connect_with(&options))
            .await
            .explain("db connection or login failed")?
            .map_err(|e| {
                Failure::new("db connection or login failed", format!("{}, {}", e, creds))
            })?;

        if query.command.is_empty() {
            let _ = conn.close().await;
            return Ok(format!(
                "no query command specified, only checking connection. {}",
                creds
            ));
        }
        // a bare string without arguments goes over the text protocol
        let rows = (&mut conn)
            .fetch_all(query.command.as_str())
            .await
            .map_err(|e| {
                Failure::new(
                    format!("could not query db with command {}", query.command),
                    e.to_string(),
                )
            })?;
        let _ = conn.close().await;
        if query.output.is_empty() {
            return Ok(format!(
                "ran query successfully and no output to check against. {}",
                creds
            ));
        }
        let values: Vec<String> = rows.iter().map(first_column).collect();
        match find_match(&values, &query)? {
            Some(hit) => Ok(format!("found match: {}. {}", hit, creds)),
            None => Err(Failure::new(
                "output incorrect",
                format!(
                    "no matching output found for query, got {:?}. {}",
                    values, creds
                ),
            )),
        }
    }
}
