use anyhow::*;
use diesel::{Connection, PgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use tracing::instrument;
use url::Url;

use super::Params;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

impl Params {
    /// Brings the schema up to date. Only the round keeper does this; other binaries just connect.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.connect("schema_migration")?;
        debug!("Running any pending migrations now.");
        let migrations_run = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!(e))
            .context("While running Postgres migrations")?;
        for migration in migrations_run {
            info!("Schema migration run: {}", migration);
        }
        Ok(())
    }

    #[instrument(name = "DB connect", skip(self))]
    pub fn connect(&self, app_name: &str) -> Result<PgConnection> {
        let url = with_application_name(&self.database_url, app_name)?;
        PgConnection::establish(&url).with_context(|| "while connecting to Postgres")
    }
}

fn with_application_name(database_url: &str, app_name: &str) -> Result<String> {
    let mut url = Url::parse(database_url).context("DATABASE_URL is not a valid URL")?;
    url.query_pairs_mut()
        .append_pair("application_name", app_name);

    // Postgres expects queries percent-encoded, but url encodes them as application/x-form-www-urlencoded
    // The subtle difference is that spaces are encoded as + in the latter and %20 in the former
    let query_percent_encoded = url.query().unwrap_or("").replace('+', "%20");
    url.set_query(Some(&query_percent_encoded));
    Ok(url.into())
}
