use std::path::Path;

use anyhow::{Context, Result};
use db_model::models::NewTeam;
use db_model::ScoreStore;
use log::{info, warn};
use queue_models::Credential;

use crate::config::EngineConfig;

/// Creates configured teams that don't exist yet, then seeds every configured credlist.
/// Existing teams and changed passwords are left alone.
pub fn prepare(store: &dyn ScoreStore, config: &EngineConfig, credlist_dir: &Path) -> Result<()> {
    let created = provision_teams(store, config)?;
    if created > 0 {
        info!("Created {} teams from the configuration", created);
    }
    seed_credlists(store, config, credlist_dir)
}

pub fn provision_teams(store: &dyn ScoreStore, config: &EngineConfig) -> Result<usize> {
    let mut created = 0;
    for team in config.teams.iter() {
        let new_team = NewTeam {
            name: team.name.clone(),
            identifier: team.identifier.clone(),
            active: team.active,
        };
        if store
            .provision_team(&new_team)
            .with_context(|| format!("creating team {}", team.name))?
        {
            created += 1;
        }
    }
    Ok(created)
}

pub fn seed_credlists(store: &dyn ScoreStore, config: &EngineConfig, credlist_dir: &Path) -> Result<()> {
    for credlist in config.credlists.iter() {
        let path = credlist_dir.join(&credlist.credlist_path);
        let rows = read_credlist(&path)?;
        if rows.is_empty() {
            warn!("Credlist {} is empty", path.display());
        }
        store
            .seed_credentials(&credlist.credlist_path, &rows)
            .with_context(|| format!("seeding credlist {}", credlist.credlist_name))?;
        info!("Seeded {} credentials of {}", rows.len(), credlist.credlist_name);
    }
    Ok(())
}

/// Reads `username,password` lines without a header.
pub fn read_credlist(path: &Path) -> Result<Vec<Credential>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening credlist {}", path.display()))?;
    let mut rows = vec![];
    for record in reader.records() {
        let record = record.with_context(|| format!("reading credlist {}", path.display()))?;
        match (record.get(0), record.get(1), record.len()) {
            (Some(username), Some(password), 2) => rows.push(Credential::new(username, password)),
            _ => anyhow::bail!("invalid credlist format in {}: {:?}", path.display(), record),
        }
    }
    Ok(rows)
}
