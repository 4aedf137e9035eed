//! CLI command implementations.

pub mod queue;
pub mod simulate;

use anyhow::{Context, Result, bail};
use buildq_config::{SystemConfig, load_system_config, parse_snapshot, parse_system_config};
use buildq_db::{create_pool, run_migrations};
use sqlx::PgPool;
use tracing::info;

/// Load the settings file, or defaults when none is given.
pub fn load_settings(path: Option<&str>) -> Result<SystemConfig> {
    match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load settings from {}", path)),
        None => Ok(SystemConfig::default()),
    }
}

/// Connect using the command-line URL, falling back to the settings file.
pub async fn connect(settings: &SystemConfig, database_url: Option<String>) -> Result<PgPool> {
    let Some(url) = database_url.or_else(|| settings.database_url.clone()) else {
        bail!("no database configured: set DATABASE_URL or `database url=...`");
    };
    let pool = create_pool(&url).await.context("failed to connect to database")?;
    Ok(pool)
}

pub async fn migrate(settings: &SystemConfig, database_url: Option<String>) -> Result<()> {
    let pool = connect(settings, database_url).await?;
    run_migrations(&pool).await?;
    info!("Migrations complete");
    Ok(())
}

pub fn validate(path: &str, snapshot: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let result = if snapshot {
        parse_snapshot(&content).map(|s| {
            format!(
                "{} groups, {} projects, {} runners, {} jobs",
                s.groups.len(),
                s.projects.len(),
                s.runners.len(),
                s.jobs.len()
            )
        })
    } else {
        parse_system_config(&content).map(|c| format!("{} flag settings", c.flags.len()))
    };

    match result {
        Ok(summary) => {
            println!("Configuration is valid ({})", summary);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
