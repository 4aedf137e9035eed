//! Queue commands against PostgreSQL.

use anyhow::{Result, bail};
use buildq_config::SystemConfig;
use buildq_core::{Flag, JobId, Runner, RunnerId};
use buildq_db::{PgFeatureFlags, PgQueueStore};
use buildq_scheduler::{BuildQueue, JobRegistrar, RunnerPoller};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::connect;

struct Backends {
    store: Arc<PgQueueStore>,
    flags: Arc<PgFeatureFlags>,
}

impl Backends {
    async fn open(settings: &SystemConfig, database_url: Option<String>) -> Result<Self> {
        let pool = connect(settings, database_url).await?;
        Ok(Self {
            store: Arc::new(PgQueueStore::new(pool.clone())),
            flags: Arc::new(PgFeatureFlags::new(pool)),
        })
    }

    async fn runner(&self, id: i64) -> Result<Runner> {
        Ok(self.store.runner(RunnerId::new(id)).await?)
    }

    fn queue(&self) -> BuildQueue {
        BuildQueue::new(self.store.clone(), self.flags.clone())
    }

    fn registrar(&self, settings: &SystemConfig) -> JobRegistrar {
        JobRegistrar::new(self.queue(), settings.queue.clone())
    }
}

pub async fn show(settings: &SystemConfig, database_url: Option<String>, runner: i64) -> Result<()> {
    let backends = Backends::open(settings, database_url).await?;
    let runner = backends.runner(runner).await?;
    let queue = backends.queue();

    let config = queue.scheduling_config(&runner).await?;
    let candidates = queue.queue_for(&runner, &config).await?;

    let output = json!({
        "runner": runner,
        "config": config,
        "candidates": candidates,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn register(
    settings: &SystemConfig,
    database_url: Option<String>,
    runner: i64,
) -> Result<()> {
    let backends = Backends::open(settings, database_url).await?;
    let runner = backends.runner(runner).await?;
    let result = backends.registrar(settings).register(&runner).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn poll(
    settings: &SystemConfig,
    database_url: Option<String>,
    runner: i64,
    max_jobs: Option<usize>,
) -> Result<()> {
    let backends = Backends::open(settings, database_url).await?;
    let runner = backends.runner(runner).await?;
    let poller = RunnerPoller::new(runner, Arc::new(backends.registrar(settings)));

    tokio::select! {
        claimed = poller.run(max_jobs) => {
            info!(claimed = claimed.len(), "Poller finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }
    Ok(())
}

pub async fn enqueue(settings: &SystemConfig, database_url: Option<String>, build: i64) -> Result<()> {
    let backends = Backends::open(settings, database_url).await?;
    backends.store.enqueue(JobId::new(build)).await?;
    println!("Build {} queued", build);
    Ok(())
}

pub async fn flag(
    settings: &SystemConfig,
    database_url: Option<String>,
    name: &str,
    state: &str,
    runner: Option<i64>,
) -> Result<()> {
    let flag: Flag = name.parse()?;
    let enabled = match state {
        "on" | "true" | "enable" => true,
        "off" | "false" | "disable" => false,
        other => bail!("expected on or off, got '{}'", other),
    };

    let backends = Backends::open(settings, database_url).await?;
    backends
        .flags
        .set(flag, runner.map(RunnerId::new), enabled)
        .await?;

    match runner {
        Some(runner) => println!("{} set to {} for runner {}", flag, state, runner),
        None => println!("{} set to {}", flag, state),
    }
    Ok(())
}
