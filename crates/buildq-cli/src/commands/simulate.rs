//! Replay registrations against a snapshot, without a database.

use anyhow::{Context, Result, anyhow};
use buildq_config::{SystemConfig, parse_snapshot};
use buildq_core::RunnerId;
use buildq_db::MemoryStore;
use buildq_scheduler::{BuildQueue, JobRegistrar};
use serde_json::json;
use std::sync::Arc;

pub async fn run(settings: &SystemConfig, path: &str, runner: i64, rounds: u32) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    let snapshot = parse_snapshot(&content)?;
    let runner = snapshot
        .runner(RunnerId::new(runner))
        .cloned()
        .ok_or_else(|| anyhow!("runner {} is not in the snapshot", runner))?;

    let store = Arc::new(MemoryStore::from_snapshot(&snapshot)?);
    let queue = BuildQueue::new(store, Arc::new(settings.static_flags()));
    let registrar = JobRegistrar::new(queue, settings.queue.clone());

    let config = registrar.queue().scheduling_config(&runner).await?;
    let candidates = registrar.queue().queue_for(&runner, &config).await?;
    println!(
        "{}",
        json!({ "round": 0, "config": config, "candidates": candidates })
    );

    for round in 1..=rounds {
        let result = registrar.register(&runner).await?;
        println!("{}", json!({ "round": round, "result": result }));
        if result.job.is_none() && result.valid {
            break;
        }
    }
    Ok(())
}
