//! buildq CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildq")]
#[command(about = "Build queue operations", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, env = "BUILDQ_CONFIG")]
    config: Option<String>,

    /// PostgreSQL connection string, overrides the settings file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Validate a settings file or queue snapshot
    Validate {
        /// Path to the file
        #[arg(default_value = "buildq.kdl")]
        path: String,
        /// Treat the file as a queue snapshot
        #[arg(long)]
        snapshot: bool,
    },
    /// Show the candidate queue for a runner
    Queue {
        #[arg(long)]
        runner: i64,
    },
    /// Register a single job for a runner
    Register {
        #[arg(long)]
        runner: i64,
    },
    /// Poll for jobs on behalf of a runner until interrupted
    Poll {
        #[arg(long)]
        runner: i64,
        /// Stop after claiming this many jobs
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Move a build to pending and add it to the queue
    Enqueue {
        /// Build ID
        build: i64,
    },
    /// Set a feature flag
    Flag {
        /// Flag name
        name: String,
        /// on or off
        state: String,
        /// Only for this runner
        #[arg(long)]
        runner: Option<i64>,
    },
    /// Replay registrations against a queue snapshot
    Simulate {
        /// Path to the snapshot
        snapshot: String,
        #[arg(long)]
        runner: i64,
        /// Number of registrations to run
        #[arg(long, default_value = "1")]
        rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = commands::load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate => {
            commands::migrate(&settings, cli.database_url).await?;
        }
        Commands::Validate { path, snapshot } => {
            commands::validate(&path, snapshot)?;
        }
        Commands::Queue { runner } => {
            commands::queue::show(&settings, cli.database_url, runner).await?;
        }
        Commands::Register { runner } => {
            commands::queue::register(&settings, cli.database_url, runner).await?;
        }
        Commands::Poll { runner, max_jobs } => {
            commands::queue::poll(&settings, cli.database_url, runner, max_jobs).await?;
        }
        Commands::Enqueue { build } => {
            commands::queue::enqueue(&settings, cli.database_url, build).await?;
        }
        Commands::Flag {
            name,
            state,
            runner,
        } => {
            commands::queue::flag(&settings, cli.database_url, &name, &state, runner).await?;
        }
        Commands::Simulate {
            snapshot,
            runner,
            rounds,
        } => {
            commands::simulate::run(&settings, &snapshot, runner, rounds).await?;
        }
    }

    Ok(())
}
