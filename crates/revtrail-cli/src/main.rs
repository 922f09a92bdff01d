use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "revtrail", version, about = "Inspect revtrail audit logs")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an entity's audit records in version order.
    History {
        /// Audit log file (JSON Lines)
        #[arg(long, env = "REVTRAIL_LOG", default_value = "audit.log")]
        log: PathBuf,

        /// Entity type, e.g. "User"
        #[arg(long = "type")]
        entity_type: String,

        /// Entity id
        #[arg(long)]
        id: i64,

        /// Print records as JSON Lines instead of log lines
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print an entity's reconstructed attributes at a version.
    Revision {
        /// Audit log file (JSON Lines)
        #[arg(long, env = "REVTRAIL_LOG", default_value = "audit.log")]
        log: PathBuf,

        /// Entity type, e.g. "User"
        #[arg(long = "type")]
        entity_type: String,

        /// Entity id
        #[arg(long)]
        id: i64,

        /// Version to reconstruct. Defaults to the latest.
        #[arg(long)]
        version: Option<u64>,
    },

    /// Load and validate a configuration file.
    Check {
        /// Path to the configuration file
        #[arg(long, short = 'c', default_value = "revtrail.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::History {
            log,
            entity_type,
            id,
            json,
        } => commands::history::run(&log, &entity_type, id, json).await?,

        Command::Revision {
            log,
            entity_type,
            id,
            version,
        } => commands::revision::run(&log, &entity_type, id, version).await?,

        Command::Check { config } => {
            let results = commands::check::run(&config)?;
            results.print_summary();
            if results.has_errors() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
