mod logging;

use adstat_sync::RunStatus;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

#[derive(Debug, Parser)]
#[command(name = "adstat-import")]
#[command(about = "Import the latest AdStat statistics into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision, fetch and reconcile (the default).
    Run,
    /// Only make sure the database and table exist.
    Provision,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // `.env` may carry RUST_LOG and NO_COLOR, so it is read before logging starts.
    let dotenv = dotenvy::dotenv();
    logging::init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(err) if err.not_found() => {}
        Err(err) => warn!(%err, "ignoring unreadable .env"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = adstat_sync::run_import_from_env().await?;
            debug!(run_id = %report.run_id, attempts = report.attempts, "run finished");
            if let RunStatus::Aborted(err) = report.status {
                return Err(err).context("import aborted");
            }
        }
        Commands::Provision => {
            adstat_sync::provision_from_env().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn dotenv_values_reach_the_logging_setup() {
        let path = std::env::temp_dir().join(format!("adstat-import-{}.env", std::process::id()));
        fs::write(&path, "NO_COLOR=1\n").expect("write .env");
        std::env::remove_var("NO_COLOR");
        assert!(logging::color_from_env());

        dotenvy::from_path(&path).expect("load .env");

        assert!(!logging::color_from_env());
        std::env::remove_var("NO_COLOR");
        fs::remove_file(&path).ok();
    }

    #[test]
    fn subcommand_defaults_to_run() {
        let cli = Cli::parse_from(["adstat-import"]);
        assert!(cli.command.is_none());
        let cli = Cli::parse_from(["adstat-import", "provision"]);
        assert!(matches!(cli.command, Some(Commands::Provision)));
    }
}
