//! keysign - sign an OpenPGP key on an ephemeral keyring

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keysign::{CeremonyConfig, CeremonyReport, SigningCeremony, TerminalOperator};
use keysign_core::SystemRunner;

/// keysign - OpenPGP key signing ceremony
#[derive(Parser)]
#[command(name = "keysign")]
#[command(about = "Sign an OpenPGP key with organizational identities on an ephemeral keyring")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Ceremony configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fingerprint or key id of the key to sign
    #[arg(long, global = true)]
    target: Option<String>,

    /// Signing identity label (repeatable, replaces the configured list)
    #[arg(long = "identity", global = true)]
    identities: Vec<String>,

    /// Write a JSON audit report here
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the ceremony
    Run,

    /// List the ceremony steps
    Steps,

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "keysign=debug,keysign_core=debug"
    } else {
        "keysign=info,keysign_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, cli.report.as_deref())?,

        Commands::Steps => {
            for (index, step) in SigningCeremony::steps().iter().enumerate() {
                let kind = if step.run_always() { "always" } else { "checked" };
                println!("{}. {} ({})", index + 1, step.name(), kind);
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<CeremonyConfig> {
    let mut config = match &cli.config {
        Some(path) => CeremonyConfig::load(path)?,
        None => match CeremonyConfig::default_path().filter(|path| path.exists()) {
            Some(path) => {
                info!(path = %path.display(), "Using configuration");
                CeremonyConfig::load(&path)?
            }
            None => CeremonyConfig::default(),
        },
    };

    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    if !cli.identities.is_empty() {
        config.identities = cli.identities.clone();
    }

    Ok(config)
}

fn run(config: CeremonyConfig, report_path: Option<&Path>) -> anyhow::Result<()> {
    let mut ceremony =
        SigningCeremony::new(config, Box::new(SystemRunner), Box::new(TerminalOperator))?;

    let started_at = Utc::now();
    let outcome = ceremony.run();

    if let Some(path) = report_path {
        let report = CeremonyReport::new(&ceremony, started_at, &outcome);
        match report.save(path) {
            Ok(()) => info!(path = %path.display(), "Audit report written"),
            Err(e) => error!(error = %e, "Could not write audit report"),
        }
    }

    match outcome {
        Ok(report) => {
            for failure in ceremony.publish_failures() {
                warn!(keyserver = %failure.keyserver, "Signed key was not published here");
            }
            info!(
                ran = report.ran().len(),
                key = %ceremony.target(),
                "Ceremony complete"
            );
            Ok(())
        }
        Err(e) => {
            if e.primary().is_retryable() {
                warn!("Re-run the same command to resume; completed steps will be skipped");
            }
            Err(e.into())
        }
    }
}
