mod commands;
mod error;
mod interactive;
mod logging;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use refit_core::UpdatePolicy;

use crate::error::CliError;
use crate::settings::HostSettings;

/// Refit: update an installed application from a shared release directory.
#[derive(Parser)]
#[command(name = "refit", version, about)]
struct Cli {
    /// Log debug output to the terminal.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether SOURCE carries a newer version than ROOT.
    Check { root: PathBuf, source: PathBuf },

    /// Check SOURCE and apply a newer version to ROOT.
    Update {
        root: PathBuf,
        source: PathBuf,

        /// Install without asking.
        #[arg(short, long)]
        yes: bool,

        /// Delete files the new version no longer ships.
        #[arg(long)]
        remove_orphans: bool,
    },

    /// Publish the tree at SOURCE as a new version.
    Publish {
        source: PathBuf,

        #[arg(long = "version", value_name = "X.Y.Z")]
        release: String,

        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Print the manifest of ROOT as JSON.
    Manifest { root: PathBuf },

    /// Print what an update from SOURCE would change in ROOT.
    Diff { root: PathBuf, source: PathBuf },

    /// Restore ROOT from its newest backup.
    Rollback { root: PathBuf },

    /// Show the installed version, pending recovery and backups of ROOT.
    Status { root: PathBuf },
}

/// How long `main` waits for blocking tasks, such as a source read that
/// outlived its check timeout, before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = HostSettings::load();
    logging::init_logging(
        cli.verbose || settings.debug_logging,
        settings.max_log_size_bytes,
    );

    let result = match run_to_completion(run(cli.command, settings.policy)) {
        Ok(result) => result,
        Err(error) => {
            log::error!("Failed to start async runtime: {error}");
            eprintln!("error: failed to start async runtime: {error}");
            return ExitCode::from(1);
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            log::error!("{error}");
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

/// Drive `future` on a fresh runtime, then shut the runtime down without
/// waiting on blocking threads stuck in the filesystem.
fn run_to_completion<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

async fn run(command: Command, policy: UpdatePolicy) -> Result<u8, CliError> {
    match command {
        Command::Check { root, source } => Ok(commands::check(&root, &source, policy).await),
        Command::Update {
            root,
            source,
            yes,
            remove_orphans,
        } => Ok(commands::update(&root, &source, policy, yes, remove_orphans).await),
        Command::Publish {
            source,
            release,
            notes,
        } => commands::publish(&source, &release, &notes, &policy),
        Command::Manifest { root } => commands::manifest(&root, &policy),
        Command::Diff { root, source } => commands::diff(&root, &source, &policy),
        Command::Rollback { root } => commands::rollback(&root, &policy),
        Command::Status { root } => commands::status(&root),
    }
}
