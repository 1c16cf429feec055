use std::path::Path;

use log::{info, warn};
use refit_core::{
    ExclusionRules, InstallMode, ManifestBuilder, ManifestDiffer, RootStatus, UpdateChecker,
    UpdateError, UpdateOutcome, UpdatePolicy, rollback_to_latest,
};
use tokio_util::sync::CancellationToken;

use crate::error::CliError;
use crate::interactive;

pub fn exit_code(outcome: &UpdateOutcome) -> u8 {
    match outcome {
        UpdateOutcome::NoUpdate
        | UpdateOutcome::Busy
        | UpdateOutcome::Available(_)
        | UpdateOutcome::Declined
        | UpdateOutcome::Cancelled
        | UpdateOutcome::Applied { .. } => 0,
        UpdateOutcome::Failed { .. } | UpdateOutcome::RolledBack { .. } => 1,
        UpdateOutcome::Fatal { .. } => 2,
    }
}

fn report(outcome: &UpdateOutcome) -> u8 {
    match outcome {
        UpdateOutcome::Fatal { .. } | UpdateOutcome::Failed { .. } | UpdateOutcome::RolledBack { .. } => {
            eprintln!("{outcome}");
        }
        UpdateOutcome::Available(update) => {
            println!("{outcome}");
            if !update.available.release_notes.is_empty() {
                println!("{}", update.available.release_notes);
            }
        }
        _ => println!("{outcome}"),
    }
    exit_code(outcome)
}

pub async fn check(root: &Path, source: &Path, policy: UpdatePolicy) -> u8 {
    let checker = UpdateChecker::new(policy);
    let outcome = match checker.check(root, source).await {
        Ok(Some(update)) => UpdateOutcome::Available(update),
        Ok(None) => UpdateOutcome::NoUpdate,
        Err(error) if error.is_recoverable() => {
            info!("Nothing to check: {error}");
            UpdateOutcome::NoUpdate
        }
        Err(error) => UpdateOutcome::Failed {
            reason: error.to_string(),
        },
    };
    report(&outcome)
}

pub async fn update(
    root: &Path,
    source: &Path,
    mut policy: UpdatePolicy,
    yes: bool,
    remove_orphans: bool,
) -> u8 {
    if yes {
        policy.install = InstallMode::Automatic;
    }
    if remove_orphans {
        policy.remove_orphans = true;
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling the update if it has not started");
                cancel.cancel();
            }
        })
    };

    let (progress, events) = crossbeam_channel::unbounded();
    let printer = interactive::spawn_progress_printer(events);
    let checker = UpdateChecker::new(policy)
        .with_prompt(interactive::confirm_update)
        .with_progress(progress)
        .with_cancellation(cancel);

    let outcome = checker.check_and_apply(root, source).await;
    drop(checker);
    interrupt.abort();
    let _ = printer.join();

    report(&outcome)
}

pub fn publish(
    source: &Path,
    version: &str,
    notes: &str,
    policy: &UpdatePolicy,
) -> Result<u8, CliError> {
    let rules = ExclusionRules::load(source, &policy.default_exclusions)?;
    let descriptor = refit_core::publish(source, version, notes, &rules)?;
    println!("Published {} from {}", descriptor.version, source.display());
    Ok(0)
}

pub fn manifest(root: &Path, policy: &UpdatePolicy) -> Result<u8, CliError> {
    let rules = ExclusionRules::load(root, &policy.default_exclusions)?;
    let manifest = ManifestBuilder::build(root, &rules)?;
    println!("{}", manifest.to_json()?);
    Ok(0)
}

pub fn diff(root: &Path, source: &Path, policy: &UpdatePolicy) -> Result<u8, CliError> {
    let rules = ExclusionRules::load(root, &policy.default_exclusions)?;
    let source_manifest = ManifestBuilder::build(source, &rules)?;
    let dest_manifest = ManifestBuilder::build(root, &rules)?;
    let diff = ManifestDiffer::diff(&source_manifest, &dest_manifest, &rules);
    println!("{}", serde_json::to_string_pretty(&diff)?);
    Ok(0)
}

pub fn rollback(root: &Path, policy: &UpdatePolicy) -> Result<u8, CliError> {
    match rollback_to_latest(root, policy.lock_timeout()) {
        Ok(backup) => {
            println!(
                "Restored {} from {} (taken {})",
                root.display(),
                backup.path.display(),
                backup.timestamp.format("%Y-%m-%d %H:%M:%S")
            );
            Ok(0)
        }
        Err(error @ UpdateError::LockContention { .. }) => {
            println!("{error}");
            Ok(0)
        }
        Err(error) => Err(error.into()),
    }
}

pub fn status(root: &Path) -> Result<u8, CliError> {
    let status = RootStatus::collect(root)?;

    match &status.installed {
        Some(descriptor) => println!(
            "Installed: {} (released {})",
            descriptor.version,
            descriptor.release_date.format("%Y-%m-%d")
        ),
        None => println!("Installed: unknown (no version.json)"),
    }
    if let Some(journal) = &status.pending {
        println!(
            "Interrupted update to {} pending recovery (phase {:?}, started {})",
            journal.target_version,
            journal.phase,
            journal.started_at.to_rfc3339()
        );
    }
    if status.backups.is_empty() {
        println!("Backups: none");
    } else {
        println!("Backups:");
        for backup in &status.backups {
            println!(
                "  {}  {} files, {} bytes",
                backup.path.display(),
                backup.file_count,
                backup.total_bytes
            );
        }
    }
    Ok(0)
}
