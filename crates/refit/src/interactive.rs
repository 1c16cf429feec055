use std::io::{self, BufRead, Write};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use refit_core::{AvailableUpdate, UpdateProgress, UpdateState};

/// Ask on the terminal whether to install `update`. Anything but an explicit
/// yes declines.
pub fn confirm_update(update: &AvailableUpdate) -> bool {
    let installed = update
        .installed
        .as_ref()
        .map_or("none", |descriptor| descriptor.version.as_str());
    println!(
        "Version {} is available (installed: {installed}, released {}).",
        update.available.version,
        update.available.release_date.format("%Y-%m-%d")
    );
    if !update.available.release_notes.is_empty() {
        println!("{}", update.available.release_notes);
    }
    print!("Install now? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(_) => false,
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

pub fn spawn_progress_printer(events: Receiver<UpdateProgress>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in events {
            if let Some(line) = describe(&event) {
                println!("{line}");
            }
        }
    })
}

fn describe(event: &UpdateProgress) -> Option<String> {
    match event {
        UpdateProgress::State(UpdateState::Idle | UpdateState::Checking) => None,
        UpdateProgress::State(state) => Some(format!("[{state}]")),
        UpdateProgress::FileCopied { path, done, total } => {
            Some(format!("  {done}/{total} {path}"))
        }
        UpdateProgress::OrphanKept { path } => Some(format!("  kept {path} (no longer shipped)")),
        UpdateProgress::OrphanRemoved { path } => Some(format!("  removed {path}")),
    }
}
