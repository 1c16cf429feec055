use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use refit_platform::AppPaths;

struct ResilientFileWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

/// Appends to `path`, creating the data directory if it was removed.
fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl ResilientFileWriter {
    fn new(path: PathBuf) -> io::Result<Self> {
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    fn ensure_file(&self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !self.path.exists() {
            *guard = Some(open_append(&self.path)?);
        }
        Ok(())
    }
}

impl Write for ResilientFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_file()?;
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("log file not available")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn trim_log_file_if_oversized(log_path: &Path, max_log_size: u64) {
    if let Ok(metadata) = std::fs::metadata(log_path)
        && metadata.len() > max_log_size
        && let Ok(contents) = std::fs::read(log_path)
    {
        let half = contents.len() / 2;
        let keep_from = contents[half..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(half, |pos| half + pos + 1);
        let _ = std::fs::write(log_path, &contents[keep_from..]);
    }
}

/// Only records from the refit crates; dependencies stay quiet.
fn log_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("refit")
        .build()
}

/// Install the terminal logger (stderr, so command output on stdout stays
/// machine readable) and the file logger under the data directory.
pub fn init_logging(verbose: bool, max_log_size: u64) {
    let config = log_config();

    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let term_logger = TermLogger::new(
        term_level,
        config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    let log_path = AppPaths::new().ok().and_then(|paths| {
        paths.ensure_dirs().ok()?;
        Some(paths.log_file())
    });
    let file_logger = log_path.as_ref().and_then(|path| {
        trim_log_file_if_oversized(path, max_log_size);
        ResilientFileWriter::new(path.clone())
            .ok()
            .map(|writer| WriteLogger::new(LevelFilter::Debug, config, writer))
    });

    if let Some(file_logger) = file_logger {
        let _ = CombinedLogger::init(vec![term_logger, file_logger]);
    } else {
        let _ = CombinedLogger::init(vec![term_logger]);
    }

    set_verbose(verbose);

    if let Some(path) = log_path {
        log::debug!("Logging to {}", path.display());
    }
}

pub fn set_verbose(verbose: bool) {
    if verbose {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Info);
    }
}

#[cfg(test)]
mod tests {
    use log::{Level, Log, Record};
    use simplelog::{LevelFilter, WriteLogger};

    use super::{ResilientFileWriter, log_config, trim_log_file_if_oversized};

    fn emit(logger: &dyn Log, level: Level, target: &str, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target(target)
                .args(format_args!("{message}"))
                .build(),
        );
        logger.flush();
    }

    #[test]
    fn update_keeps_logging_after_data_dir_is_wiped() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let data_dir = temp.path().join("refit");
        let log_path = data_dir.join("refit.log");
        let writer = ResilientFileWriter::new(log_path.clone()).expect("log file opens");
        let logger = WriteLogger::new(LevelFilter::Debug, log_config(), writer);

        emit(&*logger, Level::Info, "refit_core::applier", "Update state: idle -> checking");
        std::fs::remove_dir_all(&data_dir).expect("data dir removed");
        emit(&*logger, Level::Warn, "refit_core::applier", "Rolled back /srv/app");

        let contents = std::fs::read_to_string(&log_path).expect("log recreated");
        assert!(contents.contains("Rolled back /srv/app"));
        assert!(!contents.contains("idle -> checking"));
    }

    #[test]
    fn dependency_records_are_filtered_out() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let log_path = temp.path().join("refit.log");
        let writer = ResilientFileWriter::new(log_path.clone()).expect("log file opens");
        let logger = WriteLogger::new(LevelFilter::Debug, log_config(), writer);

        emit(&*logger, Level::Debug, "walkdir", "descending into trained/");
        emit(&*logger, Level::Info, "refit::commands", "Backups of /srv/app: 2");

        let contents = std::fs::read_to_string(&log_path).expect("log readable");
        assert!(contents.contains("Backups of /srv/app: 2"));
        assert!(!contents.contains("trained/"));
    }

    #[test]
    fn trimming_drops_old_runs_at_a_line_boundary() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let log_path = temp.path().join("refit.log");
        let runs: String = (1..=6)
            .map(|run| format!("[INFO] run {run}: Update 1.0.{run} -> 1.0.{}\n", run + 1))
            .collect();
        let log = format!("{runs}[ERROR] FATAL: restore of /srv/app failed\n");
        std::fs::write(&log_path, &log).expect("log written");

        trim_log_file_if_oversized(&log_path, 64);

        let trimmed = std::fs::read_to_string(&log_path).expect("log readable");
        assert!(trimmed.len() < log.len());
        assert!(trimmed.starts_with("[INFO] run ") || trimmed.starts_with("[ERROR]"));
        assert!(!trimmed.contains("run 1:"));
        assert!(trimmed.ends_with("FATAL: restore of /srv/app failed\n"));
    }

    #[test]
    fn log_under_the_limit_is_untouched() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let log_path = temp.path().join("refit.log");
        std::fs::write(&log_path, "[WARN] another update is in progress\n").expect("log written");

        trim_log_file_if_oversized(&log_path, 1024);

        assert_eq!(
            std::fs::read_to_string(&log_path).expect("log readable"),
            "[WARN] another update is in progress\n"
        );
        trim_log_file_if_oversized(&temp.path().join("missing.log"), 0);
    }
}
