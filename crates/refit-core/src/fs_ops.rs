use std::path::{Path, PathBuf};

use refit_platform::replace_file;

/// File mutations performed while applying an update. The applier goes
/// through this trait so that storage failures can be injected.
pub trait FileOps: Send + Sync {
    /// Replace `dst` with the contents of `src`, returning the bytes copied.
    ///
    /// # Errors
    /// Returns the underlying I/O error; `dst` is left either untouched or
    /// fully replaced.
    fn copy_file(&self, src: &Path, dst: &Path) -> std::io::Result<u64>;

    /// Delete a file.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

/// Plain filesystem implementation. Copies go to a temp file beside the
/// target and are renamed into place once synced.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn copy_file(&self, src: &Path, dst: &Path) -> std::io::Result<u64> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_path_for(dst);
        let copied = std::fs::copy(src, &tmp).and_then(|bytes| {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&tmp)
                .and_then(|file| file.sync_all())
                .map(|()| bytes)
        });
        let copied = match copied {
            Ok(bytes) => bytes,
            Err(error) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(error);
            }
        };
        if let Err(error) = replace_file(&tmp, dst) {
            let _ = std::fs::remove_file(&tmp);
            return Err(error);
        }
        Ok(copied)
    }

    fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }
}

fn temp_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{name}.refit-tmp"))
}
