//! Safe in-place updates of installed application bundles.
//!
//! An update source is a plain directory (local disk, network share or
//! synced folder) holding a newer copy of the bundle plus its
//! `version.json`. One update cycle:
//! - Compares the installed and source versions.
//! - Diffs content-hashed manifests of both trees, leaving user-owned files
//!   (matched by exclusion rules) alone.
//! - Takes a verified backup, copies changed files, re-hashes them and only
//!   then commits the new version descriptor.
//! - Rolls back automatically when anything after the backup fails.
//!
//! Every function takes the root explicitly; one process can manage any
//! number of roots.

mod applier;
mod backup;
mod checker;
mod diff;
mod error;
mod exclusion;
mod fs_ops;
mod journal;
mod lock;
mod manifest;
mod policy;
mod publish;
mod status;
mod version;

pub use applier::{ApplyOutcome, UpdateApplier, UpdateProgress, UpdateState};
pub use backup::{BACKUP_METADATA_FILE, BackupHandle, BackupManager};
pub use checker::{AvailableUpdate, UpdateChecker, UpdateOutcome, check_and_apply};
pub use diff::{DiffResult, ManifestDiffer};
pub use error::UpdateError;
pub use exclusion::{DEFAULT_EXCLUSIONS, ExclusionRules};
pub use fs_ops::{FileOps, StdFileOps};
pub use journal::{Journal, JournalPhase, Recovery, recover, rollback_to_latest};
pub use lock::acquire_lock;
pub use manifest::{Manifest, ManifestBuilder, ManifestEntry};
pub use policy::{InstallMode, UpdatePolicy};
pub use publish::publish;
pub use status::RootStatus;
pub use version::{VersionDescriptor, VersionOrdering, VersionStore, parse_version};
