use std::path::PathBuf;

use burrow_db::utils::init_log;
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Creating a scratch directory for the test's database file.
///
/// Keep the returned guard alive for the duration of the test; dropping it
/// removes the directory.
pub fn setup() -> TempDir {
    init_log();
    tempfile::tempdir().expect("create temp dir")
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join(".test")
}
