//! Startup maintenance run on demand: the file action sweep and the purge
//! of logged-out users.

use std::path::Path;
use synclane_core::{EncryptionKey, FileActionReport};

use super::open_store;

/// Runs pending file actions under `base`.
pub fn run_file_actions(
    base: &Path,
    key: Option<&EncryptionKey>,
) -> Result<FileActionReport, Box<dyn std::error::Error>> {
    let (files, store) = open_store(base, key)?;
    let report = files.run_pending_file_actions(&store)?;
    println!(
        "File actions: {} completed, {} pending",
        report.completed, report.pending
    );
    Ok(report)
}

/// Deletes the data of users marked for removal under `base`.
pub fn purge_users(
    base: &Path,
    key: Option<&EncryptionKey>,
) -> Result<usize, Box<dyn std::error::Error>> {
    let (files, store) = open_store(base, key)?;
    let purged = files.purge_removed_users(&store)?;
    println!("Purged {purged} user(s)");
    Ok(purged)
}
