//! On-disk layout of synchronized files.
//!
//! ```text
//! <base>/synclane/
//! ├─ <local_identity>/   # One directory per user
//! │  ├─ <escaped url>    # Default-path files
//! │  └─ <file name>      # Custom-path files
//! ├─ metadata/           # Metadata store
//! └─ recovered/          # Backups taken before a client reset
//! ```

use crate::error::SyncResult;
use crate::metadata::{FileAction, FileActionRecord, MetadataStore};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ROOT_DIR: &str = "synclane";
const METADATA_DIR: &str = "metadata";
const RECOVERY_DIR: &str = "recovered";

/// Longest escaped name used as-is; longer names are hashed.
const MAX_FILE_NAME: usize = 200;

/// Suffixes of the files that accompany every synchronized file.
const COMPANION_SUFFIXES: [&str; 3] = [".lock", ".note", ".management"];

/// Maps users and remote URLs to local paths.
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    /// Creates the layout under `base_path`.
    pub fn new(base_path: &Path) -> SyncResult<Self> {
        let root = base_path.join(ROOT_DIR);
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "file manager ready");
        Ok(Self { root })
    }

    /// Returns `<base>/synclane`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the metadata directory, creating it if needed.
    pub fn metadata_path(&self) -> SyncResult<PathBuf> {
        let path = self.root.join(METADATA_DIR);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Returns the directory receiving recovery copies, creating it if needed.
    pub fn recovery_directory_path(&self) -> SyncResult<PathBuf> {
        let path = self.root.join(RECOVERY_DIR);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Returns the directory of a user, creating it if needed.
    pub fn user_directory(&self, local_identity: &str) -> SyncResult<PathBuf> {
        let path = self.root.join(escape_file_name(local_identity));
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Returns the default path of the file synchronized with `url`.
    pub fn path_for_realm(&self, local_identity: &str, url: &str) -> SyncResult<PathBuf> {
        Ok(self.user_directory(local_identity)?.join(escape_file_name(url)))
    }

    /// Returns the path of a file with a host-chosen name.
    pub fn path_for_file(&self, local_identity: &str, file_name: &str) -> SyncResult<PathBuf> {
        Ok(self
            .user_directory(local_identity)?
            .join(escape_file_name(file_name)))
    }

    /// Deletes a synchronized file and its companions. Missing files are
    /// skipped.
    pub fn remove_realm_files(&self, path: &Path) -> SyncResult<()> {
        remove_if_exists(path)?;
        for suffix in COMPANION_SUFFIXES {
            let mut companion = path.as_os_str().to_owned();
            companion.push(suffix);
            let companion = PathBuf::from(companion);
            if companion.is_dir() {
                fs::remove_dir_all(&companion)?;
            } else {
                remove_if_exists(&companion)?;
            }
        }
        Ok(())
    }

    /// Copies `from` to `to`. Returns `false` without copying if `to`
    /// already exists.
    pub fn copy_realm_file(&self, from: &Path, to: &Path) -> SyncResult<bool> {
        if to.exists() {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        Ok(true)
    }

    /// Deletes the directory of a user and everything in it.
    pub fn remove_user_directory(&self, local_identity: &str) -> SyncResult<()> {
        let path = self.root.join(escape_file_name(local_identity));
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of a file action sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileActionReport {
    /// Actions that ran and were removed from the metadata store.
    pub completed: usize,
    /// Actions left for the next sweep.
    pub pending: usize,
}

impl FileManager {
    /// Runs one file action. Returns `true` once nothing is left to do for
    /// it; failures are logged and leave it pending.
    pub fn run_file_action(&self, record: &FileActionRecord) -> bool {
        let original = &record.original_path;
        match record.action {
            FileAction::DeleteRealm => match self.remove_realm_files(original) {
                Ok(()) => {
                    debug!(path = %original.display(), "deleted file");
                    true
                }
                Err(e) => {
                    warn!(path = %original.display(), error = %e, "cannot delete file");
                    false
                }
            },
            FileAction::BackUpThenDeleteRealm => {
                if !original.exists() {
                    return true;
                }
                let Some(new_path) = &record.new_path else {
                    warn!(path = %original.display(), "backup action without destination");
                    return false;
                };
                match self.copy_realm_file(original, new_path) {
                    Ok(true) => {
                        if let Err(e) = self.remove_realm_files(original) {
                            warn!(path = %original.display(), error = %e, "backed up but cannot delete original");
                        }
                        debug!(from = %original.display(), to = %new_path.display(), "backed up file");
                        true
                    }
                    Ok(false) => {
                        warn!(to = %new_path.display(), "backup destination exists");
                        false
                    }
                    Err(e) => {
                        warn!(path = %original.display(), error = %e, "cannot back up file");
                        false
                    }
                }
            }
        }
    }

    /// Runs every action pending in `store`. Completed actions are removed;
    /// failed ones stay for the next sweep.
    pub fn run_pending_file_actions(&self, store: &dyn MetadataStore) -> SyncResult<FileActionReport> {
        let mut report = FileActionReport::default();
        for record in store.pending_file_actions()? {
            if self.run_file_action(&record) {
                store.remove_file_action(&record.original_path)?;
                report.completed += 1;
            } else {
                report.pending += 1;
            }
        }
        info!(
            completed = report.completed,
            pending = report.pending,
            "file actions run"
        );
        Ok(report)
    }

    /// Deletes the directories and records of users marked for removal in
    /// `store`. Returns how many were purged.
    pub fn purge_removed_users(&self, store: &dyn MetadataStore) -> SyncResult<usize> {
        let mut purged = 0;
        for record in store.all_users_marked_for_removal()? {
            match self.remove_user_directory(&record.local_uuid) {
                Ok(()) => {
                    store.remove_user(&record.identity)?;
                    purged += 1;
                }
                Err(e) => {
                    warn!(user = %record.identity, error = %e, "cannot remove user directory");
                }
            }
        }
        if purged > 0 {
            info!(purged, "removed logged-out users");
        }
        Ok(purged)
    }
}

fn remove_if_exists(path: &Path) -> SyncResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Turns an arbitrary string into a single safe path component.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded. Results longer than
/// 200 bytes are replaced by the hex SHA-256 of the input.
#[must_use]
pub fn escape_file_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }

    if escaped.is_empty() || escaped.bytes().all(|b| b == b'.') {
        escaped = escaped.replace('.', "%2E");
        if escaped.is_empty() {
            escaped.push_str("%00");
        }
    }

    if escaped.len() > MAX_FILE_NAME {
        let digest = Sha256::digest(name.as_bytes());
        return digest.iter().map(|b| format!("{b:02x}")).collect();
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn escapes_url() {
        assert_eq!(
            escape_file_name("sync://host/~/notes"),
            "sync%3A%2F%2Fhost%2F%7E%2Fnotes"
        );
        assert_eq!(escape_file_name("plain-name_1.db"), "plain-name_1.db");
        assert_eq!(escape_file_name(".."), "%2E%2E");
        assert_eq!(escape_file_name(""), "%00");
    }

    #[test]
    fn long_names_are_hashed() {
        let url = format!("sync://host/{}", "x".repeat(300));
        let name = escape_file_name(&url);
        assert_eq!(name.len(), 64);
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(name, escape_file_name(&url));
    }

    #[test]
    fn layout() {
        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();

        let path = files.path_for_realm("u-1", "sync://host/a").unwrap();
        assert!(path.starts_with(temp.path().join("synclane").join("u-1")));
        assert!(path.parent().unwrap().is_dir());

        let custom = files.path_for_file("u-1", "mine.realm").unwrap();
        assert_eq!(custom.file_name().unwrap(), "mine.realm");

        let recovery = files.recovery_directory_path().unwrap();
        assert!(recovery.is_dir());
        assert!(recovery.ends_with("recovered"));
    }

    #[test]
    fn remove_realm_files_removes_companions() {
        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();
        let path = files.path_for_file("u", "data.realm").unwrap();

        fs::write(&path, b"db").unwrap();
        fs::write(path.with_extension("realm.lock"), b"").unwrap();
        fs::create_dir_all(path.with_extension("realm.management")).unwrap();

        files.remove_realm_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!path.with_extension("realm.lock").exists());
        assert!(!path.with_extension("realm.management").exists());

        // Removing again is fine.
        files.remove_realm_files(&path).unwrap();
    }

    #[test]
    fn copy_refuses_to_overwrite() {
        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();
        let from = temp.path().join("a");
        let to = files.recovery_directory_path().unwrap().join("a-copy");

        fs::write(&from, b"one").unwrap();
        assert!(files.copy_realm_file(&from, &to).unwrap());
        fs::write(&from, b"two").unwrap();
        assert!(!files.copy_realm_file(&from, &to).unwrap());
        assert_eq!(fs::read(&to).unwrap(), b"one");
    }

    #[test]
    fn purge_removes_marked_users_only() {
        use crate::metadata::MemoryMetadataStore;

        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();
        let store = MemoryMetadataStore::new();
        let kept = store.get_or_create_user("kept", "https://auth").unwrap();
        let gone = store.get_or_create_user("gone", "https://auth").unwrap();
        let kept_dir = files.user_directory(&kept.local_uuid).unwrap();
        let gone_dir = files.user_directory(&gone.local_uuid).unwrap();
        store.mark_user_for_removal("gone").unwrap();

        assert_eq!(files.purge_removed_users(&store).unwrap(), 1);
        assert!(kept_dir.exists());
        assert!(!gone_dir.exists());
        assert_eq!(store.user_count(), 1);
        assert_eq!(files.purge_removed_users(&store).unwrap(), 0);
    }

    #[test]
    fn backup_without_original_is_complete() {
        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();
        let record = FileActionRecord::back_up_then_delete(
            temp.path().join("absent"),
            temp.path().join("copy"),
            "sync://h/a",
            "alice",
        );
        assert!(files.run_file_action(&record));
        assert!(!temp.path().join("copy").exists());
    }

    #[test]
    fn remove_user_directory_is_idempotent() {
        let temp = tempdir().unwrap();
        let files = FileManager::new(temp.path()).unwrap();
        let dir = files.user_directory("gone").unwrap();
        fs::write(dir.join("f"), b"x").unwrap();

        files.remove_user_directory("gone").unwrap();
        assert!(!dir.exists());
        files.remove_user_directory("gone").unwrap();
    }
}
