//! Persistent records of users and pending file actions.
//!
//! The session layer only needs a narrow, key-addressed table: user records
//! keyed by identity and file actions keyed by the path they apply to.
//! [`MetadataStore`] is that interface. Two implementations are provided:
//!
//! - [`MemoryMetadataStore`] keeps everything in memory (tests, `NoMetadata`).
//! - [`FileMetadataStore`] keeps a CBOR snapshot on disk, optionally
//!   encrypted, rewritten atomically on every change.
//!
//! ```text
//! <metadata_dir>/
//! ├─ LOCK            # Advisory lock; one process at a time
//! ├─ metadata.cbor   # Current snapshot
//! └─ metadata.tmp    # Written, synced, then renamed over the snapshot
//! ```

use crate::crypto::{EncryptionKey, MetadataCipher};
use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "metadata.cbor";
const SNAPSHOT_TEMP: &str = "metadata.tmp";

/// Magic prefix of a plain snapshot.
const PLAIN_MAGIC: [u8; 4] = *b"SLMD";
/// Magic prefix of an encrypted snapshot.
const SEALED_MAGIC: [u8; 4] = *b"SLME";
/// Current snapshot format version.
const FORMAT_VERSION: u16 = 1;

/// A persisted user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Identity assigned by the auth provider.
    pub identity: String,
    /// Auth server the user logged in with.
    pub server_url: String,
    /// Stable local identifier, used as the user's directory name.
    pub local_uuid: String,
    /// Current refresh token, if logged in.
    pub user_token: Option<String>,
    /// Whether the user is an administrator.
    pub is_admin: bool,
    /// Whether the user's data is deleted at next startup.
    pub marked_for_removal: bool,
}

/// A deferred operation on a local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    /// Delete the file and its companions.
    DeleteRealm,
    /// Copy the file to a recovery location, then delete it.
    BackUpThenDeleteRealm,
}

/// A pending file action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileActionRecord {
    /// File the action applies to. Unique key.
    pub original_path: PathBuf,
    /// The action.
    pub action: FileAction,
    /// Backup destination, for [`FileAction::BackUpThenDeleteRealm`].
    pub new_path: Option<PathBuf>,
    /// Remote URL the file was synchronized with.
    pub url: String,
    /// Identity of the user owning the file.
    pub user_identity: String,
}

impl FileActionRecord {
    /// Creates a deletion record.
    pub fn delete(original_path: impl Into<PathBuf>, url: &str, user_identity: &str) -> Self {
        Self {
            original_path: original_path.into(),
            action: FileAction::DeleteRealm,
            new_path: None,
            url: url.to_string(),
            user_identity: user_identity.to_string(),
        }
    }

    /// Creates a backup-then-delete record.
    pub fn back_up_then_delete(
        original_path: impl Into<PathBuf>,
        new_path: impl Into<PathBuf>,
        url: &str,
        user_identity: &str,
    ) -> Self {
        Self {
            original_path: original_path.into(),
            action: FileAction::BackUpThenDeleteRealm,
            new_path: Some(new_path.into()),
            url: url.to_string(),
            user_identity: user_identity.to_string(),
        }
    }
}

/// Key-addressed persistence used by the registry and users.
pub trait MetadataStore: Send + Sync {
    /// Returns users that are not marked for removal.
    fn all_unmarked_users(&self) -> SyncResult<Vec<UserRecord>>;

    /// Returns users marked for removal.
    fn all_users_marked_for_removal(&self) -> SyncResult<Vec<UserRecord>>;

    /// Returns the record for `identity`, creating it if needed. An existing
    /// record that was marked for removal is revived.
    fn get_or_create_user(&self, identity: &str, server_url: &str) -> SyncResult<UserRecord>;

    /// Stores the refresh token of a user, creating the record if needed.
    fn set_user_token(
        &self,
        identity: &str,
        server_url: &str,
        token: Option<&str>,
    ) -> SyncResult<()>;

    /// Marks a user for removal at next startup. Unknown identities are ignored.
    fn mark_user_for_removal(&self, identity: &str) -> SyncResult<()>;

    /// Deletes a user record.
    fn remove_user(&self, identity: &str) -> SyncResult<()>;

    /// Returns all pending file actions.
    fn pending_file_actions(&self) -> SyncResult<Vec<FileActionRecord>>;

    /// Returns the pending action for `path`, if any.
    fn file_action_for(&self, path: &Path) -> SyncResult<Option<FileActionRecord>>;

    /// Records a file action, replacing any earlier action for the same path.
    fn add_file_action(&self, record: FileActionRecord) -> SyncResult<()>;

    /// Deletes the action for `path`.
    fn remove_file_action(&self, path: &Path) -> SyncResult<()>;
}

/// Contents of a metadata store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MetadataTables {
    users: BTreeMap<String, UserRecord>,
    file_actions: BTreeMap<PathBuf, FileActionRecord>,
}

impl MetadataTables {
    fn users_where(&self, marked: bool) -> Vec<UserRecord> {
        self.users
            .values()
            .filter(|u| u.marked_for_removal == marked)
            .cloned()
            .collect()
    }

    fn get_or_create_user(&mut self, identity: &str, server_url: &str) -> UserRecord {
        let record = self
            .users
            .entry(identity.to_string())
            .or_insert_with(|| UserRecord {
                identity: identity.to_string(),
                server_url: server_url.to_string(),
                local_uuid: Uuid::new_v4().to_string(),
                user_token: None,
                is_admin: false,
                marked_for_removal: false,
            });
        record.marked_for_removal = false;
        if record.server_url.is_empty() {
            record.server_url = server_url.to_string();
        }
        record.clone()
    }

    fn set_user_token(&mut self, identity: &str, server_url: &str, token: Option<&str>) {
        self.get_or_create_user(identity, server_url);
        if let Some(record) = self.users.get_mut(identity) {
            record.user_token = token.map(str::to_string);
        }
    }

    fn mark_user_for_removal(&mut self, identity: &str) {
        if let Some(record) = self.users.get_mut(identity) {
            record.marked_for_removal = true;
            record.user_token = None;
        }
    }
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<MetadataTables>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of user records, marked or not.
    pub fn user_count(&self) -> usize {
        self.tables.read().users.len()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn all_unmarked_users(&self) -> SyncResult<Vec<UserRecord>> {
        Ok(self.tables.read().users_where(false))
    }

    fn all_users_marked_for_removal(&self) -> SyncResult<Vec<UserRecord>> {
        Ok(self.tables.read().users_where(true))
    }

    fn get_or_create_user(&self, identity: &str, server_url: &str) -> SyncResult<UserRecord> {
        Ok(self.tables.write().get_or_create_user(identity, server_url))
    }

    fn set_user_token(
        &self,
        identity: &str,
        server_url: &str,
        token: Option<&str>,
    ) -> SyncResult<()> {
        self.tables
            .write()
            .set_user_token(identity, server_url, token);
        Ok(())
    }

    fn mark_user_for_removal(&self, identity: &str) -> SyncResult<()> {
        self.tables.write().mark_user_for_removal(identity);
        Ok(())
    }

    fn remove_user(&self, identity: &str) -> SyncResult<()> {
        self.tables.write().users.remove(identity);
        Ok(())
    }

    fn pending_file_actions(&self) -> SyncResult<Vec<FileActionRecord>> {
        Ok(self.tables.read().file_actions.values().cloned().collect())
    }

    fn file_action_for(&self, path: &Path) -> SyncResult<Option<FileActionRecord>> {
        Ok(self.tables.read().file_actions.get(path).cloned())
    }

    fn add_file_action(&self, record: FileActionRecord) -> SyncResult<()> {
        self.tables
            .write()
            .file_actions
            .insert(record.original_path.clone(), record);
        Ok(())
    }

    fn remove_file_action(&self, path: &Path) -> SyncResult<()> {
        self.tables.write().file_actions.remove(path);
        Ok(())
    }
}

/// Metadata store backed by a snapshot file.
///
/// Holds an exclusive advisory lock on the metadata directory for its
/// lifetime. Every mutation rewrites the snapshot using write-then-rename.
pub struct FileMetadataStore {
    dir: PathBuf,
    cipher: Option<MetadataCipher>,
    tables: RwLock<MetadataTables>,
    _lock_file: File,
}

impl FileMetadataStore {
    /// Opens or creates the store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MetadataLocked`] if another process holds the
    /// directory, or a decryption/codec error if the snapshot cannot be read
    /// with the given key.
    pub fn open(dir: &Path, key: Option<&EncryptionKey>) -> SyncResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::MetadataLocked);
        }

        let cipher = key.map(MetadataCipher::new);
        let tables = load_snapshot(&dir.join(SNAPSHOT_FILE), cipher.as_ref())?;
        debug!(
            dir = %dir.display(),
            users = tables.users.len(),
            file_actions = tables.file_actions.len(),
            encrypted = cipher.is_some(),
            "opened metadata store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            cipher,
            tables: RwLock::new(tables),
            _lock_file: lock_file,
        })
    }

    /// Returns the metadata directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Applies `f` to the tables and persists the result. On a write failure
    /// the in-memory tables are left unchanged.
    fn update<R>(&self, f: impl FnOnce(&mut MetadataTables) -> R) -> SyncResult<R> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        let result = f(&mut next);
        if next != *tables {
            self.save(&next)?;
            *tables = next;
        }
        Ok(result)
    }

    fn save(&self, tables: &MetadataTables) -> SyncResult<()> {
        let mut body = Vec::new();
        ciborium::into_writer(tables, &mut body).map_err(|e| SyncError::codec(e.to_string()))?;

        let mut data = Vec::with_capacity(body.len() + 6);
        match &self.cipher {
            Some(cipher) => {
                data.extend_from_slice(&SEALED_MAGIC);
                data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
                data.extend(cipher.seal(&body)?);
            }
            None => {
                data.extend_from_slice(&PLAIN_MAGIC);
                data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
                data.extend(body);
            }
        }

        let temp_path = self.dir.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(SNAPSHOT_FILE))?;
        sync_directory(&self.dir)
    }
}

fn load_snapshot(path: &Path, cipher: Option<&MetadataCipher>) -> SyncResult<MetadataTables> {
    if !path.exists() {
        return Ok(MetadataTables::default());
    }

    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(MetadataTables::default());
    }
    if data.len() < 6 {
        return Err(SyncError::invalid_metadata("snapshot too short"));
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != FORMAT_VERSION {
        return Err(SyncError::invalid_metadata(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let magic = &data[0..4];
    let body = if magic == PLAIN_MAGIC {
        if cipher.is_some() {
            return Err(SyncError::decryption_failed(
                "snapshot is not encrypted but a key was supplied",
            ));
        }
        data[6..].to_vec()
    } else if magic == SEALED_MAGIC {
        let cipher = cipher.ok_or_else(|| {
            SyncError::decryption_failed("snapshot is encrypted but no key was supplied")
        })?;
        cipher.open(&data[6..])?
    } else {
        return Err(SyncError::invalid_metadata("invalid snapshot magic"));
    };

    ciborium::from_reader(body.as_slice()).map_err(|e| SyncError::codec(e.to_string()))
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> SyncResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> SyncResult<()> {
    Ok(())
}

impl MetadataStore for FileMetadataStore {
    fn all_unmarked_users(&self) -> SyncResult<Vec<UserRecord>> {
        Ok(self.tables.read().users_where(false))
    }

    fn all_users_marked_for_removal(&self) -> SyncResult<Vec<UserRecord>> {
        Ok(self.tables.read().users_where(true))
    }

    fn get_or_create_user(&self, identity: &str, server_url: &str) -> SyncResult<UserRecord> {
        self.update(|t| t.get_or_create_user(identity, server_url))
    }

    fn set_user_token(
        &self,
        identity: &str,
        server_url: &str,
        token: Option<&str>,
    ) -> SyncResult<()> {
        self.update(|t| t.set_user_token(identity, server_url, token))
    }

    fn mark_user_for_removal(&self, identity: &str) -> SyncResult<()> {
        self.update(|t| t.mark_user_for_removal(identity))
    }

    fn remove_user(&self, identity: &str) -> SyncResult<()> {
        self.update(|t| {
            t.users.remove(identity);
        })
    }

    fn pending_file_actions(&self) -> SyncResult<Vec<FileActionRecord>> {
        Ok(self.tables.read().file_actions.values().cloned().collect())
    }

    fn file_action_for(&self, path: &Path) -> SyncResult<Option<FileActionRecord>> {
        Ok(self.tables.read().file_actions.get(path).cloned())
    }

    fn add_file_action(&self, record: FileActionRecord) -> SyncResult<()> {
        self.update(|t| {
            t.file_actions.insert(record.original_path.clone(), record);
        })
    }

    fn remove_file_action(&self, path: &Path) -> SyncResult<()> {
        self.update(|t| {
            t.file_actions.remove(path);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_user_lifecycle() {
        let store = MemoryMetadataStore::new();

        let record = store
            .get_or_create_user("alice", "https://auth.example.com")
            .unwrap();
        assert_eq!(record.identity, "alice");
        assert!(record.user_token.is_none());
        assert!(!record.local_uuid.is_empty());

        store
            .set_user_token("alice", "https://auth.example.com", Some("refresh"))
            .unwrap();
        let users = store.all_unmarked_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_token.as_deref(), Some("refresh"));

        store.mark_user_for_removal("alice").unwrap();
        assert!(store.all_unmarked_users().unwrap().is_empty());
        assert_eq!(store.all_users_marked_for_removal().unwrap().len(), 1);

        // Asking for the user again revives it with the same local identity.
        let revived = store
            .get_or_create_user("alice", "https://auth.example.com")
            .unwrap();
        assert!(!revived.marked_for_removal);
        assert_eq!(revived.local_uuid, record.local_uuid);

        store.remove_user("alice").unwrap();
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn mark_unknown_user_is_ignored() {
        let store = MemoryMetadataStore::new();
        store.mark_user_for_removal("nobody").unwrap();
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn file_actions_keyed_by_path() {
        let store = MemoryMetadataStore::new();
        store
            .add_file_action(FileActionRecord::delete("/data/a.realm", "sync://x/a", "alice"))
            .unwrap();
        store
            .add_file_action(FileActionRecord::back_up_then_delete(
                "/data/a.realm",
                "/recovered/a.realm",
                "sync://x/a",
                "alice",
            ))
            .unwrap();

        let actions = store.pending_file_actions().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, FileAction::BackUpThenDeleteRealm);

        store.remove_file_action(Path::new("/data/a.realm")).unwrap();
        assert!(store
            .file_action_for(Path::new("/data/a.realm"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("metadata");

        let local_uuid = {
            let store = FileMetadataStore::open(&dir, None).unwrap();
            store
                .set_user_token("bob", "https://auth.example.com", Some("tok"))
                .unwrap();
            store
                .add_file_action(FileActionRecord::delete("/data/b", "sync://x/b", "bob"))
                .unwrap();
            store.all_unmarked_users().unwrap()[0].local_uuid.clone()
        };

        let store = FileMetadataStore::open(&dir, None).unwrap();
        let users = store.all_unmarked_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_token.as_deref(), Some("tok"));
        assert_eq!(users[0].local_uuid, local_uuid);
        assert_eq!(store.pending_file_actions().unwrap().len(), 1);
    }

    #[test]
    fn file_store_lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _store = FileMetadataStore::open(temp.path(), None).unwrap();
        assert!(matches!(
            FileMetadataStore::open(temp.path(), None),
            Err(SyncError::MetadataLocked)
        ));
    }

    #[test]
    fn encrypted_store_requires_key() {
        let temp = tempdir().unwrap();
        let key = EncryptionKey::generate();
        {
            let store = FileMetadataStore::open(temp.path(), Some(&key)).unwrap();
            store
                .set_user_token("carol", "https://auth.example.com", Some("secret"))
                .unwrap();
        }

        let raw = fs::read(temp.path().join(SNAPSHOT_FILE)).unwrap();
        assert_eq!(&raw[0..4], &SEALED_MAGIC);
        assert!(!raw.windows(6).any(|w| w == b"secret"));

        assert!(matches!(
            FileMetadataStore::open(temp.path(), None),
            Err(SyncError::DecryptionFailed { .. })
        ));
        assert!(matches!(
            FileMetadataStore::open(temp.path(), Some(&EncryptionKey::generate())),
            Err(SyncError::DecryptionFailed { .. })
        ));

        let store = FileMetadataStore::open(temp.path(), Some(&key)).unwrap();
        assert_eq!(
            store.all_unmarked_users().unwrap()[0].user_token.as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(SNAPSHOT_FILE), b"garbage!").unwrap();
        assert!(matches!(
            FileMetadataStore::open(temp.path(), None),
            Err(SyncError::InvalidMetadata { .. })
        ));
    }
}
