//! CLI command implementations.

pub mod inspect;
pub mod maintenance;

use std::path::Path;
use synclane_core::{EncryptionKey, FileManager, FileMetadataStore, SyncResult};

/// Opens the metadata store kept under `base`.
pub fn open_store(
    base: &Path,
    key: Option<&EncryptionKey>,
) -> SyncResult<(FileManager, FileMetadataStore)> {
    let files = FileManager::new(base)?;
    let store = FileMetadataStore::open(&files.metadata_path()?, key)?;
    Ok((files, store))
}
