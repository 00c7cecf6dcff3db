//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use synclane_core::{EncryptionKey, FileAction, FileMetadataStore, MetadataStore, SyncResult};

/// Contents of a metadata directory.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Metadata directory.
    pub path: String,
    /// Persisted users, logged in first.
    pub users: Vec<UserSummary>,
    /// Pending file actions.
    pub file_actions: Vec<FileActionSummary>,
}

/// One persisted user. Tokens are never printed.
#[derive(Debug, Serialize)]
pub struct UserSummary {
    /// Identity assigned by the auth provider.
    pub identity: String,
    /// Auth server URL.
    pub server_url: String,
    /// Name of the user's directory.
    pub local_uuid: String,
    /// Whether a refresh token is stored.
    pub has_token: bool,
    /// Whether the user's data is deleted at next start.
    pub marked_for_removal: bool,
}

/// One pending file action.
#[derive(Debug, Serialize)]
pub struct FileActionSummary {
    /// `delete` or `backup-then-delete`.
    pub action: &'static str,
    /// File the action applies to.
    pub original_path: String,
    /// Backup destination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    /// Remote URL of the file.
    pub url: String,
    /// Owning user.
    pub user_identity: String,
}

/// Collects the contents of `store`.
pub fn collect(path: &Path, store: &dyn MetadataStore) -> SyncResult<InspectResult> {
    let mut users = Vec::new();
    for (records, marked) in [
        (store.all_unmarked_users()?, false),
        (store.all_users_marked_for_removal()?, true),
    ] {
        users.extend(records.into_iter().map(|r| UserSummary {
            identity: r.identity,
            server_url: r.server_url,
            local_uuid: r.local_uuid,
            has_token: r.user_token.is_some(),
            marked_for_removal: marked,
        }));
    }

    let file_actions = store
        .pending_file_actions()?
        .into_iter()
        .map(|r| FileActionSummary {
            action: match r.action {
                FileAction::DeleteRealm => "delete",
                FileAction::BackUpThenDeleteRealm => "backup-then-delete",
            },
            original_path: r.original_path.display().to_string(),
            new_path: r.new_path.map(|p| p.display().to_string()),
            url: r.url,
            user_identity: r.user_identity,
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        users,
        file_actions,
    })
}

/// Runs the inspect command.
pub fn run(
    metadata_dir: &Path,
    key: Option<&EncryptionKey>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !metadata_dir.is_dir() {
        return Err(format!("No metadata directory at {}", metadata_dir.display()).into());
    }
    let store = FileMetadataStore::open(metadata_dir, key)?;
    let result = collect(metadata_dir, &store)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Metadata: {}", result.path);
    println!();
    println!("Users ({}):", result.users.len());
    for user in &result.users {
        let mut flags = Vec::new();
        if user.has_token {
            flags.push("logged in");
        }
        if user.marked_for_removal {
            flags.push("marked for removal");
        }
        println!(
            "  {:<24} {:<36} {} [{}]",
            user.identity,
            user.local_uuid,
            user.server_url,
            flags.join(", ")
        );
    }
    println!();
    println!("Pending file actions ({}):", result.file_actions.len());
    for action in &result.file_actions {
        match &action.new_path {
            Some(new_path) => println!(
                "  {:<20} {} -> {}",
                action.action, action.original_path, new_path
            ),
            None => println!("  {:<20} {}", action.action, action.original_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclane_core::{FileActionRecord, MemoryMetadataStore};

    #[test]
    fn collect_hides_tokens_and_lists_actions() {
        let store = MemoryMetadataStore::new();
        store
            .set_user_token("alice", "https://auth", Some("secret"))
            .unwrap();
        store.get_or_create_user("bob", "https://auth").unwrap();
        store.mark_user_for_removal("bob").unwrap();
        store
            .add_file_action(FileActionRecord::back_up_then_delete(
                "/data/a", "/data/recovered/a", "sync://h/a", "alice",
            ))
            .unwrap();

        let result = collect(Path::new("/meta"), &store).unwrap();
        assert_eq!(result.users.len(), 2);
        assert!(result.users[0].has_token);
        assert!(result.users[1].marked_for_removal);
        assert_eq!(result.file_actions[0].action, "backup-then-delete");

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("secret"));
    }
}
