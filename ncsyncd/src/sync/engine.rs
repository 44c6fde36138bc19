use std::path::PathBuf;
use std::sync::Arc;

use ncsync_core::{DavEntry, Depth, RemoteGateway};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::e2ee::crypto::CryptoProvider;
use super::e2ee::lock::{LockManager, LockPolicy};
use super::error::{Permission, SyncError};
use super::index::{DirectoryRecord, FileRecord, FileStatus, MetadataStore};
use super::live_photo;
use super::paths::{
    cache_dir_for, cached_file_path, icon_path, numbered_name, strip_forbidden_characters,
};
use crate::account::Account;
use crate::events::{Completion, EventBus, SyncEvent};

pub const DEFAULT_E2EE_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;
pub(crate) const DIRECTORY_CONTENT_TYPE: &str = "httpd/unix-directory";

pub(crate) const PERMISSION_CAN_DELETE: char = 'D';
pub(crate) const PERMISSION_CAN_RENAME: char = 'N';

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_root: PathBuf,
    pub show_hidden: bool,
    pub e2ee_max_file_size: u64,
    pub upload_concurrency: usize,
    pub lock_policy: LockPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir().join("ncsync"),
            show_hidden: false,
            e2ee_max_file_size: DEFAULT_E2EE_MAX_FILE_SIZE,
            upload_concurrency: 2,
            lock_policy: LockPolicy::default(),
        }
    }
}

/// Keeps one account's local metadata in step with the server. Every mutating
/// operation returns its outcome and also publishes it on the event bus.
pub struct SyncEngine {
    pub(crate) account: Account,
    pub(crate) gateway: Arc<dyn RemoteGateway>,
    pub(crate) store: MetadataStore,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) events: EventBus,
    pub(crate) locks: LockManager,
    pub(crate) config: EngineConfig,
    pub(crate) upload_limit: Arc<Semaphore>,
}

impl SyncEngine {
    pub fn new(
        account: Account,
        gateway: Arc<dyn RemoteGateway>,
        store: MetadataStore,
        crypto: Arc<dyn CryptoProvider>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let locks = LockManager::new(gateway.clone(), store.clone(), config.lock_policy);
        let upload_limit = Arc::new(Semaphore::new(config.upload_concurrency.max(1)));
        Self {
            account,
            gateway,
            store,
            crypto,
            events,
            locks,
            config,
            upload_limit,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Lists `server_url` and replaces its settled records with the listing.
    /// Records mid-transfer survive the relist.
    pub async fn read_folder(&self, server_url: &str) -> Result<Vec<FileRecord>, SyncError> {
        let entries = self
            .gateway
            .list(server_url, Depth::One, self.config.show_hidden)
            .await?;
        let mut entries = entries.into_iter();
        let Some(folder) = entries.next() else {
            return Ok(Vec::new());
        };
        let children: Vec<DavEntry> = entries.collect();

        let mut folder_record = self.record_from_entry(&folder);
        if self.folder_is_encrypted(&folder.server_url).await? {
            folder_record.e2e_encrypted = true;
            self.resolve_view_name(&mut folder_record).await?;
        }
        self.store
            .upsert_directory(&DirectoryRecord {
                etag: folder.etag.clone(),
                date_read: Some(OffsetDateTime::now_utc().unix_timestamp()),
                ..directory_for(&folder_record, server_url)
            })
            .await?;

        for child in children.iter().filter(|child| child.directory) {
            let child_url = format!("{server_url}/{}", child.file_name);
            let existing = self.store.get_directory(&self.account.id, &child_url).await?;
            let mut record = directory_for(&self.record_from_entry(child), &child_url);
            if let Some(existing) = existing {
                record.etag = existing.etag;
                record.date_read = existing.date_read;
            }
            self.store.upsert_directory(&record).await?;
        }

        let pending = self
            .store
            .pending_files_in(&self.account.id, server_url)
            .await?;
        self.store
            .delete_settled_files_in(&self.account.id, server_url)
            .await?;
        self.store.upsert_file(&folder_record).await?;

        let mut records = Vec::with_capacity(children.len());
        for child in &children {
            let mut record = self.record_from_entry(child);
            if folder_record.e2e_encrypted {
                record.e2e_encrypted = true;
                self.resolve_view_name(&mut record).await?;
            }
            self.store.upsert_file(&record).await?;
            records.push(record);
        }
        for record in &pending {
            self.store.upsert_file(record).await?;
        }

        debug!(server_url, entries = records.len(), pending = pending.len(), "folder read");
        Ok(records)
    }

    /// Reads a single item. `None` unless the server answers with exactly one entry.
    pub async fn read_file(
        &self,
        server_url_file_name: &str,
    ) -> Result<Option<FileRecord>, SyncError> {
        let entries = self
            .gateway
            .list(server_url_file_name, Depth::Zero, self.config.show_hidden)
            .await?;
        let [entry] = entries.as_slice() else {
            return Ok(None);
        };
        let mut record = self.record_from_entry(entry);
        if entry.e2e_encrypted || self.folder_is_encrypted(&entry.server_url).await? {
            record.e2e_encrypted = true;
            self.resolve_view_name(&mut record).await?;
        }
        Ok(Some(record))
    }

    /// Creates `file_name` under `server_url`, numbering it when the name is taken.
    /// An empty name after sanitizing succeeds without creating anything.
    pub async fn create_folder(
        &self,
        file_name: &str,
        server_url: &str,
    ) -> Result<Option<FileRecord>, SyncError> {
        let result = self.create_folder_routed(file_name, server_url, false).await;
        self.finish_folder_created(file_name, server_url, &result)
            .await;
        result
    }

    /// Creates an encrypted folder. Under a plain parent the new folder becomes the
    /// root of an encrypted subtree.
    pub async fn create_encrypted_folder(
        &self,
        file_name: &str,
        server_url: &str,
    ) -> Result<Option<FileRecord>, SyncError> {
        let result = self.create_folder_routed(file_name, server_url, true).await;
        self.finish_folder_created(file_name, server_url, &result)
            .await;
        result
    }

    async fn create_folder_routed(
        &self,
        file_name: &str,
        server_url: &str,
        encrypt: bool,
    ) -> Result<Option<FileRecord>, SyncError> {
        let name = strip_forbidden_characters(file_name);
        if name.is_empty() {
            return Ok(None);
        }
        let name = self.unique_name(&name, server_url).await?;
        let record = if self.folder_is_encrypted(server_url).await? {
            self.create_folder_encrypted(&name, server_url).await?
        } else if encrypt {
            self.create_encrypted_root(&name, server_url).await?
        } else {
            self.create_folder_plain(&name, server_url).await?
        };
        Ok(Some(record))
    }

    pub(crate) async fn create_folder_plain(
        &self,
        name: &str,
        server_url: &str,
    ) -> Result<FileRecord, SyncError> {
        let folder_url = format!("{server_url}/{name}");
        self.gateway.create_folder(&folder_url, &[]).await?;
        let record = self
            .read_file(&folder_url)
            .await?
            .ok_or_else(|| SyncError::MissingDirectory(folder_url.clone()))?;
        self.store.upsert_file(&record).await?;
        self.store
            .upsert_directory(&directory_for(&record, &folder_url))
            .await?;
        info!(server_url, name, "folder created");
        Ok(record)
    }

    async fn finish_folder_created(
        &self,
        file_name: &str,
        server_url: &str,
        result: &Result<Option<FileRecord>, SyncError>,
    ) {
        self.finish(
            server_url,
            SyncEvent::FolderCreated {
                server_url: server_url.to_string(),
                file_name: file_name.to_string(),
                completion: Completion::from(result),
            },
        )
        .await;
    }

    /// Deletes `record`, its live-photo twin first. A failing twin aborts the pair.
    pub async fn delete(&self, record: &FileRecord) -> Result<(), SyncError> {
        if let Some(twin) = live_photo::find_twin(&self.store, record).await? {
            self.delete_one(&twin).await?;
        }
        self.delete_one(record).await
    }

    async fn delete_one(&self, record: &FileRecord) -> Result<(), SyncError> {
        let result = self.delete_routed(record).await;
        self.finish(
            &record.server_url,
            SyncEvent::FileDeleted {
                record: record.clone(),
                completion: Completion::from(&result),
            },
        )
        .await;
        result
    }

    async fn delete_routed(&self, record: &FileRecord) -> Result<(), SyncError> {
        if self.is_encrypted_context(record).await? {
            self.delete_encrypted(record).await
        } else {
            self.delete_plain(record, &[]).await
        }
    }

    /// WebDAV delete plus local cleanup. A 404 counts as already deleted.
    pub(crate) async fn delete_plain(
        &self,
        record: &FileRecord,
        headers: &[(&str, &str)],
    ) -> Result<(), SyncError> {
        require_permission(record, PERMISSION_CAN_DELETE, Permission::Delete)?;
        let server_url_file_name = record.server_url_file_name();
        match self.gateway.delete(&server_url_file_name, headers).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(url = %server_url_file_name, "already gone on the server");
            }
            Err(err) => return Err(err.into()),
        }

        self.remove_cache_dir(&record.oc_id).await;
        self.store.delete_file(&record.oc_id).await?;
        if record.directory {
            let removed = self
                .store
                .delete_subtree(&record.account, &server_url_file_name)
                .await?;
            for oc_id in removed {
                self.remove_cache_dir(&oc_id).await;
            }
        }
        info!(url = %server_url_file_name, "deleted");
        Ok(())
    }

    /// Toggles the favorite flag, twin first.
    pub async fn favorite(&self, record: &FileRecord) -> Result<(), SyncError> {
        if let Some(twin) = live_photo::find_twin(&self.store, record).await? {
            self.favorite_one(&twin).await?;
        }
        self.favorite_one(record).await
    }

    async fn favorite_one(&self, record: &FileRecord) -> Result<(), SyncError> {
        let favorite = !record.favorite;
        let result = self.set_favorite(record, favorite).await;
        self.finish(
            &record.server_url,
            SyncEvent::FileFavorited {
                record: FileRecord {
                    favorite: if result.is_ok() { favorite } else { record.favorite },
                    ..record.clone()
                },
                completion: Completion::from(&result),
            },
        )
        .await;
        result
    }

    async fn set_favorite(&self, record: &FileRecord, favorite: bool) -> Result<(), SyncError> {
        let path = self.account.relative_path(&record.server_url_file_name());
        self.gateway.set_favorite(&path, favorite).await?;
        if let Some(mut stored) = self.store.get_file(&record.oc_id).await? {
            stored.favorite = favorite;
            self.store.upsert_file(&stored).await?;
        }
        Ok(())
    }

    /// Renames `record` to `new_name`. The twin follows the new stem; inside an
    /// encrypted folder both names change in one manifest update.
    pub async fn rename(&self, record: &FileRecord, new_name: &str) -> Result<FileRecord, SyncError> {
        let new_name = strip_forbidden_characters(new_name);
        if new_name.is_empty() || new_name == record.file_name_view {
            return Ok(record.clone());
        }
        let twin = live_photo::find_twin(&self.store, record).await?;

        if self.is_encrypted_context(record).await? {
            let mut renames = Vec::with_capacity(2);
            if let Some(twin) = twin {
                let twin_name = live_photo::twin_name_for(&twin, &new_name);
                renames.push((twin, twin_name));
            }
            renames.push((record.clone(), new_name.clone()));
            let result = self.rename_encrypted(&renames).await;
            for (renamed, _) in &renames {
                self.finish(
                    &renamed.server_url,
                    SyncEvent::FileRenamed {
                        record: renamed.clone(),
                        completion: Completion::from(&result),
                    },
                )
                .await;
            }
            result?;
            return Ok(FileRecord {
                file_name_view: new_name,
                ..record.clone()
            });
        }

        if let Some(twin) = twin {
            let twin_name = live_photo::twin_name_for(&twin, &new_name);
            self.rename_one(&twin, &twin_name).await?;
        }
        self.rename_one(record, &new_name).await
    }

    async fn rename_one(&self, record: &FileRecord, new_name: &str) -> Result<FileRecord, SyncError> {
        let result = self.rename_plain(record, new_name).await;
        self.finish(
            &record.server_url,
            SyncEvent::FileRenamed {
                record: record.clone(),
                completion: Completion::from(&result),
            },
        )
        .await;
        result
    }

    async fn rename_plain(&self, record: &FileRecord, new_name: &str) -> Result<FileRecord, SyncError> {
        require_permission(record, PERMISSION_CAN_RENAME, Permission::Modify)?;
        let source = record.server_url_file_name();
        let destination = format!("{}/{new_name}", record.server_url);
        self.gateway.move_item(&source, &destination, false).await?;

        let renamed = FileRecord {
            file_name: new_name.to_string(),
            file_name_view: new_name.to_string(),
            ..record.clone()
        };
        self.store.upsert_file(&renamed).await?;
        if record.directory {
            self.store
                .rewrite_prefix(&record.account, &source, &destination)
                .await?;
        } else {
            self.store.rename_local_file(&record.oc_id, new_name).await?;
            self.move_cache_artifacts(&record.oc_id, &record.file_name_view, new_name)
                .await;
        }
        info!(from = %source, to = %destination, "renamed");
        Ok(renamed)
    }

    /// Moves `record` into `server_url_to`, twin first.
    pub async fn move_item(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<FileRecord, SyncError> {
        if let Some(twin) = live_photo::find_twin(&self.store, record).await? {
            self.move_one(&twin, server_url_to, overwrite).await?;
        }
        self.move_one(record, server_url_to, overwrite).await
    }

    async fn move_one(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<FileRecord, SyncError> {
        let result = self.move_plain(record, server_url_to, overwrite).await;
        self.finish(
            &record.server_url,
            SyncEvent::FileMoved {
                record: record.clone(),
                server_url_to: server_url_to.to_string(),
                completion: Completion::from(&result),
            },
        )
        .await;
        result
    }

    async fn move_plain(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<FileRecord, SyncError> {
        require_permission(record, PERMISSION_CAN_RENAME, Permission::Modify)?;
        let source = record.server_url_file_name();
        let destination = format!("{server_url_to}/{}", record.file_name);
        self.gateway
            .move_item(&source, &destination, overwrite)
            .await?;

        if let Some(replaced) = self
            .store
            .get_file_by_name(&record.account, server_url_to, &record.file_name)
            .await?
        {
            if replaced.oc_id != record.oc_id {
                self.store.delete_file(&replaced.oc_id).await?;
            }
        }
        let moved = FileRecord {
            server_url: server_url_to.to_string(),
            ..record.clone()
        };
        self.store.upsert_file(&moved).await?;
        if record.directory {
            self.store
                .rewrite_prefix(&record.account, &source, &destination)
                .await?;
        }
        self.store
            .set_date_read(&record.account, &record.server_url, None)
            .await?;
        self.store
            .set_date_read(&record.account, server_url_to, None)
            .await?;
        info!(from = %source, to = %destination, "moved");
        Ok(moved)
    }

    /// Copies `record` into `server_url_to`, twin first. Local metadata is left alone;
    /// the copy shows up on the next folder read.
    pub async fn copy_item(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<(), SyncError> {
        if let Some(twin) = live_photo::find_twin(&self.store, record).await? {
            self.copy_one(&twin, server_url_to, overwrite).await?;
        }
        self.copy_one(record, server_url_to, overwrite).await
    }

    async fn copy_one(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<(), SyncError> {
        let result = self.copy_plain(record, server_url_to, overwrite).await;
        self.finish(
            &record.server_url,
            SyncEvent::FileCopied {
                record: record.clone(),
                server_url_to: server_url_to.to_string(),
                completion: Completion::from(&result),
            },
        )
        .await;
        result
    }

    async fn copy_plain(
        &self,
        record: &FileRecord,
        server_url_to: &str,
        overwrite: bool,
    ) -> Result<(), SyncError> {
        require_permission(record, PERMISSION_CAN_RENAME, Permission::Modify)?;
        let destination = format!("{server_url_to}/{}", record.file_name);
        self.gateway
            .copy_item(&record.server_url_file_name(), &destination, overwrite)
            .await?;
        Ok(())
    }

    /// Publishes a completion. Any lock still stored for the folder is revoked first.
    pub(crate) async fn finish(&self, server_url: &str, event: SyncEvent) {
        self.locks.revoke_stored(&self.account, server_url).await;
        self.events.publish(event);
    }

    pub(crate) async fn folder_is_encrypted(&self, server_url: &str) -> Result<bool, SyncError> {
        Ok(self
            .store
            .get_directory(&self.account.id, server_url)
            .await?
            .is_some_and(|directory| directory.e2e_encrypted))
    }

    async fn is_encrypted_context(&self, record: &FileRecord) -> Result<bool, SyncError> {
        Ok(record.e2e_encrypted || self.folder_is_encrypted(&record.server_url).await?)
    }

    async fn resolve_view_name(&self, record: &mut FileRecord) -> Result<(), SyncError> {
        if let Some(entry) = self
            .store
            .get_encryption(&self.account.id, &record.server_url, &record.file_name)
            .await?
        {
            record.file_name_view = entry.file_name;
        }
        Ok(())
    }

    async fn unique_name(&self, name: &str, server_url: &str) -> Result<String, SyncError> {
        let mut candidate = name.to_string();
        let mut n = 1;
        while self
            .store
            .get_file_by_view_name(&self.account.id, server_url, &candidate)
            .await?
            .is_some()
        {
            n += 1;
            candidate = numbered_name(name, n);
        }
        Ok(candidate)
    }

    pub(crate) fn record_from_entry(&self, entry: &DavEntry) -> FileRecord {
        FileRecord {
            oc_id: entry.oc_id.clone(),
            file_id: entry.file_id.clone(),
            account: self.account.id.clone(),
            server_url: entry.server_url.clone(),
            file_name: entry.file_name.clone(),
            file_name_view: entry.file_name.clone(),
            directory: entry.directory,
            status: FileStatus::Normal,
            content_type: entry.content_type.clone(),
            size: entry.size,
            date: entry.date,
            etag: entry.etag.clone(),
            favorite: entry.favorite,
            e2e_encrypted: entry.e2e_encrypted,
            permissions: entry.permissions.clone(),
            rich_workspace: entry.rich_workspace.clone(),
            ..FileRecord::default()
        }
    }

    pub(crate) async fn remove_cache_dir(&self, oc_id: &str) {
        let dir = match cache_dir_for(&self.config.cache_root, oc_id) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(oc_id, error = %err, "unusable cache path");
                return;
            }
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove cache directory"),
        }
    }

    /// Moves the cached file and its icon to follow a new display name.
    pub(crate) async fn move_cache_artifacts(&self, oc_id: &str, from: &str, to: &str) {
        let root = &self.config.cache_root;
        let pairs = [
            (cached_file_path(root, oc_id, from), cached_file_path(root, oc_id, to)),
            (icon_path(root, oc_id, from), icon_path(root, oc_id, to)),
        ];
        for pair in pairs {
            let (Ok(at), Ok(target)) = pair else {
                warn!(oc_id, "unusable cache path, artifacts left in place");
                continue;
            };
            match tokio::fs::rename(&at, &target).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %at.display(), error = %err, "failed to move cached file"),
            }
        }
    }
}

/// An empty permission string allows everything.
pub(crate) fn require_permission(
    record: &FileRecord,
    letter: char,
    permission: Permission,
) -> Result<(), SyncError> {
    if record.permissions.is_empty() || record.permissions.contains(letter) {
        Ok(())
    } else {
        Err(SyncError::PermissionDenied(permission))
    }
}

pub(crate) fn directory_for(record: &FileRecord, server_url: &str) -> DirectoryRecord {
    DirectoryRecord {
        account: record.account.clone(),
        server_url: server_url.to_string(),
        oc_id: record.oc_id.clone(),
        file_id: record.file_id.clone(),
        e2e_encrypted: record.e2e_encrypted,
        favorite: record.favorite,
        etag: String::new(),
        permissions: record.permissions.clone(),
        rich_workspace: record.rich_workspace.clone(),
        date_read: None,
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
