use std::collections::HashMap;

use ncsync_core::{E2E_TOKEN_HEADER, ManifestMethod};
use tracing::{debug, info};

use super::lock::HeldLock;
use super::manifest::{self, ManifestError, ManifestKey};
use crate::sync::engine::{
    DIRECTORY_CONTENT_TYPE, PERMISSION_CAN_DELETE, PERMISSION_CAN_RENAME, SyncEngine,
    directory_for, require_permission,
};
use crate::sync::error::{Permission, SyncError};
use crate::sync::index::{DirectoryRecord, EncryptionEntry, FileRecord, FolderKey};

/// Change applied to a folder's entries between fetching and pushing its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestMutation {
    None,
    /// `(file_name_identifier, new plaintext name)` pairs.
    Rename(Vec<(String, String)>),
    /// Identifiers whose entries are dropped.
    Delete(Vec<String>),
}

/// What happened to the folder lock after a manifest push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestPush {
    Released,
    /// The caller owns the token and must unlock.
    Retained(String),
    /// The folder has no directory record, so nothing was locked or sent.
    Skipped,
}

/// Fresh opaque wire name for an encrypted file or folder.
pub(crate) fn random_identifier() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn encode_failure(err: ManifestError) -> SyncError {
    match err {
        ManifestError::Crypto(err) => SyncError::Crypto(err),
        ManifestError::Malformed(reason) => SyncError::ManifestDecode(reason),
    }
}

impl SyncEngine {
    /// Lock, fetch, merge, mutate, re-encode and push the manifest of `server_url`.
    /// The lock is released on every path except a successful push with
    /// `retain_for_upload`.
    pub async fn send_manifest(
        &self,
        server_url: &str,
        mutation: ManifestMutation,
        retain_for_upload: bool,
    ) -> Result<ManifestPush, SyncError> {
        let Some(held) = self.locks.lock(&self.account, server_url).await? else {
            return Ok(ManifestPush::Skipped);
        };
        match self.push_manifest(server_url, &held, mutation).await {
            Ok(()) if retain_for_upload => Ok(ManifestPush::Retained(held.token)),
            Ok(()) => {
                self.locks.release(&self.account, server_url).await;
                Ok(ManifestPush::Released)
            }
            Err(err) => {
                self.locks.release(&self.account, server_url).await;
                Err(err)
            }
        }
    }

    async fn push_manifest(
        &self,
        server_url: &str,
        held: &HeldLock,
        mutation: ManifestMutation,
    ) -> Result<(), SyncError> {
        let private_key = self
            .account
            .private_key
            .as_deref()
            .ok_or(SyncError::MissingPrivateKey)?;
        let file_id = &held.directory.file_id;

        let (method, folder_key) = match self.gateway.get_manifest(file_id, &held.token).await? {
            Some(blob) => {
                let decoded = manifest::decode(
                    self.crypto.as_ref(),
                    private_key,
                    &blob,
                    &self.account.id,
                    server_url,
                )
                .map_err(|err| SyncError::ManifestDecode(err.to_string()))?;
                self.remember_folder_key(server_url, &decoded.folder_key)
                    .await?;
                self.merge_entries(server_url, &decoded.folder_key, decoded.entries)
                    .await?;
                (ManifestMethod::Put, Some(decoded.folder_key))
            }
            None => (ManifestMethod::Post, None),
        };

        self.apply_mutation(server_url, mutation).await?;

        let entries = self
            .store
            .encryption_entries(&self.account.id, server_url)
            .await?;
        let folder_key = match folder_key {
            Some(key) => key,
            None => self.folder_generation(server_url, &entries).await?,
        };
        let blob = manifest::encode(
            self.crypto.as_ref(),
            private_key,
            &folder_key,
            self.account.e2ee_api_version,
            &entries,
        )
        .map_err(encode_failure)?;

        self.gateway
            .put_manifest(file_id, &held.token, &blob, method)
            .await?;
        debug!(server_url, method = method.as_str(), entries = entries.len(), "manifest pushed");
        Ok(())
    }

    /// Stores what the server knows and moves local-only entries onto the server's
    /// metadata key generations.
    async fn merge_entries(
        &self,
        server_url: &str,
        folder_key: &ManifestKey,
        decoded: Vec<EncryptionEntry>,
    ) -> Result<(), SyncError> {
        let mut server_keys: HashMap<i64, String> = HashMap::new();
        server_keys.insert(folder_key.index, folder_key.key.clone());
        for entry in &decoded {
            server_keys
                .entry(entry.metadata_key_index)
                .or_insert_with(|| entry.metadata_key.clone());
        }

        let local = self
            .store
            .encryption_entries(&self.account.id, server_url)
            .await?;
        let mut local_paths: HashMap<String, String> = local
            .iter()
            .map(|entry| (entry.file_name_identifier.clone(), entry.file_name_path.clone()))
            .collect();

        for mut entry in decoded {
            entry.file_name_path = match local_paths.remove(&entry.file_name_identifier) {
                Some(path) if !path.is_empty() => path,
                _ => self.entry_path(server_url, &entry.file_name),
            };
            self.store.upsert_encryption(&entry).await?;
        }

        for mut entry in local {
            if !local_paths.contains_key(&entry.file_name_identifier) {
                continue;
            }
            if let Some(key) = server_keys.get(&entry.metadata_key_index) {
                if *key != entry.metadata_key {
                    entry.metadata_key = key.clone();
                    self.store.upsert_encryption(&entry).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_mutation(
        &self,
        server_url: &str,
        mutation: ManifestMutation,
    ) -> Result<(), SyncError> {
        match mutation {
            ManifestMutation::None => {}
            ManifestMutation::Rename(renames) => {
                for (identifier, new_name) in renames {
                    let path = self.entry_path(server_url, &new_name);
                    self.store
                        .rename_encryption(&self.account.id, server_url, &identifier, &new_name, &path)
                        .await?;
                }
            }
            ManifestMutation::Delete(identifiers) => {
                for identifier in identifiers {
                    self.store
                        .delete_encryption(&self.account.id, server_url, &identifier)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Path of `file_name` relative to the WebDAV home.
    pub(crate) fn entry_path(&self, server_url: &str, file_name: &str) -> String {
        let parent = self.account.relative_path(server_url);
        if parent.ends_with('/') {
            format!("{parent}{file_name}")
        } else {
            format!("{parent}/{file_name}")
        }
    }

    /// Generation of a folder the server holds no manifest for: the newest among
    /// `entries`, else the stored one, else a fresh generation 0 that gets stored.
    async fn folder_generation(
        &self,
        server_url: &str,
        entries: &[EncryptionEntry],
    ) -> Result<ManifestKey, SyncError> {
        if let Some(key) = current_folder_key(entries) {
            return Ok(key);
        }
        if let Some(stored) = self.store.folder_key(&self.account.id, server_url).await? {
            return Ok(ManifestKey {
                key: stored.metadata_key,
                index: stored.metadata_key_index,
            });
        }
        let key = ManifestKey {
            key: self.crypto.generate_metadata_key(),
            index: 0,
        };
        self.remember_folder_key(server_url, &key).await?;
        Ok(key)
    }

    async fn remember_folder_key(&self, server_url: &str, key: &ManifestKey) -> Result<(), SyncError> {
        let folder_key = FolderKey {
            metadata_key: key.key.clone(),
            metadata_key_index: key.index,
        };
        self.store
            .set_folder_key(&self.account.id, server_url, &folder_key)
            .await?;
        Ok(())
    }

    /// Fills the metadata key of a new entry with the folder's current generation,
    /// opening generation 0 when the folder has none yet.
    pub(crate) async fn attach_folder_key(
        &self,
        entry: &mut EncryptionEntry,
    ) -> Result<(), SyncError> {
        let entries = self
            .store
            .encryption_entries(&entry.account, &entry.server_url)
            .await?;
        let siblings: Vec<EncryptionEntry> = entries
            .into_iter()
            .filter(|other| other.file_name_identifier != entry.file_name_identifier)
            .collect();
        let key = self.folder_generation(&entry.server_url, &siblings).await?;
        entry.metadata_key = key.key;
        entry.metadata_key_index = key.index;
        entry.version = self.account.e2ee_api_version;
        Ok(())
    }

    /// Creates `display_name` under the encrypted folder `server_url` with a random
    /// wire name.
    pub(crate) async fn create_folder_encrypted(
        &self,
        display_name: &str,
        server_url: &str,
    ) -> Result<FileRecord, SyncError> {
        if self.account.private_key.is_none() {
            return Err(SyncError::MissingPrivateKey);
        }
        let held = self
            .locks
            .lock(&self.account, server_url)
            .await?
            .ok_or_else(|| SyncError::MissingDirectory(server_url.to_string()))?;
        let result = self
            .populate_encrypted_folder(&held, display_name, server_url)
            .await;
        if result.is_err() {
            self.locks.release(&self.account, server_url).await;
        }
        result
    }

    async fn populate_encrypted_folder(
        &self,
        held: &HeldLock,
        display_name: &str,
        server_url: &str,
    ) -> Result<FileRecord, SyncError> {
        let identifier = random_identifier();
        let folder_url = format!("{server_url}/{identifier}");
        let headers = [(E2E_TOKEN_HEADER, held.token.as_str())];
        self.gateway.create_folder(&folder_url, &headers).await?;

        let mut record = self
            .read_file(&folder_url)
            .await?
            .ok_or_else(|| SyncError::MissingDirectory(folder_url.clone()))?;
        record.file_name_view = display_name.to_string();
        record.e2e_encrypted = true;
        self.store.upsert_file(&record).await?;
        self.store
            .upsert_directory(&DirectoryRecord {
                e2e_encrypted: true,
                ..directory_for(&record, &folder_url)
            })
            .await?;

        self.gateway.mark_encrypted(&record.file_id, true).await?;

        let (key, initialization_vector) = self.crypto.generate_file_key();
        let mut entry = EncryptionEntry {
            account: self.account.id.clone(),
            server_url: server_url.to_string(),
            file_name_identifier: identifier,
            file_name: display_name.to_string(),
            file_name_path: self.entry_path(server_url, display_name),
            key,
            initialization_vector,
            authentication_tag: None,
            mime_type: DIRECTORY_CONTENT_TYPE.to_string(),
            ..EncryptionEntry::default()
        };
        self.attach_folder_key(&mut entry).await?;
        self.store.upsert_encryption(&entry).await?;

        self.send_manifest(server_url, ManifestMutation::None, false)
            .await?;
        info!(server_url, name = display_name, "encrypted folder created");
        Ok(record)
    }

    /// Turns a new, empty folder under a plain parent into an encrypted one, opens
    /// its generation 0 and publishes its first, empty manifest under it.
    pub(crate) async fn create_encrypted_root(
        &self,
        display_name: &str,
        server_url: &str,
    ) -> Result<FileRecord, SyncError> {
        if self.account.private_key.is_none() {
            return Err(SyncError::MissingPrivateKey);
        }
        let mut record = self.create_folder_plain(display_name, server_url).await?;
        let folder_url = record.server_url_file_name();

        self.gateway.mark_encrypted(&record.file_id, true).await?;
        record.e2e_encrypted = true;
        self.store.upsert_file(&record).await?;
        self.store
            .upsert_directory(&DirectoryRecord {
                e2e_encrypted: true,
                ..directory_for(&record, &folder_url)
            })
            .await?;
        let generation = ManifestKey {
            key: self.crypto.generate_metadata_key(),
            index: 0,
        };
        self.remember_folder_key(&folder_url, &generation).await?;

        match self.send_manifest(&folder_url, ManifestMutation::None, false).await? {
            ManifestPush::Skipped => Err(SyncError::MissingDirectory(folder_url)),
            _ => Ok(record),
        }
    }

    /// Deletes one record from an encrypted folder and drops its manifest entry.
    pub(crate) async fn delete_encrypted(&self, record: &FileRecord) -> Result<(), SyncError> {
        require_permission(record, PERMISSION_CAN_DELETE, Permission::Delete)?;
        let held = self
            .locks
            .lock(&self.account, &record.server_url)
            .await?
            .ok_or_else(|| SyncError::MissingDirectory(record.server_url.clone()))?;
        let headers = [(E2E_TOKEN_HEADER, held.token.as_str())];
        if let Err(err) = self.delete_plain(record, &headers).await {
            self.locks.release(&self.account, &record.server_url).await;
            return Err(err);
        }
        if record.server_url == self.account.home() {
            self.locks.release(&self.account, &record.server_url).await;
            return Ok(());
        }
        self.send_manifest(
            &record.server_url,
            ManifestMutation::Delete(vec![record.file_name.clone()]),
            false,
        )
        .await?;
        Ok(())
    }

    /// Renames records of one encrypted folder in a single manifest update.
    pub(crate) async fn rename_encrypted(
        &self,
        renames: &[(FileRecord, String)],
    ) -> Result<(), SyncError> {
        let Some((first, _)) = renames.first() else {
            return Ok(());
        };
        let server_url = first.server_url.clone();
        for (record, _) in renames {
            require_permission(record, PERMISSION_CAN_RENAME, Permission::Modify)?;
        }
        for (record, new_name) in renames {
            if let Some(existing) = self
                .store
                .encryption_by_name(&self.account.id, &server_url, new_name)
                .await?
            {
                if existing.file_name_identifier != record.file_name {
                    return Err(SyncError::FileExists(new_name.clone()));
                }
            }
        }

        let pairs = renames
            .iter()
            .map(|(record, new_name)| (record.file_name.clone(), new_name.clone()))
            .collect();
        self.send_manifest(&server_url, ManifestMutation::Rename(pairs), false)
            .await?;

        for (record, new_name) in renames {
            let mut renamed = record.clone();
            renamed.file_name_view = new_name.clone();
            self.store.upsert_file(&renamed).await?;
            self.store.rename_local_file(&record.oc_id, new_name).await?;
            self.move_cache_artifacts(&record.oc_id, &record.file_name_view, new_name)
                .await;
        }
        Ok(())
    }
}

fn current_folder_key(entries: &[EncryptionEntry]) -> Option<ManifestKey> {
    entries
        .iter()
        .max_by_key(|entry| entry.metadata_key_index)
        .map(|entry| ManifestKey {
            key: entry.metadata_key.clone(),
            index: entry.metadata_key_index,
        })
}
