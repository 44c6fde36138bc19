use std::path::{Path, PathBuf};

use ncsync_core::{DavError, E2E_TOKEN_HEADER, UploadReceipt, UploadRequest};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::e2ee::synchronizer::{ManifestMutation, ManifestPush, random_identifier};
use super::engine::SyncEngine;
use super::error::SyncError;
use super::index::{EncryptionEntry, FileRecord, FileStatus, LocalFileRecord};
use super::paths::{cache_dir_for, cached_file_path};
use crate::events::{Completion, SyncEvent};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

impl SyncEngine {
    /// Uploads a pending record whose bytes sit in the cache under its display name.
    /// Inside an encrypted folder the file is encrypted and listed in the folder
    /// manifest first.
    pub async fn upload(
        &self,
        record: &FileRecord,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileRecord, SyncError> {
        let result = self.upload_routed(record, cancel).await;
        let published = match &result {
            Ok(uploaded) => uploaded.clone(),
            Err(_) => record.clone(),
        };
        self.events.publish(SyncEvent::UploadCompleted {
            record: published,
            completion: Completion::from(&result),
        });
        result
    }

    async fn upload_routed(
        &self,
        record: &FileRecord,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileRecord, SyncError> {
        let _permit = self
            .upload_limit
            .acquire()
            .await
            .map_err(|_| SyncError::ConcurrencyClosed)?;

        let local_path =
            cached_file_path(&self.config.cache_root, &record.oc_id, &record.file_name_view)?;
        let local = tokio::fs::metadata(&local_path).await?;
        let forced = record.status == FileStatus::UploadForcedStart;
        let pending = FileRecord {
            content_type: mime_guess::from_path(&record.file_name_view)
                .first()
                .map(|mime| mime.essence_str().to_string())
                .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
            size: i64::try_from(local.len()).unwrap_or(i64::MAX),
            date: local
                .modified()
                .ok()
                .map(|modified| OffsetDateTime::from(modified).unix_timestamp()),
            status: FileStatus::Uploading,
            ..record.clone()
        };

        if self.folder_is_encrypted(&record.server_url).await? {
            return self
                .upload_encrypted(pending, &local_path, local.len(), forced, cancel)
                .await;
        }

        self.store.upsert_file(&pending).await?;
        let result = self.transfer(&pending, &local_path, &[], cancel).await;
        self.settle_upload(pending, forced, result).await
    }

    async fn upload_encrypted(
        &self,
        mut pending: FileRecord,
        local_path: &Path,
        size: u64,
        forced: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileRecord, SyncError> {
        let max = self.config.e2ee_max_file_size;
        if size > max {
            self.store.delete_file(&pending.oc_id).await?;
            warn!(name = %pending.file_name_view, size, max, "file too large for an encrypted folder");
            return Err(SyncError::FileTooLargeForE2ee { size, max });
        }
        if self.account.private_key.is_none() {
            return Err(SyncError::MissingPrivateKey);
        }

        pending.file_name = random_identifier();
        pending.e2e_encrypted = true;
        let encrypted_path: PathBuf =
            cache_dir_for(&self.config.cache_root, &pending.oc_id)?.join(&pending.file_name);
        self.store.upsert_file(&pending).await?;
        if let Err(err) = self.seal_for_upload(&pending, local_path, &encrypted_path).await {
            return Err(self.abandon_encrypted(&pending, &encrypted_path, err).await);
        }

        let token = match self
            .send_manifest(&pending.server_url, ManifestMutation::None, true)
            .await
        {
            Ok(ManifestPush::Retained(token)) => token,
            Ok(_) => {
                let err = SyncError::MissingDirectory(pending.server_url.clone());
                return Err(self.abandon_encrypted(&pending, &encrypted_path, err).await);
            }
            Err(err) => return Err(self.abandon_encrypted(&pending, &encrypted_path, err).await),
        };

        let headers = [(E2E_TOKEN_HEADER, token.as_str())];
        let result = self
            .transfer(&pending, &encrypted_path, &headers, cancel)
            .await;
        self.locks.release(&self.account, &pending.server_url).await;
        remove_file_quietly(&encrypted_path).await;
        self.settle_upload(pending, forced, result).await
    }

    /// Writes the ciphertext next to the plaintext and stores its manifest entry.
    async fn seal_for_upload(
        &self,
        pending: &FileRecord,
        local_path: &Path,
        encrypted_path: &Path,
    ) -> Result<(), SyncError> {
        let plaintext = tokio::fs::read(local_path).await?;
        let (ciphertext, secrets) = self.crypto.encrypt_file(&plaintext)?;
        tokio::fs::write(encrypted_path, &ciphertext).await?;

        let mut entry = EncryptionEntry {
            account: self.account.id.clone(),
            server_url: pending.server_url.clone(),
            file_name_identifier: pending.file_name.clone(),
            file_name: pending.file_name_view.clone(),
            file_name_path: self.entry_path(&pending.server_url, &pending.file_name_view),
            key: secrets.key,
            initialization_vector: secrets.initialization_vector,
            authentication_tag: Some(secrets.authentication_tag),
            mime_type: pending.content_type.clone(),
            ..EncryptionEntry::default()
        };
        self.attach_folder_key(&mut entry).await?;
        self.store.upsert_encryption(&entry).await?;
        Ok(())
    }

    /// Undoes the local entry of an encrypted upload that never reached the transfer.
    async fn abandon_encrypted(
        &self,
        pending: &FileRecord,
        encrypted_path: &Path,
        err: SyncError,
    ) -> SyncError {
        remove_file_quietly(encrypted_path).await;
        if let Err(cleanup) = self
            .store
            .delete_encryption(&self.account.id, &pending.server_url, &pending.file_name)
            .await
        {
            warn!(error = %cleanup, "failed to drop encryption entry of abandoned upload");
        }
        if let Err(cleanup) = self
            .store
            .set_file_status(&pending.oc_id, FileStatus::UploadError, Some(&err.description()))
            .await
        {
            warn!(error = %cleanup, "failed to flag abandoned upload");
        }
        err
    }

    async fn transfer(
        &self,
        pending: &FileRecord,
        local_path: &Path,
        headers: &[(&str, &str)],
        cancel: Option<&CancellationToken>,
    ) -> Result<UploadReceipt, DavError> {
        let server_url_file_name = pending.server_url_file_name();
        let progress = |sent: u64, total: u64| {
            self.events.publish(SyncEvent::TransferProgress {
                account: self.account.id.clone(),
                oc_id: pending.oc_id.clone(),
                server_url: pending.server_url.clone(),
                sent,
                total,
            });
        };
        self.gateway
            .upload(
                UploadRequest {
                    server_url_file_name: &server_url_file_name,
                    local_path,
                    modified: pending.date,
                    headers,
                    cancel,
                },
                &progress,
            )
            .await
    }

    async fn settle_upload(
        &self,
        pending: FileRecord,
        forced: bool,
        result: Result<UploadReceipt, DavError>,
    ) -> Result<FileRecord, SyncError> {
        let err = match result {
            Ok(receipt) => return self.finalize_upload(pending, receipt).await,
            Err(err) => err,
        };

        if matches!(err, DavError::Cancelled) {
            if forced {
                self.store
                    .set_file_status(&pending.oc_id, FileStatus::WaitUpload, None)
                    .await?;
            } else {
                self.remove_cache_dir(&pending.oc_id).await;
                self.store.delete_file(&pending.oc_id).await?;
            }
            info!(name = %pending.file_name_view, restart = forced, "upload cancelled");
            return Err(SyncError::TransferCancelled { restart: forced });
        }

        let code = err.code();
        let failure = if code == 401 || code == 403 {
            self.events.publish(SyncEvent::AuthExpired {
                account: self.account.id.clone(),
                status: code,
            });
            SyncError::AuthExpired { status: code }
        } else if matches!(err, DavError::CertificateUntrusted) {
            self.store
                .set_certificate_error(&self.account.id, true)
                .await?;
            SyncError::CertificateUntrusted
        } else {
            SyncError::Remote(err)
        };
        warn!(name = %pending.file_name_view, error = %failure, "upload failed");
        self.store
            .set_file_status(
                &pending.oc_id,
                FileStatus::UploadError,
                Some(&failure.description()),
            )
            .await?;
        Err(failure)
    }

    async fn finalize_upload(
        &self,
        pending: FileRecord,
        receipt: UploadReceipt,
    ) -> Result<FileRecord, SyncError> {
        if receipt.oc_id != pending.oc_id {
            self.move_cache_dir(&pending.oc_id, &receipt.oc_id).await?;
            self.store.delete_file(&pending.oc_id).await?;
        }
        let uploaded = FileRecord {
            oc_id: receipt.oc_id,
            etag: receipt.etag,
            date: receipt.date.or(pending.date),
            status: FileStatus::Normal,
            session: None,
            session_error: None,
            session_task_identifier: None,
            ..pending
        };
        self.store.upsert_file(&uploaded).await?;
        self.store
            .upsert_local_file(&LocalFileRecord {
                oc_id: uploaded.oc_id.clone(),
                account: uploaded.account.clone(),
                file_name: uploaded.file_name_view.clone(),
                etag: uploaded.etag.clone(),
                date: uploaded.date,
            })
            .await?;
        info!(name = %uploaded.file_name_view, oc_id = %uploaded.oc_id, "upload finished");
        Ok(uploaded)
    }

    async fn move_cache_dir(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let source = cache_dir_for(&self.config.cache_root, from)?;
        let target = cache_dir_for(&self.config.cache_root, to)?;
        self.remove_cache_dir(to).await;
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove temporary file");
        }
    }
}

#[cfg(test)]
#[path = "upload_tests.rs"]
mod tests;
