use std::{fs, path::Path};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStatus {
    #[default]
    Normal,
    WaitUpload,
    Uploading,
    UploadError,
    WaitDownload,
    Downloading,
    DownloadError,
    UploadForcedStart,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Normal => "normal",
            FileStatus::WaitUpload => "wait_upload",
            FileStatus::Uploading => "uploading",
            FileStatus::UploadError => "upload_error",
            FileStatus::WaitDownload => "wait_download",
            FileStatus::Downloading => "downloading",
            FileStatus::DownloadError => "download_error",
            FileStatus::UploadForcedStart => "upload_forced_start",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "normal" => Ok(FileStatus::Normal),
            "wait_upload" => Ok(FileStatus::WaitUpload),
            "uploading" => Ok(FileStatus::Uploading),
            "upload_error" => Ok(FileStatus::UploadError),
            "wait_download" => Ok(FileStatus::WaitDownload),
            "downloading" => Ok(FileStatus::Downloading),
            "download_error" => Ok(FileStatus::DownloadError),
            "upload_forced_start" => Ok(FileStatus::UploadForcedStart),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// One remote file or folder as last seen by the client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileRecord {
    pub oc_id: String,
    pub file_id: String,
    pub account: String,
    pub server_url: String,
    /// Name on the wire; a random identifier inside encrypted folders.
    pub file_name: String,
    pub file_name_view: String,
    pub directory: bool,
    pub status: FileStatus,
    pub content_type: String,
    pub size: i64,
    pub date: Option<i64>,
    pub etag: String,
    pub favorite: bool,
    pub e2e_encrypted: bool,
    pub permissions: String,
    pub rich_workspace: Option<String>,
    pub session: Option<String>,
    pub session_error: Option<String>,
    pub session_task_identifier: Option<i64>,
}

impl FileRecord {
    pub fn server_url_file_name(&self) -> String {
        format!("{}/{}", self.server_url, self.file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryRecord {
    pub account: String,
    pub server_url: String,
    pub oc_id: String,
    pub file_id: String,
    pub e2e_encrypted: bool,
    pub favorite: bool,
    pub etag: String,
    pub permissions: String,
    pub rich_workspace: Option<String>,
    pub date_read: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncryptionEntry {
    pub account: String,
    pub server_url: String,
    pub file_name_identifier: String,
    pub file_name: String,
    pub file_name_path: String,
    pub key: String,
    pub initialization_vector: String,
    pub authentication_tag: Option<String>,
    pub metadata_key: String,
    pub metadata_key_index: i64,
    pub mime_type: String,
    pub version: i64,
}

/// Metadata key generation that encrypts one folder's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderKey {
    pub metadata_key: String,
    pub metadata_key_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub account: String,
    pub server_url: String,
    pub file_id: String,
    pub e2e_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileRecord {
    pub oc_id: String,
    pub account: String,
    pub file_name: String,
    pub etag: String,
    pub date: Option<i64>,
}

const FILE_COLUMNS: &str = "oc_id, file_id, account, server_url, file_name, file_name_view, directory, status, content_type, size, date, etag, favorite, e2e_encrypted, permissions, rich_workspace, session, session_error, session_task_identifier";
const DIRECTORY_COLUMNS: &str = "account, server_url, oc_id, file_id, e2e_encrypted, favorite, etag, permissions, rich_workspace, date_read";
const ENCRYPTION_COLUMNS: &str = "account, server_url, file_name_identifier, file_name, file_name_path, key, initialization_vector, authentication_tag, metadata_key, metadata_key_index, mime_type, version";

// Matches `?2` itself or anything below it, without LIKE wildcard surprises.
const SUBTREE_FILTER: &str =
    "account = ?1 AND (server_url = ?2 OR substr(server_url, 1, length(?2) + 1) = ?2 || '/')";

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metadata (
                oc_id, file_id, account, server_url, file_name, file_name_view, directory,
                status, content_type, size, date, etag, favorite, e2e_encrypted, permissions,
                rich_workspace, session, session_error, session_task_identifier
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(oc_id) DO UPDATE SET
                file_id = excluded.file_id,
                account = excluded.account,
                server_url = excluded.server_url,
                file_name = excluded.file_name,
                file_name_view = excluded.file_name_view,
                directory = excluded.directory,
                status = excluded.status,
                content_type = excluded.content_type,
                size = excluded.size,
                date = excluded.date,
                etag = excluded.etag,
                favorite = excluded.favorite,
                e2e_encrypted = excluded.e2e_encrypted,
                permissions = excluded.permissions,
                rich_workspace = excluded.rich_workspace,
                session = excluded.session,
                session_error = excluded.session_error,
                session_task_identifier = excluded.session_task_identifier",
        )
        .bind(&file.oc_id)
        .bind(&file.file_id)
        .bind(&file.account)
        .bind(&file.server_url)
        .bind(&file.file_name)
        .bind(&file.file_name_view)
        .bind(flag_value(file.directory))
        .bind(file.status.as_str())
        .bind(&file.content_type)
        .bind(file.size)
        .bind(file.date)
        .bind(&file.etag)
        .bind(flag_value(file.favorite))
        .bind(flag_value(file.e2e_encrypted))
        .bind(&file.permissions)
        .bind(&file.rich_workspace)
        .bind(&file.session)
        .bind(&file.session_error)
        .bind(file.session_task_identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, oc_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM metadata WHERE oc_id = ?1"))
            .bind(oc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_file_by_name(
        &self,
        account: &str,
        server_url: &str,
        file_name: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM metadata
             WHERE account = ?1 AND server_url = ?2 AND file_name = ?3
             LIMIT 1"
        ))
        .bind(account)
        .bind(server_url)
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_file_by_view_name(
        &self,
        account: &str,
        server_url: &str,
        file_name_view: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM metadata
             WHERE account = ?1 AND server_url = ?2 AND file_name_view = ?3
             LIMIT 1"
        ))
        .bind(account)
        .bind(server_url)
        .bind(file_name_view)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn files_in(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM metadata
             WHERE account = ?1 AND server_url = ?2
             ORDER BY file_name_view ASC"
        ))
        .bind(account)
        .bind(server_url)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Records of the folder that are mid-transfer or failed, i.e. not `normal`.
    pub async fn pending_files_in(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM metadata
             WHERE account = ?1 AND server_url = ?2 AND status != 'normal'"
        ))
        .bind(account)
        .bind(server_url)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn delete_settled_files_in(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM metadata WHERE account = ?1 AND server_url = ?2 AND status = 'normal'",
        )
        .bind(account)
        .bind(server_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_file(&self, oc_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM metadata WHERE oc_id = ?1")
            .bind(oc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM local_files WHERE oc_id = ?1")
            .bind(oc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_file_status(
        &self,
        oc_id: &str,
        status: FileStatus,
        session_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE metadata
             SET status = ?2, session = NULL, session_error = ?3, session_task_identifier = NULL
             WHERE oc_id = ?1",
        )
        .bind(oc_id)
        .bind(status.as_str())
        .bind(session_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes the folder at `server_url` and every record below it. Returns the
    /// ocIds of the removed file records so callers can drop their caches.
    pub async fn delete_subtree(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!("SELECT oc_id FROM metadata WHERE {SUBTREE_FILTER}"))
            .bind(account)
            .bind(server_url)
            .fetch_all(&mut *tx)
            .await?;
        let mut removed = Vec::with_capacity(rows.len());
        for row in rows {
            let oc_id: String = row.try_get("oc_id")?;
            sqlx::query("DELETE FROM local_files WHERE oc_id = ?1")
                .bind(&oc_id)
                .execute(&mut *tx)
                .await?;
            removed.push(oc_id);
        }
        for table in ["metadata", "directories", "e2e_encryption", "e2e_locks"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE {SUBTREE_FILTER}"))
                .bind(account)
                .bind(server_url)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Rewrites `from` and every descendant folder URL to live under `to`.
    pub async fn rewrite_prefix(&self, account: &str, from: &str, to: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["metadata", "directories", "e2e_encryption", "e2e_locks"] {
            sqlx::query(&format!(
                "UPDATE {table} SET server_url = ?3 || substr(server_url, length(?2) + 1)
                 WHERE {SUBTREE_FILTER}"
            ))
            .bind(account)
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_directory(&self, directory: &DirectoryRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO directories (
                account, server_url, oc_id, file_id, e2e_encrypted, favorite, etag,
                permissions, rich_workspace, date_read
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(account, server_url) DO UPDATE SET
                oc_id = excluded.oc_id,
                file_id = excluded.file_id,
                e2e_encrypted = excluded.e2e_encrypted,
                favorite = excluded.favorite,
                etag = excluded.etag,
                permissions = excluded.permissions,
                rich_workspace = excluded.rich_workspace,
                date_read = excluded.date_read",
        )
        .bind(&directory.account)
        .bind(&directory.server_url)
        .bind(&directory.oc_id)
        .bind(&directory.file_id)
        .bind(flag_value(directory.e2e_encrypted))
        .bind(flag_value(directory.favorite))
        .bind(&directory.etag)
        .bind(&directory.permissions)
        .bind(&directory.rich_workspace)
        .bind(directory.date_read)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_directory(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Option<DirectoryRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DIRECTORY_COLUMNS} FROM directories WHERE account = ?1 AND server_url = ?2"
        ))
        .bind(account)
        .bind(server_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(directory_from_row).transpose()
    }

    pub async fn set_date_read(
        &self,
        account: &str,
        server_url: &str,
        date_read: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE directories SET date_read = ?3 WHERE account = ?1 AND server_url = ?2")
            .bind(account)
            .bind(server_url)
            .bind(date_read)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the manifest generation of an already stored folder. Returns whether
    /// a directory row was updated.
    pub async fn set_folder_key(
        &self,
        account: &str,
        server_url: &str,
        key: &FolderKey,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE directories SET metadata_key = ?3, metadata_key_index = ?4
             WHERE account = ?1 AND server_url = ?2",
        )
        .bind(account)
        .bind(server_url)
        .bind(&key.metadata_key)
        .bind(key.metadata_key_index)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn folder_key(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Option<FolderKey>, StoreError> {
        let row = sqlx::query(
            "SELECT metadata_key, metadata_key_index FROM directories
             WHERE account = ?1 AND server_url = ?2 AND metadata_key IS NOT NULL",
        )
        .bind(account)
        .bind(server_url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(FolderKey {
            metadata_key: row.try_get("metadata_key")?,
            metadata_key_index: row
                .try_get::<Option<i64>, _>("metadata_key_index")?
                .unwrap_or_default(),
        }))
    }

    pub async fn upsert_encryption(&self, entry: &EncryptionEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO e2e_encryption (
                account, server_url, file_name_identifier, file_name, file_name_path, key,
                initialization_vector, authentication_tag, metadata_key, metadata_key_index,
                mime_type, version
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(account, server_url, file_name_identifier) DO UPDATE SET
                file_name = excluded.file_name,
                file_name_path = excluded.file_name_path,
                key = excluded.key,
                initialization_vector = excluded.initialization_vector,
                authentication_tag = excluded.authentication_tag,
                metadata_key = excluded.metadata_key,
                metadata_key_index = excluded.metadata_key_index,
                mime_type = excluded.mime_type,
                version = excluded.version",
        )
        .bind(&entry.account)
        .bind(&entry.server_url)
        .bind(&entry.file_name_identifier)
        .bind(&entry.file_name)
        .bind(&entry.file_name_path)
        .bind(&entry.key)
        .bind(&entry.initialization_vector)
        .bind(&entry.authentication_tag)
        .bind(&entry.metadata_key)
        .bind(entry.metadata_key_index)
        .bind(&entry.mime_type)
        .bind(entry.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_encryption(
        &self,
        account: &str,
        server_url: &str,
        file_name_identifier: &str,
    ) -> Result<Option<EncryptionEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENCRYPTION_COLUMNS} FROM e2e_encryption
             WHERE account = ?1 AND server_url = ?2 AND file_name_identifier = ?3"
        ))
        .bind(account)
        .bind(server_url)
        .bind(file_name_identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(encryption_from_row).transpose()
    }

    pub async fn encryption_by_name(
        &self,
        account: &str,
        server_url: &str,
        file_name: &str,
    ) -> Result<Option<EncryptionEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENCRYPTION_COLUMNS} FROM e2e_encryption
             WHERE account = ?1 AND server_url = ?2 AND file_name = ?3
             LIMIT 1"
        ))
        .bind(account)
        .bind(server_url)
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(encryption_from_row).transpose()
    }

    pub async fn encryption_entries(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Vec<EncryptionEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENCRYPTION_COLUMNS} FROM e2e_encryption
             WHERE account = ?1 AND server_url = ?2
             ORDER BY file_name_identifier ASC"
        ))
        .bind(account)
        .bind(server_url)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(encryption_from_row).collect()
    }

    pub async fn rename_encryption(
        &self,
        account: &str,
        server_url: &str,
        file_name_identifier: &str,
        file_name: &str,
        file_name_path: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE e2e_encryption SET file_name = ?4, file_name_path = ?5
             WHERE account = ?1 AND server_url = ?2 AND file_name_identifier = ?3",
        )
        .bind(account)
        .bind(server_url)
        .bind(file_name_identifier)
        .bind(file_name)
        .bind(file_name_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_encryption(
        &self,
        account: &str,
        server_url: &str,
        file_name_identifier: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM e2e_encryption
             WHERE account = ?1 AND server_url = ?2 AND file_name_identifier = ?3",
        )
        .bind(account)
        .bind(server_url)
        .bind(file_name_identifier)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_lock(
        &self,
        account: &str,
        server_url: &str,
    ) -> Result<Option<LockToken>, StoreError> {
        let row = sqlx::query(
            "SELECT account, server_url, file_id, e2e_token FROM e2e_locks
             WHERE account = ?1 AND server_url = ?2",
        )
        .bind(account)
        .bind(server_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    pub async fn set_lock(&self, lock: &LockToken) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO e2e_locks (account, server_url, file_id, e2e_token)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account, server_url) DO UPDATE SET
                file_id = excluded.file_id,
                e2e_token = excluded.e2e_token",
        )
        .bind(&lock.account)
        .bind(&lock.server_url)
        .bind(&lock.file_id)
        .bind(&lock.e2e_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_lock(&self, account: &str, server_url: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM e2e_locks WHERE account = ?1 AND server_url = ?2")
            .bind(account)
            .bind(server_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn locks(&self, account: &str) -> Result<Vec<LockToken>, StoreError> {
        let rows = sqlx::query(
            "SELECT account, server_url, file_id, e2e_token FROM e2e_locks
             WHERE account = ?1 ORDER BY server_url ASC",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }

    pub async fn upsert_local_file(&self, local: &LocalFileRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO local_files (oc_id, account, file_name, etag, date)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(oc_id) DO UPDATE SET
                account = excluded.account,
                file_name = excluded.file_name,
                etag = excluded.etag,
                date = excluded.date",
        )
        .bind(&local.oc_id)
        .bind(&local.account)
        .bind(&local.file_name)
        .bind(&local.etag)
        .bind(local.date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_local_file(&self, oc_id: &str) -> Result<Option<LocalFileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT oc_id, account, file_name, etag, date FROM local_files WHERE oc_id = ?1",
        )
        .bind(oc_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LocalFileRecord {
            oc_id: row.try_get("oc_id")?,
            account: row.try_get("account")?,
            file_name: row.try_get("file_name")?,
            etag: row.try_get("etag")?,
            date: row.try_get("date")?,
        }))
    }

    pub async fn rename_local_file(&self, oc_id: &str, file_name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE local_files SET file_name = ?2 WHERE oc_id = ?1")
            .bind(oc_id)
            .bind(file_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_certificate_error(&self, account: &str, error: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO account_flags (account, certificate_error) VALUES (?1, ?2)
             ON CONFLICT(account) DO UPDATE SET certificate_error = excluded.certificate_error",
        )
        .bind(account)
        .bind(flag_value(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn certificate_error(&self, account: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT certificate_error FROM account_flags WHERE account = ?1")
            .bind(account)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(flag(&row, "certificate_error")?),
            None => Ok(false),
        }
    }
}

fn flag_value(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn flag(row: &SqliteRow, column: &str) -> Result<bool, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    Ok(value != 0)
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(FileRecord {
        oc_id: row.try_get("oc_id")?,
        file_id: row.try_get("file_id")?,
        account: row.try_get("account")?,
        server_url: row.try_get("server_url")?,
        file_name: row.try_get("file_name")?,
        file_name_view: row.try_get("file_name_view")?,
        directory: flag(row, "directory")?,
        status: FileStatus::parse(&status)?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        date: row.try_get("date")?,
        etag: row.try_get("etag")?,
        favorite: flag(row, "favorite")?,
        e2e_encrypted: flag(row, "e2e_encrypted")?,
        permissions: row.try_get("permissions")?,
        rich_workspace: row.try_get("rich_workspace")?,
        session: row.try_get("session")?,
        session_error: row.try_get("session_error")?,
        session_task_identifier: row.try_get("session_task_identifier")?,
    })
}

fn directory_from_row(row: &SqliteRow) -> Result<DirectoryRecord, StoreError> {
    Ok(DirectoryRecord {
        account: row.try_get("account")?,
        server_url: row.try_get("server_url")?,
        oc_id: row.try_get("oc_id")?,
        file_id: row.try_get("file_id")?,
        e2e_encrypted: flag(row, "e2e_encrypted")?,
        favorite: flag(row, "favorite")?,
        etag: row.try_get("etag")?,
        permissions: row.try_get("permissions")?,
        rich_workspace: row.try_get("rich_workspace")?,
        date_read: row.try_get("date_read")?,
    })
}

fn encryption_from_row(row: &SqliteRow) -> Result<EncryptionEntry, StoreError> {
    Ok(EncryptionEntry {
        account: row.try_get("account")?,
        server_url: row.try_get("server_url")?,
        file_name_identifier: row.try_get("file_name_identifier")?,
        file_name: row.try_get("file_name")?,
        file_name_path: row.try_get("file_name_path")?,
        key: row.try_get("key")?,
        initialization_vector: row.try_get("initialization_vector")?,
        authentication_tag: row.try_get("authentication_tag")?,
        metadata_key: row.try_get("metadata_key")?,
        metadata_key_index: row.try_get("metadata_key_index")?,
        mime_type: row.try_get("mime_type")?,
        version: row.try_get("version")?,
    })
}

fn lock_from_row(row: &SqliteRow) -> Result<LockToken, StoreError> {
    Ok(LockToken {
        account: row.try_get("account")?,
        server_url: row.try_get("server_url")?,
        file_id: row.try_get("file_id")?,
        e2e_token: row.try_get("e2e_token")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "alice https://cloud.example";
    const HOME: &str = "https://cloud.example/remote.php/webdav";

    async fn make_store() -> MetadataStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn file(oc_id: &str, server_url: &str, name: &str) -> FileRecord {
        FileRecord {
            oc_id: oc_id.into(),
            file_id: oc_id.into(),
            account: ACCOUNT.into(),
            server_url: server_url.into(),
            file_name: name.into(),
            file_name_view: name.into(),
            ..FileRecord::default()
        }
    }

    fn directory(server_url: &str) -> DirectoryRecord {
        DirectoryRecord {
            account: ACCOUNT.into(),
            server_url: server_url.into(),
            oc_id: format!("oc-{server_url}"),
            file_id: "1".into(),
            ..DirectoryRecord::default()
        }
    }

    #[tokio::test]
    async fn upsert_and_fetch_file() {
        let store = make_store().await;
        let mut record = file("oc1", HOME, "a.txt");
        record.size = 12;
        record.date = Some(1_700_000_000);
        record.status = FileStatus::UploadError;
        record.session_error = Some("boom".into());

        store.upsert_file(&record).await.unwrap();
        assert_eq!(store.get_file("oc1").await.unwrap(), Some(record.clone()));

        record.file_name_view = "b.txt".into();
        store.upsert_file(&record).await.unwrap();
        let fetched = store.get_file("oc1").await.unwrap().unwrap();
        assert_eq!(fetched.file_name_view, "b.txt");
    }

    #[tokio::test]
    async fn settled_delete_keeps_pending_records() {
        let store = make_store().await;
        let settled = file("oc1", HOME, "a.txt");
        let mut pending = file("oc2", HOME, "b.txt");
        pending.status = FileStatus::Uploading;
        store.upsert_file(&settled).await.unwrap();
        store.upsert_file(&pending).await.unwrap();

        assert_eq!(store.delete_settled_files_in(ACCOUNT, HOME).await.unwrap(), 1);
        let left = store.files_in(ACCOUNT, HOME).await.unwrap();
        assert_eq!(left, vec![pending.clone()]);
        assert_eq!(store.pending_files_in(ACCOUNT, HOME).await.unwrap(), vec![pending]);
    }

    #[tokio::test]
    async fn subtree_delete_leaves_no_orphans() {
        let store = make_store().await;
        let docs = format!("{HOME}/Docs");
        let nested = format!("{docs}/Deep");
        let sibling = format!("{HOME}/Docs2");

        store.upsert_file(&file("docs", HOME, "Docs")).await.unwrap();
        store.upsert_file(&file("inner", &docs, "a.txt")).await.unwrap();
        store.upsert_file(&file("deep", &nested, "b.txt")).await.unwrap();
        store.upsert_file(&file("other", &sibling, "c.txt")).await.unwrap();
        store.upsert_directory(&directory(&docs)).await.unwrap();
        store.upsert_directory(&directory(&nested)).await.unwrap();
        store.upsert_directory(&directory(&sibling)).await.unwrap();

        let mut removed = store.delete_subtree(ACCOUNT, &docs).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["deep".to_string(), "inner".to_string()]);

        assert!(store.get_directory(ACCOUNT, &docs).await.unwrap().is_none());
        assert!(store.get_directory(ACCOUNT, &nested).await.unwrap().is_none());
        assert!(store.get_file("inner").await.unwrap().is_none());
        assert!(store.get_file("deep").await.unwrap().is_none());
        assert!(store.get_directory(ACCOUNT, &sibling).await.unwrap().is_some());
        assert!(store.get_file("other").await.unwrap().is_some());
        // The folder's own record lives in its parent and is removed by the caller.
        assert!(store.get_file("docs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rewrite_prefix_moves_descendants_only() {
        let store = make_store().await;
        let docs = format!("{HOME}/Docs");
        let renamed = format!("{HOME}/Papers");
        store.upsert_file(&file("inner", &format!("{docs}/Deep"), "a.txt")).await.unwrap();
        store.upsert_file(&file("other", &format!("{HOME}/Docs2"), "b.txt")).await.unwrap();
        store.upsert_directory(&directory(&docs)).await.unwrap();

        store.rewrite_prefix(ACCOUNT, &docs, &renamed).await.unwrap();

        let inner = store.get_file("inner").await.unwrap().unwrap();
        assert_eq!(inner.server_url, format!("{renamed}/Deep"));
        let other = store.get_file("other").await.unwrap().unwrap();
        assert_eq!(other.server_url, format!("{HOME}/Docs2"));
        assert!(store.get_directory(ACCOUNT, &renamed).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn encryption_entries_rename_and_delete() {
        let store = make_store().await;
        let entry = EncryptionEntry {
            account: ACCOUNT.into(),
            server_url: HOME.into(),
            file_name_identifier: "id1".into(),
            file_name: "a.jpg".into(),
            key: "k".into(),
            initialization_vector: "iv".into(),
            metadata_key: "mk".into(),
            version: 1,
            ..EncryptionEntry::default()
        };
        store.upsert_encryption(&entry).await.unwrap();

        let renamed = store
            .rename_encryption(ACCOUNT, HOME, "id1", "b.jpg", "/b.jpg")
            .await
            .unwrap();
        assert_eq!(renamed, 1);
        let found = store.encryption_by_name(ACCOUNT, HOME, "b.jpg").await.unwrap();
        assert_eq!(found.map(|e| e.file_name_identifier), Some("id1".to_string()));

        assert_eq!(store.delete_encryption(ACCOUNT, HOME, "id1").await.unwrap(), 1);
        assert!(store.encryption_entries(ACCOUNT, HOME).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_lock_per_folder() {
        let store = make_store().await;
        let mut lock = LockToken {
            account: ACCOUNT.into(),
            server_url: HOME.into(),
            file_id: "1".into(),
            e2e_token: "t1".into(),
        };
        store.set_lock(&lock).await.unwrap();
        lock.e2e_token = "t2".into();
        store.set_lock(&lock).await.unwrap();

        assert_eq!(store.locks(ACCOUNT).await.unwrap(), vec![lock]);
        store.delete_lock(ACCOUNT, HOME).await.unwrap();
        assert!(store.get_lock(ACCOUNT, HOME).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn folder_key_survives_directory_refresh() {
        let store = make_store().await;
        let secret = format!("{HOME}/Secret");
        let key = FolderKey {
            metadata_key: "bWV0YQ==".into(),
            metadata_key_index: 0,
        };
        assert!(!store.set_folder_key(ACCOUNT, &secret, &key).await.unwrap());

        store.upsert_directory(&directory(&secret)).await.unwrap();
        assert!(store.folder_key(ACCOUNT, &secret).await.unwrap().is_none());
        assert!(store.set_folder_key(ACCOUNT, &secret, &key).await.unwrap());
        store
            .upsert_directory(&DirectoryRecord {
                etag: "new".into(),
                ..directory(&secret)
            })
            .await
            .unwrap();

        assert_eq!(store.folder_key(ACCOUNT, &secret).await.unwrap(), Some(key));
        store.delete_subtree(ACCOUNT, &secret).await.unwrap();
        assert!(store.folder_key(ACCOUNT, &secret).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn certificate_flag_defaults_to_false() {
        let store = make_store().await;
        assert!(!store.certificate_error(ACCOUNT).await.unwrap());
        store.set_certificate_error(ACCOUNT, true).await.unwrap();
        assert!(store.certificate_error(ACCOUNT).await.unwrap());
    }

    #[test]
    fn status_roundtrips_and_rejects_unknown() {
        assert_eq!(
            FileStatus::parse(FileStatus::UploadForcedStart.as_str()).unwrap(),
            FileStatus::UploadForcedStart
        );
        assert!(matches!(
            FileStatus::parse("paused"),
            Err(StoreError::InvalidStatus(_))
        ));
    }
}
