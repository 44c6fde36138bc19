use ncsync_core::{DavError, codes};
use thiserror::Error;

use super::e2ee::crypto::CryptoError;
use super::index::StoreError;
use super::paths::PathError;

/// Which permission letter an operation needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Delete,
    Modify,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing permission for {0:?}")]
    PermissionDenied(Permission),
    #[error("remote error: {0}")]
    Remote(#[from] DavError),
    #[error("folder manifest cannot be decoded: {0}")]
    ManifestDecode(String),
    #[error("file of {size} bytes exceeds the encrypted upload limit of {max} bytes")]
    FileTooLargeForE2ee { size: u64, max: u64 },
    #[error("folder lock unavailable: {0}")]
    LockUnavailable(DavError),
    #[error("transfer cancelled")]
    TransferCancelled { restart: bool },
    #[error("authentication expired ({status})")]
    AuthExpired { status: i32 },
    #[error("server certificate is not trusted")]
    CertificateUntrusted,
    #[error("{0} already exists")]
    FileExists(String),
    #[error("no directory record for {0}")]
    MissingDirectory(String),
    #[error("account has no end-to-end private key")]
    MissingPrivateKey,
    #[error("upload limiter is closed")]
    ConcurrencyClosed,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

impl SyncError {
    pub fn code(&self) -> i32 {
        match self {
            SyncError::PermissionDenied(Permission::Delete) => codes::NOT_PERMISSION,
            SyncError::Remote(err) | SyncError::LockUnavailable(err) => err.code(),
            SyncError::TransferCancelled { .. } => codes::CANCELLED,
            SyncError::AuthExpired { status } => *status,
            SyncError::CertificateUntrusted => codes::CERTIFICATE_UNTRUSTED,
            _ => codes::INTERNAL,
        }
    }

    /// Localization key, or the server's own message for remote failures.
    pub fn description(&self) -> String {
        let key = match self {
            SyncError::PermissionDenied(Permission::Delete) => "_no_permission_delete_file_",
            SyncError::PermissionDenied(Permission::Modify) => "_no_permission_modify_file_",
            SyncError::Remote(err) => return err.to_string(),
            SyncError::ManifestDecode(_) => "_e2e_error_decode_metadata_",
            SyncError::FileTooLargeForE2ee { .. } => "_e2e_error_file_too_big_",
            SyncError::LockUnavailable(_) => "_e2e_error_lock_",
            SyncError::TransferCancelled { .. } => "_cancelled_",
            SyncError::AuthExpired { .. } => "_error_authentication_",
            SyncError::CertificateUntrusted => "_ssl_certificate_untrusted_",
            SyncError::FileExists(_) => "_file_already_exists_",
            SyncError::Crypto(_) => "_e2e_error_create_encrypted_",
            SyncError::MissingPrivateKey => "_e2e_error_missing_private_key_",
            SyncError::MissingDirectory(_)
            | SyncError::ConcurrencyClosed
            | SyncError::Store(_)
            | SyncError::Io(_)
            | SyncError::Path(_) => "_internal_error_",
        };
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ncsync_core::StatusCode;

    #[test]
    fn remote_errors_keep_http_status() {
        let err = SyncError::from(DavError::api(StatusCode::CONFLICT, "exists"));
        assert_eq!(err.code(), 409);
        assert!(err.description().contains("exists"));
    }

    #[test]
    fn local_preconditions_use_internal_codes() {
        assert_eq!(
            SyncError::PermissionDenied(Permission::Delete).code(),
            codes::NOT_PERMISSION
        );
        let too_big = SyncError::FileTooLargeForE2ee { size: 2, max: 1 };
        assert_eq!(too_big.code(), codes::INTERNAL);
        assert_eq!(too_big.description(), "_e2e_error_file_too_big_");
        assert_eq!(
            SyncError::TransferCancelled { restart: true }.code(),
            codes::CANCELLED
        );
    }
}
