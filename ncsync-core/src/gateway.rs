use std::path::Path;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Numeric codes carried by completions. HTTP statuses pass through unchanged.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const PATH_NOT_FOUND: i32 = 404;
    pub const CANCELLED: i32 = -999;
    pub const TIMED_OUT: i32 = -1001;
    pub const CANNOT_CONNECT: i32 = -1004;
    pub const CERTIFICATE_UNTRUSTED: i32 = -1202;
    pub const TRANSPORT: i32 = -1;
    pub const NOT_PERMISSION: i32 = -99997;
    pub const INTERNAL: i32 = -99999;
}

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{0} does not belong to this server")]
    ForeignUrl(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed multistatus response: {0}")]
    Xml(String),
    #[error("response missing {0}")]
    MissingField(&'static str),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("request timed out")]
    TimedOut,
    #[error("server certificate is not trusted")]
    CertificateUntrusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Locked,
    Transient,
    Permanent,
}

impl From<reqwest::Error> for DavError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() && tls_rejected(&err) {
            DavError::CertificateUntrusted
        } else {
            DavError::Request(err)
        }
    }
}

impl DavError {
    pub fn api(status: StatusCode, body: impl Into<String>) -> Self {
        DavError::Api {
            status,
            body: body.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DavError::Api { status, .. } => i32::from(status.as_u16()),
            DavError::Cancelled => codes::CANCELLED,
            DavError::TimedOut => codes::TIMED_OUT,
            DavError::CertificateUntrusted => codes::CERTIFICATE_UNTRUSTED,
            DavError::Request(err) if err.is_timeout() => codes::TIMED_OUT,
            DavError::Request(err) if err.is_connect() => codes::CANNOT_CONNECT,
            DavError::Request(_) => codes::TRANSPORT,
            DavError::Url(_)
            | DavError::ForeignUrl(_)
            | DavError::Io(_)
            | DavError::Xml(_)
            | DavError::MissingField(_) => codes::INTERNAL,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DavError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            DavError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            DavError::TimedOut => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::Locked | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::LOCKED {
        ApiErrorClass::Locked
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// rustls reports a refused handshake, an untrusted chain included, as an
/// `InvalidData` I/O error somewhere below the connect error.
fn tls_rejected(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::InvalidData {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn as_header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// One PROPFIND response entry, already split into parent folder URL and name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DavEntry {
    pub server_url: String,
    pub file_name: String,
    pub oc_id: String,
    pub file_id: String,
    pub etag: String,
    pub content_type: String,
    pub size: i64,
    pub date: Option<i64>,
    pub directory: bool,
    pub favorite: bool,
    pub e2e_encrypted: bool,
    pub permissions: String,
    pub rich_workspace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedFolder {
    pub oc_id: Option<String>,
    pub date: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestMethod {
    Post,
    Put,
}

impl ManifestMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestMethod::Post => "POST",
            ManifestMethod::Put => "PUT",
        }
    }
}

pub struct UploadRequest<'a> {
    pub server_url_file_name: &'a str,
    pub local_path: &'a Path,
    pub modified: Option<i64>,
    pub headers: &'a [(&'a str, &'a str)],
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub oc_id: String,
    pub etag: String,
    pub date: Option<i64>,
    pub size: u64,
}

/// Called with `(bytes_sent, bytes_total)` while a transfer is running.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Remote operations the sync engine relies on. Each call completes exactly once.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn list(
        &self,
        server_url: &str,
        depth: Depth,
        show_hidden: bool,
    ) -> Result<Vec<DavEntry>, DavError>;

    async fn create_folder(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<CreatedFolder, DavError>;

    async fn delete(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), DavError>;

    async fn move_item(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), DavError>;

    async fn copy_item(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<(), DavError>;

    /// `file_path` is relative to the account's WebDAV home.
    async fn set_favorite(&self, file_path: &str, favorite: bool) -> Result<(), DavError>;

    /// Acquires (or renews, when `token` is set) the folder lock. With `delete` the lock
    /// is released and `None` is returned.
    async fn lock_folder(
        &self,
        file_id: &str,
        token: Option<&str>,
        delete: bool,
    ) -> Result<Option<String>, DavError>;

    /// `Ok(None)` when the folder has no manifest yet.
    async fn get_manifest(&self, file_id: &str, token: &str) -> Result<Option<String>, DavError>;

    async fn put_manifest(
        &self,
        file_id: &str,
        token: &str,
        manifest: &str,
        method: ManifestMethod,
    ) -> Result<(), DavError>;

    async fn mark_encrypted(&self, file_id: &str, encrypted: bool) -> Result<(), DavError>;

    async fn upload(
        &self,
        request: UploadRequest<'_>,
        progress: ProgressFn<'_>,
    ) -> Result<UploadReceipt, DavError>;
}
