use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ncsync_core::{
    CreatedFolder, DavEntry, DavError, Depth, ManifestMethod, ProgressFn, RemoteGateway,
    StatusCode, UploadReceipt, UploadRequest,
};
use sqlx::SqlitePool;

use crate::account::Account;
use crate::events::EventBus;
use crate::sync::e2ee::crypto::ChaChaCrypto;
use crate::sync::engine::{EngineConfig, SyncEngine};
use crate::sync::index::{DirectoryRecord, FileRecord, MetadataStore};

pub(crate) const BASE_URL: &str = "https://cloud.example";
pub(crate) const PRIVATE_KEY: &[u8] = b"test-private-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    List { url: String, depth: Depth },
    CreateFolder { url: String, token: Option<String> },
    Delete { url: String, token: Option<String> },
    Move { source: String, destination: String },
    Copy { source: String, destination: String },
    Favorite { path: String, favorite: bool },
    Lock { file_id: String, token: Option<String> },
    Unlock { file_id: String, token: Option<String> },
    GetManifest { file_id: String },
    PutManifest { file_id: String, method: ManifestMethod },
    MarkEncrypted { file_id: String },
    Upload { url: String, token: Option<String> },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    Status(u16),
    Cancelled,
    Certificate,
}

impl Failure {
    fn to_error(self) -> DavError {
        match self {
            Failure::Status(code) => DavError::api(
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "fake failure",
            ),
            Failure::Cancelled => DavError::Cancelled,
            Failure::Certificate => DavError::CertificateUntrusted,
        }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    listings: HashMap<String, Vec<DavEntry>>,
    items: HashMap<String, DavEntry>,
    failures: HashMap<String, Failure>,
    manifests: HashMap<String, String>,
    active_locks: HashMap<String, String>,
    issued_tokens: u32,
}

/// In-memory gateway that records every call and answers from canned state.
#[derive(Default)]
pub(crate) struct FakeGateway {
    state: Mutex<FakeState>,
}

fn token_of(headers: &[(&str, &str)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("e2e-token"))
        .map(|(_, value)| value.to_string())
}

pub(crate) fn dav_entry(server_url: &str, file_name: &str, oc_id: &str) -> DavEntry {
    DavEntry {
        server_url: server_url.to_string(),
        file_name: file_name.to_string(),
        oc_id: oc_id.to_string(),
        file_id: format!("fid-{oc_id}"),
        etag: format!("etag-{oc_id}"),
        ..DavEntry::default()
    }
}

impl FakeGateway {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| matches(call)).count()
    }

    pub(crate) fn set_listing(&self, server_url: &str, entries: Vec<DavEntry>) {
        self.state().listings.insert(server_url.to_string(), entries);
    }

    pub(crate) fn set_item(&self, entry: DavEntry) {
        let url = format!("{}/{}", entry.server_url, entry.file_name);
        self.state().items.insert(url, entry);
    }

    /// Keys look like `"delete:<url>"`, `"lock:<file_id>"`, `"upload:<url>"`.
    pub(crate) fn fail(&self, key: &str, failure: Failure) {
        self.state().failures.insert(key.to_string(), failure);
    }

    pub(crate) fn manifest(&self, file_id: &str) -> Option<String> {
        self.state().manifests.get(file_id).cloned()
    }

    pub(crate) fn set_manifest(&self, file_id: &str, blob: &str) {
        self.state()
            .manifests
            .insert(file_id.to_string(), blob.to_string());
    }

    pub(crate) fn active_locks(&self) -> usize {
        self.state().active_locks.len()
    }

    fn check(&self, key: String) -> Result<(), DavError> {
        match self.state().failures.get(&key) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn list(
        &self,
        server_url: &str,
        depth: Depth,
        _show_hidden: bool,
    ) -> Result<Vec<DavEntry>, DavError> {
        self.record(Call::List {
            url: server_url.to_string(),
            depth,
        });
        self.check(format!("list:{server_url}"))?;
        let state = self.state();
        match depth {
            Depth::Zero => Ok(state.items.get(server_url).cloned().into_iter().collect()),
            Depth::One => state
                .listings
                .get(server_url)
                .cloned()
                .ok_or_else(|| DavError::api(StatusCode::NOT_FOUND, "no listing")),
        }
    }

    async fn create_folder(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<CreatedFolder, DavError> {
        self.record(Call::CreateFolder {
            url: server_url_file_name.to_string(),
            token: token_of(headers),
        });
        self.check(format!("mkcol:{server_url_file_name}"))?;
        let (parent, name) = server_url_file_name
            .rsplit_once('/')
            .ok_or(DavError::MissingField("name"))?;
        let oc_id = format!("oc-{name}");
        let mut entry = dav_entry(parent, name, &oc_id);
        entry.directory = true;
        entry.content_type = "httpd/unix-directory".into();
        self.set_item(entry);
        Ok(CreatedFolder {
            oc_id: Some(oc_id),
            date: Some(1_700_000_000),
        })
    }

    async fn delete(
        &self,
        server_url_file_name: &str,
        headers: &[(&str, &str)],
    ) -> Result<(), DavError> {
        self.record(Call::Delete {
            url: server_url_file_name.to_string(),
            token: token_of(headers),
        });
        self.check(format!("delete:{server_url_file_name}"))
    }

    async fn move_item(
        &self,
        source: &str,
        destination: &str,
        _overwrite: bool,
    ) -> Result<(), DavError> {
        self.record(Call::Move {
            source: source.to_string(),
            destination: destination.to_string(),
        });
        self.check(format!("move:{source}"))
    }

    async fn copy_item(
        &self,
        source: &str,
        destination: &str,
        _overwrite: bool,
    ) -> Result<(), DavError> {
        self.record(Call::Copy {
            source: source.to_string(),
            destination: destination.to_string(),
        });
        self.check(format!("copy:{source}"))
    }

    async fn set_favorite(&self, file_path: &str, favorite: bool) -> Result<(), DavError> {
        self.record(Call::Favorite {
            path: file_path.to_string(),
            favorite,
        });
        self.check(format!("favorite:{file_path}"))
    }

    async fn lock_folder(
        &self,
        file_id: &str,
        token: Option<&str>,
        delete: bool,
    ) -> Result<Option<String>, DavError> {
        let token = token.map(str::to_string);
        if delete {
            self.record(Call::Unlock {
                file_id: file_id.to_string(),
                token,
            });
            self.check(format!("unlock:{file_id}"))?;
            self.state().active_locks.remove(file_id);
            return Ok(None);
        }
        self.record(Call::Lock {
            file_id: file_id.to_string(),
            token: token.clone(),
        });
        self.check(format!("lock:{file_id}"))?;
        let mut state = self.state();
        if let Some(held) = state.active_locks.get(file_id) {
            if token.as_deref() != Some(held.as_str()) {
                return Err(DavError::api(StatusCode::LOCKED, "folder is locked"));
            }
        }
        state.issued_tokens += 1;
        let issued = format!("token-{}", state.issued_tokens);
        state.active_locks.insert(file_id.to_string(), issued.clone());
        Ok(Some(issued))
    }

    async fn get_manifest(&self, file_id: &str, _token: &str) -> Result<Option<String>, DavError> {
        self.record(Call::GetManifest {
            file_id: file_id.to_string(),
        });
        self.check(format!("get-manifest:{file_id}"))?;
        Ok(self.state().manifests.get(file_id).cloned())
    }

    async fn put_manifest(
        &self,
        file_id: &str,
        token: &str,
        manifest: &str,
        method: ManifestMethod,
    ) -> Result<(), DavError> {
        self.record(Call::PutManifest {
            file_id: file_id.to_string(),
            method,
        });
        self.check(format!("put-manifest:{file_id}"))?;
        let mut state = self.state();
        if state.active_locks.get(file_id).map(String::as_str) != Some(token) {
            return Err(DavError::api(StatusCode::FORBIDDEN, "token mismatch"));
        }
        state
            .manifests
            .insert(file_id.to_string(), manifest.to_string());
        Ok(())
    }

    async fn mark_encrypted(&self, file_id: &str, _encrypted: bool) -> Result<(), DavError> {
        self.record(Call::MarkEncrypted {
            file_id: file_id.to_string(),
        });
        self.check(format!("mark-encrypted:{file_id}"))
    }

    async fn upload(
        &self,
        request: UploadRequest<'_>,
        progress: ProgressFn<'_>,
    ) -> Result<UploadReceipt, DavError> {
        let url = request.server_url_file_name.to_string();
        self.record(Call::Upload {
            url: url.clone(),
            token: token_of(request.headers),
        });
        self.check(format!("upload:{url}"))?;
        let size = tokio::fs::metadata(request.local_path).await?.len();
        progress(size, size);
        let name = url.rsplit('/').next().unwrap_or_default();
        Ok(UploadReceipt {
            oc_id: format!("uploaded-{name}"),
            etag: "etag-uploaded".into(),
            date: Some(1_700_000_100),
            size,
        })
    }
}

pub(crate) fn account() -> Account {
    Account::new("alice", BASE_URL).with_private_key(PRIVATE_KEY.to_vec())
}

pub(crate) async fn make_store() -> MetadataStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MetadataStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

pub(crate) async fn make_engine(
    gateway: Arc<FakeGateway>,
    cache_root: &std::path::Path,
) -> SyncEngine {
    let config = EngineConfig {
        cache_root: cache_root.to_path_buf(),
        ..EngineConfig::default()
    };
    SyncEngine::new(
        account(),
        gateway,
        make_store().await,
        Arc::new(ChaChaCrypto),
        EventBus::new(),
        config,
    )
}

pub(crate) fn file(account: &Account, server_url: &str, name: &str, oc_id: &str) -> FileRecord {
    FileRecord {
        oc_id: oc_id.into(),
        file_id: format!("fid-{oc_id}"),
        account: account.id.clone(),
        server_url: server_url.into(),
        file_name: name.into(),
        file_name_view: name.into(),
        ..FileRecord::default()
    }
}

pub(crate) fn directory(
    account: &Account,
    server_url: &str,
    file_id: &str,
    encrypted: bool,
) -> DirectoryRecord {
    DirectoryRecord {
        account: account.id.clone(),
        server_url: server_url.into(),
        oc_id: format!("oc-{file_id}"),
        file_id: file_id.into(),
        e2e_encrypted: encrypted,
        ..DirectoryRecord::default()
    }
}
