use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ncsync_core::DEFAULT_WEBDAV_ROOT;

use crate::account::Account;
use crate::sync::e2ee::lock::LockPolicy;
use crate::sync::engine::{DEFAULT_E2EE_MAX_FILE_SIZE, EngineConfig};

const APP_DIR_NAME: &str = "ncsync";
const DB_FILE_NAME: &str = "metadata.db";
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_LOCK_ATTEMPTS: u64 = 1;
const DEFAULT_LOCK_BACKOFF_MS: u64 = 250;
const DEFAULT_LOCK_MAX_BACKOFF_MS: u64 = 5_000;
const DEFAULT_E2EE_API_VERSION: u64 = 1;

/// Everything the daemon needs to build one account's engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_url: String,
    pub user: String,
    pub app_password: String,
    pub webdav_root: String,
    pub private_key: Option<Vec<u8>>,
    pub cache_root: PathBuf,
    pub db_path: PathBuf,
    pub e2ee_max_file_size: u64,
    pub upload_concurrency: usize,
    pub lock_policy: LockPolicy,
    pub show_hidden: bool,
    pub e2ee_api_version: i64,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    fn from_lookup<F>(lookup: F, home: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{name} is not set"))
        };
        let server_url = required("NCSYNC_SERVER_URL")?;
        let user = required("NCSYNC_USER")?;
        let app_password = required("NCSYNC_APP_PASSWORD")?;
        let webdav_root =
            lookup("NCSYNC_WEBDAV_ROOT").unwrap_or_else(|| DEFAULT_WEBDAV_ROOT.to_string());
        let private_key = lookup("NCSYNC_PRIVATE_KEY")
            .filter(|value| !value.is_empty())
            .map(String::into_bytes);
        let cache_root = lookup("NCSYNC_CACHE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_cache_root);
        let db_path = lookup("NCSYNC_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_db_path);

        let read_u64 = |name: &str, default: u64| read_u64_var(lookup(name), default);
        let lock_policy = LockPolicy {
            attempts: u32::try_from(read_u64("NCSYNC_LOCK_ATTEMPTS", DEFAULT_LOCK_ATTEMPTS))
                .unwrap_or(u32::MAX),
            base_delay: Duration::from_millis(read_u64(
                "NCSYNC_LOCK_BACKOFF_MS",
                DEFAULT_LOCK_BACKOFF_MS,
            )),
            max_delay: Duration::from_millis(DEFAULT_LOCK_MAX_BACKOFF_MS),
            jitter: true,
            timeout: lookup("NCSYNC_LOCK_TIMEOUT_MS")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        };

        Ok(Self {
            server_url,
            user,
            app_password,
            webdav_root,
            private_key,
            cache_root,
            db_path,
            e2ee_max_file_size: read_u64("NCSYNC_E2EE_MAX_FILE_SIZE", DEFAULT_E2EE_MAX_FILE_SIZE),
            upload_concurrency: usize::try_from(read_u64(
                "NCSYNC_UPLOAD_CONCURRENCY",
                DEFAULT_UPLOAD_CONCURRENCY,
            ))
            .unwrap_or(usize::MAX),
            lock_policy,
            show_hidden: read_bool_var(lookup("NCSYNC_SHOW_HIDDEN"), false),
            e2ee_api_version: i64::try_from(read_u64(
                "NCSYNC_E2EE_API_VERSION",
                DEFAULT_E2EE_API_VERSION,
            ))
            .unwrap_or(i64::MAX),
        })
    }

    pub fn account(&self) -> Account {
        let account = Account::new(&self.user, &self.server_url)
            .with_webdav_root(&self.webdav_root)
            .with_e2ee_api_version(self.e2ee_api_version);
        match &self.private_key {
            Some(key) => account.with_private_key(key.clone()),
            None => account,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_root: self.cache_root.clone(),
            show_hidden: self.show_hidden,
            e2ee_max_file_size: self.e2ee_max_file_size,
            upload_concurrency: self.upload_concurrency,
            lock_policy: self.lock_policy,
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join(DB_FILE_NAME)
}

fn read_u64_var(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
