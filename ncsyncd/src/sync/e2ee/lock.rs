use std::sync::Arc;
use std::time::Duration;

use ncsync_core::{DavError, RemoteGateway};
use rand::Rng;
use tracing::{debug, warn};

use crate::account::Account;
use crate::sync::error::SyncError;
use crate::sync::index::{DirectoryRecord, LockToken, MetadataStore};

/// How hard `lock` tries before giving up on a busy or flaky server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub timeout: Option<Duration>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: true,
            timeout: None,
        }
    }
}

impl LockPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(max_ms);
        if self.jitter {
            Duration::from_millis(rng.gen_range(0..=exp))
        } else {
            Duration::from_millis(exp)
        }
    }
}

/// A folder lock this client currently holds on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldLock {
    pub directory: DirectoryRecord,
    pub token: String,
}

/// Server-side mutual exclusion for encrypted folders. Tokens are persisted so a
/// later call can renew or release them.
#[derive(Clone)]
pub struct LockManager {
    gateway: Arc<dyn RemoteGateway>,
    store: MetadataStore,
    policy: LockPolicy,
}

impl LockManager {
    pub fn new(gateway: Arc<dyn RemoteGateway>, store: MetadataStore, policy: LockPolicy) -> Self {
        Self {
            gateway,
            store,
            policy,
        }
    }

    /// `Ok(None)` when the folder has no directory record; there is nothing to lock.
    pub async fn lock(
        &self,
        account: &Account,
        server_url: &str,
    ) -> Result<Option<HeldLock>, SyncError> {
        let Some(directory) = self.store.get_directory(&account.id, server_url).await? else {
            debug!(server_url, "no directory record, lock skipped");
            return Ok(None);
        };
        let stored = self.store.get_lock(&account.id, server_url).await?;
        let previous = stored.as_ref().map(|lock| lock.e2e_token.as_str());

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        let token = loop {
            match self.request_lock(&directory.file_id, previous).await {
                Ok(Some(token)) => break token,
                Ok(None) => {
                    return Err(SyncError::LockUnavailable(DavError::MissingField(
                        "e2e-token",
                    )));
                }
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.policy.delay(attempt);
                    debug!(server_url, attempt, ?delay, error = %err, "folder lock busy, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(SyncError::LockUnavailable(err)),
            }
        };

        self.store
            .set_lock(&LockToken {
                account: account.id.clone(),
                server_url: server_url.to_string(),
                file_id: directory.file_id.clone(),
                e2e_token: token.clone(),
            })
            .await?;
        debug!(server_url, "folder locked");
        Ok(Some(HeldLock { directory, token }))
    }

    async fn request_lock(
        &self,
        file_id: &str,
        token: Option<&str>,
    ) -> Result<Option<String>, DavError> {
        let request = self.gateway.lock_folder(file_id, token, false);
        match self.policy.timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| DavError::TimedOut)?,
            None => request.await,
        }
    }

    pub async fn unlock(&self, account: &Account, server_url: &str) -> Result<(), SyncError> {
        let Some(directory) = self.store.get_directory(&account.id, server_url).await? else {
            return Ok(());
        };
        let stored = self.store.get_lock(&account.id, server_url).await?;
        let token = stored.as_ref().map(|lock| lock.e2e_token.as_str());
        self.gateway
            .lock_folder(&directory.file_id, token, true)
            .await?;
        self.store.delete_lock(&account.id, server_url).await?;
        debug!(server_url, "folder unlocked");
        Ok(())
    }

    /// Best-effort `unlock` used on cleanup paths.
    pub async fn release(&self, account: &Account, server_url: &str) {
        if let Err(err) = self.unlock(account, server_url).await {
            warn!(server_url, error = %err, "failed to release folder lock");
        }
    }

    /// Releases the stored token for `server_url`, if one is left over.
    pub async fn revoke_stored(&self, account: &Account, server_url: &str) {
        let stored = match self.store.get_lock(&account.id, server_url).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return,
            Err(err) => {
                warn!(server_url, error = %err, "failed to read stored folder lock");
                return;
            }
        };
        if let Err(err) = self.revoke(&stored).await {
            warn!(server_url, error = %err, "failed to revoke stored folder lock");
        }
    }

    /// Releases every token stored for the account. Returns how many were released.
    pub async fn release_all(&self, account: &Account) -> Result<usize, SyncError> {
        let mut released = 0;
        for lock in self.store.locks(&account.id).await? {
            match self.revoke(&lock).await {
                Ok(()) => released += 1,
                Err(err) => {
                    warn!(server_url = %lock.server_url, error = %err, "failed to release folder lock");
                }
            }
        }
        Ok(released)
    }

    async fn revoke(&self, lock: &LockToken) -> Result<(), SyncError> {
        self.gateway
            .lock_folder(&lock.file_id, Some(&lock.e2e_token), true)
            .await?;
        self.store.delete_lock(&lock.account, &lock.server_url).await?;
        Ok(())
    }
}
