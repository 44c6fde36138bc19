use tokio::sync::broadcast;

use crate::sync::error::SyncError;
use crate::sync::index::FileRecord;

const DEFAULT_CAPACITY: usize = 256;

/// Outcome attached to every completion event. `error_code == 0` means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub error_code: i32,
    pub description: String,
}

impl Completion {
    pub fn success() -> Self {
        Self {
            error_code: 0,
            description: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

impl<T> From<&Result<T, SyncError>> for Completion {
    fn from(result: &Result<T, SyncError>) -> Self {
        match result {
            Ok(_) => Completion::success(),
            Err(err) => Completion {
                error_code: err.code(),
                description: err.description(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    FolderCreated {
        server_url: String,
        file_name: String,
        completion: Completion,
    },
    FileDeleted {
        record: FileRecord,
        completion: Completion,
    },
    FileRenamed {
        record: FileRecord,
        completion: Completion,
    },
    FileMoved {
        record: FileRecord,
        server_url_to: String,
        completion: Completion,
    },
    FileCopied {
        record: FileRecord,
        server_url_to: String,
        completion: Completion,
    },
    FileFavorited {
        record: FileRecord,
        completion: Completion,
    },
    UploadCompleted {
        record: FileRecord,
        completion: Completion,
    },
    TransferProgress {
        account: String,
        oc_id: String,
        server_url: String,
        sent: u64,
        total: u64,
    },
    AuthExpired {
        account: String,
        status: i32,
    },
}

/// Broadcast channel shared by every engine. Events are delivered in publish order.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("sync event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
