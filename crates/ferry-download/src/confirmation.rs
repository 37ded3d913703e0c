//! One-shot confirmation gate

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    Cancel,
}

/// Resolves a waiting download exactly once. Clones share the same gate;
/// whichever resolves first wins and every later call reports `false`.
#[derive(Clone)]
pub struct ConfirmationHandle {
    download_id: String,
    slot: Arc<Mutex<Option<oneshot::Sender<Decision>>>>,
}

impl ConfirmationHandle {
    pub(crate) fn new(download_id: &str) -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            download_id: download_id.to_string(),
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (handle, rx)
    }

    pub fn download_id(&self) -> &str {
        &self.download_id
    }

    pub fn resolve(&self, decision: Decision) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            return false;
        };
        tx.send(decision).is_ok()
    }

    pub fn proceed(&self) -> bool {
        self.resolve(Decision::Proceed)
    }

    pub fn cancel(&self) -> bool {
        self.resolve(Decision::Cancel)
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl std::fmt::Debug for ConfirmationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationHandle")
            .field("download_id", &self.download_id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
