//! Fail-fast coordination shared by every stage of one transfer.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::TransferError;

/// Lifecycle of one transfer. Both non-running states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Running,
    Completed,
    Error,
}

struct Inner {
    state: TransferState,
    error: Option<TransferError>,
}

/// Holds the first fatal error of a transfer and the cancellation token
/// every stage was constructed with.
///
/// Setting the error cancels the token, which wakes every queue push/pop,
/// progress wait and in-flight request that selects on it.
pub struct ErrorManager {
    file_id: String,
    token: CancellationToken,
    inner: Mutex<Inner>,
}

impl ErrorManager {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            token: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: TransferState::Running,
                error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a fatal error. Returns `true` if this was the first one.
    ///
    /// Errors arriving after the first, or after completion, are logged at
    /// debug level and dropped.
    pub fn set_error(&self, err: TransferError) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != TransferState::Running {
                debug!(file_id = %self.file_id, error = %err, state = ?inner.state, "secondary error suppressed");
                return false;
            }
            error!(file_id = %self.file_id, error = %err, category = err.category(), "transfer failed");
            inner.state = TransferState::Error;
            inner.error = Some(err);
        }
        self.token.cancel();
        true
    }

    /// Cooperative cancellation requested by the caller.
    pub fn cancel(&self) -> bool {
        self.set_error(TransferError::Cancelled)
    }

    /// Marks the transfer completed. Returns `false` if it had already failed.
    pub fn complete(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != TransferState::Running {
            return inner.state == TransferState::Completed;
        }
        inner.state = TransferState::Completed;
        info!(file_id = %self.file_id, "transfer completed");
        true
    }

    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    pub fn is_error(&self) -> bool {
        self.state() == TransferState::Error
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once an error has been set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Moves the recorded error out, for returning it to the caller.
    pub fn take_error(&self) -> Option<TransferError> {
        self.lock().error.take()
    }

    /// Message of the recorded error without taking it.
    pub fn error_message(&self) -> Option<String> {
        self.lock().error.as_ref().map(ToString::to_string)
    }
}
