//! Cancellation manager (§4.3).
//!
//! Grounded on `backend/pool/dns.rs`'s use of `tokio_util::sync::
//! CancellationToken` for a stoppable background loop; generalized here to
//! compose four independent sources into one derived, cooperative signal.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Which of the four sources fired, used by the dispatcher to classify the
/// aggregate outcome (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Caller,
    CommandInstance,
    CompletenessPolicy,
    Timeout,
}

async fn wait_opt(token: &Option<CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Composes four cancellation sources into one derived signal (§4.3):
/// a caller-supplied token, a per-command-instance token, a
/// completeness-policy token (present only under [`crate::ExecutionPolicy::Complete`]),
/// and a timeout token (present only when the overall timeout is positive).
///
/// This never materializes a single literal merged [`CancellationToken`] —
/// that type only supports parent→child propagation, not "whichever of N
/// unrelated tokens fires first" — so [`CancellationManager::cancelled`] is
/// itself the derived signal callers `select!` against.
pub struct CancellationManager {
    caller: CancellationToken,
    command_instance: CancellationToken,
    completeness: Option<CancellationToken>,
    timeout: Option<CancellationToken>,
    timeout_task: Option<JoinHandle<()>>,
}

impl CancellationManager {
    pub fn new(caller: CancellationToken, supports_completeness_source: bool, overall_timeout: Duration) -> Self {
        let completeness = supports_completeness_source.then(CancellationToken::new);
        let timeout = (!overall_timeout.is_zero()).then(CancellationToken::new);

        let timeout_task = timeout.clone().map(|timeout_token| {
            tokio::spawn(async move {
                tokio::time::sleep(overall_timeout).await;
                timeout_token.cancel();
            })
        });

        Self {
            caller,
            command_instance: CancellationToken::new(),
            completeness,
            timeout,
            timeout_task,
        }
    }

    /// True if any of the four sources has fired.
    pub fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled()
            || self.command_instance.is_cancelled()
            || self.completeness.as_ref().is_some_and(CancellationToken::is_cancelled)
            || self.timeout.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolves once any of the four sources fires. Cancel-safe: fine to
    /// use inside a `select!` alongside the operation being cancelled.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.caller.cancelled() => {},
            _ = self.command_instance.cancelled() => {},
            _ = wait_opt(&self.completeness) => {},
            _ = wait_opt(&self.timeout) => {},
        }
    }

    /// Exactly the timeout source, for distinguishing a timeout from a
    /// generic cancellation (§4.3, §4.5).
    pub fn timeout_expired(&self) -> bool {
        self.timeout.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Triggered by the dispatcher on the first shard failure under
    /// [`crate::ExecutionPolicy::Complete`] (§4.5); a no-op under
    /// [`crate::ExecutionPolicy::Partial`], where this source doesn't exist.
    pub fn trigger_completeness(&self) {
        if let Some(token) = &self.completeness {
            token.cancel();
        }
    }

    /// Cancels the command-instance source. Safe from any thread, never
    /// raises (§4.8 `cancel()`).
    pub fn cancel_command_instance(&self) {
        self.command_instance.cancel();
    }

    /// After a cancel, the command-instance source is replaced so a
    /// subsequent execute may succeed (§5).
    pub fn reset_command_instance(&mut self) {
        self.command_instance = CancellationToken::new();
    }

    /// The appropriate error for a "parent cancelled" outcome (§4.5):
    /// timeout supersedes generic cancellation (§7).
    pub fn cancellation_error(&self) -> Error {
        if self.timeout_expired() {
            Error::Timeout
        } else {
            Error::Cancelled
        }
    }
}

impl Drop for CancellationManager {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}
