//! Submitted operations and their lifecycle.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::OperationError;
use crate::util::{lock, panic_message};

/// Future produced by an operation action.
pub type OperationFuture = BoxFuture<'static, anyhow::Result<()>>;

type OperationAction = Box<dyn FnOnce() -> OperationFuture + Send>;

/// Logical source of an operation, used for deduplication and cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationSender(String);

impl OperationSender {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationSender {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationSender {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for OperationSender {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for OperationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Waiting,
    Running,
    Completed,
    Faulted,
}

impl OperationStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Waiting -> Completed` covers operations skipped without running.
    pub fn can_transition_to(&self, target: OperationStatus) -> bool {
        use OperationStatus::*;

        matches!(
            (self, target),
            (Waiting, Running) | (Waiting, Completed) | (Running, Completed) | (Running, Faulted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Default)]
struct Progress {
    started_at: Option<Instant>,
    timeout_at: Option<Instant>,
}

/// A unit of submitted asynchronous work.
pub struct Operation {
    id: Uuid,
    sender: Option<OperationSender>,
    action: Mutex<Option<OperationAction>>,
    can_start_at: Option<Instant>,
    has_delay: bool,
    status: watch::Sender<OperationStatus>,
    progress: Mutex<Progress>,
    cancelled: AtomicBool,
    claimed: AtomicBool,
}

impl Operation {
    /// Create an operation from an action closure.
    pub fn new<F, Fut>(sender: Option<OperationSender>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_boxed(sender, Box::new(move || action().boxed()), false, None)
    }

    /// Create an operation whose action first sleeps for `delay`.
    pub fn delayed<F, Fut>(sender: Option<OperationSender>, delay: Duration, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped = move || {
            async move {
                tokio::time::sleep(delay).await;
                action().await
            }
            .boxed()
        };
        Self::from_boxed(sender, Box::new(wrapped), true, None)
    }

    /// Create an operation that may not be admitted before `delay` elapses.
    pub fn not_before<F, Fut>(sender: Option<OperationSender>, delay: Duration, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_boxed(
            sender,
            Box::new(move || action().boxed()),
            true,
            Some(Instant::now() + delay),
        )
    }

    fn from_boxed(
        sender: Option<OperationSender>,
        action: OperationAction,
        has_delay: bool,
        can_start_at: Option<Instant>,
    ) -> Self {
        let (status, _) = watch::channel(OperationStatus::Waiting);
        Self {
            id: Uuid::new_v4(),
            sender,
            action: Mutex::new(Some(action)),
            can_start_at,
            has_delay,
            status,
            progress: Mutex::new(Progress::default()),
            cancelled: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> Option<&OperationSender> {
        self.sender.as_ref()
    }

    pub fn has_delay(&self) -> bool {
        self.has_delay
    }

    pub fn status(&self) -> OperationStatus {
        *self.status.borrow()
    }

    /// Wait until the operation reaches a terminal status.
    pub async fn finished(&self) -> OperationStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the operation is waiting or running and not cancelled.
    pub fn is_active(&self) -> bool {
        !self.is_cancelled() && !self.status().is_terminal()
    }

    pub(crate) fn matches_sender(&self, sender: &OperationSender) -> bool {
        self.sender.as_ref() == Some(sender)
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.can_start_at.is_none_or(|at| now >= at)
    }

    /// Claim the operation for dispatch. Only the first caller wins.
    pub(crate) fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timeout(&self, deadline: Instant) {
        lock(&self.progress).timeout_at = Some(deadline);
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        lock(&self.progress).timeout_at.is_some_and(|at| now >= at)
    }

    /// Whether the operation has been running for at least `limit`.
    pub(crate) fn running_longer_than(&self, limit: Duration, now: Instant) -> bool {
        self.status() == OperationStatus::Running
            && lock(&self.progress)
                .started_at
                .is_some_and(|at| now.duration_since(at) >= limit)
    }

    fn transition(&self, next: OperationStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Mark a never-started operation as completed without running it.
    pub(crate) fn skip(&self) {
        self.dispose();
        self.transition(OperationStatus::Completed);
    }

    /// Drop the action so it can never run.
    pub(crate) fn dispose(&self) {
        lock(&self.action).take();
    }

    /// Run the action once, capturing errors and panics.
    pub async fn execute(&self) -> Result<(), OperationError> {
        let action = lock(&self.action).take();
        let Some(action) = action else {
            return Ok(());
        };

        if self.is_cancelled() {
            tracing::debug!(operation = %self.id, "Skipping cancelled operation");
            self.transition(OperationStatus::Completed);
            return Ok(());
        }

        lock(&self.progress).started_at = Some(Instant::now());
        self.transition(OperationStatus::Running);

        let outcome = AssertUnwindSafe(action()).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => {
                self.transition(OperationStatus::Completed);
                return Ok(());
            }
            Ok(Err(e)) => OperationError::Failed {
                id: self.id,
                reason: format!("{e:#}"),
            },
            Err(payload) => OperationError::Panicked {
                id: self.id,
                reason: panic_message(payload.as_ref()),
            },
        };

        tracing::error!(
            operation = %self.id,
            sender = ?self.sender.as_ref().map(OperationSender::as_str),
            error = %error,
            "Operation failed"
        );
        self.transition(OperationStatus::Faulted);
        Err(error)
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("sender", &self.sender)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
