//! Execution engine: a single background loop with a status state machine,
//! fault recovery and a cooperative freeze barrier.
//!
//! The loop structurally guarantees that two ticks of the same engine never
//! overlap: there is exactly one live loop per engine outside of the short
//! hand-over window of a forced restart.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::EngineWork;
use crate::engine::state::{EngineState, EngineTransition, TransitionLog};
use crate::error::EngineError;
use crate::util::{lock, panic_message};

const FAILURE_CHANNEL_CAPACITY: usize = 64;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(1);
const FREEZE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sent to subscribers whenever a tick fails.
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub engine_id: Uuid,
    pub engine_name: String,
    /// State the engine was in before it faulted.
    pub prior_state: EngineState,
    pub error: String,
}

/// Counters behind the freeze barrier.
#[derive(Debug, Default)]
struct FreezeGate {
    requested: bool,
    parked: usize,
    alive: usize,
}

/// State shared between the engine handle and its loop task.
struct EngineShared {
    id: Uuid,
    name: String,
    config: EngineConfig,
    status: watch::Sender<EngineState>,
    transitions: Mutex<TransitionLog>,
    gate: Mutex<FreezeGate>,
    release: Notify,
    failures: broadcast::Sender<EngineFailure>,
}

impl EngineShared {
    fn status(&self) -> EngineState {
        *self.status.borrow()
    }

    /// Replace the status, returning the previous one.
    fn set_status(&self, next: EngineState) -> EngineState {
        let mut transitions = lock(&self.transitions);
        let prior = self.status.send_replace(next);
        transitions.record(prior, next);
        prior
    }

    /// Replace the status unless `token` was cancelled.
    ///
    /// The check happens under the transition lock, and `abort` cancels before
    /// taking it, so a stale loop can never overwrite the status set by `abort`.
    fn set_status_if_live(
        &self,
        next: EngineState,
        token: &CancellationToken,
    ) -> Option<EngineState> {
        let mut transitions = lock(&self.transitions);
        if token.is_cancelled() {
            return None;
        }
        let prior = self.status.send_replace(next);
        transitions.record(prior, next);
        Some(prior)
    }

    fn freeze_requested(&self) -> bool {
        lock(&self.gate).requested
    }

    /// Park the current loop iteration until `unfreeze`, the parked timeout,
    /// or cancellation.
    async fn park(&self, token: &CancellationToken) {
        let notified = self.release.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut gate = lock(&self.gate);
            if !gate.requested {
                return;
            }
            gate.parked += 1;
        }

        tracing::debug!(engine = %self.name, "Loop parked at freeze checkpoint");

        let released = tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(self.config.parked_timeout) => false,
            _ = token.cancelled() => false,
        };

        if !released {
            let mut gate = lock(&self.gate);
            gate.parked = gate.parked.saturating_sub(1);
            tracing::warn!(engine = %self.name, "Parked loop resumed without unfreeze");
        }
    }
}

/// Counts a loop as alive for the freeze barrier; released on every exit path.
struct LoopGuard {
    shared: Arc<EngineShared>,
}

impl LoopGuard {
    fn enter(shared: Arc<EngineShared>) -> Self {
        lock(&shared.gate).alive += 1;
        Self { shared }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let mut gate = lock(&self.shared.gate);
        gate.alive = gate.alive.saturating_sub(1);
    }
}

struct EngineControl {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// A recurring background loop driving an [`EngineWork`] implementation.
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    work: Arc<dyn EngineWork>,
    control: Mutex<EngineControl>,
}

impl ExecutionEngine {
    /// Create a new engine. Nothing runs until [`start`](Self::start).
    pub fn new(name: impl Into<String>, config: EngineConfig, work: Arc<dyn EngineWork>) -> Self {
        let (status, _) = watch::channel(EngineState::NotStarted);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(EngineShared {
                id: Uuid::new_v4(),
                name: name.into(),
                config,
                status,
                transitions: Mutex::new(TransitionLog::default()),
                gate: Mutex::new(FreezeGate::default()),
                release: Notify::new(),
                failures,
            }),
            work,
            control: Mutex::new(EngineControl {
                cancel: CancellationToken::new(),
                handle: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current status.
    pub fn status(&self) -> EngineState {
        self.shared.status()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<EngineState> {
        self.shared.status.subscribe()
    }

    /// Receive a notification for every failed tick.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<EngineFailure> {
        self.shared.failures.subscribe()
    }

    /// Recorded state changes, oldest first.
    pub fn transitions(&self) -> Vec<EngineTransition> {
        lock(&self.shared.transitions).entries().to_vec()
    }

    /// Whether the most recently spawned loop task is still alive.
    pub fn is_loop_alive(&self) -> bool {
        Self::handle_alive(&lock(&self.control))
    }

    fn handle_alive(control: &EngineControl) -> bool {
        control.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the engine is ticking (idle or running) on a live loop.
    pub fn is_running(&self) -> bool {
        self.status().is_ticking() && self.is_loop_alive()
    }

    /// Start the engine.
    ///
    /// An idle engine with a live loop is simply flipped back to running.
    /// Otherwise (or when `force` is set) any in-flight loop is cancelled and
    /// a fresh one is spawned. Returns `false` if the engine is already running
    /// or no runtime is available.
    pub fn start(&self, force: bool) -> bool {
        let mut control = lock(&self.control);
        let state = self.shared.status();
        let alive = Self::handle_alive(&control);

        if !force && state == EngineState::Idle && alive {
            self.shared.set_status(EngineState::Running);
            tracing::debug!(engine = %self.shared.name, "Resumed idle engine");
            return true;
        }

        if !(force
            || state <= EngineState::Idle
            || state >= EngineState::Stopped
            || !alive)
        {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                let err = EngineError::NoRuntime {
                    name: self.shared.name.clone(),
                };
                tracing::error!(engine = %self.shared.name, "{}", err);
                return false;
            }
        };

        let token = Self::abort(&self.shared, &mut control, EngineState::Running);
        let shared = Arc::clone(&self.shared);
        let work = Arc::clone(&self.work);
        control.handle = Some(runtime.spawn(run_loop(shared, work, token)));

        tracing::info!(engine = %self.shared.name, force, "Engine started");
        true
    }

    /// Stop the engine and wait (bounded) for its loop to finish.
    ///
    /// Only valid while the engine is running; returns `false` otherwise or if
    /// the loop does not finish within the configured stop timeout.
    pub async fn stop(&self) -> bool {
        {
            let mut control = lock(&self.control);
            let state = self.shared.status();
            if !(state > EngineState::Idle && state < EngineState::Stopped) {
                let err = EngineError::InvalidState {
                    name: self.shared.name.clone(),
                    action: "stop",
                    state,
                };
                tracing::debug!(engine = %self.shared.name, "{}", err);
                return false;
            }
            Self::abort(&self.shared, &mut control, EngineState::Stopped);
        }

        self.wait_for_loop_exit().await
    }

    /// Stop the engine from any ticking or faulted state.
    ///
    /// Idle and faulted engines pass through `Running` so every recorded
    /// transition stays on the state machine.
    pub async fn shutdown(&self) -> bool {
        {
            let mut control = lock(&self.control);
            let state = self.shared.status();
            if !matches!(state, EngineState::NotStarted | EngineState::Stopped) {
                // Cancel first so the loop cannot write a status in between.
                control.cancel.cancel();
                control.cancel = CancellationToken::new();
                if state != EngineState::Running {
                    self.shared.set_status(EngineState::Running);
                }
                self.shared.set_status(EngineState::Stopped);
            }
        }

        self.wait_for_loop_exit().await
    }

    async fn wait_for_loop_exit(&self) -> bool {
        let deadline = Instant::now() + self.shared.config.stop_timeout;
        while self.is_loop_alive() {
            if Instant::now() >= deadline {
                let err = EngineError::StopTimeout {
                    name: self.shared.name.clone(),
                    timeout: self.shared.config.stop_timeout,
                };
                tracing::warn!(engine = %self.shared.name, "{}", err);
                return false;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        tracing::info!(engine = %self.shared.name, "Engine stopped");
        true
    }

    /// Stop, then start.
    pub async fn restart(&self) -> bool {
        if !self.stop().await {
            return false;
        }
        self.start(false)
    }

    /// Cancel the current loop, install a fresh token and set `next`.
    fn abort(
        shared: &EngineShared,
        control: &mut EngineControl,
        next: EngineState,
    ) -> CancellationToken {
        control.cancel.cancel();
        control.cancel = CancellationToken::new();
        shared.set_status(next);
        control.cancel.clone()
    }

    /// Ask every live loop iteration to park, waiting (bounded) until all have.
    ///
    /// Returns `true` once the parked count equals the live loop count, or
    /// immediately when no loop is alive.
    pub async fn request_freeze(&self) -> bool {
        lock(&self.shared.gate).requested = true;

        if !self.is_loop_alive() {
            return true;
        }

        let deadline = Instant::now() + self.shared.config.freeze_timeout;
        loop {
            {
                let gate = lock(&self.shared.gate);
                if gate.parked == gate.alive {
                    tracing::debug!(engine = %self.shared.name, parked = gate.parked, "Engine frozen");
                    return true;
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!(engine = %self.shared.name, "Freeze request timed out");
                return false;
            }
            tokio::time::sleep(FREEZE_POLL_INTERVAL).await;
        }
    }

    /// Release every parked iteration. Returns how many were released.
    pub fn unfreeze(&self) -> usize {
        let released = {
            let mut gate = lock(&self.shared.gate);
            gate.requested = false;
            std::mem::take(&mut gate.parked)
        };
        self.shared.release.notify_waiters();
        released
    }

    /// Every live loop is parked.
    pub fn is_frozen(&self) -> bool {
        let gate = lock(&self.shared.gate);
        gate.parked > 0 && gate.parked == gate.alive
    }

    /// More than one loop is alive (a forced restart is still handing over).
    pub fn has_loop_conflict(&self) -> bool {
        lock(&self.shared.gate).alive > 1
    }

    pub fn parked_count(&self) -> usize {
        lock(&self.shared.gate).parked
    }

    pub fn live_loop_count(&self) -> usize {
        lock(&self.shared.gate).alive
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        lock(&self.control).cancel.cancel();
    }
}

async fn run_loop(shared: Arc<EngineShared>, work: Arc<dyn EngineWork>, token: CancellationToken) {
    let _guard = LoopGuard::enter(Arc::clone(&shared));

    loop {
        // Parking comes first so freeze requesters are released promptly.
        if shared.freeze_requested() {
            shared.park(&token).await;
        }

        if shared.status().is_ticking() {
            tick(&shared, work.as_ref(), &token).await;
        } else {
            break;
        }

        if token.is_cancelled() {
            break;
        }
    }

    tracing::debug!(engine = %shared.name, "Engine loop finished");
}

async fn tick(shared: &EngineShared, work: &dyn EngineWork, token: &CancellationToken) {
    let outcome = AssertUnwindSafe(work.tick(token)).catch_unwind().await;

    let error = match outcome {
        Ok(Ok(remaining)) => {
            if remaining == 0 {
                if shared.set_status_if_live(EngineState::Idle, token).is_some() {
                    sleep_or_cancelled(shared.config.idle_delay, token).await;
                }
            } else if shared
                .set_status_if_live(EngineState::Running, token)
                .is_some()
            {
                sleep_or_cancelled(shared.config.active_delay, token).await;
            }
            return;
        }
        Ok(Err(e)) => EngineError::TickFailed {
            name: shared.name.clone(),
            reason: format!("{e:#}"),
        },
        Err(payload) => EngineError::TickPanicked {
            name: shared.name.clone(),
            reason: panic_message(payload.as_ref()),
        },
    };

    let Some(prior_state) = shared.set_status_if_live(EngineState::Faulted, token) else {
        return;
    };

    tracing::error!(
        engine = %shared.name,
        error = %error,
        "Engine execution failed, sleeping before running again"
    );

    let _ = shared.failures.send(EngineFailure {
        engine_id: shared.id,
        engine_name: shared.name.clone(),
        prior_state,
        error: error.to_string(),
    });

    if !sleep_or_cancelled(shared.config.recovery_delay, token).await {
        return;
    }

    tracing::info!(engine = %shared.name, "Engine recovered, running again");
    shared.set_status_if_live(EngineState::Running, token);
}

/// Sleep for `duration`; returns `false` if cancelled first.
async fn sleep_or_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
