//! State checkpointer: periodic stack saves and the bounded restore protocol.
//!
//! Layout below the state area: `s` summary, `ss/<depth>` one slot per stack
//! entry, `n`/`nb` host data, `ra1`..`ra3` restore-attempt markers. Each
//! restore consumes a marker; only a successful restore clears them, so a
//! state that keeps crashing the host is abandoned after three attempts.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::hooks::{CheckpointHooks, RESTORE_ATTEMPT_MARKERS, StateArea};
use crate::checkpoint::metadata::{RestoreStatus, StateMetadata};
use crate::config::CheckpointConfig;
use crate::engine::{EngineWork, ExecutionEngine};
use crate::error::{CheckpointError, StoreError};
use crate::navigation::{ActivatedUnit, NavigationStack, PlatformHandle, UnitKindRegistry, UnitRecord};
use crate::store::{self, CompressionHint, ObjectStore, Presence};
use crate::util::{lock, panic_message};

const STORE_HINT: CompressionHint = CompressionHint::Compact;
const DISABLED_SCORE: u32 = 100;

pub struct StateCheckpointer<M: StateMetadata, H: CheckpointHooks<M>> {
    store: Arc<dyn ObjectStore>,
    stack: Arc<NavigationStack>,
    registry: Arc<UnitKindRegistry>,
    hooks: H,
    config: CheckpointConfig,
    area: StateArea,
    metadata: tokio::sync::Mutex<M>,
    /// Earliest reference point for the next unforced save.
    last_saved: Mutex<Instant>,
    saved_once: AtomicBool,
    restoring: AtomicBool,
    clearing: AtomicBool,
    attempted_restore: AtomicBool,
    can_restore: AtomicBool,
    changes_detected: AtomicBool,
    failure_score: AtomicU32,
    attached: Mutex<Vec<Arc<ExecutionEngine>>>,
}

impl<M: StateMetadata, H: CheckpointHooks<M>> StateCheckpointer<M, H> {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        stack: Arc<NavigationStack>,
        registry: Arc<UnitKindRegistry>,
        hooks: H,
        config: CheckpointConfig,
    ) -> Self {
        let now = Instant::now();
        let long_ago = now.checked_sub(Duration::from_secs(3600)).unwrap_or(now);
        let area = StateArea::new(config.state_area.clone());
        Self {
            store,
            stack,
            registry,
            hooks,
            config,
            area,
            metadata: tokio::sync::Mutex::new(M::default()),
            last_saved: Mutex::new(long_ago),
            saved_once: AtomicBool::new(false),
            restoring: AtomicBool::new(false),
            clearing: AtomicBool::new(false),
            attempted_restore: AtomicBool::new(false),
            can_restore: AtomicBool::new(true),
            changes_detected: AtomicBool::new(false),
            failure_score: AtomicU32::new(0),
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn area(&self) -> &StateArea {
        &self.area
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Freeze `engine` while persisted state is being cleared.
    pub fn attach_engine(&self, engine: Arc<ExecutionEngine>) {
        lock(&self.attached).push(engine);
    }

    // ── Flags ──────────────────────────────────────────────────────────

    pub fn can_save_state(&self) -> bool {
        match self.config.save_failure_cutoff {
            Some(cutoff) => self.failure_score.load(Ordering::SeqCst) <= cutoff,
            None => true,
        }
    }

    pub fn can_restore_state(&self) -> bool {
        self.can_restore.load(Ordering::SeqCst)
    }

    pub fn attempted_restore(&self) -> bool {
        self.attempted_restore.load(Ordering::SeqCst)
    }

    pub fn is_clearing_state(&self) -> bool {
        self.clearing.load(Ordering::SeqCst)
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    pub fn failure_score(&self) -> u32 {
        self.failure_score.load(Ordering::SeqCst)
    }

    fn defer_saves_until(&self, at: Instant) {
        *lock(&self.last_saved) = at;
    }

    fn save_due(&self, now: Instant) -> bool {
        now >= *lock(&self.last_saved) + self.config.save_interval
    }

    // ── Notifications ──────────────────────────────────────────────────

    /// Count a failed save. Each failure weighs 3.
    pub fn notify_failed_state_saving_attempt(&self) {
        let score = self.failure_score.fetch_add(3, Ordering::SeqCst) + 3;
        if let Some(cutoff) = self.config.save_failure_cutoff {
            if score > cutoff && score - 3 <= cutoff {
                tracing::warn!(score, cutoff, "State saving disabled after repeated failures");
            }
        }
    }

    pub fn notify_successful_state_saving_attempt(&self) {
        self.failure_score.store(0, Ordering::SeqCst);
    }

    /// Disable saving (and therefore restoring).
    pub fn notify_state_saving_disabled(&self) {
        self.attempted_restore.store(true, Ordering::SeqCst);
        self.failure_score.store(DISABLED_SCORE, Ordering::SeqCst);
    }

    pub fn notify_state_saving_enabled(&self) {
        self.attempted_restore.store(true, Ordering::SeqCst);
        self.failure_score.store(0, Ordering::SeqCst);
    }

    /// The user declined restoring; allow saving after the reset interval.
    pub fn notify_invalid_state(&self) {
        self.attempted_restore.store(true, Ordering::SeqCst);
        self.can_restore.store(false, Ordering::SeqCst);
        self.defer_saves_until(Instant::now() + self.config.reset_interval);
    }

    /// Force the next save to write the summary.
    pub fn notify_changes_detected(&self) {
        self.changes_detected.store(true, Ordering::SeqCst);
    }

    fn notify_state_restored(&self) {
        self.attempted_restore.store(true, Ordering::SeqCst);
        self.saved_once.store(false, Ordering::SeqCst);
        self.defer_saves_until(Instant::now() + self.config.reset_interval);
    }

    // ── Restore probe ──────────────────────────────────────────────────

    /// Decide whether a saved state should be restored.
    ///
    /// Leftover restore markers mean an earlier restore did not finish; the
    /// state is wiped instead of being offered again.
    pub async fn check_restore_status(&self) -> RestoreStatus {
        if !self.can_save_state() || !self.can_restore_state() {
            return RestoreStatus::NoStateSaved;
        }

        if !self.exists(&self.area.summary()).await {
            return RestoreStatus::NoStateSaved;
        }

        if self.exists(&self.area.marker(1)).await {
            tracing::info!("Unfinished restore detected, discarding saved state");
            self.clear_state().await;
            return RestoreStatus::NoStateSaved;
        }

        let Some(metadata) = store::load::<M>(
            self.store.as_ref(),
            &self.area.summary(),
            Presence::Expected,
            STORE_HINT,
        )
        .await
        else {
            return RestoreStatus::NoStateSaved;
        };

        let age = (Utc::now() - metadata.summary().timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.config.automatic_restore_window {
            RestoreStatus::AutomaticRestore
        } else if age < self.config.prompt_restore_window {
            RestoreStatus::PromptForRestore
        } else {
            RestoreStatus::NoStateSaved
        }
    }

    async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key, error = %e, "Existence check failed");
                false
            }
        }
    }

    // ── Clearing ───────────────────────────────────────────────────────

    /// Wipe every persisted key and recreate the folders.
    ///
    /// Attached engines are frozen for the duration.
    pub async fn clear_state(&self) {
        self.clearing.store(true, Ordering::SeqCst);
        let engines = lock(&self.attached).clone();
        for engine in &engines {
            if !engine.request_freeze().await {
                tracing::warn!(engine = %engine.name(), "Engine did not freeze before clearing state");
            }
        }

        if let Err(e) = self.wipe().await {
            tracing::error!(error = %e, "Failed to clear state");
        }
        self.notify_changes_detected();

        for engine in &engines {
            engine.unfreeze();
        }
        self.clearing.store(false, Ordering::SeqCst);
        tracing::info!(area = %self.area.root(), "Persisted state cleared");
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        self.clear_restore_markers().await?;
        self.store.delete(&self.area.slots()).await?;
        self.store.create_or_open_folder(&self.area.slots()).await?;
        self.store.delete(&self.area.summary()).await?;
        for folder in [self.area.navigation(), self.area.navigation_batches()] {
            self.store.delete(&folder).await?;
            self.store.create_or_open_folder(&folder).await?;
        }
        Ok(())
    }

    async fn clear_restore_markers(&self) -> Result<(), StoreError> {
        for index in 1..=RESTORE_ATTEMPT_MARKERS {
            self.store.delete(&self.area.marker(index)).await?;
        }
        Ok(())
    }

    /// Number of restore-attempt markers currently persisted.
    pub async fn restore_attempts(&self) -> usize {
        let mut count = 0;
        for index in 1..=RESTORE_ATTEMPT_MARKERS {
            if self.exists(&self.area.marker(index)).await {
                count += 1;
            }
        }
        count
    }

    // ── Restore ────────────────────────────────────────────────────────

    /// Rebuild the navigation stack from the persisted state.
    ///
    /// Returns `false` on every refusal; nothing here panics or errors out.
    pub async fn restore_state(&self, platform: &PlatformHandle) -> bool {
        self.restoring.store(true, Ordering::SeqCst);

        let outcome = AssertUnwindSafe(self.try_restore(platform))
            .catch_unwind()
            .await;

        if self.stack.is_restoring() {
            self.stack.notify_restoration_completed(false);
        }
        self.hooks.cleanup_after_restoration();
        self.notify_state_restored();
        self.restoring.store(false, Ordering::SeqCst);

        match outcome {
            Ok(Ok(depth)) => {
                tracing::info!(depth, "State restored");
                true
            }
            Ok(Err(e)) => {
                tracing::info!(reason = %e, "State not restored");
                false
            }
            Err(payload) => {
                tracing::error!(error = %panic_message(payload.as_ref()), "Failed to restore state");
                false
            }
        }
    }

    async fn try_restore(&self, platform: &PlatformHandle) -> Result<usize, CheckpointError> {
        if !self.can_save_state() || !self.can_restore_state() {
            return Err(CheckpointError::Refused("restoring is disabled".to_string()));
        }

        self.mark_restore_attempt().await?;

        let metadata = store::load::<M>(
            self.store.as_ref(),
            &self.area.summary(),
            Presence::Optional,
            STORE_HINT,
        )
        .await
        .ok_or_else(|| CheckpointError::Refused("no saved summary".to_string()))?;
        if !metadata.is_valid() {
            return Err(CheckpointError::Refused("saved summary is invalid".to_string()));
        }

        if !self
            .hooks
            .restore_auxiliary_data(self.store.as_ref(), &self.area, &metadata)
            .await
        {
            return Err(CheckpointError::Refused(
                "auxiliary data could not be restored".to_string(),
            ));
        }

        let units = self.load_units(metadata.summary().deepest_depth).await?;
        self.rebuild_stack(platform, &units).await?;

        *self.metadata.lock().await = metadata;
        self.clear_restore_markers().await?;
        self.notify_changes_detected();
        Ok(units.len())
    }

    /// Consume the next restore marker. Exhausted markers wipe the state.
    async fn mark_restore_attempt(&self) -> Result<(), CheckpointError> {
        for index in 1..=RESTORE_ATTEMPT_MARKERS {
            let marker = self.area.marker(index);
            if !self.store.exists(&marker).await? {
                self.store.touch(&marker).await?;
                tracing::debug!(attempt = index, "Restore attempt marked");
                return Ok(());
            }
        }

        self.can_restore.store(false, Ordering::SeqCst);
        tracing::warn!("Restore attempts exhausted, clearing saved state");
        self.clear_state().await;
        Err(CheckpointError::Refused("restore attempts exhausted".to_string()))
    }

    async fn load_units(&self, deepest: usize) -> Result<Vec<Arc<ActivatedUnit>>, CheckpointError> {
        let mut units: Vec<Arc<ActivatedUnit>> = Vec::new();
        let mut previous_kind: Option<String> = None;

        for depth in 1..=deepest {
            let record: UnitRecord = store::load(
                self.store.as_ref(),
                &self.area.slot(depth),
                Presence::Expected,
                STORE_HINT,
            )
            .await
            .ok_or(CheckpointError::CorruptSlot { depth })?;

            self.registry.validate(&record.kind, &record.payload)?;

            if depth == 1 && record.kind != self.config.root_kind {
                return Err(CheckpointError::UnexpectedRoot {
                    found: record.kind,
                    expected: self.config.root_kind.clone(),
                });
            }

            if self.config.collapse_duplicate_kinds
                && previous_kind.as_deref() == Some(record.kind.as_str())
            {
                tracing::warn!(depth, kind = %record.kind, "Collapsing repeated kind");
                continue;
            }

            previous_kind = Some(record.kind.clone());
            let unit = ActivatedUnit::from_record(record);
            unit.set_materialized(true);
            units.push(Arc::new(unit));
        }

        if units.is_empty() {
            return Err(CheckpointError::Refused("no units decoded".to_string()));
        }
        Ok(units)
    }

    async fn rebuild_stack(
        &self,
        platform: &PlatformHandle,
        units: &[Arc<ActivatedUnit>],
    ) -> Result<(), CheckpointError> {
        self.stack.clear();
        self.stack.begin_restoration();

        let last = units.len() - 1;
        for (index, unit) in units.iter().enumerate() {
            if index == 0 {
                tokio::time::sleep(self.config.first_entry_settle_delay).await;
            }
            tokio::time::sleep(self.config.entry_settle_delay).await;

            let depth = index + 1;
            if !self.hooks.link_unit(unit, depth) {
                return Err(CheckpointError::Refused(format!(
                    "unit at depth {depth} could not be linked"
                )));
            }

            let is_last = index == last;
            unit.set_lazy_initialization(!is_last);

            let navigator = self
                .registry
                .navigator(unit.kind())
                .ok_or_else(|| CheckpointError::UnknownKind {
                    kind: unit.kind().to_string(),
                })?;

            self.stack.push(Arc::clone(unit));
            let navigation = navigator.navigate_to_view(platform, Arc::clone(unit), is_last);
            match tokio::time::timeout(self.config.navigation_timeout, navigation).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(depth, kind = unit.kind(), "Navigation to restored unit failed");
                }
                Err(_) => {
                    tracing::warn!(depth, kind = unit.kind(), "Navigation to restored unit timed out");
                }
            }

            if is_last {
                tokio::time::sleep(self.config.last_entry_settle_delay).await;
                self.stack.notify_restoration_completed(true);
            }
        }
        Ok(())
    }

    // ── Save ───────────────────────────────────────────────────────────

    /// One checkpoint tick: honour a skipped restore, save when due, then
    /// drop the slots of finally deactivated units.
    pub async fn run_tick(&self) {
        if !self.attempted_restore() && !self.can_restore_state() {
            self.defer_saves_until(Instant::now() + self.config.save_interval);
            self.attempted_restore.store(true, Ordering::SeqCst);
        }

        if self.can_save_state() && !self.is_clearing_state() {
            let entire_stack = !self.saved_once.load(Ordering::SeqCst);
            match self.save_current_state(entire_stack).await {
                Ok(true) => self.notify_successful_state_saving_attempt(),
                Ok(false) => {}
                Err(e) => {
                    self.notify_failed_state_saving_attempt();
                    tracing::error!(error = %e, score = self.failure_score(), "Failed to save current state");
                }
            }
        }

        self.remove_deactivated_slots().await;
    }

    async fn remove_deactivated_slots(&self) {
        // Disposals stay queued until a restore decision has been made.
        if !self.attempted_restore() || self.is_restoring() || self.is_clearing_state() {
            return;
        }
        let stale = self.stack.collect_disposals(Instant::now());
        for depth in stale {
            if let Err(e) = self.store.delete(&self.area.slot(depth)).await {
                tracing::warn!(depth, error = %e, "Failed to delete deactivated slot");
            }
        }
    }

    fn force_timestamp_update(&self, metadata: &M) -> bool {
        let age = Utc::now() - metadata.summary().timestamp;
        let too_old = age
            .to_std()
            .is_ok_and(|age| age > self.config.forced_timestamp_age);
        too_old
            || metadata.summary().generation != self.stack.generation()
            || self.changes_detected.load(Ordering::SeqCst)
    }

    /// Persist the stack if saving is allowed and due.
    ///
    /// `entire_stack` rewrites every entry after clearing old slots. Returns
    /// whether a save ran.
    pub async fn save_current_state(&self, entire_stack: bool) -> Result<bool, CheckpointError> {
        if self.is_restoring()
            || !self.attempted_restore()
            || !self.can_save_state()
            || (!entire_stack && !self.saved_once.load(Ordering::SeqCst))
        {
            return Ok(false);
        }

        let mut metadata = self.metadata.lock().await;
        let now = Instant::now();
        let force = self.force_timestamp_update(&metadata);
        if !(self.save_due(now) || force) {
            return Ok(false);
        }
        self.defer_saves_until(now);

        if entire_stack {
            self.store.delete(&self.area.slots()).await?;
            self.store.create_or_open_folder(&self.area.slots()).await?;
            self.store.delete(&self.area.summary()).await?;
        }

        let snapshot = self.stack.snapshot();
        let mut savable_depth = 0;
        let mut saved = HashSet::new();
        for unit in &snapshot {
            if !self.registry.is_registered(unit.kind()) {
                break;
            }
            savable_depth += 1;
            if entire_stack || !unit.is_materialized() {
                self.save_unit(unit).await?;
                saved.insert(unit.id());
            }
        }
        metadata.summary_mut().max_navigable_depth_pre_save = savable_depth;

        // The top entry is always refreshed.
        if let Some(current) = self.stack.current() {
            if current.is_activated()
                && current.depth() <= savable_depth
                && !saved.contains(&current.id())
            {
                self.save_unit(&current).await?;
            }
        }

        if !self
            .hooks
            .save_auxiliary_data(self.store.as_ref(), &self.area, &mut metadata)
            .await
        {
            return Err(CheckpointError::AuxiliarySaveFailed);
        }

        if force || metadata.has_changes() {
            metadata.update_for_saving(self.stack.generation());
            store::save_timestamped(
                self.store.as_ref(),
                &self.area.summary(),
                &mut *metadata,
                STORE_HINT,
                force,
            )
            .await?;
            self.changes_detected.store(false, Ordering::SeqCst);
            tracing::debug!(depth = savable_depth, forced = force, "State summary saved");
        }

        self.saved_once.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn save_unit(&self, unit: &ActivatedUnit) -> Result<(), CheckpointError> {
        if !unit.is_activated() {
            return Ok(());
        }
        let record = unit.to_record();
        store::save(
            self.store.as_ref(),
            &self.area.slot(record.depth),
            &record,
            STORE_HINT,
        )
        .await?;
        unit.set_materialized(true);
        Ok(())
    }
}

#[async_trait]
impl<M: StateMetadata, H: CheckpointHooks<M>> EngineWork for StateCheckpointer<M, H> {
    async fn tick(&self, _cancel: &CancellationToken) -> anyhow::Result<usize> {
        self.run_tick().await;
        Ok(0)
    }
}
