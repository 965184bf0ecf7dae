//! Session lifecycle manager
//!
//! Each configured group keeps its current sessions in one immutable
//! [`GroupSnapshot`]. Readers clone the snapshot `Arc` and lease sessions out
//! of it; a refresh builds a complete replacement snapshot and swaps it in
//! with a single pointer assignment, so a reader sees either the whole old
//! group or the whole new one. Superseded sessions are retired in the
//! background once their last lease is gone.

use crate::error::AttemptFailure;
use crate::retry::{RetryPolicy, RetryStep, Sleeper, TokioSleeper};
use crate::session::{Session, SessionLease, SessionStatus};
use crate::source::TargetSource;
use crate::{Error, GroupConfig, GroupKind, Result, SlotConfig};
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const DEFAULT_REFRESH: Duration = Duration::from_secs(60 * 60);

/// The sessions of one group at one point in time, in slot order.
#[derive(Debug)]
pub struct GroupSnapshot {
    sessions: Vec<Arc<Session>>,
}

impl GroupSnapshot {
    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }
}

#[derive(Debug, Default, Clone)]
struct SlotHealth {
    consecutive_failures: u32,
    last_error: Option<String>,
}

struct GroupCell {
    config: GroupConfig,
    interval: Duration,
    current: RwLock<Arc<GroupSnapshot>>,
    health: Mutex<Vec<SlotHealth>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl GroupCell {
    fn snapshot(&self) -> Arc<GroupSnapshot> {
        Arc::clone(&self.current.read())
    }
}

/// Outcome of one refresh cycle for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Slots now backed by a new session
    pub refreshed: Vec<String>,
    /// Slots that kept their previous session because re-initialization failed
    pub kept: Vec<String>,
}

/// Per-slot status, as served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub group: String,
    pub slot_id: String,
    pub generation: u64,
    pub status: SessionStatus,
    pub age_secs: u64,
    pub consecutive_refresh_failures: u32,
    pub last_refresh_error: Option<String>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    source: Arc<dyn TargetSource>,
    groups: Vec<GroupConfig>,
    retry: RetryPolicy,
    refresh_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
    debug_captures: Option<PathBuf>,
}

impl SessionManagerBuilder {
    pub fn groups(mut self, groups: Vec<GroupConfig>) -> Self {
        self.groups = groups;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cadence for groups that do not set their own.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Write a full-page screenshot per slot into `dir` after each
    /// successful initialization.
    pub fn debug_captures(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_captures = dir;
        self
    }

    /// Bring every slot of every group to Ready.
    ///
    /// Groups and slots initialize concurrently. If any slot exhausts its
    /// retries, every session that did come up is closed again and the
    /// first failure is returned; nothing is left running.
    pub async fn start(self) -> Result<Arc<SessionManager>> {
        if self.groups.is_empty() {
            return Err(Error::ConfigError("no slot groups configured".into()));
        }

        let manager = SessionManager {
            source: self.source,
            retry: self.retry,
            sleeper: self.sleeper,
            debug_captures: self.debug_captures,
            generation: AtomicU64::new(0),
            groups: Vec::new(),
            refresh_tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        };

        let started = Instant::now();
        let results = join_all(self.groups.iter().map(|group| manager.initialize_group(group))).await;

        let mut first_error = None;
        let mut initialized = Vec::new();
        for (group, result) in self.groups.into_iter().zip(results) {
            match result {
                Ok(sessions) => initialized.push((group, sessions)),
                Err(e) => {
                    error!(target: "boardshot::manager", "group '{}' failed to initialize: {}", group.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for (_, sessions) in initialized {
                for session in sessions {
                    session.retire().await;
                }
            }
            return Err(e);
        }

        let mut manager = manager;
        manager.groups = initialized
            .into_iter()
            .map(|(config, sessions)| {
                let slots = config.slots.len();
                GroupCell {
                    interval: config.refresh_interval.unwrap_or(self.refresh_interval),
                    config,
                    current: RwLock::new(Arc::new(GroupSnapshot { sessions })),
                    health: Mutex::new(vec![SlotHealth::default(); slots]),
                    refreshing: tokio::sync::Mutex::new(()),
                }
            })
            .collect();

        info!(
            target: "boardshot::manager",
            "{} group(s) ready in {:?}",
            manager.groups.len(),
            started.elapsed()
        );
        Ok(Arc::new(manager))
    }
}

/// Owns every session and keeps them fresh.
pub struct SessionManager {
    source: Arc<dyn TargetSource>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    debug_captures: Option<PathBuf>,
    generation: AtomicU64,
    groups: Vec<GroupCell>,
    refresh_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn builder(source: Arc<dyn TargetSource>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            source,
            groups: Vec::new(),
            retry: RetryPolicy::default(),
            refresh_interval: DEFAULT_REFRESH,
            sleeper: Arc::new(TokioSleeper),
            debug_captures: None,
        }
    }

    /// Open a page for `slot` and navigate until it answers 200.
    ///
    /// Non-200 answers and navigation errors are retried on the manager's
    /// backoff schedule, reusing the same page. When the attempts run out
    /// the page is closed and [`Error::InitializationFailure`] reports the
    /// last thing that went wrong.
    pub async fn initialize_slot(&self, slot: &SlotConfig) -> Result<Arc<Session>> {
        let mut backoff = self.retry.backoff();
        let mut pending: Option<Session> = None;

        loop {
            let failure = match self.attempt(slot, &mut pending).await {
                Ok(()) => break,
                Err(failure) => failure,
            };

            match backoff.fail() {
                RetryStep::Retry(delay) => {
                    warn!(
                        target: "boardshot::manager",
                        "load {} attempt {} failed ({}); retrying in {:?}",
                        slot.url,
                        backoff.attempts(),
                        failure,
                        delay
                    );
                    self.sleeper.sleep(delay).await;
                }
                RetryStep::Exhausted => {
                    if let Some(session) = pending.take() {
                        if let Err(e) = session.release().await {
                            warn!(target: "boardshot::manager", "closing failed page for {}: {}", slot.id, e);
                        }
                    }
                    return Err(Error::InitializationFailure {
                        slot: slot.id.clone(),
                        attempts: backoff.attempts(),
                        last: failure,
                    });
                }
            }
        }

        let session = pending
            .take()
            .ok_or_else(|| Error::Other(format!("slot '{}' has no page after navigation", slot.id)))?;
        session.mark_ready();
        info!(
            target: "boardshot::manager",
            "load: {} 200 (slot {}, generation {})",
            slot.url,
            slot.id,
            session.generation()
        );
        self.write_debug_capture(&session).await;
        Ok(Arc::new(session))
    }

    async fn attempt(&self, slot: &SlotConfig, pending: &mut Option<Session>) -> std::result::Result<(), AttemptFailure> {
        let session = match pending.take() {
            Some(session) => session,
            None => {
                let page = self
                    .source
                    .open()
                    .await
                    .map_err(|e| AttemptFailure::Error(e.to_string()))?;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                Session::new(&slot.id, &slot.url, generation, page)
            }
        };

        debug!(target: "boardshot::manager", "load: {}", slot.url);
        let outcome = session.page().navigate(&slot.url).await;
        *pending = Some(session);
        match outcome {
            Ok(200) => Ok(()),
            Ok(status) => Err(AttemptFailure::Status(status)),
            Err(e) => Err(AttemptFailure::Error(e.to_string())),
        }
    }

    async fn write_debug_capture(&self, session: &Session) {
        let Some(dir) = &self.debug_captures else {
            return;
        };
        let path = dir.join(format!("{}.png", session.slot_id()));
        match session.page().capture_page().await {
            Ok(bytes) => match tokio::fs::write(&path, bytes).await {
                Ok(()) => info!(target: "boardshot::manager", "load: {} page capture {}", session.target_url(), path.display()),
                Err(e) => warn!(target: "boardshot::manager", "writing {} failed: {}", path.display(), e),
            },
            Err(e) => warn!(target: "boardshot::manager", "page capture for {} failed: {}", session.slot_id(), e),
        }
    }

    async fn initialize_group(&self, group: &GroupConfig) -> Result<Vec<Arc<Session>>> {
        let results = join_all(group.slots.iter().map(|slot| self.initialize_slot(slot))).await;
        let mut sessions = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(sessions),
            Some(e) => {
                for session in sessions {
                    session.retire().await;
                }
                Err(e)
            }
        }
    }

    fn locate(&self, slot_id: &str) -> Result<(usize, usize)> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(gi, g)| g.config.slots.iter().position(|s| s.id == slot_id).map(|si| (gi, si)))
            .ok_or_else(|| Error::UnknownSlot(slot_id.to_string()))
    }

    fn group_index(&self, name: &str) -> Result<usize> {
        self.groups
            .iter()
            .position(|g| g.config.name == name)
            .ok_or_else(|| Error::UnknownSlot(name.to_string()))
    }

    /// Lease the current Ready session of `slot_id`.
    ///
    /// Never waits on a refresh: until the new session is swapped in, the
    /// previous one is returned.
    pub fn current_session(&self, slot_id: &str) -> Result<SessionLease> {
        let (gi, si) = self.locate(slot_id)?;
        let cell = &self.groups[gi];
        loop {
            let snapshot = cell.snapshot();
            if let Some(lease) = snapshot.sessions[si].lease() {
                return Ok(lease);
            }
            // A session only stops leasing after its snapshot was replaced,
            // unless nothing will ever replace it.
            if Arc::ptr_eq(&snapshot, &cell.snapshot()) {
                return Err(Error::ShuttingDown);
            }
        }
    }

    /// Lease every session of `group`, all taken from the same snapshot.
    pub fn current_group(&self, group: &str) -> Result<Vec<SessionLease>> {
        let cell = &self.groups[self.group_index(group)?];
        loop {
            let snapshot = cell.snapshot();
            let leases: Option<Vec<_>> = snapshot.sessions.iter().map(|s| s.lease()).collect();
            if let Some(leases) = leases {
                return Ok(leases);
            }
            if Arc::ptr_eq(&snapshot, &cell.snapshot()) {
                return Err(Error::ShuttingDown);
            }
        }
    }

    /// Current snapshot of `group`, for inspection.
    pub fn snapshot(&self, group: &str) -> Result<Arc<GroupSnapshot>> {
        Ok(self.groups[self.group_index(group)?].snapshot())
    }

    /// Names of the groups of one kind, in configuration order.
    pub fn groups_of_kind(&self, kind: GroupKind) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.config.kind == kind)
            .map(|g| g.config.name.clone())
            .collect()
    }

    /// Configuration of the slot behind `slot_id`.
    pub fn slot_config(&self, slot_id: &str) -> Result<&SlotConfig> {
        let (gi, si) = self.locate(slot_id)?;
        Ok(&self.groups[gi].config.slots[si])
    }

    /// Run one refresh cycle for `group`.
    ///
    /// Every slot is re-initialized concurrently. Only once all of them
    /// have resolved is the new snapshot swapped in; slots whose
    /// re-initialization failed keep their previous session. Replaced
    /// sessions are retired in the background.
    pub async fn refresh_group(&self, group: &str) -> Result<RefreshReport> {
        let cell = &self.groups[self.group_index(group)?];
        let _refreshing = cell.refreshing.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let started = Instant::now();
        let results = join_all(cell.config.slots.iter().map(|slot| self.initialize_slot(slot))).await;

        let previous = cell.snapshot();
        let mut sessions = Vec::with_capacity(results.len());
        let mut superseded = Vec::new();
        let mut report = RefreshReport::default();
        {
            let mut health = cell.health.lock();
            for (idx, result) in results.into_iter().enumerate() {
                let slot_id = cell.config.slots[idx].id.clone();
                let old = &previous.sessions[idx];
                match result {
                    Ok(fresh) => {
                        health[idx] = SlotHealth::default();
                        superseded.push(Arc::clone(old));
                        sessions.push(fresh);
                        report.refreshed.push(slot_id);
                    }
                    Err(e) => {
                        let entry = &mut health[idx];
                        entry.consecutive_failures += 1;
                        entry.last_error = Some(e.to_string());
                        warn!(
                            target: "boardshot::manager",
                            "refresh of {} failed ({} in a row), keeping generation {}: {}",
                            slot_id,
                            entry.consecutive_failures,
                            old.generation(),
                            e
                        );
                        sessions.push(Arc::clone(old));
                        report.kept.push(slot_id);
                    }
                }
            }
        }

        *cell.current.write() = Arc::new(GroupSnapshot { sessions });
        drop(previous);

        for old in superseded {
            tokio::spawn(old.retire());
        }

        info!(
            target: "boardshot::manager",
            "refreshed group '{}' in {:?}: {} new, {} kept",
            group,
            started.elapsed(),
            report.refreshed.len(),
            report.kept.len()
        );
        Ok(report)
    }

    /// Start one background refresh loop per group.
    ///
    /// Loops are independent: a slow or failing group never delays
    /// another. Calling this twice has no extra effect.
    pub fn spawn_refresh_loops(self: &Arc<Self>) {
        let mut tasks = self.refresh_tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for cell in &self.groups {
            let manager = Arc::clone(self);
            let name = cell.config.name.clone();
            let period = cell.interval;
            tasks.push(tokio::spawn(async move {
                let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticks.tick().await;
                    match manager.refresh_group(&name).await {
                        Ok(_) => {}
                        Err(Error::ShuttingDown) => break,
                        Err(e) => error!(target: "boardshot::manager", "refresh loop for '{}': {}", name, e),
                    }
                }
            }));
        }
        debug!(target: "boardshot::manager", "spawned {} refresh loop(s)", tasks.len());
    }

    /// Per-slot generation, status and refresh health.
    pub fn status(&self) -> Vec<SlotReport> {
        let mut out = Vec::new();
        for cell in &self.groups {
            let snapshot = cell.snapshot();
            let health = cell.health.lock();
            for (idx, session) in snapshot.sessions.iter().enumerate() {
                out.push(SlotReport {
                    group: cell.config.name.clone(),
                    slot_id: session.slot_id().to_string(),
                    generation: session.generation(),
                    status: session.status(),
                    age_secs: session.age().as_secs(),
                    consecutive_refresh_failures: health[idx].consecutive_failures,
                    last_refresh_error: health[idx].last_error.clone(),
                });
            }
        }
        out
    }

    /// Stop refreshing and retire every current session.
    ///
    /// Waits for outstanding leases to drain. Afterwards every lookup
    /// fails with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.refresh_tasks.lock().drain(..) {
            task.abort();
        }
        let mut retiring = Vec::new();
        for cell in &self.groups {
            // Wait out a refresh that is already underway.
            let _refreshing = cell.refreshing.lock().await;
            retiring.extend(cell.snapshot().sessions.iter().cloned().map(Session::retire));
        }
        join_all(retiring).await;
        info!(target: "boardshot::manager", "all sessions closed");
    }
}
