//! Worker pool supervision.
//!
//! # Data Flow
//! ```text
//! start():   validate → bind endpoint → spawn every slot → wait for Ready
//! monitor(): worker events ─┐
//!            control cmds ──┼──▶ control loop ──▶ WorkerTable ──▶ PoolSnapshot (watch)
//!            tick (100ms) ──┘        │
//!                                    └──▶ spawn / SIGTERM / SIGKILL
//! ```
//!
//! # Design Decisions
//! - The control loop is the table's only writer; handles talk to it over a channel
//! - One bind per supervisor lifetime; reload reuses the endpoint
//! - Rolling reload drains one slot, then waits for its replacement to be Ready
//! - A slot that keeps dying young is parked until the next reload

pub mod policy;
pub mod spawn;
pub mod table;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::{validate_config, ConfigError, PartialStartupPolicy, ServerConfig};
use crate::error::{Result, ServerError};
use crate::lifecycle::{DrainReason, StartupReport};
use crate::net::ListeningEndpoint;
use crate::observability::metrics;
use crate::worker::{WorkerMessage, WorkerSettings};

use self::policy::{jittered_max_requests, RestartDecision, RestartPolicy};
use self::spawn::{spawn_worker, ExitReason, WorkerCommand, WorkerEvent};
use self::table::{PoolSnapshot, SlotStatus, WorkerId, WorkerRecord, WorkerState, WorkerTable};

const TICK: Duration = Duration::from_millis(100);

/// How to stop the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain every worker, SIGKILL whatever is left after the grace period.
    Graceful,
    /// SIGKILL every worker now.
    Immediate,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Graceful => f.write_str("graceful"),
            ShutdownMode::Immediate => f.write_str("immediate"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Reload,
    Shutdown(ShutdownMode),
}

#[derive(Debug, Error)]
#[error("supervisor is no longer running")]
pub struct SupervisorGone;

/// Cloneable remote control for a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    control: mpsc::UnboundedSender<Control>,
    snapshots: watch::Receiver<PoolSnapshot>,
}

impl SupervisorHandle {
    /// Request a rolling reload.
    pub fn reload(&self) -> std::result::Result<(), SupervisorGone> {
        self.control.send(Control::Reload).map_err(|_| SupervisorGone)
    }

    /// Request shutdown. A second graceful request escalates to immediate.
    pub fn shutdown(&self, mode: ShutdownMode) -> std::result::Result<(), SupervisorGone> {
        self.control
            .send(Control::Shutdown(mode))
            .map_err(|_| SupervisorGone)
    }

    /// The most recently published pool state.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshots.clone()
    }

    /// Resolve once the pool starts shutting down or the supervisor is gone.
    pub async fn shutting_down(&self) {
        let mut rx = self.snapshots.clone();
        let _ = rx.wait_for(|s| s.shutting_down).await;
    }

    /// A handle wired to bare channels instead of a running supervisor.
    #[cfg(test)]
    pub(crate) fn detached(
        snapshot: PoolSnapshot,
    ) -> (Self, mpsc::UnboundedReceiver<Control>, watch::Sender<PoolSnapshot>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots) = watch::channel(snapshot);
        (Self { control, snapshots }, control_rx, snapshots_tx)
    }

    /// Wait for a snapshot matching `predicate`, up to `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> Option<PoolSnapshot>
    where
        F: FnMut(&PoolSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let found = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        };
        found
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    slot: usize,
    due: Instant,
}

#[derive(Debug)]
struct RollingReload {
    queue: VecDeque<usize>,
    /// Replacement we are waiting on, and when we stop waiting.
    awaiting: Option<(WorkerId, Instant)>,
    started: Instant,
}

/// Owns the listening endpoint and the worker pool.
pub struct Supervisor {
    config: ServerConfig,
    command: WorkerCommand,
    endpoint: Option<ListeningEndpoint>,
    local_addr: SocketAddr,
    table: WorkerTable,
    policy: RestartPolicy,
    events_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
    events_rx: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    snapshots: watch::Sender<PoolSnapshot>,
    pending: Vec<PendingRestart>,
    reload: Option<RollingReload>,
    shutdown: Option<ShutdownMode>,
    startup: Option<StartupReport>,
}

impl Supervisor {
    /// Validate, bind and bring the pool up.
    ///
    /// Returns once every worker is Ready or the startup window closes. A
    /// short pool is kept or torn down according to `startup.on_partial`.
    pub async fn start(config: ServerConfig, command: WorkerCommand) -> Result<Self> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let endpoint = ListeningEndpoint::bind(&config.listener)?;

        tracing::info!(
            address = %endpoint.local_addr(),
            workers = config.workers.count,
            execution_model = %config.workers.execution_model,
            "Listening"
        );

        let mut supervisor = Self::new(config, command, endpoint);
        let now = Instant::now();
        for slot in 0..supervisor.table.expected() {
            supervisor.spawn_slot(slot, now);
        }
        supervisor.publish();

        let report = supervisor.await_startup().await;
        if report.is_complete() {
            tracing::info!(
                workers = report.ready,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "All workers ready"
            );
        } else {
            let err = ServerError::PartialStartup {
                ready: report.ready,
                expected: report.expected,
                timeout: supervisor.config.startup.timeout(),
            };
            match supervisor.config.startup.on_partial {
                PartialStartupPolicy::Continue => {
                    tracing::warn!(error = %err, "Continuing with reduced capacity");
                }
                PartialStartupPolicy::Fail => {
                    tracing::error!(error = %err, "Startup failed, stopping workers");
                    supervisor.begin_shutdown(ShutdownMode::Immediate, Instant::now());
                    supervisor.run().await;
                    return Err(err);
                }
            }
        }

        supervisor.startup = Some(report);
        Ok(supervisor)
    }

    fn new(config: ServerConfig, command: WorkerCommand, endpoint: ListeningEndpoint) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let table = WorkerTable::new(config.workers.count);
        let (snapshots, _) = watch::channel(table.snapshot(false, false));

        Self {
            policy: RestartPolicy::from_config(&config.restart),
            local_addr: endpoint.local_addr(),
            endpoint: Some(endpoint),
            config,
            command,
            table,
            events_tx,
            events_rx,
            control_tx,
            control_rx,
            snapshots,
            pending: Vec::new(),
            reload: None,
            shutdown: None,
            startup: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.startup.as_ref()
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            control: self.control_tx.clone(),
            snapshots: self.snapshots.subscribe(),
        }
    }

    /// Run the control loop until shutdown completes.
    pub async fn monitor(mut self) {
        self.run().await;
        tracing::info!(
            requests = self.table.requests_total(),
            "All workers exited"
        );
    }

    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !(self.shutdown.is_some() && self.table.live_count() == 0) {
            tokio::select! {
                Some((id, event)) = self.events_rx.recv() => self.on_event(id, event, Instant::now()),
                Some(control) = self.control_rx.recv() => self.on_control(control, Instant::now()),
                _ = ticker.tick() => self.tick(Instant::now()),
            }
            self.publish();
        }
    }

    async fn await_startup(&mut self) -> StartupReport {
        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + self.config.startup.timeout());
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.table.ready_count() < self.table.expected() {
            // Every remaining slot crash-looped: nothing left to wait for.
            if self.table.ready_count() + self.table.parked_count() >= self.table.expected()
                || (self.table.live_count() == 0 && self.pending.is_empty())
            {
                break;
            }
            tokio::select! {
                Some((id, event)) = self.events_rx.recv() => self.on_event(id, event, Instant::now()),
                _ = ticker.tick() => self.tick(Instant::now()),
                _ = tokio::time::sleep_until(deadline) => break,
            }
            self.publish();
        }

        StartupReport {
            expected: self.table.expected(),
            ready: self.table.ready_count(),
            elapsed: started.elapsed(),
        }
    }

    fn publish(&self) {
        let snapshot = self
            .table
            .snapshot(self.reload.is_some(), self.shutdown.is_some());
        metrics::record_pool(&snapshot);
        self.snapshots.send_replace(snapshot);
    }

    fn on_control(&mut self, control: Control, now: Instant) {
        match control {
            Control::Reload => self.begin_reload(now),
            Control::Shutdown(mode) => self.begin_shutdown(mode, now),
        }
    }

    fn on_event(&mut self, id: WorkerId, event: WorkerEvent, now: Instant) {
        match event {
            WorkerEvent::Message(WorkerMessage::Ready) => {
                if self.table.mark_ready(id, now) {
                    if let Some(record) = self.table.get(id) {
                        tracing::info!(worker = %id, pid = record.pid, slot = record.slot, "Worker ready");
                    }
                    self.settle_reload(id, now);
                }
            }
            WorkerEvent::Message(WorkerMessage::Heartbeat { in_flight, requests }) => {
                self.table.heartbeat(id, now, in_flight, requests);
            }
            WorkerEvent::Message(WorkerMessage::Draining { reason }) => {
                self.on_worker_draining(id, reason, now);
            }
            WorkerEvent::Message(WorkerMessage::Exiting { requests }) => {
                if let Some(record) = self.table.get_mut(id) {
                    record.requests = requests;
                }
            }
            WorkerEvent::Exited(reason) => self.on_worker_exit(id, reason, now),
        }
    }

    /// A worker started draining on its own: refill its slot right away.
    fn on_worker_draining(&mut self, id: WorkerId, reason: DrainReason, now: Instant) {
        let Some(record) = self.table.get(id) else {
            return;
        };
        let slot = record.slot;
        tracing::info!(worker = %id, pid = record.pid, slot, %reason, "Worker draining");

        let deadline = now + self.config.reload.drain_timeout();
        let detached = self.table.begin_drain(id, deadline);
        if detached.is_some() && self.shutdown.is_none() {
            self.spawn_slot(slot, now);
        }
    }

    fn on_worker_exit(&mut self, id: WorkerId, reason: ExitReason, now: Instant) {
        let Some((record, was_current)) = self.table.remove(id, reason.code()) else {
            return;
        };
        let crashed = was_current && self.shutdown.is_none();
        metrics::record_worker_exit(crashed);

        if crashed {
            let err = ServerError::WorkerCrash {
                slot: record.slot,
                worker: id,
                reason,
            };
            tracing::warn!(pid = record.pid, requests = record.requests, error = %err, "Worker crashed");
            self.on_slot_failure(record.slot, record.uptime(now), now);
        } else {
            tracing::info!(
                worker = %id,
                pid = record.pid,
                slot = record.slot,
                requests = record.requests,
                %reason,
                "Worker exited"
            );
        }

        if self.awaiting_replacement(id) {
            self.abort_reload(id, "replacement exited before becoming ready");
        }
    }

    /// Apply the restart policy to a slot whose worker died or never started.
    fn on_slot_failure(&mut self, slot: usize, uptime: Option<Duration>, now: Instant) {
        let Some(state) = self.table.slot_mut(slot) else {
            return;
        };

        match self.policy.on_exit(&mut state.tracker, uptime) {
            RestartDecision::Restart { delay } => {
                tracing::debug!(slot, delay_ms = delay.as_millis() as u64, "Scheduling restart");
                if delay.is_zero() {
                    self.spawn_slot(slot, now);
                } else {
                    state.status = SlotStatus::Backoff;
                    self.pending.push(PendingRestart {
                        slot,
                        due: now + delay,
                    });
                }
            }
            RestartDecision::GiveUp { failures } => {
                state.status = SlotStatus::CrashLooped;
                let err = ServerError::CrashLoop { slot, failures };
                tracing::error!(error = %err, "Slot parked");
                metrics::record_crash_loop();
            }
        }
    }

    /// Spawn a worker into a vacant slot.
    fn spawn_slot(&mut self, slot: usize, now: Instant) -> Option<WorkerId> {
        if self.shutdown.is_some() {
            return None;
        }
        let listen_fd = self.endpoint.as_ref()?.raw_fd();
        if self.table.slot(slot)?.current.is_some() {
            return None;
        }

        let id = self.table.allocate_id();
        let max_requests = jittered_max_requests(
            self.config.workers.max_requests,
            self.config.workers.max_requests_jitter,
        );
        let settings = WorkerSettings::from_config(&self.config, id.0, slot, max_requests);

        match spawn_worker(&self.command, listen_fd, &settings, id, self.events_tx.clone()) {
            Ok(handle) => {
                let record = WorkerRecord::new(id, slot, handle, now);
                tracing::info!(worker = %id, pid = record.pid, slot, "Spawned worker");
                if let Err(e) = self.table.insert(record) {
                    tracing::error!(worker = %id, error = %e, "Could not register worker");
                    return None;
                }
                metrics::record_worker_spawned();
                Some(id)
            }
            Err(e) => {
                let err = ServerError::Spawn(e);
                tracing::error!(slot, error = %err, "Failed to start worker");
                self.on_slot_failure(slot, None, now);
                None
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        self.run_due_restarts(now);
        self.enforce_deadlines(now);

        let overdue = matches!(
            &self.reload,
            Some(RollingReload { awaiting: Some((_, deadline)), .. }) if now >= *deadline
        );
        if overdue {
            if let Some((id, _)) = self.reload.as_ref().and_then(|r| r.awaiting) {
                self.abort_reload(id, "replacement not ready in time");
            }
        }
    }

    fn run_due_restarts(&mut self, now: Instant) {
        if self.shutdown.is_some() {
            self.pending.clear();
            return;
        }

        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|restart| restart.due <= now);
        self.pending = later;

        for restart in due {
            let parked = self
                .table
                .slot(restart.slot)
                .map_or(true, |slot| slot.status == SlotStatus::CrashLooped);
            if !parked {
                self.spawn_slot(restart.slot, now);
            }
        }
    }

    /// SIGKILL hung, stuck and overdue workers, once each.
    fn enforce_deadlines(&mut self, now: Instant) {
        let heartbeat_timeout = self.config.workers.timeout();
        let startup_timeout = self.config.startup.timeout();

        let overdue: Vec<(WorkerId, &'static str)> = self
            .table
            .workers()
            .filter(|w| !w.kill_sent)
            .filter_map(|w| {
                let why = match w.state {
                    WorkerState::Ready
                        if now.saturating_duration_since(w.last_heartbeat) > heartbeat_timeout =>
                    {
                        "heartbeat timeout"
                    }
                    WorkerState::Starting
                        if now.saturating_duration_since(w.started_at) > startup_timeout =>
                    {
                        "startup timeout"
                    }
                    WorkerState::Draining if w.drain_deadline.is_some_and(|d| now >= d) => {
                        "drain deadline"
                    }
                    _ => return None,
                };
                Some((w.id, why))
            })
            .collect();

        for (id, why) in overdue {
            if let Some(record) = self.table.get_mut(id) {
                tracing::warn!(worker = %id, pid = record.pid, reason = why, "Killing worker");
                record.kill_sent = true;
                record.handle.signal(Signal::SIGKILL);
            }
        }
    }

    fn begin_reload(&mut self, now: Instant) {
        if self.shutdown.is_some() {
            tracing::debug!("Ignoring reload during shutdown");
            return;
        }
        if self.reload.is_some() {
            tracing::warn!("Reload already in progress, ignoring");
            return;
        }

        tracing::info!(workers = self.table.expected(), "Starting rolling reload");
        self.reload = Some(RollingReload {
            queue: (0..self.table.expected()).collect(),
            awaiting: None,
            started: now,
        });
        self.advance_reload(now);
    }

    fn awaiting_replacement(&self, id: WorkerId) -> bool {
        self.reload
            .as_ref()
            .and_then(|reload| reload.awaiting)
            .is_some_and(|(awaited, _)| awaited == id)
    }

    /// The awaited replacement is Ready: move on to the next slot.
    fn settle_reload(&mut self, id: WorkerId, now: Instant) {
        if !self.awaiting_replacement(id) {
            return;
        }
        if let Some(reload) = self.reload.as_mut() {
            reload.awaiting = None;
        }
        self.advance_reload(now);
    }

    /// Stop a rolling reload without draining any further slots.
    ///
    /// The failed slot stays with the restart policy; untouched slots keep
    /// their current workers.
    fn abort_reload(&mut self, worker: WorkerId, why: &'static str) {
        if let Some(reload) = self.reload.take() {
            tracing::error!(
                %worker,
                reason = why,
                remaining = reload.queue.len(),
                "Rolling reload aborted"
            );
            metrics::record_reload_aborted();
        }
    }

    fn advance_reload(&mut self, now: Instant) {
        loop {
            let Some(reload) = self.reload.as_mut() else {
                return;
            };
            if reload.awaiting.is_some() {
                return;
            }

            let Some(slot) = reload.queue.pop_front() else {
                let elapsed = now.saturating_duration_since(reload.started);
                self.reload = None;
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "Rolling reload complete");
                metrics::record_reload();
                return;
            };

            match self.replace_slot(slot, now) {
                Some(id) => {
                    let deadline = now + self.config.startup.timeout();
                    if let Some(reload) = self.reload.as_mut() {
                        reload.awaiting = Some((id, deadline));
                    }
                }
                None => {
                    if let Some(reload) = self.reload.take() {
                        tracing::error!(
                            slot,
                            remaining = reload.queue.len(),
                            "Rolling reload aborted: replacement failed to start"
                        );
                        metrics::record_reload_aborted();
                    }
                    return;
                }
            }
        }
    }

    /// Drain a slot's worker and spawn its successor. Parked slots start fresh.
    fn replace_slot(&mut self, slot: usize, now: Instant) -> Option<WorkerId> {
        self.pending.retain(|restart| restart.slot != slot);
        let state = self.table.slot_mut(slot)?;
        state.tracker.reset();
        state.status = SlotStatus::Active;

        if let Some(old) = state.current {
            self.table
                .begin_drain(old, now + self.config.reload.drain_timeout());
            if let Some(record) = self.table.get(old) {
                tracing::debug!(worker = %old, pid = record.pid, slot, "Draining for reload");
                record.handle.signal(Signal::SIGTERM);
            }
        }

        self.spawn_slot(slot, now)
    }

    fn begin_shutdown(&mut self, requested: ShutdownMode, now: Instant) {
        let mode = match (self.shutdown, requested) {
            (Some(ShutdownMode::Immediate), _) => return,
            (Some(ShutdownMode::Graceful), ShutdownMode::Graceful) => {
                tracing::warn!("Second shutdown request, escalating to immediate");
                ShutdownMode::Immediate
            }
            (_, mode) => mode,
        };

        self.shutdown = Some(mode);
        self.pending.clear();
        self.reload = None;
        if self.endpoint.take().is_some() {
            tracing::debug!(address = %self.local_addr, "Closed supervisor copy of the listener");
        }

        let (deadline, signal) = match mode {
            ShutdownMode::Graceful => (now + self.config.shutdown.graceful_timeout(), Signal::SIGTERM),
            ShutdownMode::Immediate => (now, Signal::SIGKILL),
        };
        tracing::info!(%mode, workers = self.table.live_count(), "Shutting down");

        let ids: Vec<WorkerId> = self.table.workers().map(|w| w.id).collect();
        for id in ids {
            self.table.begin_drain(id, deadline);
            if let Some(record) = self.table.get_mut(id) {
                if mode == ShutdownMode::Immediate {
                    record.kill_sent = true;
                }
                record.handle.signal(signal);
            }
        }
    }
}
