//! The worker table: every live worker process and every pool slot.
//!
//! Only the supervisor control loop mutates the table; everyone else sees
//! [`PoolSnapshot`]s published after each mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::policy::RestartTracker;
use crate::supervisor::spawn::ProcessHandle;

/// Supervisor-assigned worker identity. Never reused within a supervisor lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Draining,
    Exited { code: Option<i32> },
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Draining => "draining",
            WorkerState::Exited { .. } => "exited",
        }
    }
}

/// One worker process as the supervisor sees it.
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: u32,
    pub state: WorkerState,
    pub started_at: Instant,
    pub ready_at: Option<Instant>,
    pub last_heartbeat: Instant,
    pub drain_deadline: Option<Instant>,
    pub in_flight: u64,
    pub requests: u64,
    /// SIGKILL already requested; avoids repeating it every tick.
    pub kill_sent: bool,
    pub handle: ProcessHandle,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, slot: usize, handle: ProcessHandle, now: Instant) -> Self {
        Self {
            id,
            slot,
            pid: handle.pid(),
            state: WorkerState::Starting,
            started_at: now,
            ready_at: None,
            last_heartbeat: now,
            drain_deadline: None,
            in_flight: 0,
            requests: 0,
            kill_sent: false,
            handle,
        }
    }

    /// Time since spawn, for workers that ever reported ready.
    pub fn uptime(&self, now: Instant) -> Option<Duration> {
        self.ready_at
            .map(|_| now.saturating_duration_since(self.started_at))
    }
}

/// Restart status of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Running a worker, or about to spawn one.
    Active,
    /// Waiting out a restart delay.
    Backoff,
    /// Gave up restarting; only a reload revives it.
    CrashLooped,
}

/// A position in the fixed-size pool.
#[derive(Debug, Clone)]
pub struct Slot {
    pub index: usize,
    pub current: Option<WorkerId>,
    pub tracker: RestartTracker,
    pub status: SlotStatus,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("slot {slot} already runs {current}")]
    SlotOccupied { slot: usize, current: WorkerId },

    #[error("slot {0} does not exist")]
    NoSuchSlot(usize),
}

/// Owned, single-writer worker table.
#[derive(Debug)]
pub struct WorkerTable {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    slots: Vec<Slot>,
    next_id: u64,
    started_at: Instant,
    retired_requests: u64,
}

impl WorkerTable {
    pub fn new(slots: usize) -> Self {
        Self {
            workers: BTreeMap::new(),
            slots: (0..slots)
                .map(|index| Slot {
                    index,
                    current: None,
                    tracker: RestartTracker::default(),
                    status: SlotStatus::Active,
                })
                .collect(),
            next_id: 1,
            started_at: Instant::now(),
            retired_requests: 0,
        }
    }

    pub fn allocate_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a freshly spawned worker as its slot's current worker.
    pub fn insert(&mut self, record: WorkerRecord) -> Result<(), TableError> {
        let slot = self
            .slots
            .get_mut(record.slot)
            .ok_or(TableError::NoSuchSlot(record.slot))?;
        if let Some(current) = slot.current {
            return Err(TableError::SlotOccupied {
                slot: record.slot,
                current,
            });
        }
        slot.current = Some(record.id);
        slot.status = SlotStatus::Active;
        self.workers.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// `Starting → Ready`. Returns false for any other transition.
    pub fn mark_ready(&mut self, id: WorkerId, now: Instant) -> bool {
        match self.workers.get_mut(&id) {
            Some(record) if record.state == WorkerState::Starting => {
                record.state = WorkerState::Ready;
                record.ready_at = Some(now);
                record.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    pub fn heartbeat(&mut self, id: WorkerId, now: Instant, in_flight: u64, requests: u64) {
        if let Some(record) = self.workers.get_mut(&id) {
            record.last_heartbeat = now;
            record.in_flight = in_flight;
            record.requests = requests;
        }
    }

    /// Move a worker to `Draining` and detach it from its slot.
    ///
    /// Returns the slot it was detached from, if it was that slot's current worker.
    pub fn begin_drain(&mut self, id: WorkerId, deadline: Instant) -> Option<usize> {
        let record = self.workers.get_mut(&id)?;
        if matches!(record.state, WorkerState::Starting | WorkerState::Ready) {
            record.state = WorkerState::Draining;
        }
        // An earlier deadline (e.g. immediate shutdown) is never pushed back.
        record.drain_deadline = Some(match record.drain_deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });

        let slot = self.slots.get_mut(record.slot)?;
        if slot.current == Some(id) {
            slot.current = None;
            Some(slot.index)
        } else {
            None
        }
    }

    /// Drop a reaped worker. Returns its record and whether it was its slot's current worker.
    pub fn remove(&mut self, id: WorkerId, code: Option<i32>) -> Option<(WorkerRecord, bool)> {
        let mut record = self.workers.remove(&id)?;
        record.state = WorkerState::Exited { code };
        self.retired_requests += record.requests;

        let was_current = match self.slots.get_mut(record.slot) {
            Some(slot) if slot.current == Some(id) => {
                slot.current = None;
                true
            }
            _ => false,
        };
        Some((record, was_current))
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|w| w.state == state).count()
    }

    pub fn ready_count(&self) -> usize {
        self.count_in(WorkerState::Ready)
    }

    /// Slots the restart policy gave up on.
    pub fn parked_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == SlotStatus::CrashLooped)
            .count()
    }

    /// Requests served by every worker this supervisor ever ran.
    pub fn requests_total(&self) -> u64 {
        self.retired_requests + self.workers.values().map(|w| w.requests).sum::<u64>()
    }

    pub fn snapshot(&self, reloading: bool, shutting_down: bool) -> PoolSnapshot {
        let now = Instant::now();
        PoolSnapshot {
            expected: self.expected(),
            ready: self.ready_count(),
            starting: self.count_in(WorkerState::Starting),
            draining: self.count_in(WorkerState::Draining),
            reloading,
            shutting_down,
            requests_total: self.requests_total(),
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            workers: self
                .workers
                .values()
                .map(|w| WorkerSnapshot {
                    id: w.id,
                    slot: w.slot,
                    pid: w.pid,
                    state: w.state,
                    age_ms: now.saturating_duration_since(w.started_at).as_millis() as u64,
                    heartbeat_age_ms: now.saturating_duration_since(w.last_heartbeat).as_millis() as u64,
                    in_flight: w.in_flight,
                    requests: w.requests,
                })
                .collect(),
            slots: self
                .slots
                .iter()
                .map(|s| SlotSnapshot {
                    index: s.index,
                    worker: s.current,
                    status: s.status,
                    consecutive_failures: s.tracker.consecutive_failures,
                    restarts: s.tracker.restarts,
                })
                .collect(),
        }
    }
}

/// Read-only view of the pool, published after every control-loop step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub expected: usize,
    pub ready: usize,
    pub starting: usize,
    pub draining: usize,
    pub reloading: bool,
    pub shutting_down: bool,
    pub requests_total: u64,
    pub uptime_secs: u64,
    pub workers: Vec<WorkerSnapshot>,
    pub slots: Vec<SlotSnapshot>,
}

impl PoolSnapshot {
    /// Pids of workers in the given state.
    pub fn pids_in(&self, state: WorkerState) -> Vec<u32> {
        self.workers
            .iter()
            .filter(|w| w.state == state)
            .map(|w| w.pid)
            .collect()
    }

    pub fn crash_looped_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::CrashLooped)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: u32,
    #[serde(flatten)]
    pub state: WorkerState,
    pub age_ms: u64,
    pub heartbeat_age_ms: u64,
    pub in_flight: u64,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub worker: Option<WorkerId>,
    pub status: SlotStatus,
    pub consecutive_failures: u32,
    pub restarts: u64,
}
