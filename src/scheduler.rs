use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{SCHEDULER_FIRE_HISTORY, SCHEDULER_MAX_WAIT_SLICE};
use crate::error::{Result, SpeedwatchError};
use crate::history::ResultStore;
use crate::measurement::{CancelToken, SpeedTestEngine, TestOutcome, TestStatus};

// --- Time sources ---

/// Time source for the scheduler. Scheduling uses `monotonic` only; `wall`
/// is for display.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin. Never goes backwards.
    fn monotonic(&self) -> Duration;

    fn wall(&self) -> DateTime<Utc>;

    /// Block for at most `timeout` or until `event` is set. Returns true if
    /// the event is set.
    fn wait(&self, event: &ShutdownEvent, timeout: Duration) -> bool {
        event.wait_timeout(timeout)
    }
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// --- Shutdown signalling ---

/// One-shot event that wakes every waiter when set.
#[derive(Clone, Default)]
pub struct ShutdownEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock() = true;
        cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let mut set = flag.lock();
        if !*set {
            cv.wait_for(&mut set, timeout);
        }
        *set
    }
}

// --- Schedule arithmetic ---

/// Fire times on a fixed grid `anchor + k * interval`. Late fires never
/// shift the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleState {
    anchor: Duration,
    interval: Duration,
    next: Duration,
    cycles: u64,
    missed: u64,
}

impl ScheduleState {
    /// First fire is one interval after `anchor`. A zero interval is raised
    /// to one nanosecond.
    pub fn start(anchor: Duration, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_nanos(1));
        Self {
            anchor,
            interval,
            next: anchor + interval,
            cycles: 0,
            missed: 0,
        }
    }

    pub fn remaining(&self, now: Duration) -> Duration {
        self.next.saturating_sub(now)
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.next
    }

    /// Move to the next slot after a fire. Slots that already passed while
    /// the fire was running are skipped and counted. Returns the number
    /// skipped.
    pub fn advance(&mut self, now: Duration) -> u64 {
        self.cycles += 1;
        self.next += self.interval;
        if self.next > now {
            return 0;
        }
        let step = self.interval.as_nanos();
        let skipped = (now - self.next).as_nanos() / step + 1;
        let jump = u64::try_from(step.saturating_mul(skipped)).unwrap_or(u64::MAX);
        self.next += Duration::from_nanos(jump);
        let skipped = u64::try_from(skipped).unwrap_or(u64::MAX);
        self.missed = self.missed.saturating_add(skipped);
        skipped
    }

    pub fn anchor(&self) -> Duration {
        self.anchor
    }

    pub fn next(&self) -> Duration {
        self.next
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

// --- Status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Stopped,
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    pub cycles: u64,
    pub tests_completed: u64,
    pub tests_failed: u64,
    pub missed_slots: u64,
    pub runtime_seconds: f64,
    pub next_test_time: Option<DateTime<Utc>>,
    /// Offsets of recent scheduled fires from the schedule anchor, oldest
    /// first.
    pub fire_offsets: Vec<Duration>,
    pub last_outcome: Option<String>,
}

impl SchedulerStatus {
    fn new() -> Self {
        Self {
            phase: SchedulerPhase::Stopped,
            cycles: 0,
            tests_completed: 0,
            tests_failed: 0,
            missed_slots: 0,
            runtime_seconds: 0.0,
            next_test_time: None,
            fire_offsets: Vec::new(),
            last_outcome: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == SchedulerPhase::Running
    }
}

// --- Scheduler ---

/// Runs the engine on a fixed interval and records every outcome.
pub struct Scheduler {
    engine: Arc<SpeedTestEngine>,
    store: Option<ResultStore>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    max_runtime: Option<Duration>,
    immediate: bool,
    shutdown: ShutdownEvent,
    cancel: CancelToken,
    status: Arc<Mutex<SchedulerStatus>>,
    cycle_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SpeedTestEngine>,
        store: Option<ResultStore>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(SpeedwatchError::InvalidArgument(
                "schedule interval must be positive".into(),
            ));
        }
        Ok(Self {
            engine,
            store,
            interval,
            clock: Arc::new(SystemClock::new()),
            max_runtime: None,
            immediate: false,
            shutdown: ShutdownEvent::new(),
            cancel: CancelToken::new(),
            status: Arc::new(Mutex::new(SchedulerStatus::new())),
            cycle_lock: Mutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop by itself once `max_runtime` has elapsed.
    pub fn with_max_runtime(mut self, max_runtime: Option<Duration>) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    /// Run one test as soon as the loop starts, before the first slot.
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn shutdown_event(&self) -> ShutdownEvent {
        self.shutdown.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.lock().clone()
    }

    /// Run one test now, outside the schedule. Cycles never overlap.
    pub fn run_immediate(&self) -> TestOutcome {
        self.run_cycle()
    }

    /// Blocking scheduling loop. Returns once the shutdown event is set or
    /// `max_runtime` elapses.
    pub fn run(&self) -> SchedulerStatus {
        let started = self.clock.monotonic();
        let mut schedule = ScheduleState::start(started, self.interval);
        self.status.lock().phase = SchedulerPhase::Running;
        info!(
            "Scheduler started: every {:.0}s{}",
            self.interval.as_secs_f64(),
            self.max_runtime
                .map(|m| format!(", stopping after {:.0}s", m.as_secs_f64()))
                .unwrap_or_default()
        );

        if self.immediate && !self.shutdown.is_set() {
            self.run_cycle();
        }

        loop {
            if self.shutdown.is_set() {
                info!("Scheduler shutdown requested");
                break;
            }
            let now = self.clock.monotonic();
            if self
                .max_runtime
                .is_some_and(|max| now.saturating_sub(started) >= max)
            {
                info!("Scheduler reached its maximum runtime");
                break;
            }
            self.publish(&schedule, started, now);

            if schedule.is_due(now) {
                self.record_fire(now.saturating_sub(schedule.anchor()));
                debug!("Scheduled cycle {} firing", schedule.cycles() + 1);
                self.run_cycle();
                let skipped = schedule.advance(self.clock.monotonic());
                if skipped > 0 {
                    warn!(
                        "Test overran the interval, skipped {} slot(s)",
                        skipped
                    );
                }
                let mut status = self.status.lock();
                status.cycles = schedule.cycles();
                status.missed_slots = schedule.missed();
            } else {
                let wait = schedule.remaining(now).min(SCHEDULER_MAX_WAIT_SLICE);
                self.clock.wait(&self.shutdown, wait);
            }
        }

        let now = self.clock.monotonic();
        let mut status = self.status.lock();
        status.phase = SchedulerPhase::Stopped;
        status.next_test_time = None;
        status.runtime_seconds = now.saturating_sub(started).as_secs_f64();
        info!(
            "Scheduler stopped after {} cycle(s): {} completed, {} failed, {} missed slot(s)",
            status.cycles, status.tests_completed, status.tests_failed, status.missed_slots
        );
        status.clone()
    }

    /// Move the loop onto its own thread.
    pub fn spawn(self) -> Result<SchedulerHandle> {
        let scheduler = Arc::new(self);
        let worker = Arc::clone(&scheduler);
        let (done_tx, done_rx) = flume::bounded(1);
        let handle = thread::Builder::new()
            .name("speedtest-scheduler".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })?;
        Ok(SchedulerHandle {
            scheduler,
            handle: Some(handle),
            done_rx,
        })
    }

    fn run_cycle(&self) -> TestOutcome {
        let _cycle = self.cycle_lock.lock();
        let outcome = self.engine.run(&self.cancel, None);
        self.persist(&outcome);

        let mut status = self.status.lock();
        match outcome.status {
            TestStatus::Succeeded => status.tests_completed += 1,
            TestStatus::Cancelled => {}
            TestStatus::Rejected | TestStatus::Failed(_) => status.tests_failed += 1,
        }
        status.last_outcome = Some(format!(
            "{}: {}",
            outcome.classification(),
            outcome.reason
        ));
        outcome
    }

    fn persist(&self, outcome: &TestOutcome) {
        if outcome.is_cancelled() || !self.engine.config().save_results_to_database {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let saved = store
            .save(&outcome.result)
            .and_then(|id| store.cache_latest(&outcome.result, id));
        if let Err(e) = saved {
            error!("Failed to store speed test result: {}", e);
        }
    }

    fn publish(&self, schedule: &ScheduleState, started: Duration, now: Duration) {
        let until_next = chrono::Duration::from_std(schedule.remaining(now)).ok();
        let next_test_time = until_next.map(|d| self.clock.wall() + d);
        let mut status = self.status.lock();
        status.runtime_seconds = now.saturating_sub(started).as_secs_f64();
        status.next_test_time = next_test_time;
    }

    fn record_fire(&self, offset: Duration) {
        let mut status = self.status.lock();
        if status.fire_offsets.len() == SCHEDULER_FIRE_HISTORY {
            status.fire_offsets.remove(0);
        }
        status.fire_offsets.push(offset);
    }
}

/// Owner of a scheduler running on its own thread.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    handle: Option<JoinHandle<()>>,
    done_rx: flume::Receiver<()>,
}

impl SchedulerHandle {
    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn shutdown_event(&self) -> ShutdownEvent {
        self.scheduler.shutdown_event()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.scheduler.cancel_token()
    }

    pub fn run_immediate(&self) -> TestOutcome {
        self.scheduler.run_immediate()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the loop ends on its own or through the shutdown event.
    pub fn wait(&mut self) -> SchedulerStatus {
        let _ = self.done_rx.recv();
        self.join();
        self.status()
    }

    /// Set the shutdown event, cancel the in-flight test and join within
    /// `grace`. A loop that does not finish in time is detached.
    pub fn stop(&mut self, grace: Duration) -> SchedulerStatus {
        {
            let mut status = self.scheduler.status.lock();
            if status.phase == SchedulerPhase::Running {
                status.phase = SchedulerPhase::ShuttingDown;
            }
        }
        self.scheduler.shutdown.set();
        self.scheduler.cancel.cancel();

        match self.done_rx.recv_timeout(grace) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => self.join(),
            Err(flume::RecvTimeoutError::Timeout) => {
                warn!("Scheduler did not stop within {:?}, detaching", grace);
                self.handle = None;
            }
        }
        self.status()
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
    }
}
