//! Drain scheduler state machine.

/// Where the drain scheduler currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    /// Nothing scheduled.
    #[default]
    Idle,
    /// A drain tick is due on the next pump.
    Armed,
    /// A drain tick is executing.
    Draining,
}

/// Counters accumulated across drain ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Drain ticks executed.
    pub ticks: u64,
    /// Queued creates dispatched to the remote store.
    pub creates_dispatched: u64,
    /// Queued updates dispatched to the remote store.
    pub updates_dispatched: u64,
    /// Queued bulk patches dispatched.
    pub patches_dispatched: u64,
    /// Consolidated removal batches dispatched.
    pub removals_dispatched: u64,
}

/// The drain scheduler.
///
/// Arming is level-triggered: arming an armed scheduler is a no-op, and
/// a failed remote write disarms it so the queue stops draining until
/// connectivity is signalled again.
#[derive(Debug, Default)]
pub struct Scheduler {
    state: SchedulerState,
    stats: DrainStats,
}

impl Scheduler {
    /// Creates an idle scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> DrainStats {
        self.stats
    }

    /// Mutable access to the counters, for the drain loop.
    pub fn stats_mut(&mut self) -> &mut DrainStats {
        &mut self.stats
    }

    /// Returns true if a tick is due.
    pub fn is_armed(&self) -> bool {
        self.state == SchedulerState::Armed
    }

    /// Requests a drain tick.
    pub fn arm(&mut self) {
        if self.state == SchedulerState::Idle {
            self.state = SchedulerState::Armed;
        }
    }

    /// Cancels any pending tick.
    pub fn disarm(&mut self) {
        self.state = SchedulerState::Idle;
    }

    /// Marks a tick as executing. Returns false if no tick was due.
    pub fn begin_tick(&mut self) -> bool {
        match self.state {
            SchedulerState::Armed => {
                self.state = SchedulerState::Draining;
                self.stats.ticks += 1;
                true
            }
            SchedulerState::Idle | SchedulerState::Draining => false,
        }
    }

    /// Finishes a tick, re-arming when work remains.
    pub fn finish_tick(&mut self, more_work: bool) {
        self.state = if more_work {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        };
    }
}
