//! Dynamic sleep adjustment.
//!
//! DDC/CI prescribes minimum delays between transactions, but real monitors
//! tolerate anywhere from a fraction of those delays to several times them.
//! Each display carries a multiplier applied to every base interval; the
//! multiplier rises when operations need retries and decays slowly after a
//! sustained run of clean first-attempt successes.

use {
    serde::{Deserialize, Serialize},
    std::{
        collections::VecDeque,
        time::{Duration, Instant},
    },
};

/// Smallest multiplier adaptation will decay to.
pub const SLEEP_MULTIPLIER_MIN: f64 = 0.1;
/// Largest multiplier adaptation will grow to.
pub const SLEEP_MULTIPLIER_MAX: f64 = 10.0;

/// Multiplicative step applied when an operation needed retries.
const INCREASE_FACTOR: f64 = 1.5;
/// Multiplicative step applied on decay.
const DECREASE_FACTOR: f64 = 0.9;
/// First-attempt successes required before a decrease is considered.
const DECREASE_RUN: u32 = 10;
/// Minimum time since the last change before a decrease is considered.
const DECREASE_DWELL: Duration = Duration::from_secs(30);
/// Outcomes kept in the rolling window.
const WINDOW_LEN: usize = 16;

/// The inter-transaction delays mandated by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    /// Between a request write and the reply read.
    WriteToRead,
    /// Before the next write on the same display.
    NextWrite,
    /// Before reading a capabilities or table fragment.
    FragmentReply,
    /// Before the read-back that verifies a set.
    VerifySettle,
}

impl SleepEvent {
    /// Base interval for this event at multiplier 1.0.
    pub fn base(self) -> Duration {
        match self {
            SleepEvent::WriteToRead => Duration::from_millis(40),
            SleepEvent::NextWrite => Duration::from_millis(50),
            SleepEvent::FragmentReply => Duration::from_millis(50),
            SleepEvent::VerifySettle => Duration::from_millis(80),
        }
    }
}

/// One observed operation outcome.
#[derive(Debug, Clone, Copy)]
struct TryRecord {
    attempts: usize,
    success: bool,
}

/// Persisted form of the per-display tuning state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepSnapshot {
    /// Multiplier in effect when the snapshot was taken.
    pub multiplier: f64,
    /// Times the multiplier was raised.
    pub adjustments_up: u64,
    /// Times the multiplier was lowered.
    pub adjustments_down: u64,
    /// Operations observed.
    pub observed: u64,
}

/// Per-display sleep multiplier with adaptive motion.
#[derive(Debug)]
pub struct DynamicSleep {
    multiplier: f64,
    user: Option<f64>,
    frozen: bool,
    window: VecDeque<TryRecord>,
    clean_run: u32,
    last_change: Instant,
    decrease_run: u32,
    decrease_dwell: Duration,
    adjustments_up: u64,
    adjustments_down: u64,
    observed: u64,
}

impl Default for DynamicSleep {
    fn default() -> Self {
        Self::with_multiplier(1.0)
    }
}

impl DynamicSleep {
    /// Start from a specific multiplier, e.g. one restored from disk.
    pub fn with_multiplier(multiplier: f64) -> Self {
        DynamicSleep {
            multiplier: multiplier.clamp(SLEEP_MULTIPLIER_MIN, SLEEP_MULTIPLIER_MAX),
            user: None,
            frozen: false,
            window: VecDeque::with_capacity(WINDOW_LEN),
            clean_run: 0,
            last_change: Instant::now(),
            decrease_run: DECREASE_RUN,
            decrease_dwell: DECREASE_DWELL,
            adjustments_up: 0,
            adjustments_down: 0,
            observed: 0,
        }
    }

    #[cfg(test)]
    fn with_debounce(decrease_run: u32, decrease_dwell: Duration) -> Self {
        let mut dsa = Self::default();
        dsa.decrease_run = decrease_run;
        dsa.decrease_dwell = decrease_dwell;
        dsa
    }

    /// Pin the multiplier to a user-requested value, disabling adaptation.
    ///
    /// The pinned value is applied exactly; the adaptive floor does not
    /// apply to it.
    pub fn set_user_multiplier(&mut self, multiplier: f64) {
        self.user = Some(multiplier);
    }

    /// Freeze the current multiplier without pinning a new value.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// The multiplier currently in effect.
    pub fn multiplier(&self) -> f64 {
        self.user.unwrap_or(self.multiplier)
    }

    /// Sleep for the event's base interval scaled by the multiplier.
    pub fn sleep(&self, event: SleepEvent) {
        let interval = event.base().mul_f64(self.multiplier());
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    /// Feed one operation outcome into the adaptive loop.
    pub fn observe(&mut self, attempts: usize, success: bool) {
        self.observed += 1;
        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(TryRecord { attempts, success });

        if self.user.is_some() || self.frozen {
            return;
        }

        if !success || attempts > 1 {
            self.clean_run = 0;
            let raised = (self.multiplier * INCREASE_FACTOR).min(SLEEP_MULTIPLIER_MAX);
            if raised > self.multiplier {
                self.multiplier = raised;
                self.adjustments_up += 1;
                self.last_change = Instant::now();
            }
            return;
        }

        self.clean_run += 1;
        if self.clean_run >= self.decrease_run
            && self.last_change.elapsed() >= self.decrease_dwell
            && self.multiplier > SLEEP_MULTIPLIER_MIN
        {
            self.multiplier = (self.multiplier * DECREASE_FACTOR).max(SLEEP_MULTIPLIER_MIN);
            self.adjustments_down += 1;
            self.last_change = Instant::now();
            self.clean_run = 0;
        }
    }

    /// Whether any outcome in the rolling window needed retries.
    pub fn recent_retries(&self) -> bool {
        self.window.iter().any(|r| !r.success || r.attempts > 1)
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self) -> SleepSnapshot {
        SleepSnapshot {
            multiplier: self.multiplier(),
            adjustments_up: self.adjustments_up,
            adjustments_down: self.adjustments_down,
            observed: self.observed,
        }
    }

    /// Restore counters and multiplier from a persisted snapshot.
    pub fn restore(&mut self, snapshot: &SleepSnapshot) {
        self.multiplier = snapshot
            .multiplier
            .clamp(SLEEP_MULTIPLIER_MIN, SLEEP_MULTIPLIER_MAX);
        self.adjustments_up = snapshot.adjustments_up;
        self.adjustments_down = snapshot.adjustments_down;
        self.observed = snapshot.observed;
    }
}
