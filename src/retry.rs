//! Bounded retry around single protocol exchanges.
//!
//! Every primitive exchange runs under a per-class try ceiling. Retriable
//! failures accumulate as children of the composite error returned when the
//! ceiling is reached; fatal failures abort immediately.

use {
    crate::{
        error::{DdcResult, Error, Status},
        sleep::DynamicSleep,
        stats::Stats,
    },
    log::{debug, trace},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Instant,
    },
};

/// Upper bound on any retry ceiling.
pub const MAX_MAX_TRIES: usize = 15;

/// Classification of primitive exchanges for retry and statistics purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum TryClass {
    /// A bare write with no reply.
    WriteOnly = 0,
    /// A bare read.
    ReadOnly = 1,
    /// A write followed by a reply read.
    WriteRead = 2,
    /// One fragment exchange of a multi-part read.
    MultiPartRead = 3,
    /// One fragment of a multi-part write.
    MultiPartWrite = 4,
}

impl TryClass {
    /// Number of classes.
    pub const COUNT: usize = 5;

    /// Class for a histogram index.
    pub fn from_index(i: usize) -> TryClass {
        match i {
            0 => TryClass::WriteOnly,
            1 => TryClass::ReadOnly,
            2 => TryClass::WriteRead,
            3 => TryClass::MultiPartRead,
            _ => TryClass::MultiPartWrite,
        }
    }

    /// Default try ceiling for this class.
    pub fn default_max_tries(self) -> u8 {
        match self {
            TryClass::WriteOnly | TryClass::ReadOnly => 4,
            TryClass::WriteRead => 6,
            TryClass::MultiPartRead | TryClass::MultiPartWrite => 8,
        }
    }

    /// Stable display name.
    pub fn name(self) -> &'static str {
        match self {
            TryClass::WriteOnly => "write-only",
            TryClass::ReadOnly => "read-only",
            TryClass::WriteRead => "write-read",
            TryClass::MultiPartRead => "multi-part-read",
            TryClass::MultiPartWrite => "multi-part-write",
        }
    }
}

/// Per-class retry ceilings, each in `[1, MAX_MAX_TRIES]`.
#[derive(Debug, Clone, Copy)]
pub struct TryPolicy {
    caps: [u8; TryClass::COUNT],
}

impl Default for TryPolicy {
    fn default() -> Self {
        TryPolicy {
            caps: std::array::from_fn(|i| TryClass::from_index(i).default_max_tries()),
        }
    }
}

impl TryPolicy {
    /// Ceiling for one class.
    pub fn max_tries(&self, class: TryClass) -> u8 {
        self.caps[class as usize]
    }

    /// Set the ceiling for one class.
    pub fn set_max_tries(&mut self, class: TryClass, tries: u8) -> DdcResult<()> {
        if tries == 0 || tries as usize > MAX_MAX_TRIES {
            return Err(Error::new(
                Status::InvalidArgument,
                "retry::set_max_tries",
                format!("max tries {} outside [1, {}]", tries, MAX_MAX_TRIES),
            ));
        }
        self.caps[class as usize] = tries;
        Ok(())
    }

    /// Apply the three-valued option form: write ceilings, write-read
    /// ceilings (shared with bare reads), multi-part ceilings.
    pub fn set_triple(&mut self, write: u8, write_read: u8, multi_part: u8) -> DdcResult<()> {
        self.set_max_tries(TryClass::WriteOnly, write)?;
        self.set_max_tries(TryClass::ReadOnly, write_read)?;
        self.set_max_tries(TryClass::WriteRead, write_read)?;
        self.set_max_tries(TryClass::MultiPartRead, multi_part)?;
        self.set_max_tries(TryClass::MultiPartWrite, multi_part)
    }
}

/// Cooperative cancellation flag checked between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the operation holding this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run one exchange under the class's retry ceiling.
///
/// The closure receives the display's tuning state (for the protocol sleeps
/// it must apply) and the 1-based attempt number. Success and fatal errors
/// return immediately; retriable errors accumulate until the ceiling, at
/// which point the composite carries every attempt's failure as a cause.
/// When every cause is a null response the composite status collapses to
/// [`Status::AllResponsesNull`].
pub fn execute<T>(
    class: TryClass,
    policy: &TryPolicy,
    cancel: &CancelToken,
    stats: &Stats,
    dsa: &mut DynamicSleep,
    site: &'static str,
    mut attempt_fn: impl FnMut(&mut DynamicSleep, usize) -> DdcResult<T>,
) -> DdcResult<T> {
    let cap = policy.max_tries(class) as usize;
    let started = Instant::now();
    let mut causes: Vec<Error> = Vec::new();

    for attempt in 1..=cap {
        if attempt > 1 && cancel.is_cancelled() {
            return Err(Error::new(
                Status::Cancelled,
                site,
                format!("cancelled before attempt {}", attempt),
            ));
        }
        match attempt_fn(dsa, attempt) {
            Ok(value) => {
                trace!("{}: ok on attempt {}/{}", site, attempt, cap);
                stats.record(class, attempt, true, started.elapsed());
                dsa.observe(attempt, true);
                return Ok(value);
            },
            Err(err) if err.is_retriable() => {
                debug!("{}: attempt {}/{} failed: {}", site, attempt, cap, err);
                causes.push(err);
            },
            Err(err) => {
                debug!("{}: fatal on attempt {}: {}", site, attempt, err);
                stats.record(class, attempt, false, started.elapsed());
                return Err(err);
            },
        }
    }

    stats.record(class, cap, false, started.elapsed());
    dsa.observe(cap, false);
    let status = if causes.iter().all(|c| c.status == Status::NullResponse) {
        Status::AllResponsesNull
    } else {
        Status::RetriesExhausted
    };
    Err(Error::with_causes(
        status,
        site,
        format!("{} failed after {} tries", class.name(), cap),
        causes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T>(
        cap: u8,
        class: TryClass,
        f: impl FnMut(&mut DynamicSleep, usize) -> DdcResult<T>,
    ) -> (DdcResult<T>, Stats, DynamicSleep) {
        let mut policy = TryPolicy::default();
        policy.set_max_tries(class, cap).unwrap();
        let stats = Stats::default();
        let mut dsa = DynamicSleep::default();
        let res = execute(
            class,
            &policy,
            &CancelToken::new(),
            &stats,
            &mut dsa,
            "test",
            f,
        );
        (res, stats, dsa)
    }

    #[test]
    fn attempts_never_exceed_cap() {
        for cap in 1..=MAX_MAX_TRIES as u8 {
            let mut calls = 0usize;
            let (res, _, _) = run::<()>(cap, TryClass::WriteRead, |_, _| {
                calls += 1;
                Err(Error::status(Status::ShortRead, "t"))
            });
            assert_eq!(calls, cap as usize);
            assert_eq!(res.unwrap_err().status, Status::RetriesExhausted);
        }
    }

    #[test]
    fn success_after_retries_records_bucket() {
        let (res, stats, dsa) = run(6, TryClass::WriteRead, |_, attempt| {
            if attempt < 3 {
                Err(Error::status(Status::ShortRead, "t"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 3), 1);
        assert!(dsa.multiplier() > 1.0);
    }

    #[test]
    fn fatal_aborts_immediately() {
        let mut calls = 0usize;
        let (res, stats, _) = run::<()>(6, TryClass::WriteRead, |_, _| {
            calls += 1;
            Err(Error::status(Status::DisplayRemoved, "t"))
        });
        assert_eq!(calls, 1);
        assert_eq!(res.unwrap_err().status, Status::DisplayRemoved);
        assert_eq!(stats.failed_count(TryClass::WriteRead), 1);
    }

    #[test]
    fn all_null_collapses() {
        let (res, _, _) = run::<()>(6, TryClass::WriteRead, |_, _| {
            Err(Error::status(Status::NullResponse, "t"))
        });
        let err = res.unwrap_err();
        assert_eq!(err.status, Status::AllResponsesNull);
        assert_eq!(err.causes.len(), 6);
    }

    #[test]
    fn mixed_failures_stay_generic() {
        let (res, _, _) = run::<()>(2, TryClass::WriteRead, |_, attempt| {
            Err(Error::status(
                if attempt == 1 {
                    Status::NullResponse
                } else {
                    Status::ChecksumMismatch
                },
                "t",
            ))
        });
        assert_eq!(res.unwrap_err().status, Status::RetriesExhausted);
    }

    #[test]
    fn cancellation_between_attempts() {
        let policy = TryPolicy::default();
        let stats = Stats::default();
        let mut dsa = DynamicSleep::default();
        let cancel = CancelToken::new();
        let inner = cancel.clone();
        let res: DdcResult<()> = execute(
            TryClass::WriteRead,
            &policy,
            &cancel,
            &stats,
            &mut dsa,
            "test",
            move |_, _| {
                inner.cancel();
                Err(Error::status(Status::ShortRead, "t"))
            },
        );
        assert_eq!(res.unwrap_err().status, Status::Cancelled);
    }

    #[test]
    fn policy_rejects_out_of_range() {
        let mut policy = TryPolicy::default();
        assert!(policy.set_max_tries(TryClass::WriteOnly, 0).is_err());
        assert!(policy.set_max_tries(TryClass::WriteOnly, 16).is_err());
        assert!(policy.set_max_tries(TryClass::WriteOnly, 15).is_ok());
    }
}
