//! Display references, dialect flags and the per-display serialization
//! fabric.
//!
//! A [`DisplayRec`] is created during discovery and lives until the owning
//! context is discarded. Its identity (I/O path, EDID, display number) is
//! immutable once discovery finishes; the mutable runtime state (dialect
//! flags, sleep tuning) lives behind a fair per-display lock that doubles as
//! the transaction serializer: holding a [`DisplayHandle`] *is* holding the
//! lock.

use {
    crate::{
        display_info::DisplayInfo,
        error::{DdcResult, Error, Status},
        retry::{CancelToken, TryPolicy},
        sleep::DynamicSleep,
        stats::Stats,
        transport::DdcTransport,
    },
    bitflags::bitflags,
    parking_lot::{FairMutex, FairMutexGuard},
    std::{
        fmt::{self, Debug, Formatter},
        str,
        sync::Arc,
        time::Duration,
    },
};

/// Display number of a reference that failed its initial checks.
pub const DISPNO_INVALID: i32 = -1;
/// Display number of a phantom reference shadowing a real display.
pub const DISPNO_PHANTOM: i32 = -2;
/// Display number of a reference whose bus reported `EBUSY`.
pub const DISPNO_BUSY: i32 = -3;
/// Display number of a removed reference.
pub const DISPNO_REMOVED: i32 = -4;
/// Display number before discovery assigns one.
pub const DISPNO_UNASSIGNED: i32 = 0;

/// The I/O path over which a display is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IoPath {
    /// Linux i2c-dev bus
    I2c {
        /// Bus number N of `/dev/i2c-N`.
        bus: u32,
    },
    /// USB HID monitor-control interface
    Usb {
        /// USB bus number.
        bus: u8,
        /// USB device number.
        device: u8,
    },
}

impl fmt::Display for IoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            IoPath::I2c { bus } => write!(f, "i2c-{}", bus),
            IoPath::Usb { bus, device } => write!(f, "usb-{}.{}", bus, device),
        }
    }
}

impl str::FromStr for IoPath {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(bus) = s.strip_prefix("i2c-") {
            return bus.parse().map(|bus| IoPath::I2c { bus }).map_err(|_| ());
        }
        if let Some(rest) = s.strip_prefix("usb-") {
            let (bus, device) = rest.split_once('.').ok_or(())?;
            return Ok(IoPath::Usb {
                bus: bus.parse().map_err(|_| ())?,
                device: device.parse().map_err(|_| ())?,
            });
        }
        Err(())
    }
}

bitflags! {
    /// Protocol dialect and lifecycle flags of a display reference.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DdcFlags: u16 {
        /// DDC/CI communication succeeded during initial checks.
        const COMMUNICATION_WORKING = 1 << 0;
        /// Initial checks have run.
        const COMMUNICATION_CHECKED = 1 << 1;
        /// Unsupported features are reported via the reply result byte.
        const USES_DDC_FLAG = 1 << 2;
        /// Unsupported features are signalled by a null message.
        const USES_NULL_RESPONSE = 1 << 3;
        /// Unsupported features are signalled by all-zero value bytes.
        const USES_ALL_ZERO_BYTES = 1 << 4;
        /// The monitor does not indicate unsupported features at all.
        const DOES_NOT_INDICATE_UNSUPPORTED = 1 << 5;
        /// `EBUSY` was observed while checking the display.
        const BUSY = 1 << 6;
        /// The display has been removed.
        const REMOVED = 1 << 7;
    }
}

impl DdcFlags {
    const UNSUPPORTED_DIALECTS: [DdcFlags; 4] = [
        DdcFlags::USES_DDC_FLAG,
        DdcFlags::USES_NULL_RESPONSE,
        DdcFlags::USES_ALL_ZERO_BYTES,
        DdcFlags::DOES_NOT_INDICATE_UNSUPPORTED,
    ];

    /// How many of the unsupported-dialect flags are set.
    pub fn dialect_count(self) -> usize {
        Self::UNSUPPORTED_DIALECTS
            .iter()
            .filter(|f| self.contains(**f))
            .count()
    }

    /// Whether the flag set satisfies its invariants: working implies
    /// checked, and a working display names exactly one unsupported
    /// dialect.
    pub fn is_consistent(self) -> bool {
        if self.contains(DdcFlags::COMMUNICATION_WORKING) {
            self.contains(DdcFlags::COMMUNICATION_CHECKED) && self.dialect_count() == 1
        } else {
            self.dialect_count() <= 1
        }
    }
}

/// Mutable per-display runtime state, guarded by the display lock.
#[derive(Debug)]
pub struct DisplayState {
    /// Dialect and lifecycle flags.
    pub flags: DdcFlags,
    /// Sleep tuning.
    pub tuning: DynamicSleep,
    /// `EIO` failures observed on an otherwise working display; feeds the
    /// dialect re-probe fallback.
    pub eio_count: u32,
}

impl Default for DisplayState {
    fn default() -> Self {
        DisplayState {
            flags: DdcFlags::default(),
            tuning: DynamicSleep::default(),
            eio_count: 0,
        }
    }
}

/// The immutable identity of a discovered display.
#[derive(Debug, Clone)]
pub struct Display {
    /// How the display is reached.
    pub path: IoPath,
    /// EDID-derived identity.
    pub info: DisplayInfo,
    /// Display number: positive for working displays, a sentinel otherwise.
    pub dispno: i32,
    /// For a phantom, the display number of the real display it shadows.
    pub phantom_of: Option<i32>,
}

impl Display {
    /// Create an identity record with the given display number.
    pub fn new(path: IoPath, info: DisplayInfo, dispno: i32) -> Self {
        Display {
            path,
            info,
            dispno,
            phantom_of: None,
        }
    }
}

impl fmt::Display for Display {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "display {} ({}, {})", self.dispno, self.path, self.info)
    }
}

/// A display reference: identity plus lock-guarded runtime state.
pub struct DisplayRec {
    /// Identity, immutable once discovery completes.
    pub display: Display,
    state: FairMutex<DisplayState>,
}

impl DisplayRec {
    /// Create a reference in the unchecked state.
    pub fn new(display: Display) -> Self {
        DisplayRec {
            display,
            state: FairMutex::new(DisplayState::default()),
        }
    }

    /// Acquire the display lock, waiting indefinitely.
    pub fn lock(&self) -> FairMutexGuard<'_, DisplayState> {
        self.state.lock()
    }

    /// Acquire the display lock, failing with `display-busy` on timeout.
    pub fn lock_timeout(&self, timeout: Duration) -> DdcResult<FairMutexGuard<'_, DisplayState>> {
        self.state.try_lock_for(timeout).ok_or_else(|| {
            Error::new(
                Status::DisplayBusy,
                "display::lock",
                format!("{} locked by another operation", self.display),
            )
        })
    }

    /// Snapshot the flags without holding the lock across the call.
    pub fn flags(&self) -> DdcFlags {
        self.state.lock().flags
    }

    /// Snapshot the sleep multiplier.
    pub fn sleep_multiplier(&self) -> f64 {
        self.state.lock().tuning.multiplier()
    }

    /// Mark the display removed. Terminal.
    pub fn mark_removed(&self) {
        self.state.lock().flags.insert(DdcFlags::REMOVED);
    }
}

impl Debug for DisplayRec {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("DisplayRec")
            .field("display", &self.display)
            .field("flags", &self.flags())
            .finish()
    }
}

/// An open handle on a display.
///
/// Holding a handle holds the display lock: a logical operation spanning
/// several bus transactions stays serialized against other callers for its
/// whole duration, and the lock (plus the underlying device handle) is
/// released on every exit path when the handle drops.
pub struct DisplayHandle<'a> {
    rec: &'a DisplayRec,
    pub(crate) state: FairMutexGuard<'a, DisplayState>,
    pub(crate) transport: Box<dyn DdcTransport + Send + 'a>,
    pub(crate) policy: TryPolicy,
    pub(crate) stats: Arc<Stats>,
    pub(crate) cancel: CancelToken,
    pub(crate) verify_sets: bool,
}

impl<'a> DisplayHandle<'a> {
    /// Open a handle over an already-connected transport.
    ///
    /// `timeout` bounds the lock acquisition; `None` waits indefinitely.
    pub fn open(
        rec: &'a DisplayRec,
        transport: Box<dyn DdcTransport + Send + 'a>,
        policy: TryPolicy,
        stats: Arc<Stats>,
        timeout: Option<Duration>,
    ) -> DdcResult<Self> {
        let state = match timeout {
            Some(timeout) => rec.lock_timeout(timeout)?,
            None => rec.lock(),
        };
        if state.flags.contains(DdcFlags::REMOVED) {
            return Err(Error::new(
                Status::DisplayRemoved,
                "display::open",
                rec.display.to_string(),
            ));
        }
        Ok(DisplayHandle {
            rec,
            state,
            transport,
            policy,
            stats,
            cancel: CancelToken::new(),
            verify_sets: true,
        })
    }

    /// The display this handle is open on.
    pub fn display(&self) -> &Display {
        &self.rec.display
    }

    /// Current dialect flags.
    pub fn flags(&self) -> DdcFlags {
        self.state.flags
    }

    /// Token that cancels this handle's in-flight retry loops.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Enable or disable read-back verification of set operations.
    pub fn set_verification(&mut self, verify: bool) {
        self.verify_sets = verify;
    }

    /// Pin this display's sleep multiplier.
    pub fn set_sleep_multiplier(&mut self, multiplier: f64) -> DdcResult<()> {
        if !(0.0..=crate::sleep::SLEEP_MULTIPLIER_MAX).contains(&multiplier) {
            return Err(Error::new(
                Status::InvalidArgument,
                "display::set_sleep_multiplier",
                format!("multiplier {} outside [0.0, 10.0]", multiplier),
            ));
        }
        self.state.tuning.set_user_multiplier(multiplier);
        Ok(())
    }
}

impl Debug for DisplayHandle<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("DisplayHandle")
            .field(&self.rec.display.path)
            .finish()
    }
}
