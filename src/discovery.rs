//! Display discovery.
//!
//! Candidate buses are those whose EDID slave answers with a parseable
//! block. Each candidate then goes through the initial checks, a small state
//! machine that classifies how the monitor signals "unsupported feature":
//! get feature 0x00 (reserved, expected unsupported), fall back to 0x41
//! (also reserved) when the answer is ambiguous, and finally to 0x10
//! (brightness, near-universal) to recognize null-response monitors.
//! Working displays receive positive display numbers; the rest receive
//! sentinels, and non-working references whose EDID identity duplicates a
//! working display are demoted to phantoms when their connector is known to
//! be down.

use {
    crate::{
        display::{
            DdcFlags, Display, DisplayRec, DisplayState, IoPath, DISPNO_BUSY, DISPNO_INVALID,
            DISPNO_PHANTOM,
        },
        error::{DdcResult, Status},
        retry::{CancelToken, TryPolicy},
        stats::Stats,
        transport::DdcTransport,
        vcp::{get_vcp_exchange, RawVcpReply},
    },
    log::{debug, trace, warn},
};

/// Reserved feature probed first by the initial checks.
const FEATURE_RESERVED_00: u8 = 0x00;
/// Reserved feature probed when 0x00 answered with all-zero value bytes.
const FEATURE_RESERVED_41: u8 = 0x41;
/// Brightness, probed last; essentially every monitor supports it.
const FEATURE_BRIGHTNESS: u8 = 0x10;

/// Candidate count at and above which initial checks run concurrently.
pub const DEFAULT_ASYNC_THRESHOLD: usize = 3;

/// `EIO` failures tolerated before the dialect is re-probed.
const EIO_REPROBE_THRESHOLD: u32 = 3;

/// Sysfs attributes of the connector behind a bus.
#[derive(Debug, Clone, Default)]
pub struct ConnectorAttrs {
    /// The `status` attribute, e.g. `connected` or `disconnected`.
    pub status: Option<String>,
    /// The `enabled` attribute, e.g. `enabled` or `disabled`.
    pub enabled: Option<String>,
    /// Whether the connector exposes an `edid` attribute file.
    pub has_edid: bool,
}

impl ConnectorAttrs {
    /// Whether the attributes prove the connector cannot carry a display.
    fn is_down(&self) -> bool {
        self.status.as_deref() == Some("disconnected")
            && self.enabled.as_deref() == Some("disabled")
            && !self.has_edid
    }
}

/// Enumeration seam for the USB HID monitor-control path.
///
/// The protocol engine is transport-agnostic; an implementation provides
/// candidate devices with their EDIDs and opens channels to them. The
/// default implementation reports no devices.
pub trait UsbEnumerator: Send + Sync {
    /// USB candidates as `(bus, device, raw EDID)`.
    fn candidates(&self) -> Vec<(u8, u8, Vec<u8>)>;

    /// Open a monitor-control channel to a previously reported candidate.
    fn open(&self, bus: u8, device: u8) -> DdcResult<Box<dyn DdcTransport + Send>>;
}

/// The no-op USB enumerator.
#[derive(Debug, Default)]
pub struct NoUsb;

impl UsbEnumerator for NoUsb {
    fn candidates(&self) -> Vec<(u8, u8, Vec<u8>)> {
        Vec::new()
    }

    fn open(&self, bus: u8, device: u8) -> DdcResult<Box<dyn DdcTransport + Send>> {
        Err(crate::error::Error::new(
            Status::UnsupportedOp,
            "discovery::usb",
            format!("no USB support for usb-{}.{}", bus, device),
        ))
    }
}

/// Run the initial checks against an open transport, recording the outcome
/// in the display state's dialect flags.
pub fn initial_checks(
    transport: &mut dyn DdcTransport,
    state: &mut DisplayState,
    policy: &TryPolicy,
    stats: &Stats,
    cancel: &CancelToken,
) {
    let outcome = probe_dialect(transport, state, policy, stats, cancel);
    state.flags.insert(DdcFlags::COMMUNICATION_CHECKED);
    match outcome {
        Ok(dialect) => {
            state.flags.insert(dialect | DdcFlags::COMMUNICATION_WORKING);
            trace!("{}: communication working, dialect {:?}", transport.describe(), dialect);
        },
        Err(status) => {
            if status == Status::DisplayBusy {
                state.flags.insert(DdcFlags::BUSY);
            }
            debug!("{}: communication not working ({})", transport.describe(), status);
        },
    }
    debug_assert!(state.flags.is_consistent());
}

/// The a/b/c probe sequence; returns the dialect flag on success.
fn probe_dialect(
    transport: &mut dyn DdcTransport,
    state: &mut DisplayState,
    policy: &TryPolicy,
    stats: &Stats,
    cancel: &CancelToken,
) -> Result<DdcFlags, Status> {
    let mut get = |feature| {
        get_vcp_exchange(transport, policy, cancel, stats, &mut state.tuning, feature)
    };

    // (a) a reserved feature; a well-behaved monitor reports it unsupported
    let step_b = match classify(get(FEATURE_RESERVED_00))? {
        Probe::ReportedUnsupported => return Ok(DdcFlags::USES_DDC_FLAG),
        Probe::LiveValue => return Ok(DdcFlags::DOES_NOT_INDICATE_UNSUPPORTED),
        Probe::AllZero => true,
        Probe::Null => false,
    };

    if step_b {
        // (b) a second reserved feature distinguishes an all-zero dialect
        // from feature 0x00 being genuinely implemented
        match classify(get(FEATURE_RESERVED_41))? {
            Probe::ReportedUnsupported => return Ok(DdcFlags::USES_DDC_FLAG),
            Probe::AllZero => return Ok(DdcFlags::USES_ALL_ZERO_BYTES),
            Probe::LiveValue => return Ok(DdcFlags::DOES_NOT_INDICATE_UNSUPPORTED),
            Probe::Null => (),
        }
    }

    // (c) brightness: a reply here means nulls signal "unsupported"
    match classify(get(FEATURE_BRIGHTNESS))? {
        Probe::Null => Err(Status::AllResponsesNull),
        _ => Ok(DdcFlags::USES_NULL_RESPONSE),
    }
}

enum Probe {
    ReportedUnsupported,
    AllZero,
    LiveValue,
    Null,
}

fn classify(res: DdcResult<RawVcpReply>) -> Result<Probe, Status> {
    match res {
        Ok(raw) if raw.unsupported => Ok(Probe::ReportedUnsupported),
        Ok(raw) if raw.value.is_all_zero() => Ok(Probe::AllZero),
        Ok(_) => Ok(Probe::LiveValue),
        Err(err) if matches!(err.status, Status::NullResponse | Status::AllResponsesNull) => {
            Ok(Probe::Null)
        },
        Err(err) => Err(err.status),
    }
}

/// Re-probe the all-zero dialect on a display that keeps failing with I/O
/// errors on individual features.
///
/// Some monitors answer `EIO` instead of flagging an unsupported feature;
/// once enough such failures accumulate the 0x41 probe runs once more, and
/// an all-zero answer switches the display's dialect.
pub(crate) fn reprobe_dialect_if_flaky(
    transport: &mut dyn DdcTransport,
    state: &mut DisplayState,
    policy: &TryPolicy,
    stats: &Stats,
    cancel: &CancelToken,
) {
    if state.eio_count < EIO_REPROBE_THRESHOLD
        || !state.flags.contains(DdcFlags::COMMUNICATION_WORKING)
        || state.flags.contains(DdcFlags::USES_ALL_ZERO_BYTES)
    {
        return;
    }
    state.eio_count = 0;
    let res = get_vcp_exchange(
        transport,
        policy,
        cancel,
        stats,
        &mut state.tuning,
        FEATURE_RESERVED_41,
    );
    if let Ok(raw) = res {
        if !raw.unsupported && raw.value.is_all_zero() {
            warn!("{}: repeated I/O errors, switching to all-zero dialect", transport.describe());
            state.flags.remove(
                DdcFlags::USES_DDC_FLAG
                    | DdcFlags::USES_NULL_RESPONSE
                    | DdcFlags::DOES_NOT_INDICATE_UNSUPPORTED,
            );
            state.flags.insert(DdcFlags::USES_ALL_ZERO_BYTES);
        }
    }
    debug_assert!(state.flags.is_consistent());
}

/// Run initial checks for every candidate and assign display numbers.
///
/// With `async_threshold` or more candidates the checks run in one worker
/// thread per display; each worker touches only its own display's lock.
pub fn check_and_number<F>(
    recs: &mut [DisplayRec],
    async_threshold: usize,
    policy: &TryPolicy,
    stats: &Stats,
    open: F,
) where
    F: Fn(&IoPath) -> DdcResult<Box<dyn DdcTransport + Send>> + Sync,
{
    let check_one = |rec: &DisplayRec| {
        let mut state = rec.lock();
        match open(&rec.display.path) {
            Ok(mut transport) => initial_checks(
                transport.as_mut(),
                &mut state,
                policy,
                stats,
                &CancelToken::new(),
            ),
            Err(err) => {
                state.flags.insert(DdcFlags::COMMUNICATION_CHECKED);
                if err.status == Status::DisplayBusy {
                    state.flags.insert(DdcFlags::BUSY);
                }
                debug!("{}: open failed: {}", rec.display.path, err);
            },
        }
    };

    if recs.len() >= async_threshold {
        let check_one = &check_one;
        std::thread::scope(|scope| {
            for rec in recs.iter() {
                scope.spawn(move || check_one(rec));
            }
        });
    } else {
        for rec in recs.iter() {
            check_one(rec);
        }
    }

    let mut next = 1;
    for rec in recs.iter_mut() {
        let flags = rec.flags();
        rec.display.dispno = if flags.contains(DdcFlags::COMMUNICATION_WORKING) {
            let n = next;
            next += 1;
            n
        } else if flags.contains(DdcFlags::BUSY) {
            DISPNO_BUSY
        } else {
            DISPNO_INVALID
        };
    }
}

/// Demote non-working duplicates of working displays to phantoms.
///
/// A kernel exposing two buses for the same panel (typically behind a
/// docking station) produces a second reference with an identical EDID
/// identity that cannot carry DDC/CI. When the duplicate's connector is
/// verifiably down it becomes a phantom linked to the real display.
/// Applying the filter twice yields the same registry.
pub fn filter_phantoms<F>(recs: &mut [DisplayRec], attrs: F)
where
    F: Fn(&IoPath) -> Option<ConnectorAttrs>,
{
    let working: Vec<(Option<(String, String, String)>, i32)> = recs
        .iter()
        .filter(|r| r.display.dispno > 0)
        .map(|r| (r.display.info.id_tuple(), r.display.dispno))
        .collect();

    for rec in recs.iter_mut() {
        if rec.display.dispno > 0 {
            continue;
        }
        let Some(id) = rec.display.info.id_tuple() else {
            continue;
        };
        let Some(real) = working
            .iter()
            .find(|(wid, _)| wid.as_ref() == Some(&id))
            .map(|(_, dispno)| *dispno)
        else {
            continue;
        };
        match attrs(&rec.display.path) {
            Some(a) if a.is_down() => {
                debug!("{}: phantom of display {}", rec.display.path, real);
                rec.display.dispno = DISPNO_PHANTOM;
                rec.display.phantom_of = Some(real);
            },
            _ => trace!("{}: duplicate identity but connector not provably down", rec.display.path),
        }
    }
}

/// Append USB candidates reported by the enumerator.
pub(crate) fn usb_candidates(usb: &dyn UsbEnumerator) -> Vec<DisplayRec> {
    usb.candidates()
        .into_iter()
        .filter_map(|(bus, device, edid)| {
            let path = IoPath::Usb { bus, device };
            match crate::display_info::DisplayInfo::from_edid(edid) {
                Ok(info) => Some(DisplayRec::new(Display::new(
                    path,
                    info,
                    crate::display::DISPNO_UNASSIGNED,
                ))),
                Err(e) => {
                    warn!("{}: unparseable EDID: {}", path, e);
                    None
                },
            }
        })
        .collect()
}

#[cfg(target_os = "linux")]
pub(crate) mod linux {
    //! The Linux i2c-dev scan.

    use {
        super::ConnectorAttrs,
        crate::{
            display::{Display, DisplayRec, IoPath, DISPNO_UNASSIGNED},
            display_info::DisplayInfo,
            i2c::{self, I2cBus},
        },
        log::{debug, warn},
    };

    /// Probe one bus for a parseable EDID.
    pub fn probe_bus(bus: u32, edid_read_size: usize) -> Option<DisplayRec> {
        let mut dev = match I2cBus::open(bus) {
            Ok(dev) => dev,
            Err(e) => {
                debug!("i2c-{}: not accessible: {}", bus, e);
                return None;
            },
        };
        let edid = match dev.read_edid(edid_read_size) {
            Ok(edid) => edid,
            Err(e) => {
                debug!("i2c-{}: no EDID: {}", bus, e);
                return None;
            },
        };
        match DisplayInfo::from_edid(edid) {
            Ok(info) => Some(DisplayRec::new(Display::new(
                IoPath::I2c { bus },
                info,
                DISPNO_UNASSIGNED,
            ))),
            Err(e) => {
                warn!("i2c-{}: EDID does not parse: {}", bus, e);
                None
            },
        }
    }

    /// All candidate displays on the machine's i2c-dev buses.
    pub fn scan_candidates(edid_read_size: usize) -> Vec<DisplayRec> {
        i2c::enumerate_bus_numbers()
            .into_iter()
            .filter_map(|bus| probe_bus(bus, edid_read_size))
            .collect()
    }

    /// Sysfs connector attributes of a bus, resolved through the
    /// `/sys/bus/i2c/devices/i2c-N/device` link.
    pub fn connector_attrs(path: &IoPath) -> Option<ConnectorAttrs> {
        let IoPath::I2c { bus } = path else {
            return None;
        };
        let device = std::fs::canonicalize(i2c::sysfs_path(*bus).join("device")).ok()?;
        let read = |name: &str| {
            std::fs::read_to_string(device.join(name))
                .ok()
                .map(|s| s.trim().to_string())
        };
        Some(ConnectorAttrs {
            status: read("status"),
            enabled: read("enabled"),
            has_edid: device.join("edid").exists(),
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::display_info::DisplayInfo,
        crate::display::DISPNO_UNASSIGNED,
    };

    fn rec_with_identity(bus: u32, serial: &str) -> DisplayRec {
        let mut info = DisplayInfo::default();
        info.manufacturer_id = Some("XYZ".into());
        info.model_name = Some("M1".into());
        info.serial_number = Some(serial.into());
        DisplayRec::new(Display::new(IoPath::I2c { bus }, info, DISPNO_UNASSIGNED))
    }

    fn down_attrs(_: &IoPath) -> Option<ConnectorAttrs> {
        Some(ConnectorAttrs {
            status: Some("disconnected".into()),
            enabled: Some("disabled".into()),
            has_edid: false,
        })
    }

    #[test]
    fn phantom_requires_matching_identity() {
        let mut recs = vec![rec_with_identity(5, "000001"), rec_with_identity(9, "000002")];
        recs[0].display.dispno = 1;
        recs[1].display.dispno = DISPNO_INVALID;

        filter_phantoms(&mut recs, down_attrs);
        assert_eq!(recs[1].display.dispno, DISPNO_INVALID);
        assert_eq!(recs[1].display.phantom_of, None);
    }

    #[test]
    fn phantom_demotion_and_idempotence() {
        let mut recs = vec![rec_with_identity(5, "000001"), rec_with_identity(9, "000001")];
        recs[0].display.dispno = 1;
        recs[1].display.dispno = DISPNO_INVALID;

        filter_phantoms(&mut recs, down_attrs);
        assert_eq!(recs[1].display.dispno, DISPNO_PHANTOM);
        assert_eq!(recs[1].display.phantom_of, Some(1));

        // applying the filter again changes nothing
        filter_phantoms(&mut recs, down_attrs);
        assert_eq!(recs[0].display.dispno, 1);
        assert_eq!(recs[1].display.dispno, DISPNO_PHANTOM);
        assert_eq!(recs[1].display.phantom_of, Some(1));
    }

    #[test]
    fn connector_up_blocks_demotion() {
        let mut recs = vec![rec_with_identity(5, "000001"), rec_with_identity(9, "000001")];
        recs[0].display.dispno = 1;
        recs[1].display.dispno = DISPNO_INVALID;

        filter_phantoms(&mut recs, |_| {
            Some(ConnectorAttrs {
                status: Some("connected".into()),
                enabled: Some("disabled".into()),
                has_edid: false,
            })
        });
        assert_eq!(recs[1].display.dispno, DISPNO_INVALID);
    }
}
