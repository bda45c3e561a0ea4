//! End-to-end protocol scenarios against a scripted monitor.

use {
    ddcci::{
        discovery::{self, ConnectorAttrs},
        display::{
            DdcFlags, Display, DisplayHandle, DisplayRec, DisplayState, IoPath, DISPNO_INVALID,
            DISPNO_PHANTOM,
        },
        display_info::DisplayInfo,
        error::{DdcResult, Error, Status},
        packet::{decode_request, encode_reply, Opcode, Reply, Request},
        retry::{CancelToken, TryClass, TryPolicy},
        stats::Stats,
        transport::DdcTransport,
        vcp::VcpValue,
        Query,
    },
    std::{
        collections::{BTreeMap, VecDeque},
        sync::{Arc, Mutex},
        time::Duration,
    },
};

/// How the simulated monitor signals an unsupported feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnsupportedMode {
    Flag,
    Null,
    AllZero,
}

/// A fault injected into the next read.
#[derive(Debug, Clone, Copy)]
enum Fault {
    Short,
    BadChecksum,
    Timeout,
}

struct Sim {
    features: BTreeMap<u8, (u16, u16)>, // code -> (max, cur)
    unsupported: UnsupportedMode,
    read_faults: VecDeque<Fault>,
    every_read_fault: Option<Fault>,
    apply_sets: bool,
    caps: Option<Vec<u8>>,
    tables: BTreeMap<u8, Vec<u8>>,
    pending: Option<Request>,
    requests: Vec<Request>,
}

impl Sim {
    fn new(unsupported: UnsupportedMode) -> Self {
        Sim {
            features: BTreeMap::new(),
            unsupported,
            read_faults: VecDeque::new(),
            every_read_fault: None,
            apply_sets: true,
            caps: None,
            tables: BTreeMap::new(),
            pending: None,
            requests: Vec::new(),
        }
    }

    fn with_feature(mut self, code: u8, max: u16, cur: u16) -> Self {
        self.features.insert(code, (max, cur));
        self
    }

    fn reply(&mut self) -> Reply {
        let request = self.pending.take();
        match request {
            Some(Request::GetVcp { feature }) => match self.features.get(&feature) {
                Some((max, cur)) => Reply::Vcp {
                    result: 0,
                    feature,
                    ty: 0,
                    mh: (max >> 8) as u8,
                    ml: (max & 0xFF) as u8,
                    sh: (cur >> 8) as u8,
                    sl: (cur & 0xFF) as u8,
                },
                None => match self.unsupported {
                    UnsupportedMode::Flag => Reply::Vcp {
                        result: 1,
                        feature,
                        ty: 0,
                        mh: 0,
                        ml: 0,
                        sh: 0,
                        sl: 0,
                    },
                    UnsupportedMode::Null => Reply::Null,
                    UnsupportedMode::AllZero => Reply::Vcp {
                        result: 0,
                        feature,
                        ty: 0,
                        mh: 0,
                        ml: 0,
                        sh: 0,
                        sl: 0,
                    },
                },
            },
            Some(Request::CapabilitiesRead { offset }) => {
                let caps = self.caps.clone().unwrap_or_default();
                fragment(Opcode::CapabilitiesReply, &caps, offset)
            },
            Some(Request::TableRead { feature, offset }) => {
                let table = self.tables.get(&feature).cloned().unwrap_or_default();
                fragment(Opcode::TableReadReply, &table, offset)
            },
            Some(Request::GetTiming) => Reply::Timing {
                status: 0x80,
                horizontal: 6750,
                vertical: 6000,
            },
            _ => Reply::Null,
        }
    }
}

fn fragment(op: Opcode, data: &[u8], offset: u16) -> Reply {
    let start = (offset as usize).min(data.len());
    let end = (start + 32).min(data.len());
    Reply::Fragment {
        op,
        offset,
        data: data[start..end].to_vec(),
    }
}

/// Shared handle to a simulated monitor, usable as a transport.
#[derive(Clone)]
struct SimMonitor(Arc<Mutex<Sim>>);

impl SimMonitor {
    fn new(sim: Sim) -> Self {
        SimMonitor(Arc::new(Mutex::new(sim)))
    }

    fn with<T>(&self, f: impl FnOnce(&mut Sim) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }
}

impl DdcTransport for SimMonitor {
    fn write_ddc(&mut self, wire: &[u8]) -> DdcResult<()> {
        let mut sim = self.0.lock().unwrap();
        let request = decode_request(wire)?;
        sim.requests.push(request.clone());
        match request {
            Request::SetVcp { feature, value } if sim.apply_sets => {
                let entry = sim.features.entry(feature).or_insert((0xFFFF, 0));
                entry.1 = value;
            },
            Request::TableWrite {
                feature,
                offset,
                ref bytes,
            } => {
                let table = sim.tables.entry(feature).or_default();
                let end = offset as usize + bytes.len();
                if table.len() < end {
                    table.resize(end, 0);
                }
                table[offset as usize..end].copy_from_slice(bytes);
            },
            _ => sim.pending = Some(request),
        }
        Ok(())
    }

    fn read_ddc(&mut self, len: usize) -> DdcResult<Vec<u8>> {
        let mut sim = self.0.lock().unwrap();
        let fault = sim.read_faults.pop_front().or(sim.every_read_fault);
        match fault {
            Some(Fault::Short) => {
                sim.pending = None;
                return Err(Error::status(Status::ShortRead, "sim::read"));
            },
            Some(Fault::Timeout) => {
                sim.pending = None;
                return Err(Error::status(Status::Timeout, "sim::read"));
            },
            Some(Fault::BadChecksum) => {
                sim.pending = None;
                let mut wire = encode_reply(&Reply::Null).unwrap();
                let last = wire.len() - 1;
                wire[last] ^= 0x5A;
                wire.resize(len, 0xFF);
                return Ok(wire);
            },
            None => (),
        }
        let reply = sim.reply();
        let mut wire = encode_reply(&reply).unwrap();
        assert!(wire.len() <= len, "reply larger than the read buffer");
        wire.resize(len, 0x00);
        Ok(wire)
    }

    fn describe(&self) -> String {
        "sim".into()
    }
}

fn identity(serial: &str) -> DisplayInfo {
    let mut info = DisplayInfo::default();
    info.manufacturer_id = Some("XYZ".into());
    info.model_name = Some("M1".into());
    info.serial_number = Some(serial.into());
    info
}

fn rec_on_bus(bus: u32, serial: &str) -> DisplayRec {
    DisplayRec::new(Display::new(IoPath::I2c { bus }, identity(serial), 0))
}

/// A working display record with zeroed sleeps and the given dialect.
fn working_rec(dialect: DdcFlags) -> DisplayRec {
    let rec = rec_on_bus(5, "000001");
    {
        let mut state = rec.lock();
        state.flags = DdcFlags::COMMUNICATION_CHECKED | DdcFlags::COMMUNICATION_WORKING | dialect;
        state.tuning.set_user_multiplier(0.0);
    }
    rec
}

fn open<'a>(rec: &'a DisplayRec, monitor: &SimMonitor, stats: &Arc<Stats>) -> DisplayHandle<'a> {
    DisplayHandle::open(
        rec,
        Box::new(monitor.clone()),
        TryPolicy::default(),
        stats.clone(),
        None,
    )
    .unwrap()
}

#[test]
fn happy_path_get() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x64));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    let value = handle.get_vcp_feature(0x10).unwrap();
    assert_eq!(value.maximum(), 0xFF);
    assert_eq!(value.value(), 0x64);
    drop(handle);

    assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 1), 1);
    monitor.with(|sim| {
        assert_eq!(sim.requests, vec![Request::GetVcp { feature: 0x10 }]);
    });
}

#[test]
fn unsupported_by_flag() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x64));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    let err = handle.get_vcp_feature(0x00).unwrap_err();
    assert_eq!(err.status, Status::ReportedUnsupported);
}

#[test]
fn dialect_detection_ddc_flag() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x64));
    let mut state = DisplayState::default();
    state.tuning.set_user_multiplier(0.0);

    discovery::initial_checks(
        &mut monitor.clone(),
        &mut state,
        &TryPolicy::default(),
        &Stats::default(),
        &CancelToken::new(),
    );
    assert!(state.flags.contains(DdcFlags::COMMUNICATION_WORKING));
    assert!(state.flags.contains(DdcFlags::USES_DDC_FLAG));
    assert!(state.flags.is_consistent());
}

#[test]
fn unsupported_by_null_and_dialect_detection() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Null).with_feature(0x10, 0xFF, 0x64));

    // a null-dialect monitor exhausts all six write-read tries with nulls
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());
    let mut handle = open(&rec, &monitor, &stats);
    let err = handle.get_vcp_feature(0x00).unwrap_err();
    assert_eq!(err.status, Status::AllResponsesNull);
    assert_eq!(err.causes.len(), 6);
    assert!(err.causes.iter().all(|c| c.status == Status::NullResponse));
    drop(handle);

    // initial checks on the same monitor land on the null-response dialect
    let mut state = DisplayState::default();
    state.tuning.set_user_multiplier(0.0);
    discovery::initial_checks(
        &mut monitor.clone(),
        &mut state,
        &TryPolicy::default(),
        &Stats::default(),
        &CancelToken::new(),
    );
    assert!(state.flags.contains(DdcFlags::COMMUNICATION_WORKING));
    assert!(state.flags.contains(DdcFlags::USES_NULL_RESPONSE));

    // with the dialect known, the null turns into determined-unsupported
    let rec = working_rec(DdcFlags::USES_NULL_RESPONSE);
    let mut handle = open(&rec, &monitor, &stats);
    let err = handle.get_vcp_feature(0x00).unwrap_err();
    assert_eq!(err.status, Status::DeterminedUnsupported);
}

#[test]
fn dialect_detection_all_zero() {
    let monitor =
        SimMonitor::new(Sim::new(UnsupportedMode::AllZero).with_feature(0x10, 0xFF, 0x64));
    let mut state = DisplayState::default();
    state.tuning.set_user_multiplier(0.0);

    discovery::initial_checks(
        &mut monitor.clone(),
        &mut state,
        &TryPolicy::default(),
        &Stats::default(),
        &CancelToken::new(),
    );
    assert!(state.flags.contains(DdcFlags::COMMUNICATION_WORKING));
    assert!(state.flags.contains(DdcFlags::USES_ALL_ZERO_BYTES));

    // probes: 0x00 (all zero), 0x41 (all zero)
    monitor.with(|sim| {
        assert_eq!(
            sim.requests,
            vec![
                Request::GetVcp { feature: 0x00 },
                Request::GetVcp { feature: 0x41 },
            ]
        );
    });
}

#[test]
fn retry_then_success_adjusts_sleep() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x64));
    monitor.with(|sim| {
        sim.read_faults = VecDeque::from(vec![Fault::Short, Fault::BadChecksum]);
    });

    let rec = rec_on_bus(5, "000001");
    {
        let mut state = rec.lock();
        state.flags =
            DdcFlags::COMMUNICATION_CHECKED | DdcFlags::COMMUNICATION_WORKING | DdcFlags::USES_DDC_FLAG;
        // fast but adaptive
        state.tuning = ddcci::DynamicSleep::with_multiplier(0.1);
    }
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    let value = handle.get_vcp_feature(0x10).unwrap();
    assert_eq!(value.value(), 0x64);
    drop(handle);

    assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 3), 1);
    assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 1), 0);
    assert!(rec.sleep_multiplier() > 0.1);
}

#[test]
fn set_with_verification() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x2E));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    handle.set_vcp_feature(0x10, 0x32).unwrap();
    monitor.with(|sim| assert_eq!(sim.features[&0x10].1, 0x32));

    // a monitor that silently drops the set fails verification
    monitor.with(|sim| {
        sim.apply_sets = false;
        sim.features.insert(0x10, (0xFF, 0x2E));
    });
    let err = handle.set_vcp_feature(0x10, 0x32).unwrap_err();
    assert_eq!(err.status, Status::VerificationFailed);
    assert!(err.message.contains("read back 46") || !err.causes.is_empty());
}

#[test]
fn set_without_verification_trusts_the_write() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x2E));
    monitor.with(|sim| sim.apply_sets = false);
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    handle.set_verification(false);
    handle.set_vcp_feature(0x10, 0x32).unwrap();
}

#[test]
fn capabilities_multi_part() {
    let caps_string =
        b"(prot(monitor)type(lcd)model(P2411)cmds(01 02 03 07 0C E3 F3)vcp(02 10 12 14(05 08) 60(0F 11 12)))";
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag));
    monitor.with(|sim| sim.caps = Some(caps_string.to_vec()));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    let raw = handle.capabilities_string().unwrap();
    assert_eq!(raw, caps_string);

    let caps = ddcci::caps::parse_capabilities(&raw).unwrap();
    assert_eq!(caps.model.as_deref(), Some("P2411"));
    assert_eq!(caps.vcp.get(&0x14), Some(&Some(vec![0x05, 0x08])));
}

#[test]
fn table_write_then_read_round_trips() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let payload: Vec<u8> = (0..70).collect();
    let mut handle = open(&rec, &monitor, &stats);
    handle.table_write(0x73, &payload).unwrap();
    monitor.with(|sim| assert_eq!(sim.tables[&0x73], payload));

    let read = handle.table_read(0x73).unwrap();
    assert_eq!(read, payload);
}

#[test]
fn timing_report() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let mut handle = open(&rec, &monitor, &stats);
    let timing = handle.get_timing_report().unwrap();
    assert_eq!(timing.status, 0x80);
    assert_eq!(timing.horizontal, 6750);
    assert_eq!(timing.vertical, 6000);
}

#[test]
fn phantom_scenario() {
    // bus 5 answers properly; bus 9 carries the same EDID identity but
    // every read times out
    let good = SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 0x64));
    let dead = SimMonitor::new(Sim::new(UnsupportedMode::Flag));
    dead.with(|sim| sim.every_read_fault = Some(Fault::Timeout));

    let mut recs = vec![rec_on_bus(5, "000001"), rec_on_bus(9, "000001")];
    for rec in &recs {
        rec.lock().tuning.set_user_multiplier(0.0);
    }

    let stats = Stats::default();
    discovery::check_and_number(&mut recs, 99, &TryPolicy::default(), &stats, |path| {
        Ok(match path {
            IoPath::I2c { bus: 5 } => Box::new(good.clone()) as Box<dyn DdcTransport + Send>,
            _ => Box::new(dead.clone()),
        })
    });

    assert_eq!(recs[0].display.dispno, 1);
    assert_eq!(recs[1].display.dispno, DISPNO_INVALID);

    let attrs = |path: &IoPath| match path {
        IoPath::I2c { bus: 9 } => Some(ConnectorAttrs {
            status: Some("disconnected".into()),
            enabled: Some("disabled".into()),
            has_edid: false,
        }),
        _ => Some(ConnectorAttrs {
            status: Some("connected".into()),
            enabled: Some("enabled".into()),
            has_edid: true,
        }),
    };
    discovery::filter_phantoms(&mut recs, attrs);
    assert_eq!(recs[1].display.dispno, DISPNO_PHANTOM);
    assert_eq!(recs[1].display.phantom_of, Some(1));

    // idempotent
    discovery::filter_phantoms(&mut recs, attrs);
    assert_eq!(recs[0].display.dispno, 1);
    assert_eq!(recs[1].display.dispno, DISPNO_PHANTOM);
}

#[test]
fn concurrent_initial_checks() {
    // at the async threshold the checks run one thread per display and
    // every display still ends up consistently classified
    let mut recs: Vec<DisplayRec> = (0..4).map(|i| rec_on_bus(i, &format!("{:06}", i))).collect();
    for rec in &recs {
        rec.lock().tuning.set_user_multiplier(0.0);
    }
    let monitors: Vec<SimMonitor> = (0..4)
        .map(|_| SimMonitor::new(Sim::new(UnsupportedMode::Flag).with_feature(0x10, 0xFF, 1)))
        .collect();

    let stats = Stats::default();
    discovery::check_and_number(&mut recs, 3, &TryPolicy::default(), &stats, |path| {
        let IoPath::I2c { bus } = path else {
            panic!("unexpected path")
        };
        Ok(Box::new(monitors[*bus as usize].clone()) as Box<dyn DdcTransport + Send>)
    });

    for (i, rec) in recs.iter().enumerate() {
        assert_eq!(rec.display.dispno, i as i32 + 1);
        assert!(rec.flags().is_consistent());
        assert!(rec.flags().contains(DdcFlags::COMMUNICATION_WORKING));
    }
}

#[test]
fn busy_lock_times_out() {
    let monitor = SimMonitor::new(Sim::new(UnsupportedMode::Flag));
    let rec = working_rec(DdcFlags::USES_DDC_FLAG);
    let stats = Arc::new(Stats::default());

    let handle = open(&rec, &monitor, &stats);
    let err = DisplayHandle::open(
        &rec,
        Box::new(monitor.clone()),
        TryPolicy::default(),
        stats.clone(),
        Some(Duration::from_millis(20)),
    )
    .map(|_| ())
    .unwrap_err();
    assert_eq!(err.status, Status::DisplayBusy);
    drop(handle);
}

#[test]
fn facade_init_is_idempotent() {
    // disable persistence so the test leaves no state behind
    const OPTS: &str = "--disable-displays-cache --disable-capabilities-cache";

    ddcci::initialize(OPTS).unwrap();
    let err = ddcci::initialize(OPTS).unwrap_err();
    assert_eq!(err.status, Status::InvalidOperation);
    assert_eq!(
        ddcci::last_error_detail().map(|e| e.status),
        Some(Status::InvalidOperation)
    );

    ddcci::with_context(|ctx| {
        let err = ctx.find_display(&Query::DisplayNumber(9999)).unwrap_err();
        assert_eq!(err.status, Status::DisplayNotFound);
        Ok(())
    })
    .unwrap();

    ddcci::teardown().unwrap();
    assert_eq!(
        ddcci::teardown().unwrap_err().status,
        Status::InvalidOperation
    );
}

#[test]
fn vcp_value_layout_matches_wire() {
    let value = VcpValue {
        ty: 0,
        mh: 0x01,
        ml: 0x00,
        sh: 0x00,
        sl: 0x64,
    };
    assert_eq!(value.maximum(), 0x100);
    assert_eq!(value.value(), 0x64);
}
