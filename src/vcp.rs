//! VCP feature exchange.
//!
//! The operations here implement the feature-level conversations: get and
//! set of non-table values, table read and write, the capabilities string,
//! save-settings and the timing report. Each bus exchange runs under the
//! retry engine with the display's sleep tuning applied before the write and
//! between write and read.

use {
    crate::{
        caps::{self, Capabilities},
        display::{DdcFlags, DisplayHandle, DisplayState},
        error::{DdcResult, Error, Status},
        packet::{
            decode_reply, encode_request, reply_size, MultiPartAssembler, Opcode, Reply, Request,
            FRAGMENT_DATA_MAX, TABLE_WRITE_CHUNK,
        },
        retry::{CancelToken, TryClass, TryPolicy},
        sleep::{DynamicSleep, SleepEvent},
        stats::Stats,
        transport::DdcTransport,
    },
    log::trace,
};

/// A VCP feature code.
pub type FeatureCode = u8;

/// VCP version feature, probed to identify the MCCS level.
pub const FEATURE_VCP_VERSION: FeatureCode = 0xDF;

/// A non-table VCP feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpValue {
    /// VCP type byte from the reply.
    pub ty: u8,
    /// Maximum value, high byte.
    pub mh: u8,
    /// Maximum value, low byte.
    pub ml: u8,
    /// Current value, high byte.
    pub sh: u8,
    /// Current value, low byte.
    pub sl: u8,
}

impl VcpValue {
    /// The maximum value as a 16-bit quantity.
    pub fn maximum(&self) -> u16 {
        u16::from_be_bytes([self.mh, self.ml])
    }

    /// The current value as a 16-bit quantity.
    pub fn value(&self) -> u16 {
        u16::from_be_bytes([self.sh, self.sl])
    }

    /// Whether every value byte is zero, the signal some monitors use for
    /// an unsupported feature.
    pub fn is_all_zero(&self) -> bool {
        self.mh == 0 && self.ml == 0 && self.sh == 0 && self.sl == 0
    }
}

/// A decoded timing report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingReport {
    /// Timing status byte.
    pub status: u8,
    /// Horizontal frequency in units of 1/100 kHz.
    pub horizontal: u16,
    /// Vertical frequency in units of 1/100 Hz.
    pub vertical: u16,
}

/// A raw get-feature reply before dialect interpretation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawVcpReply {
    /// The reply's unsupported-feature result bit.
    pub unsupported: bool,
    /// The value bytes.
    pub value: VcpValue,
}

/// One retried get-feature conversation on a bare transport.
///
/// Shared between open display handles and the initial-checks probe, which
/// runs before a display is considered usable.
pub(crate) fn get_vcp_exchange(
    transport: &mut dyn DdcTransport,
    policy: &TryPolicy,
    cancel: &CancelToken,
    stats: &Stats,
    dsa: &mut DynamicSleep,
    feature: FeatureCode,
) -> DdcResult<RawVcpReply> {
    const SITE: &str = "vcp::get";
    let wire = encode_request(&Request::GetVcp { feature })?;
    crate::retry::execute(
        TryClass::WriteRead,
        policy,
        cancel,
        stats,
        dsa,
        SITE,
        |dsa, _attempt| {
            dsa.sleep(SleepEvent::NextWrite);
            transport.write_ddc(&wire)?;
            dsa.sleep(SleepEvent::WriteToRead);
            let buf = transport.read_ddc(reply_size(8))?;
            match decode_reply(&buf)? {
                Reply::Null => Err(Error::status(Status::NullResponse, SITE)),
                Reply::Vcp {
                    result,
                    feature: echoed,
                    ty,
                    mh,
                    ml,
                    sh,
                    sl,
                } => {
                    if echoed != feature {
                        return Err(Error::new(
                            Status::InvalidResponse,
                            SITE,
                            format!("reply echoes feature x{:02X}, requested x{:02X}", echoed, feature),
                        ));
                    }
                    let value = VcpValue { ty, mh, ml, sh, sl };
                    match result {
                        0x00 => Ok(RawVcpReply {
                            unsupported: false,
                            value,
                        }),
                        0x01 => Ok(RawVcpReply {
                            unsupported: true,
                            value,
                        }),
                        other => Err(Error::new(
                            Status::InvalidResponse,
                            SITE,
                            format!("unknown result code x{:02X}", other),
                        )),
                    }
                },
                _ => Err(Error::status(Status::InvalidResponse, SITE)),
            }
        },
    )
}

/// One retried write-only conversation.
fn write_only_exchange(
    transport: &mut dyn DdcTransport,
    policy: &TryPolicy,
    cancel: &CancelToken,
    stats: &Stats,
    dsa: &mut DynamicSleep,
    site: &'static str,
    wire: &[u8],
) -> DdcResult<()> {
    crate::retry::execute(
        TryClass::WriteOnly,
        policy,
        cancel,
        stats,
        dsa,
        site,
        |dsa, _attempt| {
            dsa.sleep(SleepEvent::NextWrite);
            transport.write_ddc(wire)
        },
    )
}

/// One retried fragment exchange of a multi-part read.
fn fragment_exchange(
    transport: &mut dyn DdcTransport,
    policy: &TryPolicy,
    cancel: &CancelToken,
    stats: &Stats,
    dsa: &mut DynamicSleep,
    request: &Request,
) -> DdcResult<Reply> {
    const SITE: &str = "vcp::fragment";
    let wire = encode_request(request)?;
    crate::retry::execute(
        TryClass::MultiPartRead,
        policy,
        cancel,
        stats,
        dsa,
        SITE,
        |dsa, _attempt| {
            dsa.sleep(SleepEvent::NextWrite);
            transport.write_ddc(&wire)?;
            dsa.sleep(SleepEvent::FragmentReply);
            let buf = transport.read_ddc(reply_size(FRAGMENT_DATA_MAX + 3))?;
            match decode_reply(&buf)? {
                Reply::Null => Err(Error::status(Status::NullResponse, SITE)),
                reply @ Reply::Fragment { .. } => Ok(reply),
                _ => Err(Error::status(Status::InvalidResponse, SITE)),
            }
        },
    )
}

/// Dialect-aware interpretation of a get-feature outcome.
///
/// Maps a reported-unsupported bit, an all-zero value on an all-zero-dialect
/// display, and a null response on a null-dialect display to the proper
/// unsupported statuses.
pub(crate) fn interpret_vcp_result(
    flags: DdcFlags,
    feature: FeatureCode,
    res: DdcResult<RawVcpReply>,
) -> DdcResult<VcpValue> {
    const SITE: &str = "vcp::interpret";
    match res {
        Ok(raw) if raw.unsupported => Err(Error::new(
            Status::ReportedUnsupported,
            SITE,
            format!("feature x{:02X}", feature),
        )),
        Ok(raw) => {
            if raw.value.is_all_zero() && flags.contains(DdcFlags::USES_ALL_ZERO_BYTES) {
                Err(Error::new(
                    Status::DeterminedUnsupported,
                    SITE,
                    format!("feature x{:02X}: all-zero value bytes", feature),
                ))
            } else {
                Ok(raw.value)
            }
        },
        Err(err)
            if matches!(err.status, Status::NullResponse | Status::AllResponsesNull)
                && flags.contains(DdcFlags::USES_NULL_RESPONSE) =>
        {
            Err(Error::with_causes(
                Status::DeterminedUnsupported,
                SITE,
                format!("feature x{:02X}: null response", feature),
                vec![err],
            ))
        },
        Err(err) => Err(err),
    }
}

impl DisplayHandle<'_> {
    /// Get the current and maximum value of a non-table feature.
    ///
    /// `reported-unsupported` and `determined-unsupported` distinguish a
    /// monitor saying no from the library inferring no via the display's
    /// dialect.
    pub fn get_vcp_feature(&mut self, feature: FeatureCode) -> DdcResult<VcpValue> {
        trace!("get_vcp_feature(x{:02X}) on {}", feature, self.display());
        let state = &mut *self.state;
        let flags = state.flags;
        let res = get_vcp_exchange(
            self.transport.as_mut(),
            &self.policy,
            &self.cancel,
            &self.stats,
            &mut state.tuning,
            feature,
        );
        track_eio(state, &res);
        interpret_vcp_result(flags, feature, res)
    }

    /// Set a non-table feature.
    ///
    /// With verification enabled (the default) the value is read back after
    /// a settle delay; a second read-back is allowed before declaring
    /// `verification-failed`.
    pub fn set_vcp_feature(&mut self, feature: FeatureCode, value: u16) -> DdcResult<()> {
        trace!("set_vcp_feature(x{:02X}, {}) on {}", feature, value, self.display());
        let wire = encode_request(&Request::SetVcp { feature, value })?;
        let state = &mut *self.state;
        write_only_exchange(
            self.transport.as_mut(),
            &self.policy,
            &self.cancel,
            &self.stats,
            &mut state.tuning,
            "vcp::set",
            &wire,
        )?;
        if !self.verify_sets {
            return Ok(());
        }

        let flags = state.flags;
        let mut read_back = 0u16;
        // monitors that settle slowly get one extra read-back
        for _ in 0..2 {
            state.tuning.sleep(SleepEvent::VerifySettle);
            let res = get_vcp_exchange(
                self.transport.as_mut(),
                &self.policy,
                &self.cancel,
                &self.stats,
                &mut state.tuning,
                feature,
            );
            match interpret_vcp_result(flags, feature, res) {
                Ok(v) if v.value() == value => return Ok(()),
                Ok(v) => read_back = v.value(),
                Err(err) => {
                    return Err(Error::with_causes(
                        Status::VerificationFailed,
                        "vcp::set",
                        format!("feature x{:02X}: read-back failed", feature),
                        vec![err],
                    ))
                },
            }
        }
        Err(Error::new(
            Status::VerificationFailed,
            "vcp::set",
            format!("feature x{:02X}: wrote {}, read back {}", feature, value, read_back),
        ))
    }

    /// Read a table feature value, stitched from offset-ordered fragments.
    pub fn table_read(&mut self, feature: FeatureCode) -> DdcResult<Vec<u8>> {
        trace!("table_read(x{:02X}) on {}", feature, self.display());
        let state = &mut *self.state;
        let mut asm = MultiPartAssembler::new(Opcode::TableReadReply);
        loop {
            let reply = fragment_exchange(
                self.transport.as_mut(),
                &self.policy,
                &self.cancel,
                &self.stats,
                &mut state.tuning,
                &Request::TableRead {
                    feature,
                    offset: asm.next_offset(),
                },
            )?;
            if asm.push(&reply)? {
                return asm.finish();
            }
        }
    }

    /// Write a table feature value in offset-ordered chunks.
    pub fn table_write(&mut self, feature: FeatureCode, bytes: &[u8]) -> DdcResult<()> {
        trace!("table_write(x{:02X}, {} bytes) on {}", feature, bytes.len(), self.display());
        let state = &mut *self.state;
        let mut offset = 0usize;
        // a zero-length value still writes one empty chunk
        loop {
            let chunk_len = (bytes.len() - offset).min(TABLE_WRITE_CHUNK);
            let wire = encode_request(&Request::TableWrite {
                feature,
                offset: offset as u16,
                bytes: bytes[offset..offset + chunk_len].to_vec(),
            })?;
            crate::retry::execute(
                TryClass::MultiPartWrite,
                &self.policy,
                &self.cancel,
                &self.stats,
                &mut state.tuning,
                "vcp::table_write",
                |dsa, _attempt| {
                    dsa.sleep(SleepEvent::NextWrite);
                    self.transport.write_ddc(&wire)
                },
            )?;
            offset += chunk_len;
            if offset >= bytes.len() {
                return Ok(());
            }
        }
    }

    /// Read the raw capabilities string.
    pub fn capabilities_string(&mut self) -> DdcResult<Vec<u8>> {
        trace!("capabilities_string on {}", self.display());
        let state = &mut *self.state;
        let mut asm = MultiPartAssembler::new(Opcode::CapabilitiesReply);
        loop {
            let reply = fragment_exchange(
                self.transport.as_mut(),
                &self.policy,
                &self.cancel,
                &self.stats,
                &mut state.tuning,
                &Request::CapabilitiesRead {
                    offset: asm.next_offset(),
                },
            )?;
            if asm.push(&reply)? {
                return asm.finish();
            }
        }
    }

    /// Request and parse the display's capabilities string.
    pub fn capabilities(&mut self) -> DdcResult<Capabilities> {
        let raw = self.capabilities_string()?;
        caps::parse_capabilities(&raw)
    }

    /// Instruct the monitor to save its current settings.
    pub fn save_current_settings(&mut self) -> DdcResult<()> {
        trace!("save_current_settings on {}", self.display());
        let wire = encode_request(&Request::SaveSettings)?;
        let state = &mut *self.state;
        write_only_exchange(
            self.transport.as_mut(),
            &self.policy,
            &self.cancel,
            &self.stats,
            &mut state.tuning,
            "vcp::save_settings",
            &wire,
        )
    }

    /// Request a timing report.
    pub fn get_timing_report(&mut self) -> DdcResult<TimingReport> {
        const SITE: &str = "vcp::timing";
        trace!("get_timing_report on {}", self.display());
        let wire = encode_request(&Request::GetTiming)?;
        let state = &mut *self.state;
        crate::retry::execute(
            TryClass::WriteRead,
            &self.policy,
            &self.cancel,
            &self.stats,
            &mut state.tuning,
            SITE,
            |dsa, _attempt| {
                dsa.sleep(SleepEvent::NextWrite);
                self.transport.write_ddc(&wire)?;
                dsa.sleep(SleepEvent::WriteToRead);
                let buf = self.transport.read_ddc(reply_size(6))?;
                match decode_reply(&buf)? {
                    Reply::Null => Err(Error::status(Status::NullResponse, SITE)),
                    Reply::Timing {
                        status,
                        horizontal,
                        vertical,
                    } => Ok(TimingReport {
                        status,
                        horizontal,
                        vertical,
                    }),
                    _ => Err(Error::status(Status::InvalidResponse, SITE)),
                }
            },
        )
    }
}

/// Count `EIO`-style fatal communication errors on an otherwise working
/// display; discovery consults the count for its dialect re-probe fallback.
fn track_eio(state: &mut DisplayState, res: &DdcResult<RawVcpReply>) {
    if let Err(err) = res {
        if err.status == Status::CommunicationFailed {
            state.eio_count += 1;
        }
    }
}
