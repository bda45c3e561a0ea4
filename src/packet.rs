//! DDC/CI packet framing.
//!
//! A host packet written to the bus is `source | length | payload… | checksum`
//! where the length byte is `0x80 | payload_len` and the checksum is the XOR
//! of every wire byte seeded with the destination address `0x6E` (transmitted
//! by the adapter as the addressing byte, so it never appears in the write
//! buffer). Replies arrive as `0x6E | length | payload… | checksum` with the
//! XOR seeded by `0x50`.

use crate::error::{DdcResult, Error, Status};

/// 7-bit I²C slave address carrying DDC/CI command traffic.
pub const DDC_SLAVE: u8 = 0x37;
/// 7-bit I²C slave address publishing the EDID.
pub const EDID_SLAVE: u8 = 0x50;
/// Source address byte identifying the host in outgoing packets.
pub const HOST_SOURCE: u8 = 0x51;
/// Destination address byte identifying the monitor on the wire.
pub const DISPLAY_DEST: u8 = 0x6E;
/// XOR seed for verifying reply checksums.
pub const REPLY_SEED: u8 = 0x50;
/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = 32;
/// Largest data portion of a multi-part reply fragment.
pub const FRAGMENT_DATA_MAX: usize = 32;
/// Largest chunk of table data per write fragment, leaving room for the
/// opcode, feature code and offset inside the payload.
pub const TABLE_WRITE_CHUNK: usize = MAX_PAYLOAD - 4;

const LENGTH_FLAG: u8 = 0x80;

/// DDC/CI operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Request the value of a VCP feature.
    VcpRequest = 0x01,
    /// Reply carrying a VCP feature value.
    VcpReply = 0x02,
    /// Set a VCP feature.
    VcpSet = 0x03,
    /// Reply carrying a timing report.
    TimingReply = 0x06,
    /// Request a timing report.
    TimingRequest = 0x07,
    /// Instruct the monitor to save its current settings.
    SaveSettings = 0xE2,
    /// Fragment of the capabilities string.
    CapabilitiesReply = 0xE3,
    /// Write a fragment of a table value.
    TableWrite = 0xE4,
    /// Request a fragment of a table value.
    TableReadRequest = 0xE5,
    /// Request the monitor's identification string.
    IdentificationRequest = 0xE6,
    /// Fragment of a table value.
    TableReadReply = 0xE7,
    /// Request a fragment of the capabilities string.
    CapabilitiesRequest = 0xF3,
}

impl Opcode {
    /// Look up a wire opcode.
    pub fn from_u8(op: u8) -> Option<Opcode> {
        Some(match op {
            0x01 => Opcode::VcpRequest,
            0x02 => Opcode::VcpReply,
            0x03 => Opcode::VcpSet,
            0x06 => Opcode::TimingReply,
            0x07 => Opcode::TimingRequest,
            0xE2 => Opcode::SaveSettings,
            0xE3 => Opcode::CapabilitiesReply,
            0xE4 => Opcode::TableWrite,
            0xE5 => Opcode::TableReadRequest,
            0xE6 => Opcode::IdentificationRequest,
            0xE7 => Opcode::TableReadReply,
            0xF3 => Opcode::CapabilitiesRequest,
            _ => return None,
        })
    }
}

/// XOR-reduce `bytes` starting from `seed`.
pub fn xor_checksum(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |acc, b| acc ^ b)
}

/// A host-to-monitor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Get a non-table VCP feature value.
    GetVcp {
        /// VCP feature code.
        feature: u8,
    },
    /// Set a non-table VCP feature value.
    SetVcp {
        /// VCP feature code.
        feature: u8,
        /// New 16-bit value.
        value: u16,
    },
    /// Ask the monitor to persist its current settings.
    SaveSettings,
    /// Request a timing report.
    GetTiming,
    /// Request the capabilities fragment starting at `offset`.
    CapabilitiesRead {
        /// Byte offset into the capabilities string.
        offset: u16,
    },
    /// Request the table fragment of `feature` starting at `offset`.
    TableRead {
        /// VCP feature code.
        feature: u8,
        /// Byte offset into the table value.
        offset: u16,
    },
    /// Write a table fragment of `feature` at `offset`.
    TableWrite {
        /// VCP feature code.
        feature: u8,
        /// Byte offset into the table value.
        offset: u16,
        /// Fragment bytes, at most [`TABLE_WRITE_CHUNK`].
        bytes: Vec<u8>,
    },
    /// Request the monitor's identification string.
    Identification,
}

impl Request {
    fn payload(&self) -> Vec<u8> {
        match self {
            Request::GetVcp { feature } => vec![Opcode::VcpRequest as u8, *feature],
            Request::SetVcp { feature, value } => vec![
                Opcode::VcpSet as u8,
                *feature,
                (value >> 8) as u8,
                (value & 0xFF) as u8,
            ],
            Request::SaveSettings => vec![Opcode::SaveSettings as u8],
            Request::GetTiming => vec![Opcode::TimingRequest as u8],
            Request::CapabilitiesRead { offset } => vec![
                Opcode::CapabilitiesRequest as u8,
                (offset >> 8) as u8,
                (offset & 0xFF) as u8,
            ],
            Request::TableRead { feature, offset } => vec![
                Opcode::TableReadRequest as u8,
                *feature,
                (offset >> 8) as u8,
                (offset & 0xFF) as u8,
            ],
            Request::TableWrite {
                feature,
                offset,
                bytes,
            } => {
                let mut p = vec![
                    Opcode::TableWrite as u8,
                    *feature,
                    (offset >> 8) as u8,
                    (offset & 0xFF) as u8,
                ];
                p.extend_from_slice(bytes);
                p
            },
            Request::Identification => vec![Opcode::IdentificationRequest as u8],
        }
    }
}

/// Frame a raw payload into the buffer written to the DDC slave.
pub fn build_host_packet(payload: &[u8]) -> DdcResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::new(
            Status::InvalidArgument,
            "packet::build_host_packet",
            format!("payload length {} exceeds {}", payload.len(), MAX_PAYLOAD),
        ));
    }
    let mut wire = Vec::with_capacity(payload.len() + 3);
    wire.push(HOST_SOURCE);
    wire.push(LENGTH_FLAG | payload.len() as u8);
    wire.extend_from_slice(payload);
    wire.push(xor_checksum(DISPLAY_DEST, &wire));
    Ok(wire)
}

/// Encode a request into the buffer written to the DDC slave.
pub fn encode_request(req: &Request) -> DdcResult<Vec<u8>> {
    build_host_packet(&req.payload())
}

/// Decode a buffer written by a host back into a [`Request`].
///
/// The inverse of [`encode_request`]; exercised by the protocol tests and by
/// scripted transports standing in for a monitor.
pub fn decode_request(wire: &[u8]) -> DdcResult<Request> {
    const SITE: &str = "packet::decode_request";
    if wire.len() < 3 {
        return Err(Error::status(Status::ShortRead, SITE));
    }
    if wire[0] != HOST_SOURCE {
        return Err(Error::new(
            Status::InvalidResponse,
            SITE,
            format!("unexpected source byte x{:02X}", wire[0]),
        ));
    }
    if wire[1] & LENGTH_FLAG == 0 {
        return Err(Error::status(Status::InvalidResponse, SITE));
    }
    let len = (wire[1] & !LENGTH_FLAG) as usize;
    if wire.len() != len + 3 {
        return Err(Error::new(
            Status::InvalidResponse,
            SITE,
            format!("declared payload {} in {}-byte packet", len, wire.len()),
        ));
    }
    let expected = xor_checksum(DISPLAY_DEST, &wire[..wire.len() - 1]);
    if expected != wire[wire.len() - 1] {
        return Err(Error::status(Status::ChecksumMismatch, SITE));
    }
    let payload = &wire[2..2 + len];
    let op = payload
        .first()
        .and_then(|op| Opcode::from_u8(*op))
        .ok_or_else(|| Error::status(Status::InvalidResponse, SITE))?;
    let short = || Error::status(Status::InvalidResponse, SITE);
    Ok(match op {
        Opcode::VcpRequest => Request::GetVcp {
            feature: *payload.get(1).ok_or_else(short)?,
        },
        Opcode::VcpSet => {
            if payload.len() < 4 {
                return Err(short());
            }
            Request::SetVcp {
                feature: payload[1],
                value: u16::from_be_bytes([payload[2], payload[3]]),
            }
        },
        Opcode::SaveSettings => Request::SaveSettings,
        Opcode::TimingRequest => Request::GetTiming,
        Opcode::CapabilitiesRequest => {
            if payload.len() < 3 {
                return Err(short());
            }
            Request::CapabilitiesRead {
                offset: u16::from_be_bytes([payload[1], payload[2]]),
            }
        },
        Opcode::TableReadRequest => {
            if payload.len() < 4 {
                return Err(short());
            }
            Request::TableRead {
                feature: payload[1],
                offset: u16::from_be_bytes([payload[2], payload[3]]),
            }
        },
        Opcode::TableWrite => {
            if payload.len() < 4 {
                return Err(short());
            }
            Request::TableWrite {
                feature: payload[1],
                offset: u16::from_be_bytes([payload[2], payload[3]]),
                bytes: payload[4..].to_vec(),
            }
        },
        Opcode::IdentificationRequest => Request::Identification,
        _ => return Err(short()),
    })
}

/// A monitor-to-host reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A zero-length message; some monitors use it to mean "unsupported".
    Null,
    /// A VCP feature value reply (opcode 0x02).
    Vcp {
        /// Result code byte: 0 for success, 1 for unsupported feature.
        result: u8,
        /// Echoed VCP feature code.
        feature: u8,
        /// VCP type byte.
        ty: u8,
        /// Maximum value, high byte.
        mh: u8,
        /// Maximum value, low byte.
        ml: u8,
        /// Current value, high byte.
        sh: u8,
        /// Current value, low byte.
        sl: u8,
    },
    /// A fragment of a multi-part value (capabilities or table read).
    Fragment {
        /// [`Opcode::CapabilitiesReply`] or [`Opcode::TableReadReply`].
        op: Opcode,
        /// Byte offset this fragment continues at.
        offset: u16,
        /// Fragment data; empty terminates the stream.
        data: Vec<u8>,
    },
    /// A timing report reply (opcode 0x06).
    Timing {
        /// Timing status byte.
        status: u8,
        /// Horizontal frequency in units of 1/100 kHz.
        horizontal: u16,
        /// Vertical frequency in units of 1/100 Hz.
        vertical: u16,
    },
}

/// Decode a reply buffer as read from the DDC slave.
///
/// An all-zero buffer and a zero-length packet both decode to
/// [`Reply::Null`]; interpreting that as an error is left to the caller.
pub fn decode_reply(wire: &[u8]) -> DdcResult<Reply> {
    const SITE: &str = "packet::decode_reply";
    if wire.len() < 3 {
        return Err(Error::status(Status::ShortRead, SITE));
    }
    if wire.iter().all(|b| *b == 0) {
        return Ok(Reply::Null);
    }
    if wire[0] != DISPLAY_DEST {
        return Err(Error::new(
            Status::InvalidResponse,
            SITE,
            format!("unexpected destination byte x{:02X}", wire[0]),
        ));
    }
    if wire[1] & LENGTH_FLAG == 0 {
        return Err(Error::new(
            Status::InvalidResponse,
            SITE,
            format!("length byte x{:02X} lacks the framing bit", wire[1]),
        ));
    }
    let len = (wire[1] & !LENGTH_FLAG) as usize;
    if wire.len() < len + 3 {
        return Err(Error::new(
            Status::ShortRead,
            SITE,
            format!("declared payload {} in {}-byte buffer", len, wire.len()),
        ));
    }
    let expected = xor_checksum(REPLY_SEED, &wire[..len + 2]);
    if expected != wire[len + 2] {
        return Err(Error::new(
            Status::ChecksumMismatch,
            SITE,
            format!("computed x{:02X}, received x{:02X}", expected, wire[len + 2]),
        ));
    }
    if len == 0 {
        return Ok(Reply::Null);
    }
    let payload = &wire[2..2 + len];
    match Opcode::from_u8(payload[0]) {
        Some(Opcode::VcpReply) => {
            if len != 8 {
                return Err(Error::new(
                    Status::InvalidResponse,
                    SITE,
                    format!("VCP reply payload of {} bytes", len),
                ));
            }
            Ok(Reply::Vcp {
                result: payload[1],
                feature: payload[2],
                ty: payload[3],
                mh: payload[4],
                ml: payload[5],
                sh: payload[6],
                sl: payload[7],
            })
        },
        Some(op @ (Opcode::CapabilitiesReply | Opcode::TableReadReply)) => {
            if len < 3 || len - 3 > FRAGMENT_DATA_MAX {
                return Err(Error::status(Status::InvalidResponse, SITE));
            }
            Ok(Reply::Fragment {
                op,
                offset: u16::from_be_bytes([payload[1], payload[2]]),
                data: payload[3..].to_vec(),
            })
        },
        Some(Opcode::TimingReply) => {
            if len != 6 {
                return Err(Error::status(Status::InvalidResponse, SITE));
            }
            Ok(Reply::Timing {
                status: payload[1],
                horizontal: u16::from_be_bytes([payload[2], payload[3]]),
                vertical: u16::from_be_bytes([payload[4], payload[5]]),
            })
        },
        _ => Err(Error::new(
            Status::InvalidResponse,
            SITE,
            format!("unknown reply opcode x{:02X}", payload[0]),
        )),
    }
}

/// Encode a reply into the buffer a monitor would put on the wire.
///
/// The inverse of [`decode_reply`].
pub fn encode_reply(reply: &Reply) -> DdcResult<Vec<u8>> {
    let payload: Vec<u8> = match reply {
        Reply::Null => Vec::new(),
        Reply::Vcp {
            result,
            feature,
            ty,
            mh,
            ml,
            sh,
            sl,
        } => vec![
            Opcode::VcpReply as u8,
            *result,
            *feature,
            *ty,
            *mh,
            *ml,
            *sh,
            *sl,
        ],
        Reply::Fragment { op, offset, data } => {
            let mut p = vec![*op as u8, (offset >> 8) as u8, (offset & 0xFF) as u8];
            p.extend_from_slice(data);
            p
        },
        Reply::Timing {
            status,
            horizontal,
            vertical,
        } => vec![
            Opcode::TimingReply as u8,
            *status,
            (horizontal >> 8) as u8,
            (horizontal & 0xFF) as u8,
            (vertical >> 8) as u8,
            (vertical & 0xFF) as u8,
        ],
    };
    // fragment replies carry opcode + offset on top of their data portion
    if payload.len() > FRAGMENT_DATA_MAX + 3 {
        return Err(Error::status(Status::InvalidArgument, "packet::encode_reply"));
    }
    let mut wire = Vec::with_capacity(payload.len() + 3);
    wire.push(DISPLAY_DEST);
    wire.push(LENGTH_FLAG | payload.len() as u8);
    wire.extend_from_slice(&payload);
    wire.push(xor_checksum(REPLY_SEED, &wire));
    Ok(wire)
}

/// Number of bytes to read for a reply whose payload length is `payload`.
pub fn reply_size(payload: usize) -> usize {
    payload + 3
}

/// Reassembles a multi-part value from reply fragments.
///
/// Fragments must begin at offset zero and continue contiguously; an empty
/// fragment terminates the stream.
#[derive(Debug)]
pub struct MultiPartAssembler {
    op: Opcode,
    next_offset: usize,
    buf: Vec<u8>,
    complete: bool,
}

/// Upper bound on an assembled multi-part value.
const MAX_MULTI_PART: usize = 0x1_0000;

impl MultiPartAssembler {
    /// Start assembly of fragments carrying the given reply opcode.
    pub fn new(op: Opcode) -> Self {
        MultiPartAssembler {
            op,
            next_offset: 0,
            buf: Vec::new(),
            complete: false,
        }
    }

    /// Offset the next fragment must start at.
    pub fn next_offset(&self) -> u16 {
        self.next_offset as u16
    }

    /// Whether a terminating fragment has arrived.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feed one decoded reply; returns `true` once the stream terminates.
    pub fn push(&mut self, reply: &Reply) -> DdcResult<bool> {
        const SITE: &str = "packet::multi_part";
        if self.complete {
            return Err(Error::status(Status::InvalidOperation, SITE));
        }
        let (op, offset, data) = match reply {
            Reply::Fragment { op, offset, data } => (*op, *offset as usize, data),
            Reply::Null => return Err(Error::status(Status::NullResponse, SITE)),
            _ => return Err(Error::status(Status::InvalidResponse, SITE)),
        };
        if op != self.op {
            return Err(Error::new(
                Status::InvalidResponse,
                SITE,
                format!("fragment opcode x{:02X}, expected x{:02X}", op as u8, self.op as u8),
            ));
        }
        if offset != self.next_offset {
            return Err(Error::new(
                Status::InvalidResponse,
                SITE,
                format!("fragment at offset {}, expected {}", offset, self.next_offset),
            ));
        }
        if data.is_empty() {
            self.complete = true;
            return Ok(true);
        }
        if self.buf.len() + data.len() > MAX_MULTI_PART {
            return Err(Error::status(Status::InvalidResponse, SITE));
        }
        self.buf.extend_from_slice(data);
        self.next_offset += data.len();
        Ok(false)
    }

    /// Consume the assembler, yielding the reassembled bytes.
    ///
    /// Fails with `invalid-response` unless a terminating fragment arrived.
    pub fn finish(self) -> DdcResult<Vec<u8>> {
        if !self.complete {
            return Err(Error::status(Status::InvalidResponse, "packet::multi_part"));
        }
        Ok(self.buf)
    }
}
