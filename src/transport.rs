//! The seam between the protocol engine and a physical channel.
//!
//! The engine speaks to a monitor through [`DdcTransport`]; the Linux
//! i2c-dev implementation lives in [`crate::i2c`], and scripted transports
//! back the protocol tests. A USB HID monitor-control channel plugs in at
//! the same seam.

use crate::error::{DdcResult, Error, Status};

/// Raw framed I/O against a monitor's DDC/CI slave.
///
/// Implementations perform exactly one bus transaction per call and classify
/// operating-system failures into the library error taxonomy: transient
/// conditions map to retriable statuses, `EBUSY` to `display-busy`, a
/// vanished device to `display-removed`.
pub trait DdcTransport {
    /// Write one framed packet to the DDC slave.
    fn write_ddc(&mut self, wire: &[u8]) -> DdcResult<()>;

    /// Read up to `len` bytes of one reply from the DDC slave.
    fn read_ddc(&mut self, len: usize) -> DdcResult<Vec<u8>>;

    /// A short description of the channel for error messages.
    fn describe(&self) -> String;
}

/// Classify a raw OS error into the protocol-level taxonomy.
pub(crate) fn classify_os_error(errno: i32, site: &'static str, detail: &str) -> Error {
    // nix::libc constants are not available off Linux; the raw values are
    // identical across the platforms this library compiles on.
    const EAGAIN: i32 = 11;
    const EBUSY: i32 = 16;
    const ENODEV: i32 = 19;
    const ENXIO: i32 = 6;
    const ETIMEDOUT: i32 = 110;

    let status = match errno {
        EAGAIN | ETIMEDOUT => Status::Timeout,
        EBUSY => Status::DisplayBusy,
        ENODEV | ENXIO => Status::DisplayRemoved,
        _ => Status::CommunicationFailed,
    };
    Error::new(status, site, format!("{} (errno {})", detail, errno))
}

/// Classify a `std::io` failure, falling back to `communication-failed`
/// when no errno is attached.
pub(crate) fn classify_io_error(err: &std::io::Error, site: &'static str, detail: &str) -> Error {
    match err.raw_os_error() {
        Some(errno) => classify_os_error(errno, site, detail),
        None => Error::new(status_for_io_kind(err), site, format!("{}: {}", detail, err)),
    }
}

fn status_for_io_kind(err: &std::io::Error) -> Status {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Status::Timeout,
        std::io::ErrorKind::NotFound => Status::DisplayRemoved,
        _ => Status::CommunicationFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_taxonomy() {
        assert_eq!(classify_os_error(11, "t", "w").status, Status::Timeout);
        assert_eq!(classify_os_error(110, "t", "w").status, Status::Timeout);
        assert_eq!(classify_os_error(16, "t", "w").status, Status::DisplayBusy);
        assert_eq!(classify_os_error(19, "t", "w").status, Status::DisplayRemoved);
        assert_eq!(classify_os_error(6, "t", "w").status, Status::DisplayRemoved);
        assert_eq!(classify_os_error(5, "t", "w").status, Status::CommunicationFailed);
    }

    #[test]
    fn timeouts_are_retriable_busy_is_not() {
        assert!(classify_os_error(11, "t", "w").is_retriable());
        assert!(!classify_os_error(16, "t", "w").is_retriable());
        assert!(!classify_os_error(19, "t", "w").is_retriable());
    }
}
