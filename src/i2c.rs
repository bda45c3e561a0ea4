//! Linux i2c-dev transport.
//!
//! Opens `/dev/i2c-N`, selects the 7-bit slave address with the normal or
//! forced ioctl variant, and performs the raw framed reads and writes the
//! protocol engine asks for. All OS failures are classified into the library
//! error taxonomy before they leave this module.

use {
    crate::{
        error::{DdcResult, Error, Status},
        packet,
        transport::{classify_io_error, classify_os_error, DdcTransport},
    },
    log::trace,
    nix::libc,
    std::{
        fmt::{self, Debug, Formatter},
        fs::{File, OpenOptions},
        io::{Read, Write},
        os::unix::io::AsRawFd,
        path::PathBuf,
    },
};

nix::ioctl_write_int_bad!(
    /// `I2C_SLAVE`: claim a slave address, failing if a driver owns it.
    ioctl_i2c_slave,
    0x0703
);
nix::ioctl_write_int_bad!(
    /// `I2C_SLAVE_FORCE`: claim a slave address regardless of ownership.
    ioctl_i2c_slave_force,
    0x0706
);

/// An open `/dev/i2c-N` character device.
pub struct I2cBus {
    file: File,
    bus: u32,
    slave: Option<u8>,
}

impl I2cBus {
    /// Open the i2c-dev node for the given bus number, read-write.
    pub fn open(bus: u32) -> DdcResult<Self> {
        let path = Self::dev_path(bus);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| classify_io_error(&e, "i2c::open", &format!("open {}", path.display())))?;
        trace!("opened {}", path.display());
        Ok(I2cBus {
            file,
            bus,
            slave: None,
        })
    }

    /// Device node path for a bus number.
    pub fn dev_path(bus: u32) -> PathBuf {
        PathBuf::from(format!("/dev/i2c-{}", bus))
    }

    /// The bus number this handle was opened on.
    pub fn bus_number(&self) -> u32 {
        self.bus
    }

    /// Select the 7-bit slave address for subsequent reads and writes.
    ///
    /// `force` selects the unchecked-ownership ioctl variant; callers reach
    /// for it only after the normal variant reported the address busy.
    pub fn set_slave_address(&mut self, addr: u8, force: bool) -> DdcResult<()> {
        if self.slave == Some(addr) {
            return Ok(());
        }
        let fd = self.file.as_raw_fd();
        let res = if force {
            unsafe { ioctl_i2c_slave_force(fd, addr as libc::c_int) }
        } else {
            unsafe { ioctl_i2c_slave(fd, addr as libc::c_int) }
        };
        res.map_err(|e| {
            classify_os_error(
                e as i32,
                "i2c::set_slave_address",
                &format!("slave x{:02X} on i2c-{}", addr, self.bus),
            )
        })?;
        self.slave = Some(addr);
        Ok(())
    }

    /// Write raw bytes to the currently selected slave.
    pub fn write(&mut self, bytes: &[u8]) -> DdcResult<usize> {
        (&self.file).write(bytes).map_err(|e| {
            classify_io_error(&e, "i2c::write", &format!("write {} bytes to i2c-{}", bytes.len(), self.bus))
        })
    }

    /// Read raw bytes from the currently selected slave into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> DdcResult<usize> {
        (&self.file)
            .read(buf)
            .map_err(|e| classify_io_error(&e, "i2c::read", &format!("read {} bytes from i2c-{}", buf.len(), self.bus)))
    }

    /// Read the EDID at slave 0x50: seek to offset zero, then read
    /// `read_size` bytes (128 or 256).
    pub fn read_edid(&mut self, read_size: usize) -> DdcResult<Vec<u8>> {
        self.set_slave_address(packet::EDID_SLAVE, false)?;
        self.write(&[0x00])?;
        let mut edid = vec![0u8; read_size];
        let n = self.read(&mut edid)?;
        if n < read_size {
            return Err(Error::new(
                Status::ShortRead,
                "i2c::read_edid",
                format!("EDID read returned {} of {} bytes", n, read_size),
            ));
        }
        Ok(edid)
    }
}

impl DdcTransport for I2cBus {
    fn write_ddc(&mut self, wire: &[u8]) -> DdcResult<()> {
        self.set_slave_address(packet::DDC_SLAVE, false)?;
        let n = self.write(wire)?;
        if n < wire.len() {
            return Err(Error::new(
                Status::ShortRead,
                "i2c::write_ddc",
                format!("wrote {} of {} bytes", n, wire.len()),
            ));
        }
        Ok(())
    }

    fn read_ddc(&mut self, len: usize) -> DdcResult<Vec<u8>> {
        self.set_slave_address(packet::DDC_SLAVE, false)?;
        let mut buf = vec![0u8; len];
        let n = self.read(&mut buf)?;
        if n < len {
            return Err(Error::new(
                Status::ShortRead,
                "i2c::read_ddc",
                format!("read {} of {} bytes", n, len),
            ));
        }
        Ok(buf)
    }

    fn describe(&self) -> String {
        format!("i2c-{}", self.bus)
    }
}

impl Debug for I2cBus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_tuple("I2cBus").field(&self.bus).finish()
    }
}

/// Bus numbers of every accessible i2c-dev node on this machine.
pub fn enumerate_bus_numbers() -> Vec<u32> {
    let mut buses = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = name.strip_prefix("i2c-").and_then(|n| n.parse().ok()) {
                buses.push(n);
            }
        }
    }
    buses.sort_unstable();
    buses
}

/// The sysfs directory describing a bus, e.g. `/sys/bus/i2c/devices/i2c-5`.
pub fn sysfs_path(bus: u32) -> PathBuf {
    PathBuf::from(format!("/sys/bus/i2c/devices/i2c-{}", bus))
}
