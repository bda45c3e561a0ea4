//! EDID-derived display identity.

use {
    crate::error::{DdcResult, Error, Status},
    log::trace,
    std::{fmt, iter::FromIterator},
};

/// Identifying information about an attached display, parsed from its EDID.
///
/// Every field except the raw EDID bytes is optional: phantom connectors and
/// monitors with mangled EDIDs fill in what they can.
#[derive(Clone, Debug, Default)]
pub struct DisplayInfo {
    /// A three-character identifier of the manufacturer of the display.
    pub manufacturer_id: Option<String>,
    /// A number that identifies the product model.
    pub product_code: Option<u16>,
    /// The EDID version and revision.
    pub version: Option<(u8, u8)>,
    /// Binary serial number of the device.
    pub serial: Option<u32>,
    /// Year the display was manufactured.
    pub manufacture_year: Option<u8>,
    /// Week the display was manufactured.
    pub manufacture_week: Option<u8>,
    /// The model name of the display.
    pub model_name: Option<String>,
    /// Human-readable serial number of the device.
    pub serial_number: Option<String>,
    /// Raw EDID data provided by the display.
    pub edid_data: Option<Vec<u8>>,
}

impl fmt::Display for DisplayInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.manufacturer_id {
            Some(s) => write!(f, "{}", s)?,
            None => write!(f, "???")?,
        }

        if let Some(s) = &self.model_name {
            write!(f, " {}", s)?;
        } else if let Some(s) = &self.product_code {
            write!(f, " {}", s)?;
        }

        if let Some(s) = &self.serial_number {
            write!(f, " {}", s)?;
        }

        Ok(())
    }
}

impl DisplayInfo {
    /// Creates a new `DisplayInfo` from unparsed EDID data.
    ///
    /// Fails when the blob does not parse as an EDID base block.
    pub fn from_edid(edid_data: Vec<u8>) -> DdcResult<Self> {
        trace!("DisplayInfo::from_edid({} bytes)", edid_data.len());

        if edid_data.len() < 128 {
            return Err(Error::new(
                Status::InvalidResponse,
                "display_info::from_edid",
                format!("EDID is {} bytes, expected at least 128", edid_data.len()),
            ));
        }

        let edid = edid::parse(&edid_data)
            .to_result()
            .map_err(|e| Error::new(Status::InvalidResponse, "display_info::from_edid", e.to_string()))?;

        let mut model_name = None;
        let mut serial_number = None;

        for desc in edid.descriptors {
            match desc {
                edid::Descriptor::SerialNumber(serial) => serial_number = Some(serial),
                edid::Descriptor::ProductName(model) => model_name = Some(model),
                _ => (),
            }
        }

        Ok(DisplayInfo {
            manufacturer_id: Some(String::from_iter(edid.header.vendor.iter())),
            product_code: Some(edid.header.product),
            serial: Some(edid.header.serial),
            version: Some((edid.header.version, edid.header.revision)),
            manufacture_year: Some(edid.header.year),
            manufacture_week: Some(edid.header.week),
            model_name,
            serial_number,
            edid_data: Some(edid_data),
        })
    }

    /// Merge in any missing information from another `DisplayInfo`.
    pub fn update_from(&mut self, info: &DisplayInfo) {
        if self.manufacturer_id.is_none() {
            self.manufacturer_id = info.manufacturer_id.clone()
        }

        if self.product_code.is_none() {
            self.product_code = info.product_code
        }

        if self.version.is_none() {
            self.version = info.version
        }

        if self.serial.is_none() {
            self.serial = info.serial
        }

        if self.manufacture_year.is_none() {
            self.manufacture_year = info.manufacture_year
        }

        if self.manufacture_week.is_none() {
            self.manufacture_week = info.manufacture_week
        }

        if self.model_name.is_none() {
            self.model_name = info.model_name.clone()
        }

        if self.serial_number.is_none() {
            self.serial_number = info.serial_number.clone()
        }

        if self.edid_data.is_none() {
            self.edid_data = info.edid_data.clone()
        }
    }

    /// The identifier tuple `(manufacturer, model, serial)` that keys the
    /// persisted caches and the phantom filter.
    ///
    /// The ASCII serial descriptor wins over the binary serial; a display
    /// reporting neither yields no tuple and is never matched against
    /// another.
    pub fn id_tuple(&self) -> Option<(String, String, String)> {
        let mfg = self.manufacturer_id.clone()?;
        let model = self
            .model_name
            .clone()
            .or_else(|| self.product_code.map(|p| p.to_string()))?;
        let serial = self
            .serial_number
            .clone()
            .or_else(|| self.serial.map(|s| s.to_string()))?;
        Some((mfg, model, serial))
    }

    /// The identifier tuple flattened into a cache key.
    pub fn id_key(&self) -> Option<String> {
        self.id_tuple().map(|(m, p, s)| format!("{}/{}/{}", m, p, s))
    }
}

#[cfg(test)]
pub(crate) mod test_edid {
    use super::*;

    /// Build a syntactically valid 128-byte EDID for tests.
    pub fn edid_block(vendor: [u8; 3], product: u16, serial: u32) -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        // compressed 5-bit letters, 'A' = 1
        let v = ((vendor[0] - b'A' + 1) as u16) << 10
            | ((vendor[1] - b'A' + 1) as u16) << 5
            | (vendor[2] - b'A' + 1) as u16;
        edid[8..10].copy_from_slice(&v.to_be_bytes());
        edid[10..12].copy_from_slice(&product.to_le_bytes());
        edid[12..16].copy_from_slice(&serial.to_le_bytes());
        edid[16] = 2; // week
        edid[17] = 30; // year offset from 1990
        edid[18] = 1;
        edid[19] = 4;
        // one detailed timing, a serial-number descriptor, two dummies
        edid[54..56].copy_from_slice(&[0x01, 0x01]);
        edid[72..77].copy_from_slice(&[0x00, 0x00, 0x00, 0xFF, 0x00]);
        edid[77..82].copy_from_slice(b"SN001");
        edid[82] = 0x0A;
        for pad in &mut edid[83..90] {
            *pad = 0x20;
        }
        edid[90..94].copy_from_slice(&[0x00, 0x00, 0x00, 0x10]);
        edid[108..112].copy_from_slice(&[0x00, 0x00, 0x00, 0x10]);
        let sum: u8 = edid[..127].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        edid[127] = 0u8.wrapping_sub(sum);
        edid
    }

    #[test]
    fn parses_identity_fields() {
        let info = DisplayInfo::from_edid(edid_block(*b"ACM", 0x0123, 42)).unwrap();
        assert_eq!(info.manufacturer_id.as_deref(), Some("ACM"));
        assert_eq!(info.product_code, Some(0x0123));
        assert_eq!(info.serial, Some(42));
    }

    #[test]
    fn rejects_garbage() {
        assert!(DisplayInfo::from_edid(vec![0u8; 128]).is_err());
    }

    #[test]
    fn rejects_short_blob() {
        assert!(DisplayInfo::from_edid(vec![0u8; 64]).is_err());
    }

    #[test]
    fn id_tuple_prefers_ascii_serial() {
        let mut info = DisplayInfo::default();
        assert_eq!(info.id_tuple(), None);

        info.manufacturer_id = Some("ACM".into());
        info.model_name = Some("M1".into());
        info.serial = Some(7);
        info.serial_number = Some("SN001".into());
        assert_eq!(
            info.id_tuple(),
            Some(("ACM".into(), "M1".into(), "SN001".into()))
        );
        assert_eq!(info.id_key().as_deref(), Some("ACM/M1/SN001"));
    }
}
