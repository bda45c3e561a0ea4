//! Display selection queries.

use crate::display::{Display, IoPath};

/// A query to filter out matching displays.
///
/// Most comparisons must match the full string.
pub enum Query {
    /// Matches any display
    Any,
    /// Matches the display on the given I²C bus
    Bus(u32),
    /// Matches the display with the given display number
    DisplayNumber(i32),
    /// Matches a display whose raw EDID begins with the given bytes
    EdidPrefix(Vec<u8>),
    /// Matches a display with the specified manufacturer
    ManufacturerId(String),
    /// Matches a display with the specified model name
    ModelName(String),
    /// Matches a display with the specified serial number
    SerialNumber(String),
    /// At least one of the queries must match
    Or(Vec<Query>),
    /// All of the queries must match
    And(Vec<Query>),
}

impl Query {
    /// Queries whether the provided display is a match.
    pub fn matches(&self, display: &Display) -> bool {
        match *self {
            Query::Any => true,
            Query::Bus(bus) => display.path == IoPath::I2c { bus },
            Query::DisplayNumber(n) => display.dispno == n,
            Query::EdidPrefix(ref prefix) => display
                .info
                .edid_data
                .as_ref()
                .map(|edid| edid.starts_with(prefix) && !prefix.is_empty())
                .unwrap_or(false),
            Query::ManufacturerId(ref id) => display.info.manufacturer_id.as_ref() == Some(id),
            Query::ModelName(ref model) => display.info.model_name.as_ref() == Some(model),
            Query::SerialNumber(ref serial) => display.info.serial_number.as_ref() == Some(serial),
            Query::Or(ref query) => query.iter().any(|q| q.matches(display)),
            Query::And(ref query) => query.iter().all(|q| q.matches(display)),
        }
    }
}
