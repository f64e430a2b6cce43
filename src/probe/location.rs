use std::fmt::{Debug, Display, Formatter};

use thiserror::Error;

pub const LOCATION_SIZE: usize = 36;

#[derive(Debug, Error, Eq, PartialEq)]
#[error("byte representation of location must not exceed {LOCATION_SIZE} bytes, was {len}: {location}")]
pub struct LocationError {
    pub len: usize,
    pub location: String,
}

/// An opaque tag for the physical or topological location of a node, carried in every probe.
///
/// The tag's UTF-8 bytes are stored at the start of a fixed-size field and padded with zeros.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Location([u8; LOCATION_SIZE]);

impl Default for Location {
    fn default() -> Self {
        Location([0; LOCATION_SIZE])
    }
}

impl Location {
    pub fn new(location: &str) -> Result<Location, LocationError> {
        let bytes = location.as_bytes();
        if bytes.len() > LOCATION_SIZE {
            return Err(LocationError {
                len: bytes.len(),
                location: location.to_string(),
            });
        }

        let mut result = [0u8; LOCATION_SIZE];
        result[..bytes.len()].copy_from_slice(bytes);
        Ok(Location(result))
    }

    pub fn from_bytes(bytes: [u8; LOCATION_SIZE]) -> Location {
        Location(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LOCATION_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let used = self.0.iter()
            .position(|&b| b == 0)
            .map(|len| &self.0[..len])
            .unwrap_or(&self.0);

        write!(f, "{}", String::from_utf8_lossy(used))
    }
}

impl Debug for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Location({:?})", self.to_string())
    }
}
