//! Protocol version announced by the client.
//!
//! Sent as the `vsn` query parameter of every endpoint URL; the server uses
//! it to pick the frame layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version this crate speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// A `major.minor.patch` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
