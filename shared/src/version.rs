//! Host/participant version numbers.
//!
//! Versions travel over the wire as dotted strings (e.g. `"1.4.2"`) and are
//! parsed on the host side for the handshake compatibility check.

use serde::{Deserialize, Serialize};

/// A `major.minor.build` version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version string '{0}'")]
pub struct VersionParseError(pub String);

impl Version {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Parse a dotted version string.
    ///
    /// Missing components default to zero, so `"1"` and `"1.0.0"` parse to
    /// the same version.
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        let mut parts = s.split('.');
        let mut next = |required: bool| -> Result<u32, VersionParseError> {
            match parts.next() {
                Some(p) => p
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| VersionParseError(s.to_string())),
                None if required => Err(VersionParseError(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let build = next(false)?;
        if parts.next().is_some() {
            return Err(VersionParseError(s.to_string()));
        }
        Ok(Self::new(major, minor, build))
    }

    /// Whether two versions may talk to each other.
    ///
    /// Only the major component participates in the check; minor and build
    /// are informational.
    pub fn compatible(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        assert_eq!(Version::parse("1.4.2").unwrap(), Version::new(1, 4, 2));
    }

    #[test]
    fn parse_short() {
        assert_eq!(Version::parse("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(Version::parse("2.1").unwrap(), Version::new(2, 1, 0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("a.b.c").is_err());
        assert!(Version::parse("1.2.3.4").is_err());
    }

    #[test]
    fn compatibility_is_major_only() {
        let host = Version::new(1, 9, 9);
        assert!(host.compatible(&Version::new(1, 2, 3)));
        assert!(!host.compatible(&Version::new(2, 0, 0)));
    }

    #[test]
    fn display_roundtrip() {
        let v = Version::new(3, 1, 7);
        assert_eq!(Version::parse(&v.to_string()).unwrap(), v);
    }
}
