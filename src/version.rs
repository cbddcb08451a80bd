//! Operator release versions and the half-open ranges generators, decorators,
//! mutators and validators are bound to.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A `MAJOR.MINOR` operator release. Patch releases never change which
/// implementation is active for a slot, so they are not modelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorVersion {
    pub major: u32,
    pub minor: u32,
}

impl OperatorVersion {
    pub const V1_0: OperatorVersion = OperatorVersion::new(1, 0);
    pub const V1_1: OperatorVersion = OperatorVersion::new(1, 1);
    pub const V1_2: OperatorVersion = OperatorVersion::new(1, 2);
    pub const V1_3: OperatorVersion = OperatorVersion::new(1, 3);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The version this binary was built as.
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always MAJOR.MINOR.PATCH.
        env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or(OperatorVersion::V1_3)
    }
}

impl fmt::Display for OperatorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for OperatorVersion {
    type Err = Error;

    /// Accepts `1.2`, `1.2.7` and `v1.2`; anything after the minor
    /// component is ignored.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| Error::config(format!("invalid operator version {s:?}")))?;
        let minor = parts
            .next()
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u32>()
            })
            .transpose()
            .map_err(|_| Error::config(format!("invalid operator version {s:?}")))?
            .unwrap_or(0);
        Ok(OperatorVersion::new(major, minor))
    }
}

/// Half-open `[start, stop)` range of operator versions. A missing bound is
/// unbounded on that side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub start: Option<OperatorVersion>,
    pub stop: Option<OperatorVersion>,
}

impl VersionRange {
    /// Every version.
    pub const fn all() -> Self {
        Self {
            start: None,
            stop: None,
        }
    }

    /// `[start, ∞)`
    pub const fn from(start: OperatorVersion) -> Self {
        Self {
            start: Some(start),
            stop: None,
        }
    }

    /// `[start, stop)`
    pub const fn between(start: OperatorVersion, stop: OperatorVersion) -> Self {
        Self {
            start: Some(start),
            stop: Some(stop),
        }
    }

    pub fn contains(&self, version: OperatorVersion) -> bool {
        self.start.is_none_or(|start| version >= start)
            && self.stop.is_none_or(|stop| version < stop)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => write!(f, "[{start}, {stop})"),
            (Some(start), None) => write!(f, "[{start}, ∞)"),
            (None, Some(stop)) => write!(f, "(-∞, {stop})"),
            (None, None) => write!(f, "(-∞, ∞)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.2".parse::<OperatorVersion>().unwrap(), OperatorVersion::V1_2);
        assert_eq!("1.3.0".parse::<OperatorVersion>().unwrap(), OperatorVersion::V1_3);
        assert_eq!("v1.0".parse::<OperatorVersion>().unwrap(), OperatorVersion::V1_0);
        assert_eq!("2".parse::<OperatorVersion>().unwrap(), OperatorVersion::new(2, 0));
        assert_eq!(
            "1.4.0-rc1".parse::<OperatorVersion>().unwrap(),
            OperatorVersion::new(1, 4)
        );
        assert!("latest".parse::<OperatorVersion>().is_err());
    }

    #[test]
    fn test_current_version_matches_package() {
        assert_eq!(OperatorVersion::current(), OperatorVersion::V1_3);
    }

    #[test]
    fn test_range_is_half_open() {
        let range = VersionRange::between(OperatorVersion::V1_0, OperatorVersion::V1_2);
        assert!(range.contains(OperatorVersion::V1_0));
        assert!(range.contains(OperatorVersion::V1_1));
        assert!(!range.contains(OperatorVersion::V1_2));

        let open = VersionRange::from(OperatorVersion::V1_2);
        assert!(!open.contains(OperatorVersion::V1_1));
        assert!(open.contains(OperatorVersion::V1_2));
        assert!(open.contains(OperatorVersion::new(9, 0)));

        assert!(VersionRange::all().contains(OperatorVersion::new(0, 1)));
    }

    #[test]
    fn test_range_display() {
        assert_eq!(
            VersionRange::between(OperatorVersion::V1_0, OperatorVersion::V1_2).to_string(),
            "[1.0, 1.2)"
        );
        assert_eq!(VersionRange::from(OperatorVersion::V1_2).to_string(), "[1.2, ∞)");
    }
}
