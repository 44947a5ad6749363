//! Document version identifiers (`major.minor.patch`).
//!
//! New documents start at `1.0.0`; each accepted update bumps the minor
//! component by the configured step. `0.0.0` marks a soft-deleted record.

use crate::core::error::KeelsonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const INITIAL: Version = Version::new(1, 0, 0);
    pub const SOFT_DELETED: Version = Version::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn bump_minor(self, step: u32) -> Self {
        Self::new(self.major, self.minor.saturating_add(step.max(1)), 0)
    }

    /// First version of a re-created document.
    pub fn next_incarnation(self) -> Self {
        Self::new(self.major.saturating_add(1), 0, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = KeelsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let parse = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| KeelsonError::invalid(format!("invalid version '{}'", s)))
        };
        match parts[..] {
            [major, minor] => Ok(Self::new(parse(major)?, parse(minor)?, 0)),
            [major, minor, patch] => Ok(Self::new(parse(major)?, parse(minor)?, parse(patch)?)),
            _ => Err(KeelsonError::invalid(format!("invalid version '{}'", s))),
        }
    }
}

impl TryFrom<String> for Version {
    type Error = KeelsonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}
