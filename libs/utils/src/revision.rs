//! Revision numbers: the logical clock of a resource.
//!
//! A revision identifies one committed snapshot. Revisions are dense and
//! monotonic within a resource; revision 0 is the bootstrap (empty) snapshot.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub i64);

impl Revision {
    /// The bootstrap revision present in every resource.
    pub const BASE: Revision = Revision(0);

    /// Upper sentinel: greater than every real revision. Used as the
    /// "no active reader" watermark value.
    pub const MAX: Revision = Revision(i64::MAX);

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub fn checked_prev(self) -> Option<Revision> {
        if self.0 > 0 {
            Some(Revision(self.0 - 1))
        } else {
            None
        }
    }
}

impl Add<i64> for Revision {
    type Output = Revision;

    fn add(self, rhs: i64) -> Revision {
        Revision(self.0 + rhs)
    }
}

impl AddAssign<i64> for Revision {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl From<i64> for Revision {
    fn from(raw: i64) -> Self {
        Revision(raw)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed revision: '{0}'")]
pub struct ParseRevisionError(String);

impl FromStr for Revision {
    type Err = ParseRevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('r').unwrap_or(s);
        digits
            .parse::<i64>()
            .map(Revision)
            .map_err(|_| ParseRevisionError(s.to_owned()))
    }
}
