//! Process-wide identifiers for databases and the resources inside them.
//!
//! Both ids are allocated once at database creation time and persisted in the
//! database descriptor. On disk, page references carry only their file offset;
//! the ids are re-attached during deserialization from the reader's context.
//! Keeping them as distinct newtypes prevents the classic bug of passing a
//! database id where a resource id is expected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! u64_newtype_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>()
                    .map($name)
                    .map_err(|_| IdError::Malformed(s.to_owned()))
            }
        }
    };
}

u64_newtype_id!(DatabaseId);
u64_newtype_id!(ResourceId);

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("malformed id: '{0}'")]
    Malformed(String),
}
