//! # botplane-id
//!
//! Typed resource IDs for the botplane hosting platform.
//!
//! Every hosted resource is identified by a prefixed ULID, e.g.
//! `bot_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix makes IDs self-describing
//! in logs and the database, the ULID keeps them time-ordered and unique,
//! and the newtype wrappers keep a `BotId` from ever being passed where an
//! `OwnerId` is expected.

use thiserror::Error;

/// Re-export ulid for consumers that need raw ULID operations.
pub use ulid::Ulid;

/// Errors from parsing an ID string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input was empty.
    #[error("ID cannot be empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The prefix does not match the resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The portion after the prefix is not a valid ULID.
    #[error("invalid ULID: {0}")]
    BadUlid(String),
}

macro_rules! resource_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Ulid);

        impl $name {
            /// The prefix carried by every ID of this type.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses `{prefix}_{ulid}`, rejecting other resource types.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                if s.is_empty() {
                    return Err(IdError::Empty);
                }
                let Some((prefix, rest)) = s.split_once('_') else {
                    return Err(IdError::MissingSeparator);
                };
                if prefix != Self::PREFIX {
                    return Err(IdError::WrongPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                let ulid = rest
                    .parse::<Ulid>()
                    .map_err(|e| IdError::BadUlid(e.to_string()))?;
                Ok(Self(ulid))
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

resource_id!(
    /// A hosted bot.
    BotId,
    "bot"
);

resource_id!(
    /// The account that owns one or more bots.
    OwnerId,
    "own"
);

resource_id!(
    /// One boot of an execution unit; fresh for every launch.
    UnitId,
    "unit"
);
