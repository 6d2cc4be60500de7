//! Strongly-typed identifiers.
//!
//! String ids are validated at construction time (non-empty, no `/` since
//! they are joined into endpoint addresses) and compare case-insensitively,
//! so `P1` and `p1` name the same process.

use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Macro to define a strongly-typed, case-insensitive ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Eq/Hash ignoring
/// ASCII case, Serialize, Deserialize. Optionally generates `new()` (UUID v4)
/// and `Default` if the `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_string(s).map_err(de::Error::custom)
            }
        }

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                if s.contains('/') {
                    return Err(concat!(stringify!($name), " cannot contain '/'"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.eq_ignore_ascii_case(&other.0)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                for b in self.0.bytes() {
                    state.write_u8(b.to_ascii_lowercase());
                }
                state.write_u8(0xff);
            }
        }

        impl std::str::FromStr for $name {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_string(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ProcessId, uuid);
define_id!(EndpointId);
define_id!(SubscriptionId, uuid);

/// Id of the process at the top of every tree.
pub const ROOT_PROCESS_ID: &str = "root";

impl ProcessId {
    /// The well-known id of the root process.
    pub fn root() -> Self {
        Self(ROOT_PROCESS_ID.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0.eq_ignore_ascii_case(ROOT_PROCESS_ID)
    }
}

/// Per-channel call identifier.
///
/// Ids are handed out by a monotonic counter and live in the positive 63-bit
/// range. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Largest id a channel may issue. Crossing it is fatal for the channel.
    pub const MAX: u64 = i64::MAX as u64;

    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0 && raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one channel inside this process. Never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    /// Pseudo channel used for calls issued and served inside one process.
    pub const LOCAL: ChannelId = ChannelId(0);

    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}
