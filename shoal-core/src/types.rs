//! Strongly-typed identifiers for Shoal entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! Shard and worker identifiers are opaque strings assigned by the stream and
//! by the operator; the lease counter is a 64-bit fence.

use std::fmt;

/// Macro to generate strongly-typed string name wrappers.
///
/// Each name type wraps a `String` and provides:
/// - Type safety (can't pass a `WorkerId` where a `ShardId` is expected)
/// - Ordering by the raw string, used for deterministic tie-breaking
/// - Debug/Display formatting
macro_rules! define_name {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            ///
            /// # Panics
            /// Panics if the identifier is empty.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                let value = value.into();
                assert!(!value.is_empty(), concat!($prefix, " must be non-empty"));
                Self(value)
            }

            /// Creates an identifier from untrusted input, such as a shard
            /// listing.
            ///
            /// # Errors
            /// Returns `InvalidArgument` if the identifier is empty.
            pub fn try_new(value: impl Into<String>) -> crate::Result<Self> {
                let value = value.into();
                if value.is_empty() {
                    return Err(crate::Error::InvalidArgument {
                        name: $prefix,
                        reason: "must be non-empty",
                    });
                }
                Ok(Self(value))
            }

            /// Returns the raw identifier.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_name!(ShardId, "shard", "Stable identifier of a stream partition.");
define_name!(WorkerId, "worker", "Identifier of a worker instance in the fleet.");

/// Optimistic-concurrency fence for a lease row.
///
/// Incremented on every successful mutation of the lease. A write carrying a
/// stale counter is rejected by the lease table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LeaseCounter(u64);

impl LeaseCounter {
    /// Creates a counter from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the counter a successful mutation will carry.
    ///
    /// # Panics
    /// Panics if the counter would overflow.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX, "lease counter overflow");
        Self(self.0 + 1)
    }
}

impl fmt::Debug for LeaseCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter({})", self.0)
    }
}

impl fmt::Display for LeaseCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LeaseCounter {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}
