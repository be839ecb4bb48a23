//! Stream positions and checkpoints.
//!
//! Sequence numbers are decimal strings assigned by the stream. They routinely
//! exceed the width of native integers, so they are compared numerically on
//! their digits rather than parsed.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

// -----------------------------------------------------------------------------
// Sequence Number
// -----------------------------------------------------------------------------

/// Arbitrary-precision sequence number of a stream record.
///
/// Equality and ordering are numeric: `"0042"` equals `"42"`.
#[derive(Clone)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    /// Parses a sequence number from its decimal representation.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the value is empty or contains non-digits.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::InvalidArgument {
                name: "sequence_number",
                reason: "must be non-empty",
            });
        }
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidArgument {
                name: "sequence_number",
                reason: "must contain only decimal digits",
            });
        }
        Ok(Self(value))
    }

    /// Creates a sequence number from a native integer.
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_string())
    }

    /// Returns the raw decimal representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits without leading zeros; `"0"` stays `"0"`.
    fn significant_digits(&self) -> &str {
        let trimmed = self.0.trim_start_matches('0');
        if trimmed.is_empty() {
            "0"
        } else {
            trimmed
        }
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.significant_digits() == other.significant_digits()
    }
}

impl Eq for SequenceNumber {}

impl Hash for SequenceNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_digits().hash(state);
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.significant_digits();
        let b = other.significant_digits();
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for SequenceNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq({})", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -----------------------------------------------------------------------------
// Extended Sequence Number
// -----------------------------------------------------------------------------

/// Position of a logical record: sequence number plus sub-sequence number.
///
/// The sub-sequence number distinguishes the logical records that a single
/// aggregated stream record expands into. Ordering is by sequence number,
/// then by sub-sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedSequenceNumber {
    /// Sequence number assigned by the stream.
    pub sequence_number: SequenceNumber,
    /// Index of the logical record within an aggregated record.
    pub sub_sequence_number: u64,
}

impl ExtendedSequenceNumber {
    /// Creates a position for a non-aggregated record.
    #[must_use]
    pub const fn new(sequence_number: SequenceNumber) -> Self {
        Self {
            sequence_number,
            sub_sequence_number: 0,
        }
    }

    /// Creates a position for a logical record inside an aggregated record.
    #[must_use]
    pub const fn with_sub_sequence(sequence_number: SequenceNumber, sub_sequence_number: u64) -> Self {
        Self {
            sequence_number,
            sub_sequence_number,
        }
    }
}

impl fmt::Display for ExtendedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sequence_number, self.sub_sequence_number)
    }
}

// -----------------------------------------------------------------------------
// Checkpoint
// -----------------------------------------------------------------------------

/// Durable progress marker stored in a lease.
///
/// Total order: `TrimHorizon < Sequence(_) < ShardEnd`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Checkpoint {
    /// Start of the shard; nothing processed yet.
    TrimHorizon,
    /// Everything up to and including this position has been processed.
    Sequence(ExtendedSequenceNumber),
    /// The shard has been fully drained. Terminal.
    ShardEnd,
}

impl Checkpoint {
    /// Returns true for the terminal `ShardEnd` sentinel.
    #[must_use]
    pub const fn is_shard_end(&self) -> bool {
        matches!(self, Self::ShardEnd)
    }

    /// Returns the position if this is a sequence checkpoint.
    #[must_use]
    pub const fn sequence(&self) -> Option<&ExtendedSequenceNumber> {
        match self {
            Self::Sequence(position) => Some(position),
            Self::TrimHorizon | Self::ShardEnd => None,
        }
    }
}

impl From<ExtendedSequenceNumber> for Checkpoint {
    fn from(position: ExtendedSequenceNumber) -> Self {
        Self::Sequence(position)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrimHorizon => f.write_str("TRIM_HORIZON"),
            Self::Sequence(position) => write!(f, "{position}"),
            Self::ShardEnd => f.write_str("SHARD_END"),
        }
    }
}

// -----------------------------------------------------------------------------
// Initial Position
// -----------------------------------------------------------------------------

/// Where to start a shard that has never been checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Start from the oldest available record.
    #[default]
    TrimHorizon,
    /// Start after the newest record at the time of the first read.
    Latest,
}
