use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use bytes::Bytes;

/// Classifies the granularity of a [`Message`] payload.
///
/// Levels are bits and can be combined: a consumer declares the set of levels it accepts, and a
/// message is accepted iff its level is a subset of that set (`message | consumer == consumer`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Level(u8);

impl Level {
    /// No level at all. Accepted by every consumer, matches nothing.
    pub const NONE: Self = Self(0);
    /// A raw captured link-layer frame.
    pub const PACKET: Self = Self(1);
    /// Reassembled TCP payload bytes.
    pub const TCP: Self = Self(2);
    /// Socket-level data.
    pub const SOCKET: Self = Self(4);
    /// A complete, decoded HTTP request.
    pub const HTTP: Self = Self(8);
    /// Every known level.
    pub const ALL: Self = Self(1 | 2 | 4 | 8);

    const NAMES: [(Self, &'static str); 4] =
        [(Self::PACKET, "packet"), (Self::TCP, "tcp"), (Self::SOCKET, "socket"), (Self::HTTP, "http")];

    /// Builds a level from raw bits. Returns `None` if unknown bits are set.
    #[inline]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if every bit of `self` is also set in `mask`.
    #[inline]
    pub const fn is_subset_of(self, mask: Self) -> bool {
        self.0 | mask.0 == mask.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        other.is_subset_of(self)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Level {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Level {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }

        let mut first = true;
        for (level, name) in Self::NAMES {
            if self.contains(level) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Level({self})")
    }
}

/// The unit of transport between input and output adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The granularity of the payload.
    level: Level,
    /// The payload bytes.
    raw: Bytes,
    /// When the message was produced, in UNIX nanoseconds.
    timestamp_nanos: u64,
}

impl Message {
    /// Creates a new message stamped with the current time.
    #[inline]
    pub fn new(level: Level, raw: impl Into<Bytes>) -> Self {
        Self::with_timestamp(level, raw, replay_common::unix_nanos())
    }

    #[inline]
    pub fn with_timestamp(level: Level, raw: impl Into<Bytes>, timestamp_nanos: u64) -> Self {
        Self { level, raw: raw.into(), timestamp_nanos }
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    #[inline]
    pub fn into_raw(self) -> Bytes {
        self.raw
    }

    #[inline]
    pub fn timestamp_nanos(&self) -> u64 {
        self.timestamp_nanos
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
