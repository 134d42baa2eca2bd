//! Readiness event bitmask.
//!
//! The integer delivered to a port is the bit pattern of an [`EventBits`]
//! value. Subscribers may only ask for [`EventBits::IN`] and
//! [`EventBits::OUT`]; the remaining bits are synthesized by the reactor.

use std::fmt;
use std::ops;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventBits(u32);

impl EventBits {
    pub const NONE: EventBits = EventBits(0);

    /// Data (or a pending connection) is available for reading.
    pub const IN: EventBits = EventBits(1 << 0);

    /// The descriptor is writable.
    pub const OUT: EventBits = EventBits(1 << 1);

    /// The kernel reported an error condition on the descriptor.
    pub const ERROR: EventBits = EventBits(1 << 2);

    /// The remote end closed the connection.
    pub const CLOSE: EventBits = EventBits(1 << 3);

    /// The descriptor was torn down in response to a close command.
    pub const DESTROYED: EventBits = EventBits(1 << 4);

    /// The subset a subscriber is allowed to request.
    pub const SUBSCRIBABLE: EventBits = EventBits(1 << 0 | 1 << 1);

    pub fn from_bits(bits: u32) -> EventBits {
        EventBits(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True iff every bit of `other` is set in `self`.
    pub fn contains(self, other: EventBits) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True iff `self` and `other` share at least one bit.
    pub fn intersects(self, other: EventBits) -> bool {
        (self.0 & other.0) != 0
    }
}

impl ops::BitOr for EventBits {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        EventBits(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventBits {
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for EventBits {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        EventBits(self.0 & other.0)
    }
}

impl fmt::Display for EventBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for (bit, name) in [
            (EventBits::IN, "IN"),
            (EventBits::OUT, "OUT"),
            (EventBits::ERROR, "ERROR"),
            (EventBits::CLOSE, "CLOSE"),
            (EventBits::DESTROYED, "DESTROYED"),
        ] {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        if self.is_empty() {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}
