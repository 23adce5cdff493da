//! Protocol feature negotiation.
//!
//! Features are a 16-bit mask exchanged before a peer is built. A remote may
//! only require bits the local implementation supports; anything else makes
//! the connection unacceptable.

use std::fmt::{self, Display, Formatter};
use std::ops::{BitAnd, BitOr};

/// Bitmask of protocol features enabled on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u16);

impl Features {
    /// No optional features: text documents.
    pub const NONE: Features = Features(0);

    /// Documents travel in the compact binary form instead of JSON text.
    pub const RAW: Features = Features(0x0001);

    /// Wrap a raw bitmask as received from a remote peer.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Features this implementation understands.
    pub const fn supported() -> Self {
        Self::RAW
    }

    /// True if every bit of `other` is also set in `self`.
    pub const fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check whether a remote peer's required features can be honoured.
    ///
    /// Holds when no bit set in `peer_features` is missing locally:
    /// `(!peer | supported) == all ones`.
    pub fn accepts(peer_features: u16) -> bool {
        (!peer_features | Self::supported().0) == u16::MAX
    }

    /// `accepts` for a mask read off the wire as a wider integer.
    ///
    /// A value that does not fit in 16 bits requires bits nobody supports.
    pub fn accepts_wire(peer_features: u32) -> bool {
        u16::try_from(peer_features).is_ok_and(Self::accepts)
    }

    /// Bits required by the remote that are not supported locally.
    pub fn unsupported_bits(peer_features: u16) -> u16 {
        peer_features & !Self::supported().0
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitAnd for Features {
    type Output = Features;

    fn bitand(self, rhs: Features) -> Features {
        Features(self.0 & rhs.0)
    }
}

impl Display for Features {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut names = Vec::new();
        if self.contains(Self::RAW) {
            names.push("Raw".to_string());
        }
        let unknown = self.0 & !Self::RAW.0;
        if unknown != 0 {
            names.push(format!("{unknown:#06x}"));
        }
        write!(f, "{}", names.join("|"))
    }
}
