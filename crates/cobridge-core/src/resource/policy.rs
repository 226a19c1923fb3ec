use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Resource policy bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Policy(u8);

impl Policy {
    pub const NONE: Self = Self(0);
    pub const DISCOVERABLE: Self = Self(0x01);
    pub const OBSERVABLE: Self = Self(0x02);
    /// Local-only flag: include the resource in cloud publication.
    pub const PUBLISH_TO_CLOUD: Self = Self(0x80);

    const WIRE_MASK: u8 = 0x7F;

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The `bm` value advertised in links.
    pub const fn wire_bits(self) -> u8 {
        self.0 & Self::WIRE_MASK
    }
}

impl BitOr for Policy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl BitOrAssign for Policy {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.with(rhs);
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::DISCOVERABLE) {
            names.push("DISCOVERABLE");
        }
        if self.contains(Self::OBSERVABLE) {
            names.push("OBSERVABLE");
        }
        if self.contains(Self::PUBLISH_TO_CLOUD) {
            names.push("PUBLISH_TO_CLOUD");
        }
        write!(f, "Policy({})", names.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bits_hide_local_flags() {
        let policy = Policy::DISCOVERABLE | Policy::OBSERVABLE | Policy::PUBLISH_TO_CLOUD;
        assert_eq!(policy.wire_bits(), 0x03);
        assert!(policy.contains(Policy::PUBLISH_TO_CLOUD));
        assert!(!policy.without(Policy::OBSERVABLE).contains(Policy::OBSERVABLE));
    }
}
