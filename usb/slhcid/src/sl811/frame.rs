use std::fmt;

use serde::{Deserialize, Serialize};

/// Software USB frame counter. It wraps, so frames are only ever compared relative to each
/// other, never by absolute value.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Frame(pub u32);

impl Frame {
    pub const fn next(self) -> Self {
        Frame(self.0.wrapping_add(1))
    }

    pub const fn after(self, frames: u32) -> Self {
        Frame(self.0.wrapping_add(frames))
    }

    /// Signed distance from `other` to `self`.
    pub const fn since(self, other: Frame) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub const fn is_after(self, other: Frame) -> bool {
        self.since(other) > 0
    }

    /// True once `self` is no longer in the future of `now`.
    pub const fn is_due(self, now: Frame) -> bool {
        now.since(self) >= 0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comparisons_survive_wrap() {
        let before = Frame(u32::MAX - 1);
        let after = before.after(4);
        assert_eq!(after, Frame(2));
        assert!(after.is_after(before));
        assert!(!before.is_after(after));
        assert!(before.is_due(after));
        assert!(!after.is_due(before));
        assert!(after.is_due(after));
    }
}
