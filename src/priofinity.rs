// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Packed (priority, affinity) value carried on every process and batch.

use core::fmt;

/// Highest priority number representable (5 bits, 0 = highest priority).
pub const MAX_PRIORITY: u8 = 31;

mycelium_bitfield::bitfield! {
    /// A 64-bit packed `(priority, affinity-mask)` value.
    ///
    /// ```text
    /// | 63                        5 | 4        0 |
    /// | affinity mask (59 bits)     | priority   |
    /// ```
    ///
    /// Priority `0` is highest; affinity bit `i` set means "may run on
    /// scheduler `i`"; an all-zero affinity mask means "any scheduler".
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    pub struct Priofinity<u64> {
        /// Priority level, `0` (highest) ..= `31` (lowest).
        pub const PRIORITY = 5;
        /// Affinity mask over scheduler indices `0..59`.
        pub const AFFINITY = 59;
    }
}

impl Priofinity<u64> {
    #[must_use]
    pub fn new(priority: u8, affinity: u64) -> Self {
        assert!(priority <= MAX_PRIORITY, "priority out of range");
        Self::new_unchecked(priority, affinity)
    }

    fn new_unchecked(priority: u8, affinity: u64) -> Self {
        Self(0)
            .with(Self::PRIORITY, u64::from(priority))
            .with(Self::AFFINITY, affinity)
    }

    /// Any-scheduler priofinity at the given priority.
    #[must_use]
    pub fn any(priority: u8) -> Self {
        Self::new(priority, 0)
    }

    #[must_use]
    pub fn priority(self) -> u8 {
        // PRIORITY is 5 bits, fits in u8 by construction.
        u8::try_from(self.get(Self::PRIORITY)).expect("priority field exceeds 5 bits")
    }

    #[must_use]
    pub fn affinity(self) -> u64 {
        self.get(Self::AFFINITY)
    }

    /// `true` when this priofinity may run on any scheduler.
    #[must_use]
    pub fn is_any_affinity(self) -> bool {
        self.affinity() == 0
    }

    /// `true` when `scheduler_idx` is a member of the affinity mask (or the
    /// mask is the "any" wildcard).
    #[must_use]
    pub fn allows_scheduler(self, scheduler_idx: u32) -> bool {
        if self.is_any_affinity() {
            return true;
        }
        scheduler_idx < 59 && self.affinity() & (1 << scheduler_idx) != 0
    }

    #[must_use]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Priofinity<u64> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "priofinity(pri={}, affinity={:#x})",
            self.priority(),
            self.affinity()
        )
    }
}

impl Default for Priofinity<u64> {
    fn default() -> Self {
        Self::any(MAX_PRIORITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let pf = Priofinity::new(3, 0b1010);
        assert_eq!(pf.priority(), 3);
        assert_eq!(pf.affinity(), 0b1010);
        assert!(!pf.is_any_affinity());
        assert!(pf.allows_scheduler(1));
        assert!(pf.allows_scheduler(3));
        assert!(!pf.allows_scheduler(0));
    }

    #[test]
    fn any_affinity_allows_every_scheduler() {
        let pf = Priofinity::any(0);
        assert!(pf.is_any_affinity());
        for i in 0..59 {
            assert!(pf.allows_scheduler(i));
        }
    }

    #[test]
    #[should_panic(expected = "priority out of range")]
    fn priority_range_checked() {
        Priofinity::new(32, 0);
    }
}
