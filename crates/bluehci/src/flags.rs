//! Atomically testable flag sets
//!
//! Device, advertising set and periodic sync state are all `bitflags` types
//! stored in an [`AtomicFlags`] cell, so that the dispatch path and the
//! deferred work path can flip individual bits without a lock.

use bitflags::Flags;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// A `bitflags` value held in an atomic word
pub struct AtomicFlags<F> {
    bits: AtomicU32,
    _flags: PhantomData<F>,
}

impl<F> AtomicFlags<F>
where
    F: Flags<Bits = u32> + Copy,
{
    pub fn new(initial: F) -> Self {
        Self {
            bits: AtomicU32::new(initial.bits()),
            _flags: PhantomData,
        }
    }

    /// Snapshot of all flags
    pub fn load(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::SeqCst))
    }

    /// True if every flag in `flags` is set
    pub fn contains(&self, flags: F) -> bool {
        self.load().contains(flags)
    }

    /// True if any flag in `flags` is set
    pub fn intersects(&self, flags: F) -> bool {
        self.load().intersects(flags)
    }

    pub fn set(&self, flags: F) {
        self.bits.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self, flags: F) {
        self.bits.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn assign(&self, flags: F, value: bool) {
        if value {
            self.set(flags)
        } else {
            self.clear(flags)
        }
    }

    /// Set `flags`, returning whether all of them were already set
    pub fn test_and_set(&self, flags: F) -> bool {
        let prev = self.bits.fetch_or(flags.bits(), Ordering::SeqCst);
        prev & flags.bits() == flags.bits()
    }

    /// Clear `flags`, returning whether all of them were set
    pub fn test_and_clear(&self, flags: F) -> bool {
        let prev = self.bits.fetch_and(!flags.bits(), Ordering::SeqCst);
        prev & flags.bits() == flags.bits()
    }

    /// Set `set` and clear `clear` in one step, returning the previous flags
    pub fn update(&self, set: F, clear: F) -> F {
        let prev = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((bits | set.bits()) & !clear.bits())
            })
            .unwrap_or_else(|bits| bits);
        F::from_bits_retain(prev)
    }

    /// Clear everything except `keep`
    pub fn retain(&self, keep: F) {
        self.bits.fetch_and(keep.bits(), Ordering::SeqCst);
    }

    pub fn clear_all(&self) {
        self.bits.store(0, Ordering::SeqCst);
    }
}

impl<F> Default for AtomicFlags<F>
where
    F: Flags<Bits = u32> + Copy,
{
    fn default() -> Self {
        Self::new(F::empty())
    }
}

impl<F> fmt::Debug for AtomicFlags<F>
where
    F: Flags<Bits = u32> + Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicFlags").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitflags::bitflags;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct Bits: u32 {
            const A = 1 << 0;
            const B = 1 << 1;
            const C = 1 << 2;
        }
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let flags = AtomicFlags::new(Bits::empty());
        assert!(!flags.test_and_set(Bits::A));
        assert!(flags.test_and_set(Bits::A));
        assert!(flags.contains(Bits::A));

        assert!(flags.test_and_clear(Bits::A));
        assert!(!flags.test_and_clear(Bits::A));
        assert_eq!(flags.load(), Bits::empty());
    }

    #[test]
    fn test_retain_keeps_persistent_subset() {
        let flags = AtomicFlags::new(Bits::all());
        flags.retain(Bits::A | Bits::C);
        assert_eq!(flags.load(), Bits::A | Bits::C);

        flags.assign(Bits::B, true);
        assert!(flags.intersects(Bits::B));
        flags.assign(Bits::B, false);
        assert!(!flags.contains(Bits::B));
    }

    #[test]
    fn test_update_sets_and_clears_together() {
        let flags = AtomicFlags::new(Bits::B | Bits::C);
        let prev = flags.update(Bits::A, Bits::B);
        assert_eq!(prev, Bits::B | Bits::C);
        assert_eq!(flags.load(), Bits::A | Bits::C);
    }
}
