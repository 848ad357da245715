use crate::PhysicalAddress;
use core::fmt;

/// An inclusive `[low, high]` physical byte range.
///
/// Ranges are reported once by firmware at boot and are read-only afterwards.
/// The inclusive upper bound lets a range end at the very top of the address
/// space without overflowing.
///
/// ### Invariants
/// - `low <= high`, so a range is never empty.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct AddressRange {
    low: PhysicalAddress,
    high: PhysicalAddress,
}

impl AddressRange {
    /// Build a range from inclusive bounds; `None` if `low > high`.
    #[inline]
    #[must_use]
    pub const fn new(low: PhysicalAddress, high: PhysicalAddress) -> Option<Self> {
        if low.as_u64() > high.as_u64() {
            return None;
        }
        Some(Self { low, high })
    }

    /// Build a range covering `len` bytes from `base`; `None` for an empty or
    /// overflowing range.
    #[inline]
    #[must_use]
    pub const fn from_base_len(base: PhysicalAddress, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        match base.as_u64().checked_add(len - 1) {
            Some(high) => Some(Self {
                low: base,
                high: PhysicalAddress::new(high),
            }),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn low(&self) -> PhysicalAddress {
        self.low
    }

    #[inline]
    #[must_use]
    pub const fn high(&self) -> PhysicalAddress {
        self.high
    }

    /// Number of bytes covered. Saturates for the full 64-bit space.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        (self.high.as_u64() - self.low.as_u64()).saturating_add(1)
    }

    /// A range is never empty; provided for API symmetry with [`len`](Self::len).
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.low.as_u64() && addr.as_u64() <= self.high.as_u64()
    }

    /// Whether `[addr, addr + bytes)` lies entirely inside this range.
    #[inline]
    #[must_use]
    pub const fn contains_span(&self, addr: PhysicalAddress, bytes: u64) -> bool {
        if bytes == 0 {
            return self.contains(addr);
        }
        match addr.as_u64().checked_add(bytes - 1) {
            Some(last) => self.contains(addr) && last <= self.high.as_u64(),
            None => false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.low.as_u64() <= other.high.as_u64() && other.low.as_u64() <= self.high.as_u64()
    }

    /// The overlapping part of two ranges, if any.
    #[inline]
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let low = self.low.max(other.low);
        let high = self.high.min(other.high);
        Self::new(low, high)
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.low, self.high)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: u64, high: u64) -> AddressRange {
        AddressRange::new(PhysicalAddress::new(low), PhysicalAddress::new(high)).unwrap()
    }

    #[test]
    fn inclusive_bounds() {
        let r = range(0x1000, 0x1FFF);
        assert_eq!(r.len(), 0x1000);
        assert!(r.contains(PhysicalAddress::new(0x1FFF)));
        assert!(!r.contains(PhysicalAddress::new(0x2000)));
        assert!(r.contains_span(PhysicalAddress::new(0x1800), 0x800));
        assert!(!r.contains_span(PhysicalAddress::new(0x1800), 0x801));
    }

    #[test]
    fn rejects_inverted_and_empty() {
        assert!(AddressRange::new(PhysicalAddress::new(2), PhysicalAddress::new(1)).is_none());
        assert!(AddressRange::from_base_len(PhysicalAddress::new(2), 0).is_none());
        assert!(AddressRange::from_base_len(PhysicalAddress::new(u64::MAX), 2).is_none());
    }

    #[test]
    fn overlap_and_intersection() {
        let a = range(0x0000, 0x3FFF);
        let b = range(0x2000, 0x5FFF);
        let c = range(0x4000, 0x4FFF);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersect(&b), Some(range(0x2000, 0x3FFF)));
        assert_eq!(a.intersect(&c), None);
    }
}
