//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! Classic and LE PSM validity rules and the allocator that hands out
//! dynamic PSMs to services registering without a fixed one.

/// First PSM value in the dynamic range
pub const DYNAMIC_PSM_START: u16 = 0x1001;

/// LE PSMs live in a separate, single-octet space
pub const LE_PSM_MAX: u16 = 0x00FF;

/// Classic PSMs are odd, and the least significant bit of the upper octet
/// must be zero.
pub fn is_valid_classic_psm(value: u16) -> bool {
    (value & 0x0001) == 0x0001 && (value & 0x0100) == 0
}

pub fn is_valid_le_psm(value: u16) -> bool {
    value != 0 && value <= LE_PSM_MAX
}

/// Hands out dynamic PSMs, skipping values already registered.
#[derive(Debug, Clone)]
pub struct DynamicPsmAllocator {
    next: u16,
}

impl Default for DynamicPsmAllocator {
    fn default() -> Self {
        Self {
            next: DYNAMIC_PSM_START,
        }
    }
}

impl DynamicPsmAllocator {
    /// Returns the next free dynamic PSM, or `None` once every candidate
    /// has been tried.
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let mut candidate = self.next;
        loop {
            let value = candidate;
            candidate = Self::advance(candidate);
            if !in_use(value) {
                self.next = candidate;
                return Some(value);
            }
            if candidate == self.next {
                return None;
            }
        }
    }

    fn advance(value: u16) -> u16 {
        let mut next = value.wrapping_add(2);
        if next < DYNAMIC_PSM_START {
            next = DYNAMIC_PSM_START;
        }
        // Skip values with bit 8 set, they are not legal PSMs.
        if next & 0x0100 != 0 {
            next = (next & 0xFF00).wrapping_add(0x0101);
            if next < DYNAMIC_PSM_START {
                next = DYNAMIC_PSM_START;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psm_validity() {
        assert!(is_valid_classic_psm(0x0001));
        assert!(is_valid_classic_psm(0x1001));
        assert!(!is_valid_classic_psm(0x0002));
        assert!(!is_valid_classic_psm(0x0101));
        assert!(is_valid_le_psm(0x0080));
        assert!(!is_valid_le_psm(0x0100));
        assert!(!is_valid_le_psm(0));
    }

    #[test]
    fn test_dynamic_allocation_skips_in_use() {
        let mut alloc = DynamicPsmAllocator::default();
        assert_eq!(alloc.allocate(|_| false), Some(0x1001));
        assert_eq!(alloc.allocate(|v| v == 0x1003), Some(0x1005));
        assert_eq!(alloc.allocate(|_| true), None);
    }

    #[test]
    fn test_dynamic_allocation_skips_illegal_values() {
        let mut alloc = DynamicPsmAllocator { next: 0x10FF };
        assert_eq!(alloc.allocate(|_| false), Some(0x10FF));
        assert_eq!(alloc.allocate(|_| false), Some(0x1201));
    }
}
