//! Available-capacity tracking for one resource class

/// Item and size limits for one resource class. `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapacityLimits {
    pub items: u64,
    pub size: u64,
}

impl CapacityLimits {
    pub const UNLIMITED: CapacityLimits = CapacityLimits {
        items: u64::MAX,
        size: u64::MAX,
    };

    pub fn new(items: u64, size: u64) -> Self {
        Self { items, size }
    }
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

/// Snapshot of one capacity counter for statistics reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct CapacityUsage {
    pub items: u64,
    pub size: u64,
    pub item_limit: u64,
    pub size_limit: u64,
}

/// Used/limit counter for one resource class (items and bytes).
///
/// Every mutation brackets a chunk state change: subtract the old costs,
/// mutate the chunk, add the new costs. Limits may shrink at runtime, so
/// `current > limit` is a legal transient that the next scheduler tick
/// resolves by evicting.
#[derive(Debug)]
pub struct AvailableCapacity {
    items: u64,
    size: u64,
    item_limit: u64,
    size_limit: u64,
}

impl AvailableCapacity {
    pub fn new(limits: CapacityLimits) -> Self {
        Self {
            items: 0,
            size: 0,
            item_limit: limits.items,
            size_limit: limits.size,
        }
    }

    /// Apply a signed usage delta.
    pub fn adjust(&mut self, items: i64, size: i64) {
        self.items = add_signed(self.items, items);
        self.size = add_signed(self.size, size);
    }

    pub fn available_items(&self) -> u64 {
        self.item_limit.saturating_sub(self.items)
    }

    pub fn available_size(&self) -> u64 {
        self.size_limit.saturating_sub(self.size)
    }

    /// Whether current usage exceeds either limit.
    pub fn over_committed(&self) -> bool {
        self.items > self.item_limit || self.size > self.size_limit
    }

    pub fn set_limits(&mut self, limits: CapacityLimits) {
        self.item_limit = limits.items;
        self.size_limit = limits.size;
    }

    pub fn usage(&self) -> CapacityUsage {
        CapacityUsage {
            items: self.items,
            size: self.size,
            item_limit: self.item_limit,
            size_limit: self.size_limit,
        }
    }
}

fn add_signed(current: u64, delta: i64) -> u64 {
    debug_assert!(
        delta >= 0 || current >= delta.unsigned_abs(),
        "capacity counter underflow"
    );
    current.checked_add_signed(delta).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_and_available() {
        let mut cap = AvailableCapacity::new(CapacityLimits::new(4, 400));
        assert_eq!(cap.available_items(), 4);
        assert_eq!(cap.available_size(), 400);

        cap.adjust(1, 50);
        cap.adjust(1, 80);
        assert_eq!(cap.available_items(), 2);
        assert_eq!(cap.available_size(), 270);

        cap.adjust(-1, -50);
        assert_eq!(cap.available_items(), 3);
        assert_eq!(cap.available_size(), 320);
    }

    #[test]
    fn test_shrunk_limit_reads_as_exhausted() {
        let mut cap = AvailableCapacity::new(CapacityLimits::new(4, 400));
        cap.adjust(3, 300);
        cap.set_limits(CapacityLimits::new(2, 100));
        assert!(cap.over_committed());
        assert_eq!(cap.available_items(), 0);
        assert_eq!(cap.available_size(), 0);
    }

    #[test]
    fn test_unlimited_default() {
        let cap = AvailableCapacity::new(CapacityLimits::default());
        assert_eq!(cap.available_items(), u64::MAX);
        assert!(!cap.over_committed());
    }
}
