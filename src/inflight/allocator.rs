/// Session-scoped packet identifier counter.
///
/// Counts upward from 1, skips 0, wraps from `u16::MAX` back to 1, and skips
/// any id the caller reports as still in use.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Next free id, or `None` when every id is in use
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
