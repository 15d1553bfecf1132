//! Round-robin victim selection for guest TLB writes (MAS0\[NV\]).

/// Round-robin replacement pointer.
///
/// Advances on every selection regardless of hit/miss history, like the
/// hardware's own next-victim register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimSelector {
    next: usize,
    limit: usize,
}

impl VictimSelector {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "victim selector needs at least one slot");
        Self { next: 0, limit }
    }

    /// Returns the current victim and advances.
    #[inline]
    pub fn next_victim(&mut self) -> usize {
        let victim = self.next;
        self.next += 1;
        if self.next >= self.limit {
            self.next = 0;
        }
        victim
    }

    /// The victim the next call to [`VictimSelector::next_victim`] will return.
    #[inline]
    pub fn peek(&self) -> usize {
        self.next
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
}
