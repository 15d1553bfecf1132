//! Removal of guest and shadow entries.
//!
//! None of these fail: missing, invalid and protected entries are skipped.
//! Dropping a live shadow writes its hardware slot invalid before the pin goes
//! back to the memory map. Translations the core may still cache elsewhere are
//! discarded by [`ShadowMmu::global_flush`], which callers issue once per batch.

use crate::descriptor::{Descriptor, SpaceMatch};
use crate::host::HostTlb;
use crate::memory::GuestMemoryMap;
use crate::store::TableId;
use crate::ShadowMmu;

/// A guest invalidation, as decoded by the instruction dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateRequest {
    /// One explicit slot.
    Entry { table: TableId, slot: usize },
    /// Every entry of one table (MMUCSR0 flash invalidate, `tlbivax` with IA).
    All(TableId),
    /// The entry translating `address` for the current pid (`tlbivax`).
    Address { table: TableId, address: u64 },
    /// TLB1 entries overlapping `[low, high]` for `pid`.
    Range { low: u64, high: u64, pid: u32 },
    /// Entries tagged with `pid` in both tables (`tlbilx` T=1).
    Pid(u32),
}

impl<M: GuestMemoryMap, H: HostTlb> ShadowMmu<M, H> {
    /// Dispatches a guest invalidation and flushes the hardware.
    pub fn on_guest_invalidate(&mut self, request: InvalidateRequest) {
        match request {
            InvalidateRequest::Entry { table, slot } => {
                self.invalidate_entry(table, slot);
            }
            InvalidateRequest::All(table) => {
                self.invalidate_all(table);
            }
            InvalidateRequest::Address { table, address } => {
                self.invalidate_address(table, address, self.pid, SpaceMatch::Any);
            }
            InvalidateRequest::Range { low, high, pid } => {
                self.invalidate_range(low, high, pid);
            }
            InvalidateRequest::Pid(pid) => {
                self.invalidate_pid(pid);
            }
        }
        self.global_flush();
    }

    /// Invalidates one guest entry and its shadow, clearing the shadow's
    /// hardware slot. Call [`ShadowMmu::global_flush`] after a batch.
    ///
    /// A protected (IPROT) guest entry is left alone. Out-of-range and already
    /// invalid slots are ignored. Returns whether anything was cleared.
    pub fn invalidate_entry(&mut self, table: TableId, slot: usize) -> bool {
        if slot >= self.guest.size(table) {
            return false;
        }
        let guest = self.guest.entry_mut(table, slot);
        if guest.protected {
            tracing::trace!(%table, slot, "skip protected guest entry");
            return false;
        }
        let was_valid = guest.valid;
        guest.valid = false;

        let had_shadow = self.drop_shadow(table, slot);
        if was_valid || had_shadow {
            self.flush_pending = true;
            #[cfg(feature = "stats")]
            {
                self.stats.invalidations = self.stats.invalidations.wrapping_add(1);
            }
        }
        was_valid || had_shadow
    }

    /// Invalidates every TLB1 entry overlapping `[low, high]` whose pid is the
    /// wildcard or equals `pid`. Returns the number of entries removed.
    pub fn invalidate_range(&mut self, low: u64, high: u64, pid: u32) -> usize {
        let table = TableId::Tlb1;
        let mut removed = 0;
        for slot in 0..self.guest.size(table) {
            let entry = self.guest.entry(table, slot);
            if !entry.valid || !entry.intersects(low, high) || !entry.matches_pid(pid) {
                continue;
            }
            if self.invalidate_entry(table, slot) {
                removed += 1;
            }
        }
        tracing::debug!(low, high, pid, removed, "invalidate TLB1 range");
        removed
    }

    /// Invalidates every non-protected entry of `table`.
    pub fn invalidate_all(&mut self, table: TableId) -> usize {
        let removed = (0..self.guest.size(table))
            .filter(|&slot| self.invalidate_entry(table, slot))
            .count();
        tracing::debug!(%table, removed, "invalidate all");
        removed
    }

    /// Invalidates entries tagged with exactly `pid` in both tables. Wildcard
    /// entries are kept.
    pub fn invalidate_pid(&mut self, pid: u32) -> usize {
        let mut removed = 0;
        for table in TableId::ALL {
            for slot in 0..self.guest.size(table) {
                let entry = self.guest.entry(table, slot);
                if entry.valid && entry.process_id == pid && self.invalidate_entry(table, slot) {
                    removed += 1;
                }
            }
        }
        tracing::debug!(pid, removed, "invalidate pid");
        removed
    }

    /// Invalidates the first entry of `table` translating `address`.
    pub fn invalidate_address(&mut self, table: TableId, address: u64, pid: u32, space: SpaceMatch) -> bool {
        match self.guest.search(table, address, pid, space) {
            Some(slot) => self.invalidate_entry(table, slot),
            None => false,
        }
    }

    /// Discards every hardware translation, then reloads the protected
    /// entries so they stay resident.
    pub fn global_flush(&mut self) {
        self.host.invalidate_all();
        for (index, entry) in self.shadow.protected_entries() {
            self.writer.commit_protected(&mut self.host, index, entry);
        }
        self.flush_pending = false;
        tracing::trace!("global TLB flush");
        #[cfg(feature = "stats")]
        {
            self.stats.global_flushes = self.stats.global_flushes.wrapping_add(1);
        }
    }

    /// Drops every TLB1 shadow after a guest privilege change. Shadow
    /// permissions depend on the privilege level they were built for; guest
    /// entries are untouched and get reshadowed on the next miss. Protected
    /// mappings live outside the guest-indexed slots and are not visited.
    pub fn privilege_switch_sweep(&mut self) {
        let table = TableId::Tlb1;
        let dropped = (0..self.guest.size(table))
            .filter(|&slot| self.drop_shadow(table, slot))
            .count();
        tracing::debug!(dropped, user_mode = self.user_mode, "privilege switch sweep");
        #[cfg(feature = "stats")]
        {
            self.stats.privilege_sweeps = self.stats.privilege_sweeps.wrapping_add(1);
        }
        self.global_flush();
    }

    /// Drops every shadow whose pinned frames overlap host frames
    /// `[pfn_low, pfn_high]`, so the host can reclaim them, then flushes.
    /// Guest entries stay valid. Returns the number of shadows dropped.
    pub fn on_host_reclaim(&mut self, pfn_low: u64, pfn_high: u64) -> usize {
        let mut dropped = 0;
        for table in TableId::ALL {
            for slot in 0..self.guest.size(table) {
                let hit = self
                    .shadow
                    .pin(table, slot)
                    .is_some_and(|pin| pin.overlaps(pfn_low, pfn_high));
                if hit && self.drop_shadow(table, slot) {
                    dropped += 1;
                }
            }
        }
        tracing::debug!(pfn_low, pfn_high, dropped, "host reclaim");
        self.global_flush();
        dropped
    }

    /// Drops TLB1 shadows overlapping `[low, high]` for `pid`, leaving guest
    /// entries alone. Used before a valid TLB1 slot is overwritten.
    pub(crate) fn drop_shadows_in_range(&mut self, low: u64, high: u64, pid: u32) -> usize {
        let table = TableId::Tlb1;
        let mut dropped = 0;
        for slot in 0..self.guest.size(table) {
            let shadow = self.shadow.entry(table, slot);
            let guest = self.guest.entry(table, slot);
            if !shadow.valid || !shadow.intersects(low, high) || !guest.matches_pid(pid) {
                continue;
            }
            if self.drop_shadow(table, slot) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Clears one shadow slot and returns its pin to the memory map. A live
    /// slot is written invalid in hardware before the pin is released.
    pub(crate) fn drop_shadow(&mut self, table: TableId, slot: usize) -> bool {
        let was_live = self.shadow.is_live(table, slot);
        let released = self.shadow.clear(table, slot);
        if was_live {
            self.sync_invalid_shadow(table, slot);
            self.flush_pending = true;
        }
        if let Some(released) = released {
            self.memory.release(released.pin, released.dirty);
        }
        was_live
    }

    fn sync_invalid_shadow(&mut self, table: TableId, slot: usize) {
        let entry = Descriptor {
            valid: false,
            ..*self.shadow.entry(table, slot)
        };
        self.writer.commit(&mut self.host, table, slot, &entry);
    }
}
