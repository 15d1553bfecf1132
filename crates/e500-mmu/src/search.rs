//! Associative lookup over the guest TLB.
//!
//! Lookups are linear, slot-ascending scans: the first matching slot wins, so
//! overlapping guest entries resolve the same way every time.

use crate::config::MissDefaults;
use crate::descriptor::{AddressSpace, Descriptor, SpaceMatch, PAGE_SHIFT};
use crate::store::{GuestTlbStore, TableId};

impl GuestTlbStore {
    /// Finds the slot translating `vaddr` for `pid` in `space`.
    ///
    /// TLB0 only looks in the set `vaddr` hashes to; TLB1 scans every slot.
    pub fn search(&self, table: TableId, vaddr: u64, pid: u32, space: SpaceMatch) -> Option<usize> {
        let range = match table {
            TableId::Tlb0 => {
                let base = self.tlb0_set_base(vaddr);
                base..base + self.tlb0_ways()
            }
            TableId::Tlb1 => 0..self.size(TableId::Tlb1),
        };
        let entries = self.entries(table);
        range.into_iter().find(|&slot| {
            let e = &entries[slot];
            e.valid && e.contains(vaddr) && e.matches_pid(pid) && space.matches(e.address_space)
        })
    }

    /// Searches TLB0, then TLB1.
    pub fn search_all(&self, vaddr: u64, pid: u32, space: SpaceMatch) -> Option<(TableId, usize)> {
        TableId::ALL
            .into_iter()
            .find_map(|table| self.search(table, vaddr, pid, space).map(|slot| (table, slot)))
    }
}

/// A guest search hit, as read back into the guest's MAS registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchHit {
    pub table: TableId,
    pub slot: usize,
    pub descriptor: Descriptor,
    /// Next replacement slot of `table` (MAS0[NV]).
    pub next_victim: usize,
}

/// Register values handed to the guest's software miss handler: where to put
/// the new entry and a partially filled entry to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissTemplate {
    pub table: TableId,
    pub slot: usize,
    pub next_victim: usize,
    pub descriptor: Descriptor,
}

impl MissTemplate {
    /// `valid` is set for reflected hardware misses and clear for failed
    /// explicit searches.
    pub(crate) fn build(
        defaults: &MissDefaults,
        slot: usize,
        next_victim: usize,
        vaddr: u64,
        pid: u32,
        space: SpaceMatch,
        valid: bool,
    ) -> Self {
        let address_space = match space {
            SpaceMatch::Exact(space) => space,
            SpaceMatch::Any => AddressSpace::As0,
        };
        let descriptor = Descriptor {
            valid,
            address_space,
            process_id: pid,
            size: defaults.size,
            epn: defaults.size.align_page(vaddr >> PAGE_SHIFT),
            attributes: defaults.attributes,
            ..Descriptor::default()
        };
        Self {
            table: defaults.table,
            slot,
            next_victim,
            descriptor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Hit(SearchHit),
    Miss(MissTemplate),
}
