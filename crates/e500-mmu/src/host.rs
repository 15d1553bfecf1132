//! The real hardware TLB and the slot translation used to load it.

use crate::descriptor::Descriptor;
use crate::store::TableId;

/// A hardware TLB location (MAS0[TLBSEL, ESEL]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwSlot {
    pub table: TableId,
    pub index: usize,
}

/// The host's hardware TLB.
pub trait HostTlb {
    /// TLB1 entries implemented by the core (TLB1CFG[NENTRY]). Read once when
    /// the engine is built.
    fn tlb1_capacity(&self) -> usize;

    /// Loads `entry` into `slot`.
    ///
    /// Implementations must run the whole register sequence (MAS writes plus
    /// `tlbwe`) with local interrupts and preemption disabled; a half-written
    /// entry is visible to instruction fetch on the same core.
    fn write_entry(&mut self, slot: HwSlot, entry: &Descriptor);

    /// Drops every translation held by the hardware, including ones this crate
    /// did not install.
    fn invalidate_all(&mut self);
}

impl<T: HostTlb + ?Sized> HostTlb for &mut T {
    #[inline]
    fn tlb1_capacity(&self) -> usize {
        <T as HostTlb>::tlb1_capacity(&**self)
    }

    #[inline]
    fn write_entry(&mut self, slot: HwSlot, entry: &Descriptor) {
        <T as HostTlb>::write_entry(&mut **self, slot, entry)
    }

    #[inline]
    fn invalidate_all(&mut self) {
        <T as HostTlb>::invalidate_all(&mut **self)
    }
}

/// Maps shadow coordinates onto hardware slots.
///
/// TLB0 is loaded at the same index. Shadow TLB1 slot `s` lands at
/// `host_reserved_low + s`, and protected slot `k` at the top of the table,
/// `capacity - reserved_tail + k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostTlbWriter {
    tlb1_base: usize,
    protected_base: usize,
}

impl HostTlbWriter {
    pub(crate) fn new(host_reserved_low: usize, host_tlb1_capacity: usize, reserved_tail: usize) -> Self {
        debug_assert!(host_tlb1_capacity >= host_reserved_low + reserved_tail);
        Self {
            tlb1_base: host_reserved_low,
            protected_base: host_tlb1_capacity - reserved_tail,
        }
    }

    #[inline]
    pub(crate) fn hw_slot(&self, table: TableId, slot: usize) -> HwSlot {
        let index = match table {
            TableId::Tlb0 => slot,
            TableId::Tlb1 => self.tlb1_base + slot,
        };
        HwSlot { table, index }
    }

    #[inline]
    pub(crate) fn protected_hw_slot(&self, index: usize) -> HwSlot {
        HwSlot {
            table: TableId::Tlb1,
            index: self.protected_base + index,
        }
    }

    pub(crate) fn commit<H: HostTlb>(&self, host: &mut H, table: TableId, slot: usize, entry: &Descriptor) {
        let hw = self.hw_slot(table, slot);
        tracing::trace!(
            ?table,
            slot,
            hw_index = hw.index,
            valid = entry.valid,
            epn = entry.epn,
            rpn = entry.rpn,
            "commit shadow entry"
        );
        host.write_entry(hw, entry);
    }

    pub(crate) fn commit_protected<H: HostTlb>(&self, host: &mut H, index: usize, entry: &Descriptor) {
        let hw = self.protected_hw_slot(index);
        tracing::trace!(index, hw_index = hw.index, valid = entry.valid, "commit protected entry");
        host.write_entry(hw, entry);
    }
}
