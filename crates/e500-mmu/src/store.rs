//! Guest and shadow TLB arrays.

use core::fmt;

use crate::descriptor::{Descriptor, SizeClass, PAGE_SHIFT};
use crate::error::{Result, TlbError};
use crate::memory::FramePin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableId {
    Tlb0,
    Tlb1,
}

impl TableId {
    pub const ALL: [TableId; 2] = [TableId::Tlb0, TableId::Tlb1];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            TableId::Tlb0 => 0,
            TableId::Tlb1 => 1,
        }
    }

    /// Decodes MAS0[TLBSEL].
    pub const fn from_tlbsel(tlbsel: u8) -> Option<Self> {
        match tlbsel {
            0 => Some(TableId::Tlb0),
            1 => Some(TableId::Tlb1),
            _ => None,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableId::Tlb0 => f.write_str("TLB0"),
            TableId::Tlb1 => f.write_str("TLB1"),
        }
    }
}

/// What the guest believes its TLB holds.
///
/// TLB0 is set associative: slot = `set * ways + way`, with the set taken from
/// the effective address. TLB1 is fully associative.
#[derive(Debug, Clone)]
pub struct GuestTlbStore {
    tables: [Vec<Descriptor>; 2],
    tlb0_sets: usize,
    tlb0_ways: usize,
}

impl GuestTlbStore {
    pub fn new(tlb0_sets: usize, tlb0_ways: usize, tlb1_entries: usize) -> Self {
        debug_assert!(tlb0_sets.is_power_of_two());
        Self {
            tables: [
                vec![Descriptor::default(); tlb0_sets * tlb0_ways],
                vec![Descriptor::default(); tlb1_entries],
            ],
            tlb0_sets,
            tlb0_ways,
        }
    }

    #[inline]
    pub fn size(&self, table: TableId) -> usize {
        self.tables[table.index()].len()
    }

    #[inline]
    pub fn tlb0_ways(&self) -> usize {
        self.tlb0_ways
    }

    pub fn read(&self, table: TableId, slot: usize) -> Result<Descriptor> {
        self.check_slot(table, slot)?;
        Ok(self.tables[table.index()][slot])
    }

    /// Stores a guest entry. TLB0 only holds 4KiB pages.
    pub fn write(&mut self, table: TableId, slot: usize, descriptor: Descriptor) -> Result<()> {
        self.check_slot(table, slot)?;
        if table == TableId::Tlb0 && descriptor.size != SizeClass::Size4K {
            return Err(TlbError::UnsupportedSize {
                table,
                size: descriptor.size,
            });
        }
        self.tables[table.index()][slot] = descriptor;
        Ok(())
    }

    /// First TLB0 slot of the set `vaddr` hashes to.
    #[inline]
    pub fn tlb0_set_base(&self, vaddr: u64) -> usize {
        (((vaddr >> PAGE_SHIFT) as usize) & (self.tlb0_sets - 1)) * self.tlb0_ways
    }

    /// TLB0 slot for `way` in the set of `vaddr`.
    #[inline]
    pub fn tlb0_slot(&self, vaddr: u64, way: usize) -> usize {
        debug_assert!(way < self.tlb0_ways);
        self.tlb0_set_base(vaddr) + way
    }

    #[inline]
    pub(crate) fn entry(&self, table: TableId, slot: usize) -> &Descriptor {
        &self.tables[table.index()][slot]
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, table: TableId, slot: usize) -> &mut Descriptor {
        &mut self.tables[table.index()][slot]
    }

    #[inline]
    pub(crate) fn entries(&self, table: TableId) -> &[Descriptor] {
        &self.tables[table.index()]
    }

    fn check_slot(&self, table: TableId, slot: usize) -> Result<()> {
        let size = self.size(table);
        if slot >= size {
            return Err(TlbError::SlotOutOfRange { table, slot, size });
        }
        Ok(())
    }
}

/// A shadow entry together with the pin it owns.
#[derive(Debug, Default)]
pub(crate) struct ShadowSlot {
    pub(crate) entry: Descriptor,
    pin: Option<FramePin>,
    dirty: bool,
}

/// A pin taken out of a shadow slot, to be handed back to the memory map.
#[derive(Debug)]
pub(crate) struct ReleasedPin {
    pub(crate) pin: FramePin,
    pub(crate) dirty: bool,
}

/// Translations actually loaded (or loadable) into hardware on the guest's
/// behalf. Indexed exactly like [`GuestTlbStore`], plus a small region of
/// protected hypervisor entries that has no guest counterpart.
#[derive(Debug)]
pub(crate) struct ShadowTlbStore {
    tables: [Vec<ShadowSlot>; 2],
    protected: Vec<Option<Descriptor>>,
}

impl ShadowTlbStore {
    pub(crate) fn new(tlb0_entries: usize, tlb1_entries: usize, protected: usize) -> Self {
        Self {
            tables: [
                (0..tlb0_entries).map(|_| ShadowSlot::default()).collect(),
                (0..tlb1_entries).map(|_| ShadowSlot::default()).collect(),
            ],
            protected: vec![None; protected],
        }
    }

    #[inline]
    pub(crate) fn entry(&self, table: TableId, slot: usize) -> &Descriptor {
        &self.tables[table.index()][slot].entry
    }

    #[inline]
    pub(crate) fn is_live(&self, table: TableId, slot: usize) -> bool {
        self.tables[table.index()][slot].entry.valid
    }

    #[inline]
    pub(crate) fn pin(&self, table: TableId, slot: usize) -> Option<&FramePin> {
        self.tables[table.index()][slot].pin.as_ref()
    }

    /// Installs a live shadow, returning the pin previously held by the slot.
    pub(crate) fn install(
        &mut self,
        table: TableId,
        slot: usize,
        entry: Descriptor,
        pin: FramePin,
        dirty: bool,
    ) -> Option<ReleasedPin> {
        debug_assert!(entry.valid);
        let cell = &mut self.tables[table.index()][slot];
        let old = cell.pin.replace(pin).map(|pin| ReleasedPin {
            pin,
            dirty: cell.dirty,
        });
        cell.entry = entry;
        cell.dirty = dirty;
        old
    }

    /// Marks the slot invalid and takes its pin. Returns `None` if the slot
    /// held nothing.
    pub(crate) fn clear(&mut self, table: TableId, slot: usize) -> Option<ReleasedPin> {
        let cell = &mut self.tables[table.index()][slot];
        cell.entry.valid = false;
        let dirty = cell.dirty;
        cell.dirty = false;
        cell.pin.take().map(|pin| ReleasedPin { pin, dirty })
    }

    pub(crate) fn outstanding_pins(&self) -> usize {
        self.tables
            .iter()
            .flat_map(|t| t.iter())
            .filter(|s| s.pin.is_some())
            .count()
    }

    pub(crate) fn drain_pins(&mut self) -> Vec<ReleasedPin> {
        let mut out = Vec::new();
        for table in TableId::ALL {
            for slot in 0..self.tables[table.index()].len() {
                if let Some(released) = self.clear(table, slot) {
                    out.push(released);
                }
            }
        }
        out
    }

    #[inline]
    pub(crate) fn protected_capacity(&self) -> usize {
        self.protected.len()
    }

    #[inline]
    pub(crate) fn protected_entry(&self, index: usize) -> Option<&Descriptor> {
        self.protected.get(index).and_then(|e| e.as_ref())
    }

    pub(crate) fn protected_entries(&self) -> impl Iterator<Item = (usize, &Descriptor)> + '_ {
        self.protected
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }

    pub(crate) fn free_protected_slot(&self) -> Option<usize> {
        self.protected.iter().position(Option::is_none)
    }

    pub(crate) fn set_protected(&mut self, index: usize, entry: Option<Descriptor>) {
        self.protected[index] = entry;
    }
}
