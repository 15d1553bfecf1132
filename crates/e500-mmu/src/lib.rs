//! Guest/shadow TLB virtualization for the PowerPC e500 (Book3E) MMU.
//!
//! The guest programs a two-level software-visible TLB (TLB0: small,
//! set-associative, 4KiB pages; TLB1: fully associative, variable page sizes).
//! [`ShadowMmu`] records what the guest believes it loaded, builds matching
//! "shadow" entries that point at pinned host memory with narrowed
//! permissions, and loads them into the real TLB through [`HostTlb`].
//!
//! Shadows are built lazily: a guest write eagerly tries to shadow the new
//! entry, but the hardware can lose shadows at any time (flushes, privilege
//! changes, host reclaim) and the miss entry points rebuild them from the
//! guest TLB.

mod config;
mod descriptor;
mod error;
mod host;
mod invalidate;
mod memory;
mod search;
mod shadow;
mod store;
mod victim;


pub use config::{MissDefaults, TlbConfig};
pub use descriptor::{
    narrow_permissions, AddressSpace, Attributes, Descriptor, Permissions, SizeClass, SpaceMatch,
    PAGE_SHIFT, PAGE_SIZE,
};
pub use error::{Result, TlbError};
pub use host::{HostTlb, HwSlot};
pub use invalidate::InvalidateRequest;
pub use memory::{Backing, FrameError, FramePin, GuestMemoryMap, ResolvedFrame};
pub use search::{MissTemplate, SearchHit, SearchOutcome};
pub use shadow::{largest_passthrough_class, SHADOW_ADDRESS_SPACE};
pub use store::{GuestTlbStore, TableId};
pub use victim::VictimSelector;

use host::HostTlbWriter;
use store::ShadowTlbStore;

/// Optional shadow-TLB statistics.
///
/// When the `stats` feature is disabled, this type contains no fields and
/// [`ShadowMmu::stats`] will always return `None`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShadowStats {
    /// Shadow entries built and loaded.
    #[cfg(feature = "stats")]
    pub shadow_maps: u64,
    /// Shadow builds abandoned because the guest frame had no host backing.
    #[cfg(feature = "stats")]
    pub map_failures: u64,
    /// Guest entries (or orphaned shadows) invalidated.
    #[cfg(feature = "stats")]
    pub invalidations: u64,
    /// Hardware invalidate-all operations.
    #[cfg(feature = "stats")]
    pub global_flushes: u64,
    /// Privilege switch sweeps.
    #[cfg(feature = "stats")]
    pub privilege_sweeps: u64,
    /// Misses reflected to the guest's own handler.
    #[cfg(feature = "stats")]
    pub guest_misses: u64,
}

impl ShadowStats {
    /// Shadow entries built and loaded.
    #[inline]
    pub fn shadow_maps(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.shadow_maps
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    /// Shadow builds abandoned because the guest frame had no host backing.
    #[inline]
    pub fn map_failures(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.map_failures
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    /// Guest entries (or orphaned shadows) invalidated.
    #[inline]
    pub fn invalidations(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.invalidations
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    /// Hardware invalidate-all operations.
    #[inline]
    pub fn global_flushes(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.global_flushes
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    /// Privilege switch sweeps.
    #[inline]
    pub fn privilege_sweeps(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.privilege_sweeps
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    /// Misses reflected to the guest's own handler.
    #[inline]
    pub fn guest_misses(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.guest_misses
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }
}

/// Result of a hardware TLB miss taken while the guest was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// The guest TLB translates the address; a shadow is now loaded.
    Mapped {
        table: TableId,
        slot: usize,
        size: SizeClass,
    },
    /// The guest TLB translates the address but the guest physical address
    /// has no host frame (MMIO emulation or a fault, at the caller's choice).
    Unbacked {
        table: TableId,
        slot: usize,
        guest_physical: u64,
    },
    /// The guest TLB has no translation; reflect the miss with these values.
    DeliverToGuest(MissTemplate),
}

/// Which hardware TLB miss was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    Instruction,
    Data,
}

/// Per-vCPU guest and shadow TLB state.
///
/// Owns the guest memory map handle and the host TLB it loads shadows into.
/// All operations are synchronous and run on the vCPU's own thread; nothing
/// here blocks.
pub struct ShadowMmu<M: GuestMemoryMap, H: HostTlb> {
    config: TlbConfig,
    guest: GuestTlbStore,
    shadow: ShadowTlbStore,
    victims: [VictimSelector; 2],
    writer: HostTlbWriter,
    memory: M,
    host: H,
    pid: u32,
    user_mode: bool,
    flush_pending: bool,
    #[cfg(feature = "stats")]
    stats: ShadowStats,
}

impl<M: GuestMemoryMap, H: HostTlb> ShadowMmu<M, H> {
    /// Builds the TLB state for one vCPU. The host TLB1 capacity is read once
    /// here and fixes the guest TLB1 size for the vCPU's lifetime.
    pub fn new(config: TlbConfig, memory: M, host: H) -> Result<Self> {
        config.validate()?;
        let host_tlb1 = host.tlb1_capacity();
        let tlb1_entries = config.tlb1_entries(host_tlb1)?;

        let guest = GuestTlbStore::new(config.tlb0_sets, config.tlb0_ways, tlb1_entries);
        let shadow = ShadowTlbStore::new(config.tlb0_entries(), tlb1_entries, config.reserved_tail);
        let victims = [
            VictimSelector::new(config.tlb0_ways),
            VictimSelector::new(tlb1_entries),
        ];
        let writer = HostTlbWriter::new(config.host_reserved_low, host_tlb1, config.reserved_tail);

        tracing::debug!(
            tlb0_entries = config.tlb0_entries(),
            tlb1_entries,
            host_tlb1,
            "shadow MMU initialised"
        );

        Ok(Self {
            config,
            guest,
            shadow,
            victims,
            writer,
            memory,
            host,
            pid: 0,
            user_mode: false,
            flush_pending: false,
            #[cfg(feature = "stats")]
            stats: ShadowStats::default(),
        })
    }

    #[inline]
    pub fn config(&self) -> &TlbConfig {
        &self.config
    }

    #[inline]
    pub fn guest(&self) -> &GuestTlbStore {
        &self.guest
    }

    #[inline]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    #[inline]
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    #[inline]
    pub fn host(&self) -> &H {
        &self.host
    }

    #[inline]
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Current guest process id (PID0).
    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn set_pid(&mut self, pid: u32) {
        self.pid = pid;
    }

    /// Whether the guest currently runs in (guest) user mode.
    #[inline]
    pub fn user_mode(&self) -> bool {
        self.user_mode
    }

    /// Records a guest privilege change. Changing level sweeps TLB1 shadows,
    /// since their permissions were narrowed for the old level.
    pub fn set_user_mode(&mut self, user_mode: bool) {
        if self.user_mode == user_mode {
            return;
        }
        self.user_mode = user_mode;
        self.privilege_switch_sweep();
    }

    /// Called when the vCPU is scheduled in. A vCPU that moved to another core
    /// finds stale translations there, so the hardware is flushed and the
    /// protected entries reloaded.
    pub fn on_vcpu_load(&mut self, cpu_changed: bool) {
        if cpu_changed || self.flush_pending {
            self.global_flush();
        }
    }

    /// Whether invalidations were recorded since the last global flush.
    #[inline]
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// The shadow at `(table, slot)`, if one is live.
    pub fn shadow_entry(&self, table: TableId, slot: usize) -> Option<&Descriptor> {
        if slot >= self.guest.size(table) {
            return None;
        }
        let entry = self.shadow.entry(table, slot);
        entry.valid.then_some(entry)
    }

    /// Pins currently held by shadow entries.
    pub fn outstanding_pins(&self) -> usize {
        self.shadow.outstanding_pins()
    }

    /// The next replacement slot for `table` without advancing it.
    #[inline]
    pub fn next_victim(&self, table: TableId) -> usize {
        self.victims[table.index()].peek()
    }

    /// Picks a replacement slot for a new entry. For TLB0 the way comes from
    /// the round-robin pointer and the set from `vaddr`.
    pub fn allocate_victim(&mut self, table: TableId, vaddr: u64) -> usize {
        let victim = self.victims[table.index()].next_victim();
        match table {
            TableId::Tlb0 => self.guest.tlb0_slot(vaddr, victim),
            TableId::Tlb1 => victim,
        }
    }

    /// Guest TLB write (`tlbwe`).
    ///
    /// Overwriting a valid TLB1 entry first drops every shadow overlapping the
    /// old entry's range. The slot's own shadow is always dropped and its
    /// hardware slot cleared before the new entry is pinned. A valid new entry
    /// is shadowed immediately; if its frame has no host backing the guest
    /// entry is kept and the next miss reports it as unbacked.
    pub fn on_guest_write(&mut self, table: TableId, slot: usize, mut descriptor: Descriptor) -> Result<()> {
        let old = self.guest.read(table, slot)?;
        if !self.config.supports_size(table, descriptor.size) {
            return Err(TlbError::UnsupportedSize {
                table,
                size: descriptor.size,
            });
        }

        if table == TableId::Tlb1 && old.valid {
            let dropped =
                self.drop_shadows_in_range(old.base_address(), old.end_address(), old.process_id);
            if dropped > 0 {
                self.global_flush();
            }
        }
        self.drop_shadow(table, slot);

        descriptor.epn = descriptor.size.align_page(descriptor.epn);
        descriptor.rpn = descriptor.size.align_page(descriptor.rpn);
        self.guest.write(table, slot, descriptor)?;
        tracing::trace!(%table, slot, valid = descriptor.valid, epn = descriptor.epn, "guest tlbwe");

        if descriptor.valid {
            self.shadow_map(table, slot, descriptor.base_address());
        }
        Ok(())
    }

    /// Guest TLB read (`tlbre`): the entry plus the table's next victim.
    pub fn on_guest_read(&self, table: TableId, slot: usize) -> Result<SearchHit> {
        let descriptor = self.guest.read(table, slot)?;
        Ok(SearchHit {
            table,
            slot,
            descriptor,
            next_victim: self.next_victim(table),
        })
    }

    /// Guest TLB search (`tlbsx`): TLB0, then TLB1. A miss allocates a victim
    /// in the configured miss table and returns a template for it.
    pub fn on_tlb_search(&mut self, address: u64, pid: u32, space: SpaceMatch) -> SearchOutcome {
        if let Some((table, slot)) = self.guest.search_all(address, pid, space) {
            return SearchOutcome::Hit(SearchHit {
                table,
                slot,
                descriptor: *self.guest.entry(table, slot),
                next_victim: self.next_victim(table),
            });
        }
        SearchOutcome::Miss(self.miss_template(address, pid, space, false))
    }

    /// Instruction TLB miss taken by the guest.
    pub fn on_instruction_miss(&mut self, address: u64, space: AddressSpace) -> MissOutcome {
        self.handle_miss(MissKind::Instruction, address, space)
    }

    /// Data TLB miss taken by the guest.
    pub fn on_data_miss(&mut self, address: u64, space: AddressSpace) -> MissOutcome {
        self.handle_miss(MissKind::Data, address, space)
    }

    fn handle_miss(&mut self, kind: MissKind, address: u64, space: AddressSpace) -> MissOutcome {
        let pid = self.pid;
        let Some((table, slot)) = self.guest.search_all(address, pid, space.into()) else {
            tracing::trace!(?kind, address, pid, ?space, "reflect miss to guest");
            #[cfg(feature = "stats")]
            {
                self.stats.guest_misses = self.stats.guest_misses.wrapping_add(1);
            }
            return MissOutcome::DeliverToGuest(self.miss_template(address, pid, space.into(), true));
        };

        match self.shadow_map(table, slot, address) {
            Some(size) => MissOutcome::Mapped { table, slot, size },
            None => MissOutcome::Unbacked {
                table,
                slot,
                guest_physical: self.guest.entry(table, slot).translate(address),
            },
        }
    }

    fn miss_template(&mut self, address: u64, pid: u32, space: SpaceMatch, valid: bool) -> MissTemplate {
        let table = self.config.miss.table;
        let slot = self.allocate_victim(table, address);
        MissTemplate::build(
            &self.config.miss,
            slot,
            self.next_victim(table),
            address,
            pid,
            space,
            valid,
        )
    }

    /// Loads a permanent hypervisor mapping (the paravirt "magic page") into
    /// the protected region and returns its index there.
    ///
    /// Protected entries are not visible to the guest, are never picked as
    /// victims or swept, and survive global flushes.
    pub fn install_protected_mapping(&mut self, virtual_address: u64, host_physical_frame: u64) -> Result<usize> {
        let Some(index) = self.shadow.free_protected_slot() else {
            let capacity = self.shadow.protected_capacity();
            tracing::warn!(capacity, virtual_address, "no free protected TLB1 slot");
            return Err(TlbError::ProtectedRegionFull { capacity });
        };

        let mut attributes = Attributes::empty();
        if self.config.coherent {
            attributes |= Attributes::COHERENT;
        }
        let entry = Descriptor {
            valid: true,
            address_space: SHADOW_ADDRESS_SPACE,
            process_id: 0,
            size: SizeClass::Size4K,
            epn: virtual_address >> PAGE_SHIFT,
            attributes,
            rpn: host_physical_frame,
            permissions: Permissions::SR | Permissions::SW | Permissions::UR | Permissions::UW,
            protected: true,
        };
        self.shadow.set_protected(index, Some(entry));
        self.writer.commit_protected(&mut self.host, index, &entry);
        tracing::debug!(index, virtual_address, host_physical_frame, "protected mapping installed");
        Ok(index)
    }

    /// Removes a protected mapping. This is the only path that can.
    pub fn remove_protected_mapping(&mut self, index: usize) -> Result<()> {
        let capacity = self.shadow.protected_capacity();
        if index >= capacity {
            return Err(TlbError::ProtectedSlotOutOfRange { index, capacity });
        }
        if let Some(entry) = self.shadow.protected_entry(index).copied() {
            let cleared = Descriptor {
                valid: false,
                ..entry
            };
            self.writer.commit_protected(&mut self.host, index, &cleared);
            self.shadow.set_protected(index, None);
            tracing::debug!(index, "protected mapping removed");
        }
        Ok(())
    }

    pub fn protected_entry(&self, index: usize) -> Option<&Descriptor> {
        self.shadow.protected_entry(index)
    }

    /// Returns current statistics when the `stats` feature is enabled.
    #[inline]
    pub fn stats(&self) -> Option<ShadowStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }

        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }

    /// Resets statistics counters back to 0 when the `stats` feature is enabled.
    #[inline]
    pub fn reset_stats(&mut self) {
        #[cfg(feature = "stats")]
        {
            self.stats = ShadowStats::default();
        }
    }
}

impl<M: GuestMemoryMap, H: HostTlb> Drop for ShadowMmu<M, H> {
    fn drop(&mut self) {
        let pins = self.shadow.drain_pins();
        if pins.is_empty() {
            return;
        }
        // Nothing may keep translating to these frames once they go back.
        self.host.invalidate_all();
        tracing::debug!(count = pins.len(), "releasing shadow pins");
        for released in pins {
            self.memory.release(released.pin, released.dirty);
        }
    }
}
