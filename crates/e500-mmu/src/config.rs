//! Per-vCPU TLB geometry and policy.

use crate::descriptor::{Attributes, SizeClass};
use crate::error::{Result, TlbError};
use crate::store::TableId;

/// Values used to pre-fill the guest's registers when a miss is reflected to
/// it (the MAS4 defaults on real hardware).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissDefaults {
    /// Table the guest's miss handler is expected to refill.
    pub table: TableId,
    pub size: SizeClass,
    pub attributes: Attributes,
}

impl Default for MissDefaults {
    fn default() -> Self {
        Self {
            table: TableId::Tlb0,
            size: SizeClass::Size4K,
            attributes: Attributes::empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlbConfig {
    /// TLB0 sets; must be a power of two.
    pub tlb0_sets: usize,
    pub tlb0_ways: usize,
    /// Low TLB1 hardware slots owned by the host kernel's own mappings.
    pub host_reserved_low: usize,
    /// High TLB1 hardware slots set aside for protected hypervisor mappings.
    pub reserved_tail: usize,
    /// Page sizes TLB1 accepts, smallest first. Must start at 4KiB.
    pub tlb1_sizes: Vec<SizeClass>,
    /// Force the coherence attribute on every shadow (multi-core hosts).
    pub coherent: bool,
    pub miss: MissDefaults,
}

impl Default for TlbConfig {
    /// e500v2: 256-entry 2-way TLB0, TLB1 pages from 4KiB to 4GiB.
    fn default() -> Self {
        Self {
            tlb0_sets: 128,
            tlb0_ways: 2,
            host_reserved_low: 0,
            reserved_tail: 1,
            tlb1_sizes: SizeClass::ALL.to_vec(),
            coherent: true,
            miss: MissDefaults::default(),
        }
    }
}

impl TlbConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tlb0_sets == 0 || !self.tlb0_sets.is_power_of_two() {
            return Err(TlbError::InvalidConfig(
                "tlb0_sets must be a non-zero power of two",
            ));
        }
        if self.tlb0_ways == 0 {
            return Err(TlbError::InvalidConfig("tlb0_ways must be non-zero"));
        }
        if self.tlb1_sizes.first() != Some(&SizeClass::Size4K) {
            return Err(TlbError::InvalidConfig("tlb1_sizes must start at 4KiB"));
        }
        if !self.tlb1_sizes.windows(2).all(|w| w[0] < w[1]) {
            return Err(TlbError::InvalidConfig(
                "tlb1_sizes must be strictly ascending",
            ));
        }
        let miss_sizes_ok = match self.miss.table {
            TableId::Tlb0 => self.miss.size == SizeClass::Size4K,
            TableId::Tlb1 => self.tlb1_sizes.contains(&self.miss.size),
        };
        if !miss_sizes_ok {
            return Err(TlbError::InvalidConfig(
                "miss default size not supported by the miss table",
            ));
        }
        Ok(())
    }

    /// Guest-visible TLB1 entries left once the host's own and the protected
    /// slots are carved out of the hardware table.
    pub fn tlb1_entries(&self, host_tlb1_capacity: usize) -> Result<usize> {
        match host_tlb1_capacity.checked_sub(self.host_reserved_low + self.reserved_tail) {
            Some(n) if n > 0 => Ok(n),
            _ => Err(TlbError::InvalidConfig(
                "host TLB1 too small for the reserved slots",
            )),
        }
    }

    #[inline]
    pub fn tlb0_entries(&self) -> usize {
        self.tlb0_sets * self.tlb0_ways
    }

    pub fn supports_size(&self, table: TableId, size: SizeClass) -> bool {
        match table {
            TableId::Tlb0 => size == SizeClass::Size4K,
            TableId::Tlb1 => self.tlb1_sizes.contains(&size),
        }
    }
}
