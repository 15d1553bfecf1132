#![allow(dead_code)]

use std::collections::HashMap;

use e500_mmu::{
    Backing, Descriptor, FrameError, FramePin, GuestMemoryMap, HostTlb, HwSlot, ResolvedFrame,
    TableId,
};

pub const MIB_FRAMES: u64 = 256;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy)]
struct Region {
    gfn: u64,
    pages: u64,
    host_pfn: u64,
    passthrough: bool,
}

/// Guest memory built from contiguous regions. Panics on a double or foreign
/// release so pin bugs surface at the call site.
#[derive(Debug, Default)]
pub struct MockMemory {
    regions: Vec<Region>,
    next_cookie: u64,
    live: HashMap<u64, (u64, u64)>,
    pub released: Vec<(u64, u64, bool)>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ram(mut self, gfn: u64, pages: u64, host_pfn: u64) -> Self {
        self.regions.push(Region {
            gfn,
            pages,
            host_pfn,
            passthrough: false,
        });
        self
    }

    pub fn with_passthrough(mut self, gfn: u64, pages: u64, host_pfn: u64) -> Self {
        self.regions.push(Region {
            gfn,
            pages,
            host_pfn,
            passthrough: true,
        });
        self
    }

    pub fn outstanding(&self) -> usize {
        self.live.len()
    }
}

impl GuestMemoryMap for MockMemory {
    fn pin(&mut self, gfn: u64, pages: u64, _writable: bool) -> Result<ResolvedFrame, FrameError> {
        let region = self
            .regions
            .iter()
            .find(|r| gfn >= r.gfn && gfn < r.gfn + r.pages)
            .copied()
            .ok_or(FrameError::NotBacked { gfn })?;
        if gfn + pages > region.gfn + region.pages {
            return Err(FrameError::NotContiguous { gfn, pages });
        }
        let pfn = region.host_pfn + (gfn - region.gfn);
        self.next_cookie += 1;
        self.live.insert(self.next_cookie, (pfn, pages));
        let backing = if region.passthrough {
            Backing::Passthrough {
                start_pfn: region.host_pfn,
                end_pfn: region.host_pfn + region.pages,
            }
        } else {
            Backing::Ram
        };
        Ok(ResolvedFrame {
            pin: FramePin::new(pfn, pages, self.next_cookie),
            backing,
        })
    }

    fn release(&mut self, pin: FramePin, dirty: bool) {
        let held = self
            .live
            .remove(&pin.cookie())
            .unwrap_or_else(|| panic!("pin {pin:?} released twice or never handed out"));
        assert_eq!(held, (pin.pfn(), pin.pages()));
        self.released.push((pin.pfn(), pin.pages(), dirty));
    }
}

/// Records what the hardware would hold.
#[derive(Debug)]
pub struct MockHost {
    capacity: usize,
    loaded: HashMap<HwSlot, Descriptor>,
    pub writes: Vec<(HwSlot, Descriptor)>,
    pub flushes: usize,
}

impl MockHost {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            loaded: HashMap::new(),
            writes: Vec::new(),
            flushes: 0,
        }
    }

    pub fn loaded(&self, table: TableId, index: usize) -> Option<&Descriptor> {
        self.loaded
            .get(&HwSlot { table, index })
            .filter(|entry| entry.valid)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.values().filter(|entry| entry.valid).count()
    }

    /// Every hardware slot currently holding a valid translation.
    pub fn valid_entries(&self) -> impl Iterator<Item = (HwSlot, &Descriptor)> + '_ {
        self.loaded
            .iter()
            .filter(|(_, entry)| entry.valid)
            .map(|(slot, entry)| (*slot, entry))
    }
}

impl HostTlb for MockHost {
    fn tlb1_capacity(&self) -> usize {
        self.capacity
    }

    fn write_entry(&mut self, slot: HwSlot, entry: &Descriptor) {
        self.writes.push((slot, *entry));
        self.loaded.insert(slot, *entry);
    }

    fn invalidate_all(&mut self) {
        self.flushes += 1;
        self.loaded.clear();
    }
}
