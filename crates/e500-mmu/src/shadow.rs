//! Shadow entry construction.

use core::ops::Range;

use crate::descriptor::{narrow_permissions, AddressSpace, Attributes, Descriptor, SizeClass, PAGE_SHIFT};
use crate::host::HostTlb;
use crate::memory::{Backing, FramePin, GuestMemoryMap};
use crate::store::TableId;
use crate::ShadowMmu;

/// Address space every shadow entry is loaded into. The guest always runs with
/// MSR[IS,DS] set, so hypervisor mappings in AS0 can never collide with it.
pub const SHADOW_ADDRESS_SPACE: AddressSpace = AddressSpace::As1;

/// Picks the largest page size in `ladder` usable for a passthrough mapping.
///
/// A class qualifies when it is no larger than `requested`, `vpn` and `pfn`
/// share their in-page bits at that size, and the naturally aligned physical
/// page around `pfn` lies inside `region`. Falls back to 4KiB.
///
/// `ladder` must be ascending, as enforced by [`crate::TlbConfig::validate`].
pub fn largest_passthrough_class(
    ladder: &[SizeClass],
    requested: SizeClass,
    vpn: u64,
    pfn: u64,
    region: Range<u64>,
) -> SizeClass {
    for &size in ladder.iter().rev() {
        if size > requested {
            continue;
        }
        if size == SizeClass::Size4K {
            break;
        }
        let pages = size.pages();
        let offset = vpn & (pages - 1);
        if pfn & (pages - 1) != offset {
            continue;
        }
        let start = pfn - offset;
        let Some(end) = start.checked_add(pages) else {
            continue;
        };
        if start < region.start || end > region.end {
            continue;
        }
        return size;
    }
    SizeClass::Size4K
}

/// Page size, pin and aligned page numbers chosen for a shadow entry.
struct Placement {
    size: SizeClass,
    pin: FramePin,
    vpn: u64,
    pfn: u64,
}

impl<M: GuestMemoryMap, H: HostTlb> ShadowMmu<M, H> {
    /// Builds and loads the shadow for the guest entry at `(table, slot)`,
    /// covering `vaddr`.
    ///
    /// Returns the shadow page size, or `None` when the guest frame has no
    /// host backing. In that case nothing is installed and the slot keeps
    /// whatever shadow (and pin) it had.
    pub(crate) fn shadow_map(&mut self, table: TableId, slot: usize, vaddr: u64) -> Option<SizeClass> {
        let guest = *self.guest.entry(table, slot);
        debug_assert!(guest.valid && guest.contains(vaddr));

        let writable = guest.grants_write();
        let gfn = guest.frame_for(vaddr);
        let frame = match self.memory.pin(gfn, 1, writable) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%table, slot, vaddr, gfn, %err, "shadow map: frame resolution failed");
                #[cfg(feature = "stats")]
                {
                    self.stats.map_failures = self.stats.map_failures.wrapping_add(1);
                }
                return None;
            }
        };

        let vpn = vaddr >> PAGE_SHIFT;
        let placement = match frame.backing {
            Backing::Passthrough { start_pfn, end_pfn } => {
                let size = match table {
                    TableId::Tlb0 => SizeClass::Size4K,
                    TableId::Tlb1 => largest_passthrough_class(
                        &self.config.tlb1_sizes,
                        guest.size,
                        vpn,
                        frame.pin.pfn(),
                        start_pfn..end_pfn,
                    ),
                };
                let pfn = size.align_page(frame.pin.pfn());
                Placement {
                    size,
                    pin: frame.pin,
                    vpn: size.align_page(vpn),
                    pfn,
                }
            }
            Backing::Ram if table == TableId::Tlb1 && guest.size > SizeClass::Size4K => {
                match self.pin_whole_page(&guest, writable) {
                    Some(unit) => {
                        self.memory.release(frame.pin, false);
                        let pfn = unit.pfn();
                        Placement {
                            size: guest.size,
                            pin: unit,
                            vpn: guest.epn,
                            pfn,
                        }
                    }
                    None => {
                        let pfn = frame.pin.pfn();
                        Placement {
                            size: SizeClass::Size4K,
                            pin: frame.pin,
                            vpn,
                            pfn,
                        }
                    }
                }
            }
            Backing::Ram => {
                let pfn = frame.pin.pfn();
                Placement {
                    size: SizeClass::Size4K,
                    pin: frame.pin,
                    vpn,
                    pfn,
                }
            }
        };

        let mut shadow = narrow_permissions(&guest, self.user_mode);
        shadow.valid = true;
        shadow.address_space = SHADOW_ADDRESS_SPACE;
        shadow.size = placement.size;
        shadow.epn = placement.vpn;
        shadow.rpn = placement.pfn;
        shadow.protected = false;
        if self.config.coherent {
            shadow.attributes |= Attributes::COHERENT;
        }

        let old = self.shadow.install(table, slot, shadow, placement.pin, writable);
        self.writer.commit(&mut self.host, table, slot, &shadow);
        // The hardware slot no longer points at the old frames.
        if let Some(old) = old {
            self.memory.release(old.pin, old.dirty);
        }

        tracing::debug!(
            %table,
            slot,
            vaddr,
            size = ?placement.size,
            pfn = placement.pfn,
            "shadow entry installed"
        );
        #[cfg(feature = "stats")]
        {
            self.stats.shadow_maps = self.stats.shadow_maps.wrapping_add(1);
        }
        Some(placement.size)
    }

    /// Pins a large RAM page as one unit. Only usable when the host frames come
    /// back aligned to the page size; otherwise the pin is dropped.
    fn pin_whole_page(&mut self, guest: &Descriptor, writable: bool) -> Option<FramePin> {
        let pages = guest.size.pages();
        let gfn = guest.size.align_page(guest.rpn);
        let unit = match self.memory.pin(gfn, pages, writable) {
            Ok(unit) => unit,
            Err(err) => {
                tracing::trace!(gfn, pages, %err, "large page not pinnable as a unit");
                return None;
            }
        };
        if unit.backing != Backing::Ram || unit.pin.pfn() & (pages - 1) != 0 {
            tracing::trace!(gfn, pfn = unit.pin.pfn(), pages, "large page not aligned on host");
            self.memory.release(unit.pin, false);
            return None;
        }
        Some(unit.pin)
    }
}
