//! Translation descriptors shared by guest and shadow tables.

use bitflags::bitflags;

/// Hardware frames are always 4KiB; page numbers in descriptors are in these units.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Book3E page size classes (MAS1[TSIZE]); a class covers `4^tsize` KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SizeClass {
    Size4K = 1,
    Size16K = 2,
    Size64K = 3,
    Size256K = 4,
    Size1M = 5,
    Size4M = 6,
    Size16M = 7,
    Size64M = 8,
    Size256M = 9,
    Size1G = 10,
    Size4G = 11,
}

impl SizeClass {
    /// Every class, smallest first.
    pub const ALL: [SizeClass; 11] = [
        SizeClass::Size4K,
        SizeClass::Size16K,
        SizeClass::Size64K,
        SizeClass::Size256K,
        SizeClass::Size1M,
        SizeClass::Size4M,
        SizeClass::Size16M,
        SizeClass::Size64M,
        SizeClass::Size256M,
        SizeClass::Size1G,
        SizeClass::Size4G,
    ];

    #[inline]
    pub const fn tsize(self) -> u8 {
        self as u8
    }

    pub const fn from_tsize(tsize: u8) -> Option<Self> {
        if tsize == 0 || tsize as usize > Self::ALL.len() {
            return None;
        }
        Some(Self::ALL[tsize as usize - 1])
    }

    #[inline]
    pub const fn bytes(self) -> u64 {
        1024u64 << (2 * self as u32)
    }

    /// Number of 4KiB frames covered by one page of this class.
    #[inline]
    pub const fn pages(self) -> u64 {
        self.bytes() >> PAGE_SHIFT
    }

    /// Clears the in-page bits of a page number.
    #[inline]
    pub const fn align_page(self, page: u64) -> u64 {
        page & !(self.pages() - 1)
    }
}

/// Translation space selector (MAS1[TS]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressSpace {
    #[default]
    As0,
    As1,
}

impl AddressSpace {
    #[inline]
    pub fn from_bit(ts: bool) -> Self {
        if ts {
            AddressSpace::As1
        } else {
            AddressSpace::As0
        }
    }
}

/// Address-space filter used by lookups. `Any` is used by explicit guest searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceMatch {
    Exact(AddressSpace),
    Any,
}

impl SpaceMatch {
    #[inline]
    pub fn matches(self, space: AddressSpace) -> bool {
        match self {
            SpaceMatch::Exact(want) => want == space,
            SpaceMatch::Any => true,
        }
    }
}

impl From<AddressSpace> for SpaceMatch {
    fn from(space: AddressSpace) -> Self {
        SpaceMatch::Exact(space)
    }
}

bitflags! {
    /// Storage attributes (MAS2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u8 {
        const LITTLE_ENDIAN = 1 << 0;
        const GUARDED = 1 << 1;
        const COHERENT = 1 << 2;
        const CACHE_INHIBIT = 1 << 3;
        const WRITE_THROUGH = 1 << 4;
        const X1 = 1 << 5;
        const X0 = 1 << 6;
        /// Variable-length-encoding page; never propagated to shadows.
        const VLE = 1 << 7;
    }
}

impl Attributes {
    /// Attributes a shadow entry may inherit from the guest.
    pub const SHADOW_SAFE: Attributes = Attributes::LITTLE_ENDIAN
        .union(Attributes::GUARDED)
        .union(Attributes::COHERENT)
        .union(Attributes::CACHE_INHIBIT)
        .union(Attributes::WRITE_THROUGH)
        .union(Attributes::X1)
        .union(Attributes::X0);
}

bitflags! {
    /// Access permissions and user-defined bits (MAS3).
    ///
    /// Each user permission sits one bit above its supervisor counterpart.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permissions: u16 {
        const SR = 1 << 0;
        const UR = 1 << 1;
        const SW = 1 << 2;
        const UW = 1 << 3;
        const SX = 1 << 4;
        const UX = 1 << 5;
        const U3 = 1 << 6;
        const U2 = 1 << 7;
        const U1 = 1 << 8;
        const U0 = 1 << 9;
    }
}

impl Permissions {
    pub const SUPERVISOR: Permissions = Permissions::SR
        .union(Permissions::SW)
        .union(Permissions::SX);
    pub const USER: Permissions = Permissions::UR
        .union(Permissions::UW)
        .union(Permissions::UX);
    pub const USER_DEFINED: Permissions = Permissions::U0
        .union(Permissions::U1)
        .union(Permissions::U2)
        .union(Permissions::U3);
    pub const WRITE: Permissions = Permissions::SW.union(Permissions::UW);

    /// Supervisor read/write/execute moved into the user positions.
    #[inline]
    pub fn supervisor_as_user(self) -> Permissions {
        Permissions::from_bits_truncate((self & Permissions::SUPERVISOR).bits() << 1)
    }
}

/// One TLB entry, as the guest sees it or as it is loaded into hardware.
///
/// `epn` and `rpn` are 4KiB page numbers, both kept aligned to `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub valid: bool,
    pub address_space: AddressSpace,
    /// 0 matches every process id.
    pub process_id: u32,
    pub size: SizeClass,
    pub epn: u64,
    pub attributes: Attributes,
    pub rpn: u64,
    pub permissions: Permissions,
    /// MAS1[IPROT].
    pub protected: bool,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            valid: false,
            address_space: AddressSpace::As0,
            process_id: 0,
            size: SizeClass::Size4K,
            epn: 0,
            attributes: Attributes::empty(),
            rpn: 0,
            permissions: Permissions::empty(),
            protected: false,
        }
    }
}

impl Descriptor {
    /// Builds a valid entry mapping `vaddr` to `paddr`; both are truncated to `size`.
    pub fn new(vaddr: u64, paddr: u64, size: SizeClass) -> Self {
        Self {
            valid: true,
            size,
            epn: size.align_page(vaddr >> PAGE_SHIFT),
            rpn: size.align_page(paddr >> PAGE_SHIFT),
            ..Self::default()
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }

    pub fn with_space(mut self, space: AddressSpace) -> Self {
        self.address_space = space;
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    #[inline]
    pub fn base_address(&self) -> u64 {
        self.epn << PAGE_SHIFT
    }

    /// Last byte covered by the entry.
    #[inline]
    pub fn end_address(&self) -> u64 {
        self.base_address()
            .wrapping_add(self.size.bytes())
            .wrapping_sub(1)
    }

    #[inline]
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.base_address() && vaddr <= self.end_address()
    }

    /// Whether the entry overlaps the inclusive range `[low, high]`.
    #[inline]
    pub fn intersects(&self, low: u64, high: u64) -> bool {
        self.base_address() <= high && self.end_address() >= low
    }

    #[inline]
    pub fn matches_pid(&self, pid: u32) -> bool {
        self.process_id == 0 || self.process_id == pid
    }

    /// Physical address for `vaddr`, which must lie inside the entry.
    #[inline]
    pub fn translate(&self, vaddr: u64) -> u64 {
        debug_assert!(self.contains(vaddr));
        (self.rpn << PAGE_SHIFT) + (vaddr - self.base_address())
    }

    /// Guest frame backing `vaddr`.
    #[inline]
    pub fn frame_for(&self, vaddr: u64) -> u64 {
        self.translate(vaddr) >> PAGE_SHIFT
    }

    #[inline]
    pub fn grants_write(&self) -> bool {
        self.permissions.intersects(Permissions::WRITE)
    }
}

/// Derives shadow attributes and permissions from a guest entry.
///
/// The guest always executes in host user mode, so the result's user bits are
/// what the guest effectively gets. When the guest believes it is in
/// supervisor mode its supervisor permissions are mirrored into the user bits;
/// otherwise only its user bits survive. Supervisor bits are always set so the
/// host can reach every frame it maps for the guest.
pub fn narrow_permissions(descriptor: &Descriptor, running_as_user: bool) -> Descriptor {
    let guest = descriptor.permissions;
    let user = if running_as_user {
        guest & Permissions::USER
    } else {
        guest.supervisor_as_user()
    };

    Descriptor {
        attributes: descriptor.attributes & Attributes::SHADOW_SAFE,
        permissions: user | (guest & Permissions::USER_DEFINED) | Permissions::SUPERVISOR,
        ..*descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_ladder_steps_by_four() {
        assert_eq!(SizeClass::Size4K.bytes(), 4 * 1024);
        assert_eq!(SizeClass::Size1M.bytes(), 1024 * 1024);
        assert_eq!(SizeClass::Size256M.bytes(), 256 * 1024 * 1024);
        assert_eq!(SizeClass::Size4G.bytes(), 4 * 1024 * 1024 * 1024);
        for pair in SizeClass::ALL.windows(2) {
            assert_eq!(pair[0].bytes() * 4, pair[1].bytes());
        }
        assert_eq!(SizeClass::from_tsize(7), Some(SizeClass::Size16M));
        assert_eq!(SizeClass::from_tsize(0), None);
        assert_eq!(SizeClass::from_tsize(12), None);
    }

    #[test]
    fn descriptor_range_is_masked_to_size() {
        let d = Descriptor::new(0x1234_5678, 0x8765_4321, SizeClass::Size16M);
        assert_eq!(d.base_address(), 0x1200_0000);
        assert_eq!(d.end_address(), 0x12ff_ffff);
        assert_eq!(d.rpn << PAGE_SHIFT, 0x8700_0000);
        assert!(d.contains(0x12ab_cdef));
        assert!(!d.contains(0x1300_0000));
        assert!(d.intersects(0x12ff_ffff, 0x2000_0000));
        assert!(!d.intersects(0x1300_0000, 0x2000_0000));
        assert_eq!(d.translate(0x1200_1234), 0x8700_1234);
    }

    #[test]
    fn wildcard_pid_matches_everything() {
        let d = Descriptor::new(0, 0, SizeClass::Size4K);
        assert!(d.matches_pid(0));
        assert!(d.matches_pid(42));
        let d = d.with_pid(7);
        assert!(d.matches_pid(7));
        assert!(!d.matches_pid(8));
    }

    #[test]
    fn supervisor_guest_gets_mirrored_user_bits() {
        let d = Descriptor::new(0, 0, SizeClass::Size4K)
            .with_permissions(Permissions::SR | Permissions::SW | Permissions::UR);
        let shadow = narrow_permissions(&d, false);
        assert_eq!(
            shadow.permissions,
            Permissions::SUPERVISOR | Permissions::UR | Permissions::UW
        );
    }

    #[test]
    fn user_guest_keeps_only_user_bits() {
        let d = Descriptor::new(0, 0, SizeClass::Size4K).with_permissions(
            Permissions::SR | Permissions::SW | Permissions::SX | Permissions::UR | Permissions::U2,
        );
        let shadow = narrow_permissions(&d, true);
        assert_eq!(
            shadow.permissions,
            Permissions::SUPERVISOR | Permissions::UR | Permissions::U2
        );
    }

    #[test]
    fn unsafe_attributes_are_dropped() {
        let d = Descriptor::new(0, 0, SizeClass::Size4K)
            .with_attributes(Attributes::VLE | Attributes::GUARDED | Attributes::CACHE_INHIBIT);
        let shadow = narrow_permissions(&d, true);
        assert_eq!(
            shadow.attributes,
            Attributes::GUARDED | Attributes::CACHE_INHIBIT
        );
    }
}
