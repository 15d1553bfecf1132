mod common;

use common::{init_tracing, MockHost, MockMemory, MIB_FRAMES};
use e500_mmu::{
    AddressSpace, Descriptor, HostTlb, InvalidateRequest, MissOutcome, Permissions, ShadowMmu,
    SizeClass, SpaceMatch, TableId, TlbConfig,
};

const HOST_TLB1: usize = 64;

const RW: Permissions = Permissions::SR
    .union(Permissions::SW)
    .union(Permissions::UR)
    .union(Permissions::UW);

/// 1GiB of guest RAM at guest frame 0, host frames from 2GiB, plus a 1MiB
/// passthrough window at 3GiB.
fn memory() -> MockMemory {
    MockMemory::new()
        .with_ram(0, 1024 * MIB_FRAMES, 0x8_0000)
        .with_passthrough(0xc_0000, MIB_FRAMES, 0xc_0000)
}

fn mmu() -> ShadowMmu<MockMemory, MockHost> {
    init_tracing();
    ShadowMmu::new(TlbConfig::default(), memory(), MockHost::new(HOST_TLB1)).unwrap()
}

fn scenario_one_entry() -> Descriptor {
    Descriptor::new(0x1000_0000, 0x0100_0000, SizeClass::Size16M)
        .with_pid(5)
        .with_permissions(RW)
}

#[test]
fn large_ram_entry_gets_a_matching_shadow() {
    let mut mmu = mmu();
    mmu.on_guest_write(TableId::Tlb1, 0, scenario_one_entry()).unwrap();

    let shadow = *mmu.shadow_entry(TableId::Tlb1, 0).unwrap();
    assert_eq!(shadow.size, SizeClass::Size16M);
    assert_eq!(shadow.base_address(), 0x1000_0000);
    assert_eq!(shadow.rpn, 0x8_1000);
    assert_eq!(shadow.process_id, 5);
    assert_eq!(shadow.address_space, AddressSpace::As1);
    assert_eq!(mmu.outstanding_pins(), 1);
    assert_eq!(mmu.memory().outstanding(), 1);
    assert_eq!(mmu.host().loaded(TableId::Tlb1, 0), Some(&shadow));
}

#[test]
fn passthrough_window_caps_the_shadow_size() {
    let mut mmu = mmu();
    let entry = Descriptor::new(0x2000_0000, 0xc000_0000, SizeClass::Size256M).with_permissions(RW);
    mmu.on_guest_write(TableId::Tlb1, 1, entry).unwrap();

    let shadow = mmu.shadow_entry(TableId::Tlb1, 1).unwrap();
    assert_eq!(shadow.size, SizeClass::Size1M);
    assert_eq!(shadow.base_address(), 0x2000_0000);
    assert_eq!(shadow.rpn, 0xc_0000);
    assert_eq!(mmu.guest().read(TableId::Tlb1, 1).unwrap().size, SizeClass::Size256M);
}

#[test]
fn passthrough_miss_beyond_the_first_window_page() {
    let mut mmu = mmu();
    let entry = Descriptor::new(0x2000_0000, 0xc000_0000, SizeClass::Size256M);
    mmu.on_guest_write(TableId::Tlb1, 1, entry).unwrap();

    // Still inside the 1MiB window: the same 1MiB class is chosen.
    assert_eq!(
        mmu.on_data_miss(0x2008_0123, AddressSpace::As0),
        MissOutcome::Mapped {
            table: TableId::Tlb1,
            slot: 1,
            size: SizeClass::Size1M
        }
    );
    // Past the window the guest mapping has no backing.
    assert_eq!(
        mmu.on_data_miss(0x2010_0000, AddressSpace::As0),
        MissOutcome::Unbacked {
            table: TableId::Tlb1,
            slot: 1,
            guest_physical: 0xc010_0000
        }
    );
}

#[test]
fn range_invalidation_releases_the_pin() {
    let mut mmu = mmu();
    mmu.on_guest_write(TableId::Tlb1, 0, scenario_one_entry()).unwrap();

    assert_eq!(mmu.invalidate_range(0x1000_0000, 0x1000_0fff, 5), 1);

    assert_eq!(mmu.outstanding_pins(), 0);
    assert_eq!(mmu.memory().outstanding(), 0);
    assert_eq!(mmu.memory().released.last(), Some(&(0x8_1000, 0x1000, true)));
    assert!(!mmu.guest().read(TableId::Tlb1, 0).unwrap().valid);
    assert!(mmu.shadow_entry(TableId::Tlb1, 0).is_none());
    assert!(mmu.host().loaded(TableId::Tlb1, 0).is_none());
    assert_eq!(mmu.guest().search(TableId::Tlb1, 0x1000_0000, 5, SpaceMatch::Any), None);
}

#[test]
fn range_invalidation_honours_pid() {
    let mut mmu = mmu();
    mmu.on_guest_write(TableId::Tlb1, 0, scenario_one_entry()).unwrap();
    let global = Descriptor::new(0x1100_0000, 0x0200_0000, SizeClass::Size1M);
    mmu.on_guest_write(TableId::Tlb1, 1, global).unwrap();

    mmu.on_guest_invalidate(InvalidateRequest::Range {
        low: 0x1000_0000,
        high: 0x11ff_ffff,
        pid: 6,
    });
    // Tagged with pid 5: kept. Wildcard: removed.
    assert!(mmu.guest().read(TableId::Tlb1, 0).unwrap().valid);
    assert!(!mmu.guest().read(TableId::Tlb1, 1).unwrap().valid);
    assert_eq!(mmu.outstanding_pins(), 1);
}

#[test]
fn privilege_sweep_flushes_once_and_keeps_guest_entries() {
    let mut mmu = mmu();
    for slot in 0..3u64 {
        let entry = Descriptor::new(0x4000_0000 + slot * 0x10_0000, slot * 0x10_0000, SizeClass::Size1M);
        mmu.on_guest_write(TableId::Tlb1, slot as usize, entry).unwrap();
    }
    assert_eq!(mmu.outstanding_pins(), 3);
    let flushes = mmu.host().flushes;

    mmu.privilege_switch_sweep();

    assert_eq!(mmu.host().flushes, flushes + 1);
    for slot in 0..3 {
        assert!(mmu.shadow_entry(TableId::Tlb1, slot).is_none());
        assert!(mmu.guest().read(TableId::Tlb1, slot).unwrap().valid);
    }
    assert_eq!(mmu.outstanding_pins(), 0);
    assert_eq!(mmu.memory().outstanding(), 0);
}

#[test]
fn protected_mapping_survives_invalidate_all() {
    let mut mmu = mmu();
    let index = mmu.install_protected_mapping(0xffff_f000, 0x12_3456).unwrap();
    let installed = *mmu.protected_entry(index).unwrap();
    mmu.on_guest_write(TableId::Tlb1, 0, scenario_one_entry()).unwrap();

    mmu.on_guest_invalidate(InvalidateRequest::All(TableId::Tlb1));

    assert_eq!(mmu.protected_entry(index), Some(&installed));
    assert!(installed.valid && installed.protected);
    assert_eq!(mmu.host().loaded(TableId::Tlb1, HOST_TLB1 - 1), Some(&installed));
    assert_eq!(mmu.host().loaded_count(), 1);
    assert!(mmu.shadow_entry(TableId::Tlb1, 0).is_none());
}

#[test]
fn guest_refill_cycle() {
    let mut mmu = mmu();
    mmu.set_pid(3);

    // Miss, reflect, guest writes the template back, access retries.
    let MissOutcome::DeliverToGuest(template) = mmu.on_data_miss(0x5123, AddressSpace::As1) else {
        panic!("expected the miss to go to the guest");
    };
    assert_eq!(template.table, TableId::Tlb0);
    let mut entry = template.descriptor;
    entry.rpn = 0x42;
    entry.permissions = RW;
    mmu.on_guest_write(template.table, template.slot, entry).unwrap();

    mmu.host_mut().invalidate_all();
    assert_eq!(
        mmu.on_data_miss(0x5123, AddressSpace::As1),
        MissOutcome::Mapped {
            table: TableId::Tlb0,
            slot: template.slot,
            size: SizeClass::Size4K
        }
    );
    assert_eq!(mmu.shadow_entry(TableId::Tlb0, template.slot).unwrap().rpn, 0x8_0042);
    assert_eq!(mmu.outstanding_pins(), 1);
}

#[test]
fn dropping_the_engine_returns_every_pin() {
    init_tracing();
    let mut memory = memory();
    let mut host = MockHost::new(HOST_TLB1);
    {
        let mut mmu = ShadowMmu::new(TlbConfig::default(), &mut memory, &mut host).unwrap();
        mmu.on_guest_write(TableId::Tlb1, 0, scenario_one_entry()).unwrap();
        let entry = Descriptor::new(0x3000, 0x9000, SizeClass::Size4K);
        mmu.on_guest_write(TableId::Tlb0, 6, entry).unwrap();
        mmu.install_protected_mapping(0xffff_f000, 0x1).unwrap();
        assert_eq!(mmu.outstanding_pins(), 2);
    }
    assert_eq!(memory.outstanding(), 0);
    assert_eq!(memory.released.len(), 3);
}
