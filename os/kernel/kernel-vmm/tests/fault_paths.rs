use kernel_alloc::{Gaf, Pmm};
use kernel_info::boot::BootMemoryRegion;
use kernel_info::topology::NumaTopology;
use kernel_info::{CpuId, Status};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_vmem::testing::{RecordingMmu, RecordingTlb, TestPhys};
use kernel_vmem::{AddressSpaceTag, MmuFlags, PhysMapperExt};
use kernel_vmm::{
    AddressSpace, Backing, FaultCause, PageFault, PageProvider, PageRequest, ProviderReply,
    RegionKind, RegionRange, Slot, VmObject, VmObjectPaged, VmObjectPhysical, VmmConfig, VmoFlags,
    Vmm,
};
use std::sync::{Arc, Mutex};

const CPU: CpuId = CpuId::new(0);

struct Harness {
    vmm: Vmm,
    pmm: Arc<Pmm>,
    mmu: Arc<RecordingMmu>,
}

fn harness(config: VmmConfig) -> Harness {
    let map = [BootMemoryRegion::usable(0, 64 << 20)];
    let pmm = Arc::new(Pmm::new(&NumaTopology::uniform(), &map).unwrap());
    let mmu = Arc::new(RecordingMmu::default());
    let vmm = Vmm::new(
        pmm.clone(),
        Arc::new(TestPhys::new()),
        Arc::new(RecordingTlb::default()),
        mmu.clone(),
        config,
    )
    .unwrap();
    Harness { vmm, pmm, mmu }
}

fn in_use(pmm: &Pmm) -> u64 {
    let stats = pmm.stats();
    stats.allocated - stats.cached
}

/// A user space with `pages` pages of a fresh paged object mapped RW.
fn mapped(h: &Harness, pages: u64) -> (Arc<AddressSpace>, Arc<VmObject>, VirtualAddress) {
    let user = h.vmm.create_user_aspace().unwrap();
    let object = VmObjectPaged::create(h.vmm.context(), Gaf::USER, pages, VmoFlags::empty()).unwrap();
    let va = user
        .create_subregion(
            RegionRange::anywhere(pages * PAGE_SIZE),
            0,
            MmuFlags::RW,
            Some(Backing::new(object.clone(), 0)),
        )
        .unwrap();
    (user, object, va)
}

fn user_write(va: VirtualAddress) -> PageFault {
    PageFault::new(va, FaultCause::ABSENT | FaultCause::WRITE | FaultCause::USER)
}

fn user_read(va: VirtualAddress) -> PageFault {
    PageFault::new(va, FaultCause::ABSENT | FaultCause::USER)
}

#[test]
fn write_fault_maps_one_private_page() {
    let h = harness(VmmConfig::default());
    let (user, object, va) = mapped(&h, 4);

    let mut fault = user_write(va + PAGE_SIZE + 0x18);
    h.vmm.handle_fault(CPU, Some(&user), &mut fault).unwrap();
    assert!(fault.request.is_none());

    let translation = user.table().query(va + PAGE_SIZE).unwrap();
    assert_eq!(translation.flags, MmuFlags::RW | MmuFlags::USER);
    assert_eq!(object.lookup(PAGE_SIZE).unwrap(), translation.pa);
    assert!(user.table().query(va).is_err());

    let paged = object.as_paged().unwrap();
    assert_eq!(paged.resident_pages(), 1);
    assert!(matches!(paged.slot(1), Some(Slot::Owned(_))));
    assert_eq!(user.faults(), 1);
}

#[test]
fn read_fault_maps_the_zero_page_until_written() {
    let h = harness(VmmConfig::default());
    let (user, object, va) = mapped(&h, 2);
    let zero = h.vmm.context().zero_frame().to_phys();

    h.vmm.handle_fault(CPU, Some(&user), &mut user_read(va)).unwrap();
    let translation = user.table().query(va).unwrap();
    assert_eq!(translation.pa, zero);
    assert!(!translation.flags.contains(MmuFlags::WRITABLE));
    assert_eq!(object.as_paged().unwrap().slot(0), Some(Slot::Zero));
    assert_eq!(object.lookup(0), Err(Status::NotFound));

    let mut write = PageFault::new(va, FaultCause::WRITE | FaultCause::USER);
    h.vmm.handle_fault(CPU, Some(&user), &mut write).unwrap();
    let translation = user.table().query(va).unwrap();
    assert_ne!(translation.pa, zero);
    assert!(translation.flags.contains(MmuFlags::WRITABLE));
    assert_eq!(object.lookup(0).unwrap(), translation.pa);
}

#[test]
fn fork_shares_frames_until_written() {
    let h = harness(VmmConfig::default());
    let (parent, _object, va) = mapped(&h, 2);
    parent.write_bytes(CPU, va, b"parent").unwrap();

    let child = parent.fork(CPU).unwrap();
    h.vmm.handle_fault(CPU, Some(&parent), &mut user_read(va)).unwrap();
    h.vmm.handle_fault(CPU, Some(&child), &mut user_read(va)).unwrap();
    let shared = parent.table().query(va).unwrap();
    assert_eq!(child.table().query(va).unwrap().pa, shared.pa);
    assert!(!shared.flags.contains(MmuFlags::WRITABLE));

    let mut write = PageFault::new(va, FaultCause::WRITE | FaultCause::USER);
    h.vmm.handle_fault(CPU, Some(&child), &mut write).unwrap();
    let private = child.table().query(va).unwrap();
    assert_ne!(private.pa, shared.pa);
    assert!(private.flags.contains(MmuFlags::WRITABLE));

    child.write_bytes(CPU, va, b"child!").unwrap();
    let mut seen = [0u8; 6];
    parent.read_bytes(CPU, va, &mut seen).unwrap();
    assert_eq!(&seen, b"parent");
    child.read_bytes(CPU, va, &mut seen).unwrap();
    assert_eq!(&seen, b"child!");

    // The child mapping sees the second page as untouched.
    let mut tail = [0xffu8; 4];
    child.read_bytes(CPU, va + PAGE_SIZE, &mut tail).unwrap();
    assert_eq!(tail, [0; 4]);
}

#[test]
fn bytes_cross_page_boundaries() {
    let h = harness(VmmConfig::default());
    let (user, object, va) = mapped(&h, 2);
    let at = va + PAGE_SIZE - 3;
    user.write_bytes(CPU, at, b"abcdef").unwrap();

    let mut back = [0u8; 6];
    user.read_bytes(CPU, at, &mut back).unwrap();
    assert_eq!(&back, b"abcdef");
    assert_eq!(object.as_paged().unwrap().resident_pages(), 2);
    assert_eq!(user.read_bytes(CPU, va + 2 * PAGE_SIZE, &mut back), Err(Status::NotFound));
}

#[derive(Default)]
struct Pager {
    asked: Mutex<Vec<Arc<PageRequest>>>,
}

impl PageProvider for Pager {
    fn request(&self, _object_id: u64, _index: u64, request: &Arc<PageRequest>) -> ProviderReply {
        self.asked.lock().unwrap().push(request.clone());
        ProviderReply::Pending
    }
}

#[test]
fn pager_faults_wait_for_the_supplied_page() {
    let h = harness(VmmConfig::default());
    let pager = Arc::new(Pager::default());
    let user = h.vmm.create_user_aspace().unwrap();
    let object =
        VmObjectPaged::create_with_pager(h.vmm.context(), Gaf::USER, 2, VmoFlags::empty(), pager.clone())
            .unwrap();
    let va = user
        .create_subregion(
            RegionRange::anywhere(2 * PAGE_SIZE),
            0,
            MmuFlags::READABLE,
            Some(Backing::new(object.clone(), 0)),
        )
        .unwrap();

    let mut fault = user_read(va + PAGE_SIZE);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut fault), Err(Status::ShouldWait));
    let request = fault.request.take().unwrap();
    assert_eq!(request.index(), 1);
    assert_eq!(request.object_id(), object.id());

    // A second fault joins the request in flight.
    let mut again = user_read(va + PAGE_SIZE);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut again), Err(Status::ShouldWait));
    assert!(Arc::ptr_eq(again.request.as_ref().unwrap(), &request));
    assert_eq!(pager.asked.lock().unwrap().len(), 1);

    let pfn = h.pmm.alloc(CPU, Gaf::USER, 0).unwrap();
    // Safety: the frame was just allocated and is not mapped anywhere.
    unsafe { h.vmm.context().mapper().write_bytes(pfn.to_phys(), b"paged in") };
    let paged = object.as_paged().unwrap();
    paged.supply_page(1, pfn).unwrap();
    assert!(request.complete());
    request.wait(0).unwrap();
    assert!(paged.pending_request(1).is_none());

    let mut retry = user_read(va + PAGE_SIZE);
    h.vmm.handle_fault(CPU, Some(&user), &mut retry).unwrap();
    assert_eq!(user.table().query(va + PAGE_SIZE).unwrap().pa, pfn.to_phys());

    let mut seen = [0u8; 8];
    user.read_bytes(CPU, va + PAGE_SIZE, &mut seen).unwrap();
    assert_eq!(&seen, b"paged in");

    let spare = h.pmm.alloc(CPU, Gaf::USER, 0).unwrap();
    assert_eq!(paged.supply_page(1, spare), Err(Status::AlreadyExists));
    assert_eq!(paged.supply_page(2, spare), Err(Status::OutOfRange));
    assert!(h.pmm.put_frame(CPU, spare));
}

#[test]
fn forked_pager_mappings_read_what_the_pager_supplies() {
    let h = harness(VmmConfig::default());
    let pager = Arc::new(Pager::default());
    let parent = h.vmm.create_user_aspace().unwrap();
    let object =
        VmObjectPaged::create_with_pager(h.vmm.context(), Gaf::USER, 1, VmoFlags::empty(), pager.clone())
            .unwrap();
    let va = parent
        .create_subregion(
            RegionRange::anywhere(PAGE_SIZE),
            0,
            MmuFlags::RW,
            Some(Backing::new(object.clone(), 0)),
        )
        .unwrap();
    let child = parent.fork(CPU).unwrap();

    let mut fault = user_read(va);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&child), &mut fault), Err(Status::ShouldWait));
    let request = fault.request.take().unwrap();
    assert_eq!(request.object_id(), object.id());

    let pfn = h.pmm.alloc(CPU, Gaf::USER, 0).unwrap();
    // Safety: the frame was just allocated and is not mapped anywhere.
    unsafe { h.vmm.context().mapper().write_bytes(pfn.to_phys(), b"from disk") };
    object.as_paged().unwrap().supply_page(0, pfn).unwrap();
    assert!(request.complete());

    let mut seen = [0u8; 9];
    child.read_bytes(CPU, va, &mut seen).unwrap();
    assert_eq!(&seen, b"from disk");
    assert_eq!(pager.asked.lock().unwrap().len(), 1);

    child.write_bytes(CPU, va, b"child").unwrap();
    parent.read_bytes(CPU, va, &mut seen).unwrap();
    assert_eq!(&seen, b"from disk");
    child.read_bytes(CPU, va, &mut seen).unwrap();
    assert_eq!(&seen, b"childdisk");
}

#[test]
fn faults_are_checked_against_the_mapping() {
    let h = harness(VmmConfig::default());
    let user = h.vmm.create_user_aspace().unwrap();
    let object = VmObjectPaged::create(h.vmm.context(), Gaf::USER, 1, VmoFlags::empty()).unwrap();
    let va = user
        .create_subregion(RegionRange::anywhere(PAGE_SIZE), 0, MmuFlags::READABLE, Some(Backing::new(object, 0)))
        .unwrap();

    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut user_write(va)), Err(Status::Unsupported));
    let mut fetch = PageFault::new(va, FaultCause::ABSENT | FaultCause::INSTRUCTION | FaultCause::USER);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut fetch), Err(Status::Unsupported));

    let unmapped = va + 16 * PAGE_SIZE;
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut user_read(unmapped)), Err(Status::NotFound));
    assert_eq!(h.vmm.handle_fault(CPU, None, &mut user_read(va)), Err(Status::NotFound));

    let kernel_va = h.vmm.kernel_aspace().range().base;
    assert_eq!(
        h.vmm.handle_fault(CPU, Some(&user), &mut user_read(kernel_va)),
        Err(Status::InvalidArguments)
    );
    let mut kernel_fault = PageFault::new(kernel_va, FaultCause::ABSENT);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut kernel_fault), Err(Status::NotFound));
}

#[test]
fn protect_narrows_installed_translations() {
    let h = harness(VmmConfig::default());
    let (user, _object, va) = mapped(&h, 3);
    for i in 0..3 {
        h.vmm.handle_fault(CPU, Some(&user), &mut user_write(va + i * PAGE_SIZE)).unwrap();
    }

    let middle = VirtualRange::new(va + PAGE_SIZE, PAGE_SIZE);
    user.protect(CPU, middle, MmuFlags::READABLE).unwrap();
    assert!(!user.table().query(va + PAGE_SIZE).unwrap().flags.contains(MmuFlags::WRITABLE));
    assert!(user.table().query(va).unwrap().flags.contains(MmuFlags::WRITABLE));

    let info = user.find_subregion(va + PAGE_SIZE).unwrap();
    assert_eq!(info.range, middle);
    assert_eq!(info.flags, MmuFlags::READABLE | MmuFlags::USER);
    assert!(matches!(info.kind, RegionKind::Mapping { offset, .. } if offset == PAGE_SIZE));

    let mut write = PageFault::new(va + PAGE_SIZE, FaultCause::WRITE | FaultCause::USER);
    assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut write), Err(Status::Unsupported));

    let beyond = VirtualRange::new(va + 2 * PAGE_SIZE, 2 * PAGE_SIZE);
    assert_eq!(user.protect(CPU, beyond, MmuFlags::READABLE), Err(Status::InvalidArguments));
}

#[test]
fn physical_windows_map_uncached() {
    let h = harness(VmmConfig::default());
    let user = h.vmm.create_user_aspace().unwrap();
    let base = PhysicalAddress::new(0xfee0_0000);
    let window = VmObjectPhysical::create(h.vmm.context(), base, 2 * PAGE_SIZE, VmoFlags::empty()).unwrap();
    let va = user
        .create_subregion(RegionRange::anywhere(2 * PAGE_SIZE), 0, MmuFlags::RW, Some(Backing::new(window, 0)))
        .unwrap();

    h.vmm.handle_fault(CPU, Some(&user), &mut user_write(va + PAGE_SIZE)).unwrap();
    let translation = user.table().query(va + PAGE_SIZE).unwrap();
    assert_eq!(translation.pa, base + PAGE_SIZE);
    assert!(translation.flags.contains(MmuFlags::UNCACHED));
}

#[test]
fn kernel_space_faults_in_kernel_mappings() {
    let h = harness(VmmConfig::default());
    let kernel = h.vmm.kernel_aspace();
    let object = VmObjectPaged::create(h.vmm.context(), Gaf::KERNEL, 2, VmoFlags::empty()).unwrap();
    let va = kernel
        .create_subregion(RegionRange::anywhere(2 * PAGE_SIZE), 0, MmuFlags::RW, Some(Backing::new(object, 0)))
        .unwrap();

    let mut fault = PageFault::new(va, FaultCause::ABSENT | FaultCause::WRITE);
    h.vmm.handle_fault(CPU, None, &mut fault).unwrap();
    let translation = kernel.table().query(va).unwrap();
    assert_eq!(translation.flags, MmuFlags::RW);
    assert_eq!(kernel.fork(CPU).err(), Some(Status::Unsupported));
}

#[test]
fn switching_loads_roots_with_their_tags() {
    let h = harness(VmmConfig::default());
    let a = h.vmm.create_user_aspace().unwrap();
    let b = h.vmm.create_user_aspace().unwrap();
    assert_ne!(a.table().tag(), b.table().tag());
    assert_ne!(a.table().tag(), AddressSpaceTag::KERNEL);

    AddressSpace::switch(CPU, None, &a);
    let load = h.mmu.last().unwrap();
    assert_eq!((load.cpu, load.root, load.tag), (CPU, a.table().root(), a.table().tag()));
    assert_eq!(a.users(), 1);

    AddressSpace::switch(CPU, Some(&a), &b);
    assert_eq!(h.mmu.last().unwrap().root, b.table().root());
    assert_eq!((a.users(), b.users()), (0, 1));

    let loads = h.mmu.loads().len();
    AddressSpace::switch(CPU, Some(&b), &b);
    assert_eq!(h.mmu.loads().len(), loads);

    assert_eq!(b.destroy(CPU), Err(Status::BadState));
    a.destroy(CPU).unwrap();
    assert_eq!(a.destroy(CPU), Err(Status::BadState));
}

#[test]
fn without_pcids_every_switch_flushes() {
    let h = harness(VmmConfig {
        pcid_enabled: false,
        ..VmmConfig::default()
    });
    let a = h.vmm.create_user_aspace().unwrap();
    let b = h.vmm.create_user_aspace().unwrap();
    assert_eq!(h.vmm.context().pcids_in_use(), 0);

    AddressSpace::switch(CPU, None, &a);
    AddressSpace::switch(CPU, Some(&a), &b);
    let load = h.mmu.last().unwrap();
    assert_eq!(load.tag, AddressSpaceTag::KERNEL);
    assert!(load.flush);
}

#[test]
fn decommit_and_destroy_remove_translations() {
    let h = harness(VmmConfig::default());
    let baseline = in_use(&h.pmm);
    {
        let (user, object, va) = mapped(&h, 4);
        for i in 0..4 {
            h.vmm.handle_fault(CPU, Some(&user), &mut user_write(va + i * PAGE_SIZE)).unwrap();
        }

        assert_eq!(object.decommit(CPU, 0, 2 * PAGE_SIZE), Ok(2));
        assert!(user.table().query(va).is_err());
        assert!(user.table().query(va + 2 * PAGE_SIZE).is_ok());

        user.destroy_subregion(CPU, va).unwrap();
        assert!(user.table().query(va + 2 * PAGE_SIZE).is_err());
        assert_eq!(user.find_subregion(va), Err(Status::NotFound));
        assert_eq!(object.as_paged().unwrap().mapping_count(), 0);
        assert_eq!(user.destroy_subregion(CPU, va), Err(Status::NotFound));

        user.destroy(CPU).unwrap();
        assert!(user.is_destroyed());
        assert_eq!(h.vmm.handle_fault(CPU, Some(&user), &mut user_read(va)), Err(Status::BadState));
    }
    for cpu in 0..4 {
        h.pmm.drain_cpu(CpuId::new(cpu));
    }
    assert_eq!(in_use(&h.pmm), baseline);
}
