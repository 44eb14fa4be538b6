//! # Per-CPU Frame Cache
//!
//! Order-0 allocations and frees on a CPU's home node go through a small
//! per-CPU stack of frames, one per zone. The zone lock is only taken when a
//! stack runs dry or overflows, and then once per batch:
//!
//! ```text
//!            alloc(0)                        free(0)
//!               │                               │
//!   ┌───────────▼──────────┐        ┌───────────▼──────────┐
//!   │ empty? refill BATCH  │        │ len > HIGH? drain    │
//!   │ from the zone        │        │ BATCH to the zone    │
//!   └───────────┬──────────┘        └──────────────────────┘
//!               ▼
//!            pop top
//! ```
//!
//! Cached frames carry [`FrameState::CACHED`] and no reference. They count
//! as allocated in their zone.

use crate::frame::{FrameRole, FrameState};
use crate::memory_model::MemoryModel;
use crate::node::Node;
use crate::zone::{NR_ZONE_TYPES, ZoneType};
use alloc::vec::Vec;
use kernel_info::memory::{PCP_BATCH, PCP_HIGH};
use kernel_info::fatal::fatal;
use kernel_info::{CpuId, invariant};
use kernel_memory_addresses::Pfn;
use kernel_sync::{PerCpu, SpinLock};

struct PcpLists {
    lists: [Vec<Pfn>; NR_ZONE_TYPES],
}

impl PcpLists {
    fn new() -> Self {
        Self {
            lists: core::array::from_fn(|_| Vec::with_capacity(PCP_HIGH + 1)),
        }
    }
}

pub(crate) struct PcpCache {
    slots: PerCpu<SpinLock<PcpLists>>,
}

impl PcpCache {
    pub(crate) fn new(cpus: usize) -> Self {
        Self {
            slots: PerCpu::new_with(cpus, |_| SpinLock::new(PcpLists::new())),
        }
    }

    pub(crate) fn covers(&self, cpu: CpuId) -> bool {
        self.slots.get(cpu).is_some()
    }

    /// Pop a frame of zone `zone` of `node` for `cpu`, refilling if empty.
    /// The returned frame is no longer flagged cached.
    pub(crate) fn alloc(
        &self,
        cpu: CpuId,
        node: &Node,
        model: &MemoryModel,
        zone: ZoneType,
        required: bool,
    ) -> Option<Pfn> {
        let slot = self.slots.get(cpu)?;
        let mut lists = slot.lock();
        let list = &mut lists.lists[zone.index()];
        if list.is_empty() {
            node.zone(zone).alloc_batch(model, PCP_BATCH, required, list);
        }
        let pfn = list.pop()?;
        drop(lists);

        node.zone(zone).uncache(1);
        if let Some(frame) = model.frame(pfn) {
            frame.remove_state(FrameState::CACHED);
        }
        Some(pfn)
    }

    /// Park a released order-0 frame, draining a batch on overflow.
    pub(crate) fn free(&self, cpu: CpuId, node: &Node, model: &MemoryModel, pfn: Pfn) {
        let (Some(slot), Some(frame)) = (self.slots.get(cpu), model.frame(pfn)) else {
            fatal(format_args!("{pfn:?} freed into missing cache of {cpu:?}"));
        };
        frame.check_releasable();
        let zone = frame.zone_type();
        invariant!(frame.node() == node.id(), "{pfn:?} cached on a foreign node");
        frame.reset_state(FrameState::CACHED);
        frame.set_role(FrameRole::Pmm);

        let mut lists = slot.lock();
        let list = &mut lists.lists[zone.index()];
        list.push(pfn);
        node.zone(zone).recache(1);
        if list.len() > PCP_HIGH {
            // The bottom of the stack is the coldest.
            node.zone(zone).free_batch(model, list.drain(..PCP_BATCH));
        }
    }

    /// Return every frame cached on `cpu` to its zone.
    pub(crate) fn drain(&self, cpu: CpuId, node: &Node, model: &MemoryModel) -> usize {
        let Some(slot) = self.slots.get(cpu) else {
            return 0;
        };
        let mut lists = slot.lock();
        let mut drained = 0;
        for zone in ZoneType::ALL {
            let list = &mut lists.lists[zone.index()];
            if !list.is_empty() {
                drained += node.zone(zone).free_batch(model, list.drain(..));
            }
        }
        drained
    }

    /// Frames currently cached on `cpu`.
    pub(crate) fn cached(&self, cpu: CpuId) -> usize {
        self.slots
            .get(cpu)
            .map_or(0, |slot| slot.lock().lists.iter().map(Vec::len).sum())
    }

    pub(crate) fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.slots.iter().map(|(cpu, _)| cpu)
    }
}
