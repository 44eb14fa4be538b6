//! # Physical Memory Manager
//!
//! This crate owns every physical page of the machine. It tracks each frame
//! with a descriptor, groups frames into zones per NUMA node, and hands out
//! naturally aligned power-of-two blocks through a binary buddy allocator
//! with a per-CPU cache in front of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Pmm context                      │
//! │    • Gaf routing: home node first, then fallback    │
//! │    • Reference helpers: get_frame / put_frame       │
//! └──────────┬───────────────────────────┬──────────────┘
//!            │ order 0, home node        │ everything else
//! ┌──────────▼──────────┐                │
//! │   Per-CPU cache     │                │
//! │  • high 64, batch 16│                │
//! └──────────┬──────────┘                │
//!            │ one zone lock per batch   │
//! ┌──────────▼───────────────────────────▼──────────────┐
//! │          Node ─► Zone[DMA, DMA32, Normal]           │
//! │    • buddy free lists, orders 0..=10                │
//! │    • watermarks: critical / moderate / sufficient   │
//! └──────────┬──────────────────────────────────────────┘
//!            │ PFN-indexed links
//! ┌──────────▼──────────────────────────────────────────┐
//! │     Memory model: sparse sections of descriptors    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame Descriptors ([`frame`], [`memory_model`])
//! One [`Frame`] per attached page: role, zone and node, state flags,
//! atomic reference and mapping counts, and a free-list link that stores
//! PFNs rather than pointers. Descriptors live in 128 MiB sections created
//! the first time a range inside them is attached, and are never destroyed.
//!
//! ### Zones and Nodes ([`zone`], [`node`])
//! * **Attach**: a range is split at zone limits, then into maximal aligned
//!   blocks
//! * **Alloc**: first non-empty order at or above the request, split down
//! * **Free**: coalesce with the buddy while it is free, same order, same zone
//! * **Nodes**: zones tried Normal → DMA32 → DMA, capped by the [`Gaf`] hint
//!
//! ### Allocation Domain ([`gaf`])
//! [`Gaf`] selects zones, node fallback and whether the critical watermark
//! may be crossed. `NEVER_FAIL` is rejected: there is no reclaim to wait on.
//!
//! ### Page-Table Plumbing ([`page_source`], [`phys_mapper`])
//! [`PmmPageSource`] backs [`kernel_vmem::PageTable`]s with PMM frames and
//! keeps `mapped_count` in step with leaf entries. [`HhdmPhysMapper`]
//! reaches physical memory through the higher-half direct map.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{Gaf, Pmm};
//! use kernel_info::CpuId;
//! use kernel_info::boot::BootMemoryRegion;
//! use kernel_info::topology::NumaTopology;
//!
//! let map = [BootMemoryRegion::usable(0, 8 << 20)];
//! let pmm = Pmm::new(&NumaTopology::uniform(), &map).unwrap();
//!
//! let cpu = CpuId::new(0);
//! let block = pmm.alloc(cpu, Gaf::KERNEL, 2).unwrap();
//! assert!(block.is_aligned(2));
//! pmm.free(cpu, block, 2);
//! ```
//!
//! ## Locking
//!
//! | Data | Guard |
//! |------|-------|
//! | zone free lists | per-zone `SpinLock`, held across split/coalesce or one batch |
//! | per-CPU cache | its slot's `SpinLock`; contended only by draining |
//! | reference / mapped counts | atomics |
//!
//! A cache slot lock is always taken before a zone lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod error;
pub mod frame;
mod free_list;
pub mod gaf;
pub mod memory_model;
pub mod node;
pub mod page_source;
mod pcp_cache;
pub mod phys_mapper;
mod pmm;
pub mod zone;

pub use error::AttachError;
pub use frame::{Frame, FrameKind, FrameRole, FrameState};
pub use gaf::Gaf;
pub use memory_model::MemoryModel;
pub use node::{Node, NodeMask, NodeStates};
pub use page_source::PmmPageSource;
pub use phys_mapper::HhdmPhysMapper;
pub use pmm::Pmm;
pub use zone::{Watermark, Zone, ZoneStats, ZoneType};
