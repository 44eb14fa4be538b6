//! # Memory Subsystem Configuration and Boot Interface
//!
//! This crate holds the vocabulary shared by every layer of the memory core:
//! layout constants, the boot-time inputs the physical memory manager consumes,
//! the uniform [`Status`](status::Status) result code and the always-on
//! invariant machinery.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time configuration of the virtual address space and the allocator:
//! * **Address Space Layout**: user and kernel ranges, HHDM base
//! * **Allocator Geometry**: maximum buddy order, section size, zone limits
//! * **Topology Limits**: maximum NUMA nodes and CPUs
//! * **Per-CPU Cache Tuning**: high watermark and batch size
//!
//! ### Boot Inputs ([`boot`], [`topology`])
//! Plain data handed over once before PMM init:
//! * **Boot Memory Map**: `(base, size, kind, node)` regions
//! * **NUMA Feed**: memory and CPU affinities plus a distance matrix
//!
//! ### Status ([`status`])
//! The single error channel returned by every public operation of the core.
//!
//! ### Fatal Invariants ([`fatal`])
//! Corruption of allocator bookkeeping is not recoverable. [`invariant!`]
//! checks are compiled into every build and divert to a replaceable hook.
//!
//! ```text
//! Virtual Address Space Layout (48-bit, 4-level paging):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   null guard page (never mapped)│
//! USER_ASPACE_BASE      ├─────────────────────────────────┤ 0x0000_0000_0000_1000
//!                       │         User Space              │
//! USER_ASPACE_END       ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! KERNEL_ASPACE_BASE    ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   kernel regions                │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_F000 └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod boot;
pub mod fatal;
pub mod memory;
pub mod status;
pub mod topology;

pub use status::{Result, Status};
pub use topology::{CpuId, NodeId};
