//! Demand paging for KidneyOS user processes.
//!
//! The pieces are layered bottom-up: the swap space in [`swapping`], the
//! supplemental page table, frame table and fault handler in [`mem`], and the
//! [`vm::Vm`] facade that the rest of the kernel calls into on page faults,
//! timer ticks and process exit.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod threading;
pub mod timer;
pub mod vm;

pub use config::VmConfig;
pub use mem::page_fault::{PageFault, PageFaultError};
pub use vm::Vm;
