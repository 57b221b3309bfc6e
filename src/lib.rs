#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod error;
mod hal;
mod mem;
pub(crate) mod msr;
pub(crate) mod regs;
mod vmx;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

pub use error::{Result, VmxError};
pub use hal::{Hal, HostPhysAddr, HostVirtAddr};
pub use regs::{GeneralRegisters, GeneralRegistersDiff};

pub use vmx::*;
