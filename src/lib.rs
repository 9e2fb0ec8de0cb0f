#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate log;

pub mod backend;
pub mod consts;
mod error;
pub mod exit;
pub mod hypervisor;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as os;
mod mem;
pub mod params;
mod serial;
pub mod slots;
pub mod stats;
pub mod vcpu;
pub mod vm;

pub use error::{HypervisorResult, VmmError};
pub use hypervisor::{Capabilities, Capability, Hypervisor};
pub use vm::VirtualMachine;
