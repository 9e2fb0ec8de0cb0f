//! The interface to the kernel virtualization subsystem.

use crate::{
	hypervisor::Capability,
	slots::MemoryRegion,
	vcpu::{Registers, VcpuExit},
};

/// Trait marking a interface for creating (accelerated) VMs.
pub trait VirtualizationBackend: Sized {
	type Vm: VmBackend;
	const NAME: &str;

	/// Opens the subsystem.
	fn open() -> nix::Result<Self>;

	fn query_capability(&self, cap: Capability) -> nix::Result<usize>;

	/// Creates a VM of the given machine type.
	fn create_vm(&self, id: u64) -> nix::Result<Self::Vm>;
}

/// Kernel side of one VM.
pub trait VmBackend: Send + Sync {
	type Vcpu: VcpuBackend;

	/// Maps `region` into the guest physical address space.
	fn register_region(&self, region: &MemoryRegion) -> nix::Result<()>;

	/// Removes `region` from the guest physical address space. The host
	/// mapping must stay valid until this returns.
	fn unregister_region(&self, region: &MemoryRegion) -> nix::Result<()>;

	/// Creates the vCPU `index` together with its shared control structure.
	/// Nothing is left behind on failure.
	fn create_vcpu(&self, index: usize) -> nix::Result<Self::Vcpu>;
}

/// Functionality a virtual CPU backend must provide.
pub trait VcpuBackend: Send {
	fn registers(&self) -> nix::Result<Registers>;

	fn set_registers(&mut self, regs: &Registers) -> nix::Result<()>;

	/// Switches to real mode with a flat code segment and jumps to `entry_point`.
	fn enter_real_mode(&mut self, entry_point: u64) -> nix::Result<()>;

	/// Runs the guest until it exits to user space.
	fn resume(&mut self) -> nix::Result<VcpuExit<'_>>;
}
