//! KVM backend.

pub mod x86_64 {
	pub mod kvm_cpu;
}

use std::{mem::ManuallyDrop, os::fd::AsRawFd};

use kvm_bindings::{
	KVM_CAP_MAX_VCPUS, KVM_CAP_NR_MEMSLOTS, KVM_CAP_NR_VCPUS, kvm_userspace_memory_region,
};
use kvm_ioctls::{Kvm, VmFd};
use nix::errno::Errno;

use crate::{
	backend::{VirtualizationBackend, VmBackend},
	hypervisor::Capability,
	linux::x86_64::kvm_cpu::KvmCpu,
	slots::MemoryRegion,
};

pub type HypervisorError = vmm_sys_util::errno::Error;

/// Slot count KVM guarantees when `KVM_CAP_NR_MEMSLOTS` is not reported.
const KVM_DEFAULT_MEMSLOTS: usize = 32;
/// vCPU count KVM guarantees when neither vCPU capability is reported.
const KVM_DEFAULT_VCPUS: usize = 4;

pub(crate) fn errno(err: HypervisorError) -> Errno {
	Errno::from_raw(err.errno())
}

/// Handle to `/dev/kvm`.
pub struct KvmHypervisor {
	kvm: ManuallyDrop<Kvm>,
}

impl KvmHypervisor {
	fn check_extension(&self, cap: u32) -> nix::Result<usize> {
		let ret = self.kvm.check_extension_raw(cap.into());
		if ret < 0 {
			return Err(Errno::last());
		}
		Ok(ret as usize)
	}
}

impl VirtualizationBackend for KvmHypervisor {
	type Vm = KvmVm;
	const NAME: &str = "KVM";

	fn open() -> nix::Result<Self> {
		let kvm = Kvm::new().map_err(errno)?;
		Ok(Self {
			kvm: ManuallyDrop::new(kvm),
		})
	}

	fn query_capability(&self, cap: Capability) -> nix::Result<usize> {
		match cap {
			Capability::MaxVcpus => match self.check_extension(KVM_CAP_MAX_VCPUS)? {
				0 => match self.check_extension(KVM_CAP_NR_VCPUS)? {
					0 => Ok(KVM_DEFAULT_VCPUS),
					n => Ok(n),
				},
				n => Ok(n),
			},
			Capability::MaxMemorySlots => match self.check_extension(KVM_CAP_NR_MEMSLOTS)? {
				0 => Ok(KVM_DEFAULT_MEMSLOTS),
				n => Ok(n),
			},
			Capability::VcpuMmapSize => self.kvm.get_vcpu_mmap_size().map_err(errno),
		}
	}

	fn create_vm(&self, id: u64) -> nix::Result<KvmVm> {
		let vm_fd = self.kvm.create_vm_with_type(id).map_err(errno)?;
		Ok(KvmVm { vm_fd })
	}
}

impl Drop for KvmHypervisor {
	fn drop(&mut self) {
		// SAFETY: the descriptor is owned by `self.kvm`, which is never used again.
		let ret = unsafe { libc::close(self.kvm.as_raw_fd()) };
		if ret < 0 {
			let err = Errno::last();
			error!("Unable to close /dev/kvm: {err}");
			panic!("Unable to close /dev/kvm: {err}");
		}
	}
}

/// A KVM virtual machine.
pub struct KvmVm {
	vm_fd: VmFd,
}

impl KvmVm {
	fn set_user_memory_region(&self, region: &MemoryRegion, memory_size: u64) -> nix::Result<()> {
		let kvm_mem = kvm_userspace_memory_region {
			slot: region.slot(),
			flags: region.flags().bits(),
			guest_phys_addr: region.guest_address(),
			memory_size,
			userspace_addr: region.host_address(),
		};
		// SAFETY: the host mapping of `region` outlives its registration.
		unsafe { self.vm_fd.set_user_memory_region(kvm_mem) }.map_err(errno)
	}
}

impl VmBackend for KvmVm {
	type Vcpu = KvmCpu;

	fn register_region(&self, region: &MemoryRegion) -> nix::Result<()> {
		self.set_user_memory_region(region, region.size() as u64)
	}

	fn unregister_region(&self, region: &MemoryRegion) -> nix::Result<()> {
		// a slot of size zero deletes it
		self.set_user_memory_region(region, 0)
	}

	fn create_vcpu(&self, index: usize) -> nix::Result<KvmCpu> {
		let vcpu = self.vm_fd.create_vcpu(index as u64).map_err(errno)?;
		Ok(KvmCpu::new(index, vcpu))
	}
}
