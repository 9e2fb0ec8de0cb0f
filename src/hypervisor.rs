use crate::{
	HypervisorResult, VmmError, backend::VirtualizationBackend, params::Params,
	vm::VirtualMachine,
};

/// Capabilities of the hypervisor subsystem the VMM depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
	/// Maximum number of vCPUs per VM.
	MaxVcpus,
	/// Maximum number of memory slots per VM.
	MaxMemorySlots,
	/// Size of the per-vCPU shared control structure in bytes.
	VcpuMmapSize,
}

/// Snapshot of the capabilities, taken when the hypervisor is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
	pub max_vcpus: usize,
	pub max_memory_slots: usize,
	pub vcpu_mmap_size: usize,
}

/// Handle to the hypervisor subsystem.
pub struct Hypervisor<B: VirtualizationBackend> {
	backend: B,
	capabilities: Capabilities,
}

impl<B: VirtualizationBackend> Hypervisor<B> {
	/// Opens the subsystem and reads its capabilities.
	pub fn open() -> HypervisorResult<Self> {
		let backend = B::open().map_err(VmmError::SubsystemUnavailable)?;
		Self::with_backend(backend)
	}

	pub fn with_backend(backend: B) -> HypervisorResult<Self> {
		let query = |cap| {
			backend
				.query_capability(cap)
				.map_err(|source| VmmError::CapabilityQueryFailed { cap, source })
		};
		let capabilities = Capabilities {
			max_vcpus: query(Capability::MaxVcpus)?,
			max_memory_slots: query(Capability::MaxMemorySlots)?,
			vcpu_mmap_size: query(Capability::VcpuMmapSize)?,
		};
		debug!("{} capabilities: {capabilities:?}", B::NAME);

		Ok(Self {
			backend,
			capabilities,
		})
	}

	pub fn capabilities(&self) -> Capabilities {
		self.capabilities
	}

	/// Asks the subsystem for `cap`, bypassing the snapshot.
	pub fn query_capability(&self, cap: Capability) -> HypervisorResult<usize> {
		self.backend
			.query_capability(cap)
			.map_err(|source| VmmError::CapabilityQueryFailed { cap, source })
	}

	/// Creates a VM of machine type `id`.
	pub fn create_vm(&self, id: u64, params: Params) -> HypervisorResult<VirtualMachine<B::Vm>> {
		let vm = self
			.backend
			.create_vm(id)
			.map_err(|source| VmmError::CreationFailed { id, source })?;
		debug!("Created VM {id}");
		VirtualMachine::new(id, self.capabilities, vm, params)
	}
}
