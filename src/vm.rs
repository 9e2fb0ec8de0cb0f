use std::sync::{
	Arc, PoisonError, RwLock, RwLockWriteGuard,
	atomic::{AtomicUsize, Ordering},
};

use crate::{
	HypervisorResult, VmmError,
	backend::VmBackend,
	exit::{self, ExitAction},
	hypervisor::Capabilities,
	params::Params,
	serial::VmmSerial,
	slots::{MemoryFlags, MemorySlotTable, RegionInfo},
	stats::{CpuStats, VmExit},
	vcpu::{RegisterSnapshot, Registers, VcpuContext, VcpuExit},
};

#[cfg(target_os = "linux")]
pub type DefaultBackend = crate::os::KvmHypervisor;

/// Marks a VM as running while alive.
struct RunGuard<'a> {
	running: &'a AtomicUsize,
}

impl Drop for RunGuard<'_> {
	fn drop(&mut self) {
		self.running.fetch_sub(1, Ordering::SeqCst);
	}
}

/// A virtual machine: a guest physical address space and its vCPUs.
///
/// The VM can be shared between an execution thread driving
/// [`run_vcpu`](Self::run_vcpu) and control threads observing the vCPUs.
/// The memory layout is frozen while any vCPU runs.
pub struct VirtualMachine<B: VmBackend> {
	id: u64,
	capabilities: Capabilities,
	params: Params,
	slots: RwLock<MemorySlotTable<B>>,
	vcpus: RwLock<Vec<Arc<VcpuContext<B::Vcpu>>>>,
	/// Number of vCPUs currently inside a resume or run loop. Only
	/// incremented while holding the `slots` write lock.
	running: AtomicUsize,
	serial: VmmSerial,
	backend: Arc<B>,
}

impl<B: VmBackend> VirtualMachine<B> {
	pub(crate) fn new(
		id: u64,
		capabilities: Capabilities,
		backend: B,
		params: Params,
	) -> HypervisorResult<Self> {
		let serial = VmmSerial::from_params(&params.output)?;
		let backend = Arc::new(backend);
		Ok(Self {
			id,
			capabilities,
			slots: RwLock::new(MemorySlotTable::new(
				backend.clone(),
				capabilities.max_memory_slots,
				params.ksm,
			)),
			vcpus: RwLock::new(Vec::new()),
			running: AtomicUsize::new(0),
			serial,
			params,
			backend,
		})
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn capabilities(&self) -> Capabilities {
		self.capabilities
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst) > 0
	}

	#[cfg(test)]
	pub(crate) fn backend(&self) -> Arc<B> {
		self.backend.clone()
	}

	fn slots_for_update(&self) -> HypervisorResult<RwLockWriteGuard<'_, MemorySlotTable<B>>> {
		let slots = self.slots.write().unwrap();
		if self.is_running() {
			return Err(VmmError::VmIsRunning);
		}
		Ok(slots)
	}

	fn enter_running(&self) -> RunGuard<'_> {
		let _slots = self.slots.write().unwrap();
		self.running.fetch_add(1, Ordering::SeqCst);
		RunGuard {
			running: &self.running,
		}
	}

	/// Adds a region of `pages` pages behind the existing regions.
	pub fn add_region(
		&self,
		slot: u32,
		pages: usize,
		flags: MemoryFlags,
	) -> HypervisorResult<RegionInfo> {
		self.slots_for_update()?
			.add_region(slot, pages, flags)
			.map(|region| region.info())
	}

	/// Adds a region of `pages` pages at `guest_address`.
	pub fn add_region_at(
		&self,
		slot: u32,
		guest_address: u64,
		pages: usize,
		flags: MemoryFlags,
	) -> HypervisorResult<RegionInfo> {
		self.slots_for_update()?
			.add_region_at(slot, guest_address, pages, flags)
			.map(|region| region.info())
	}

	pub fn remove_region(&self, slot: u32) -> HypervisorResult<()> {
		self.slots_for_update()?.remove_region(slot)
	}

	pub fn region(&self, slot: u32) -> Option<RegionInfo> {
		self.slots.read().unwrap().region(slot).map(|r| r.info())
	}

	pub fn regions(&self) -> Vec<RegionInfo> {
		self.slots
			.read()
			.unwrap()
			.regions()
			.map(|r| r.info())
			.collect()
	}

	/// Copies `data` into guest memory at `address`. Host-side copies are
	/// serialized against each other; the guest itself is not stopped.
	pub fn copy_to_guest(&self, address: u64, data: &[u8]) -> HypervisorResult<()> {
		self.slots.write().unwrap().copy_to_guest(address, data)
	}

	pub fn copy_from_guest(&self, address: u64, buf: &mut [u8]) -> HypervisorResult<()> {
		self.slots.read().unwrap().copy_from_guest(address, buf)
	}

	/// Creates the next vCPU and returns its index.
	pub fn add_vcpu(&self) -> HypervisorResult<usize> {
		let mut vcpus = self.vcpus.write().unwrap();
		if vcpus.len() >= self.capabilities.max_vcpus {
			return Err(VmmError::VcpuLimitExceeded {
				max: self.capabilities.max_vcpus,
			});
		}

		let index = vcpus.len();
		let cpu = self
			.backend
			.create_vcpu(index)
			.map_err(|source| VmmError::SharedPageMapFailed { index, source })?;
		vcpus.push(Arc::new(VcpuContext::new(index, cpu)));
		debug!("VM {}: created vCPU {index}", self.id);
		Ok(index)
	}

	pub fn vcpu_count(&self) -> usize {
		self.vcpus.read().unwrap().len()
	}

	pub(crate) fn vcpu(&self, index: usize) -> HypervisorResult<Arc<VcpuContext<B::Vcpu>>> {
		self.vcpus
			.read()
			.unwrap()
			.get(index)
			.cloned()
			.ok_or(VmmError::InvalidVcpuIndex(index))
	}

	pub fn get_registers(&self, index: usize) -> HypervisorResult<Registers> {
		self.vcpu(index)?.registers()
	}

	pub fn set_registers(&self, index: usize, regs: &Registers) -> HypervisorResult<()> {
		self.vcpu(index)?.set_registers(regs)
	}

	/// Instruction pointer and accumulator of vCPU `index`. Waits for an
	/// in-flight resume of that vCPU to return.
	pub fn register_snapshot(&self, index: usize) -> HypervisorResult<RegisterSnapshot> {
		self.vcpu(index)?.snapshot()
	}

	pub fn enter_real_mode(&self, index: usize, entry_point: u64) -> HypervisorResult<()> {
		self.vcpu(index)?.enter_real_mode(entry_point)
	}

	/// Resumes vCPU `index` once and hands the resulting exit to `f`.
	pub fn resume<R>(
		&self,
		index: usize,
		f: impl FnOnce(VcpuExit<'_>) -> HypervisorResult<R>,
	) -> HypervisorResult<R> {
		let vcpu = self.vcpu(index)?;
		let _running = self.enter_running();
		vcpu.resume(f)
	}

	/// Runs vCPU `index` until the guest halts.
	///
	/// Returns the exit statistics if they are enabled. An exit that is not
	/// modeled stops the vCPU with [`VmmError::UnhandledExit`].
	pub fn run_vcpu(&self, index: usize) -> HypervisorResult<Option<CpuStats>> {
		let vcpu = self.vcpu(index)?;
		let _running = self.enter_running();

		let mut stats = self.params.stats.then(|| CpuStats::new(index));
		if let Some(stats) = stats.as_mut() {
			stats.start_time_measurement();
		}

		loop {
			match vcpu.resume(|exit| self.handle_exit(exit, stats.as_mut())) {
				Ok(false) => {}
				Ok(true) => break,
				Err(err @ VmmError::UnhandledExit { .. }) => {
					match vcpu.registers() {
						Ok(regs) => error!("vCPU {index} stopped, register state:\n{regs}"),
						Err(reg_err) => error!("vCPU {index} stopped: {reg_err}"),
					}
					return Err(err);
				}
				Err(err) => return Err(err),
			}
		}

		debug!("vCPU {index} halted");
		if let Some(stats) = stats.as_mut() {
			stats.stop_time_measurement();
		}
		Ok(stats)
	}

	/// Handles one exit; returns whether the guest halted.
	fn handle_exit(
		&self,
		exit: VcpuExit<'_>,
		stats: Option<&mut CpuStats>,
	) -> HypervisorResult<bool> {
		if let Some(stats) = stats {
			stats.increment_val(VmExit::from(&exit));
		}
		match exit::dispatch(&exit, self.params.console_port, self.params.io_port_policy)? {
			ExitAction::Continue => Ok(false),
			ExitAction::ConsoleWrite(buf) => {
				self.serial.output(buf)?;
				Ok(false)
			}
			ExitAction::Halt => Ok(true),
		}
	}

	/// Everything the guest wrote to the console, if the output goes to a buffer.
	pub fn console_output(&self) -> Option<Vec<u8>> {
		self.serial.buffered_output()
	}
}

impl<B: VmBackend> Drop for VirtualMachine<B> {
	fn drop(&mut self) {
		debug!("Drop VM {}", self.id);
		// vCPUs go first; the slot table then deregisters and unmaps the
		// memory, and the VM itself is closed with the last backend reference.
		self.vcpus
			.get_mut()
			.unwrap_or_else(PoisonError::into_inner)
			.clear();
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Barrier, thread};

	use nix::errno::Errno;

	use super::*;
	use crate::{
		backend::mock::{MockExit, MockHypervisor, MockVm},
		consts::{CONSOLE_PORT, EXIT_REASON_IO, PAGE_SIZE},
		hypervisor::Hypervisor,
		params::{IoPortPolicy, Output},
	};

	fn buffered_params() -> Params {
		Params {
			output: Output::Buffer,
			ksm: false,
			..Default::default()
		}
	}

	fn create_vm(max_vcpus: usize, params: Params) -> VirtualMachine<MockVm> {
		Hypervisor::with_backend(MockHypervisor {
			max_vcpus,
			max_memory_slots: 8,
			..Default::default()
		})
		.unwrap()
		.create_vm(0, params)
		.unwrap()
	}

	#[test]
	fn test_vcpu_limit() {
		let vm = create_vm(1, buffered_params());
		assert_eq!(vm.add_vcpu().unwrap(), 0);
		assert!(matches!(
			vm.add_vcpu(),
			Err(VmmError::VcpuLimitExceeded { max: 1 })
		));
		assert_eq!(vm.vcpu_count(), 1);
	}

	#[test]
	fn test_vcpu_indices_are_contiguous() {
		let vm = create_vm(4, buffered_params());
		for expected in 0..4 {
			assert_eq!(vm.add_vcpu().unwrap(), expected);
			assert_eq!(vm.vcpu(expected).unwrap().index(), expected);
		}
		assert!(matches!(vm.vcpu(4), Err(VmmError::InvalidVcpuIndex(4))));
		assert!(matches!(
			vm.get_registers(9),
			Err(VmmError::InvalidVcpuIndex(9))
		));
	}

	#[test]
	fn test_failed_vcpu_creation() {
		let vm = create_vm(2, buffered_params());
		vm.backend().fail_vcpu(Some(Errno::ENOMEM));
		assert!(matches!(
			vm.add_vcpu(),
			Err(VmmError::SharedPageMapFailed { index: 0, .. })
		));
		assert_eq!(vm.vcpu_count(), 0);

		vm.backend().fail_vcpu(None);
		assert_eq!(vm.add_vcpu().unwrap(), 0);
	}

	#[test]
	fn test_region_limit_allocates_nothing() {
		let vm = create_vm(1, buffered_params());
		assert!(matches!(
			vm.add_region(8, 1, MemoryFlags::empty()),
			Err(VmmError::SlotLimitExceeded { slot: 8, max: 8 })
		));
		assert!(vm.regions().is_empty());
		assert!(vm.backend().registered_slots().is_empty());
	}

	#[test]
	fn test_append_policy() {
		let vm = create_vm(1, buffered_params());
		let first = vm.add_region(0, 2, MemoryFlags::empty()).unwrap();
		assert_eq!(first.guest_address, 0);
		assert_eq!(first.size, 2 * PAGE_SIZE);
		let second = vm.add_region(1, 1, MemoryFlags::empty()).unwrap();
		assert_eq!(second.guest_address, 8192);
		assert_eq!(vm.region(1), Some(second));
	}

	#[test]
	fn test_console_then_halt() {
		let vm = create_vm(1, Params {
			stats: true,
			..buffered_params()
		});
		vm.backend().script_exits(vec![
			MockExit::Out {
				port: CONSOLE_PORT,
				data: vec![0x41],
			},
			MockExit::Halt,
		]);
		vm.add_region(0, 1, MemoryFlags::empty()).unwrap();
		vm.add_vcpu().unwrap();
		vm.enter_real_mode(0, 0x1000).unwrap();

		let stats = vm.run_vcpu(0).unwrap().unwrap();
		assert_eq!(vm.console_output().unwrap(), vec![0x41]);
		assert_eq!(stats.count(VmExit::Halt), 1);
		assert_eq!(stats.count(VmExit::PortOut(CONSOLE_PORT)), 1);
		assert_eq!(vm.backend().resumes(), 2);
		assert!(!vm.is_running());

		// the mock advances rip once per resume
		assert_eq!(vm.register_snapshot(0).unwrap().rip, 0x1002);
	}

	#[test]
	fn test_unhandled_exit_stops_the_loop() {
		let vm = create_vm(1, buffered_params());
		vm.backend().script_exits(vec![
			MockExit::Out {
				port: CONSOLE_PORT,
				data: b"ok".to_vec(),
			},
			MockExit::Other(8),
			MockExit::Halt,
		]);
		vm.add_vcpu().unwrap();

		assert!(matches!(
			vm.run_vcpu(0),
			Err(VmmError::UnhandledExit { code: 8 })
		));
		assert_eq!(vm.backend().resumes(), 2);
		assert_eq!(vm.console_output().unwrap(), b"ok");
		assert!(!vm.is_running());
	}

	#[test]
	fn test_unrelated_port_policy() {
		let exits = vec![
			MockExit::Out {
				port: 0x80,
				data: vec![0x12],
			},
			MockExit::In { port: 0x64, size: 1 },
			MockExit::Halt,
		];

		let vm = create_vm(1, buffered_params());
		vm.backend().script_exits(exits.clone());
		vm.add_vcpu().unwrap();
		assert!(matches!(
			vm.run_vcpu(0),
			Err(VmmError::UnhandledExit {
				code: EXIT_REASON_IO
			})
		));
		assert_eq!(vm.backend().resumes(), 1);

		let vm = create_vm(1, Params {
			io_port_policy: IoPortPolicy::Ignore,
			..buffered_params()
		});
		vm.backend().script_exits(exits);
		vm.add_vcpu().unwrap();
		assert!(vm.run_vcpu(0).unwrap().is_none());
		assert_eq!(vm.backend().resumes(), 3);
		assert!(vm.console_output().unwrap().is_empty());
	}

	#[test]
	fn test_resume_failure() {
		let vm = create_vm(1, buffered_params());
		vm.backend()
			.script_exits(vec![MockExit::Fail(Errno::EFAULT)]);
		vm.add_vcpu().unwrap();
		assert!(matches!(
			vm.run_vcpu(0),
			Err(VmmError::ResumeFailed {
				index: 0,
				source: Errno::EFAULT
			})
		));
	}

	#[test]
	fn test_single_resume() {
		let vm = create_vm(1, buffered_params());
		vm.backend().script_exits(vec![MockExit::Other(17)]);
		vm.add_vcpu().unwrap();
		let code = vm.resume(0, |exit| Ok(exit.reason_code())).unwrap();
		assert_eq!(code, 17);
		assert!(!vm.is_running());
	}

	#[test]
	fn test_layout_is_frozen_while_running() {
		let vm = create_vm(1, buffered_params());
		vm.add_region(0, 1, MemoryFlags::empty()).unwrap();
		vm.add_vcpu().unwrap();
		vm.backend().script_exits(vec![MockExit::Halt]);

		let running = vm.enter_running();
		assert!(vm.is_running());
		assert!(matches!(
			vm.add_region(1, 1, MemoryFlags::empty()),
			Err(VmmError::VmIsRunning)
		));
		assert!(matches!(
			vm.add_region_at(1, 0x10000, 1, MemoryFlags::empty()),
			Err(VmmError::VmIsRunning)
		));
		assert!(matches!(vm.remove_region(0), Err(VmmError::VmIsRunning)));
		assert_eq!(vm.regions().len(), 1);

		// copying data is not a layout change
		vm.copy_to_guest(0x10, &[1, 2, 3]).unwrap();
		drop(running);

		vm.remove_region(0).unwrap();
		assert!(vm.backend().registered_slots().is_empty());
	}

	#[test]
	fn test_copy_to_guest_roundtrip() {
		let vm = create_vm(1, buffered_params());
		vm.add_region(0, 1, MemoryFlags::empty()).unwrap();
		vm.add_region(1, 1, MemoryFlags::empty()).unwrap();

		let code = [0xba, 0xf8, 0x03, 0xb0, 0x41, 0xee, 0xf4];
		vm.copy_to_guest(0x1000, &code).unwrap();
		let mut buf = [0; 7];
		vm.copy_from_guest(0x1000, &mut buf).unwrap();
		assert_eq!(buf, code);

		assert!(matches!(
			vm.copy_to_guest(0x2000, &code),
			Err(VmmError::OutOfSlotBounds { address: 0x2000, len: 7 })
		));
	}

	#[test]
	fn test_concurrent_register_reads() {
		let exits: Vec<_> = (0..500)
			.map(|_| MockExit::Out {
				port: CONSOLE_PORT,
				data: vec![b'.'],
			})
			.chain([MockExit::Halt])
			.collect();
		let vm = create_vm(1, buffered_params());
		vm.backend().script_exits(exits);
		vm.add_vcpu().unwrap();
		vm.enter_real_mode(0, 0).unwrap();

		let barrier = Barrier::new(2);
		thread::scope(|s| {
			let reader = s.spawn(|| {
				barrier.wait();
				let mut last = 0;
				while vm.is_running() || last == 0 {
					let rip = vm.register_snapshot(0).unwrap().rip;
					assert!(rip >= last, "rip went backwards: {rip} < {last}");
					last = rip;
					if rip == 501 {
						break;
					}
				}
			});
			barrier.wait();
			vm.run_vcpu(0).unwrap();
			reader.join().unwrap();
		});

		assert_eq!(vm.console_output().unwrap().len(), 500);
		assert_eq!(vm.get_registers(0).unwrap().rip, 501);
	}

	#[test]
	fn test_drop_releases_vcpus_and_regions() {
		let vm = create_vm(2, buffered_params());
		vm.add_region(0, 1, MemoryFlags::empty()).unwrap();
		vm.add_region(3, 1, MemoryFlags::empty()).unwrap();
		vm.add_vcpu().unwrap();
		vm.add_vcpu().unwrap();

		let backend = vm.backend();
		assert_eq!(backend.registered_slots(), vec![0, 3]);
		assert_eq!(backend.live_vcpus(), 2);

		drop(vm);
		assert!(backend.registered_slots().is_empty());
		assert_eq!(backend.live_vcpus(), 0);
	}

	#[test]
	fn test_concurrent_copies_do_not_interleave() {
		let vm = create_vm(1, buffered_params());
		vm.add_region(0, 1, MemoryFlags::empty()).unwrap();

		thread::scope(|s| {
			for pattern in [0xaa, 0x55] {
				let vm = &vm;
				s.spawn(move || {
					let data = [pattern; PAGE_SIZE];
					for _ in 0..200 {
						vm.copy_to_guest(0, &data).unwrap();
					}
				});
			}
			s.spawn(|| {
				let mut buf = [0; PAGE_SIZE];
				for _ in 0..200 {
					vm.copy_from_guest(0, &mut buf).unwrap();
					assert!(buf.iter().all(|b| *b == buf[0]), "torn copy observed");
				}
			});
		});
	}
}
