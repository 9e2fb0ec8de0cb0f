use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group};
use tinyvmmlib::{
	backend::{VcpuBackend, VmBackend},
	consts::{CONSOLE_PORT, PAGE_SIZE},
	exit::dispatch,
	params::IoPortPolicy,
	slots::{MemoryFlags, MemoryRegion, MemorySlotTable},
	vcpu::{IoDirection, PortIo, Registers, VcpuExit},
};

/// A VM that accepts every region and has no vCPUs.
struct NullVm;

struct NullVcpu;

impl VcpuBackend for NullVcpu {
	fn registers(&self) -> nix::Result<Registers> {
		Ok(Registers::default())
	}

	fn set_registers(&mut self, _regs: &Registers) -> nix::Result<()> {
		Ok(())
	}

	fn enter_real_mode(&mut self, _entry_point: u64) -> nix::Result<()> {
		Ok(())
	}

	fn resume(&mut self) -> nix::Result<VcpuExit<'_>> {
		Ok(VcpuExit::Halt)
	}
}

impl VmBackend for NullVm {
	type Vcpu = NullVcpu;

	fn register_region(&self, _region: &MemoryRegion) -> nix::Result<()> {
		Ok(())
	}

	fn unregister_region(&self, _region: &MemoryRegion) -> nix::Result<()> {
		Ok(())
	}

	fn create_vcpu(&self, _index: usize) -> nix::Result<NullVcpu> {
		Ok(NullVcpu)
	}
}

pub fn dispatch_console_write(c: &mut Criterion) {
	let data = [b'A'];
	let exit = VcpuExit::PortIo(PortIo {
		direction: IoDirection::Out,
		port: CONSOLE_PORT,
		size: 1,
		count: 1,
		data: &data,
	});

	c.bench_function("exit::dispatch(console write)", |b| {
		b.iter(|| dispatch(black_box(&exit), CONSOLE_PORT, IoPortPolicy::Fatal).unwrap())
	});
	c.bench_function("exit::dispatch(halt)", |b| {
		b.iter(|| dispatch(black_box(&VcpuExit::Halt), CONSOLE_PORT, IoPortPolicy::Fatal).unwrap())
	});
}

pub fn translate_address(c: &mut Criterion) {
	let mut slots = MemorySlotTable::new(Arc::new(NullVm), 32, false);
	for slot in 0..16 {
		slots.add_region(slot, 16, MemoryFlags::empty()).unwrap();
	}
	let last = 15 * 16 * PAGE_SIZE as u64 + 0x123;

	c.bench_function("MemorySlotTable::translate(16 regions)", |b| {
		b.iter(|| slots.translate(black_box(last), 8).unwrap().1)
	});
}

criterion_group!(dispatch_benchmark_group, dispatch_console_write);
criterion_group!(translate_benchmark_group, translate_address);
