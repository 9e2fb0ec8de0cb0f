use std::slice;

use ::x86_64::registers::control::Cr0Flags;
use kvm_bindings::{KVM_EXIT_HLT, KVM_EXIT_IO, kvm_regs, kvm_run};
use kvm_ioctls::VcpuFd;

use crate::{
	backend::VcpuBackend,
	consts::{IO_DIRECTION_IN, IO_DIRECTION_OUT, RFLAGS_RESERVED},
	linux::errno,
	vcpu::{IoDirection, PortIo, Registers, VcpuExit},
};

impl From<kvm_regs> for Registers {
	fn from(regs: kvm_regs) -> Self {
		Self {
			rax: regs.rax,
			rbx: regs.rbx,
			rcx: regs.rcx,
			rdx: regs.rdx,
			rsi: regs.rsi,
			rdi: regs.rdi,
			rsp: regs.rsp,
			rbp: regs.rbp,
			r8: regs.r8,
			r9: regs.r9,
			r10: regs.r10,
			r11: regs.r11,
			r12: regs.r12,
			r13: regs.r13,
			r14: regs.r14,
			r15: regs.r15,
			rip: regs.rip,
			rflags: regs.rflags,
		}
	}
}

impl From<&Registers> for kvm_regs {
	fn from(regs: &Registers) -> Self {
		Self {
			rax: regs.rax,
			rbx: regs.rbx,
			rcx: regs.rcx,
			rdx: regs.rdx,
			rsi: regs.rsi,
			rdi: regs.rdi,
			rsp: regs.rsp,
			rbp: regs.rbp,
			r8: regs.r8,
			r9: regs.r9,
			r10: regs.r10,
			r11: regs.r11,
			r12: regs.r12,
			r13: regs.r13,
			r14: regs.r14,
			r15: regs.r15,
			rip: regs.rip,
			rflags: regs.rflags,
		}
	}
}

/// A KVM vCPU together with its mapped `kvm_run` structure.
pub struct KvmCpu {
	id: usize,
	vcpu: VcpuFd,
}

impl KvmCpu {
	pub(crate) fn new(id: usize, vcpu: VcpuFd) -> Self {
		Self { id, vcpu }
	}

	/// Decodes the exit the last `KVM_RUN` left in `kvm_run`.
	fn decode_exit(run: &kvm_run) -> VcpuExit<'_> {
		match run.exit_reason {
			KVM_EXIT_HLT => VcpuExit::Halt,
			KVM_EXIT_IO => {
				// SAFETY: `io` is the active union member for KVM_EXIT_IO.
				let io = unsafe { run.__bindgen_anon_1.io };
				let direction = match io.direction {
					IO_DIRECTION_IN => IoDirection::In,
					IO_DIRECTION_OUT => IoDirection::Out,
					_ => return VcpuExit::Other(KVM_EXIT_IO),
				};
				let len = usize::from(io.size) * io.count as usize;
				// SAFETY: KVM places the payload at `data_offset` inside the
				// kvm_run mapping, which stays valid while `run` is borrowed.
				let data = unsafe {
					let base = (run as *const kvm_run).cast::<u8>();
					slice::from_raw_parts(base.add(io.data_offset as usize), len)
				};
				VcpuExit::PortIo(PortIo {
					direction,
					port: io.port,
					size: io.size,
					count: io.count,
					data,
				})
			}
			reason => VcpuExit::Other(reason),
		}
	}
}

impl VcpuBackend for KvmCpu {
	fn registers(&self) -> nix::Result<Registers> {
		self.vcpu.get_regs().map(Registers::from).map_err(errno)
	}

	fn set_registers(&mut self, regs: &Registers) -> nix::Result<()> {
		self.vcpu.set_regs(&regs.into()).map_err(errno)
	}

	fn enter_real_mode(&mut self, entry_point: u64) -> nix::Result<()> {
		let mut sregs = self.vcpu.get_sregs().map_err(errno)?;
		sregs.cs.base = 0;
		sregs.cs.selector = 0;
		sregs.cr0 &= !Cr0Flags::PROTECTED_MODE_ENABLE.bits();
		self.vcpu.set_sregs(&sregs).map_err(errno)?;

		let mut regs = self.vcpu.get_regs().map_err(errno)?;
		regs.rip = entry_point;
		regs.rflags = RFLAGS_RESERVED;
		self.vcpu.set_regs(&regs).map_err(errno)?;

		trace!("vCPU {}: real mode entry at {entry_point:#x}", self.id);
		Ok(())
	}

	fn resume(&mut self) -> nix::Result<VcpuExit<'_>> {
		// The decoded exit of kvm-ioctls hides the access width and repeat
		// count, so only the return value is used and `kvm_run` is read directly.
		self.vcpu.run().map_err(errno)?;
		Ok(Self::decode_exit(self.vcpu.get_kvm_run()))
	}
}
