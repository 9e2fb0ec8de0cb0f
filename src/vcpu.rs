use std::{fmt, sync::Mutex};

use crate::{
	HypervisorResult, VmmError,
	backend::VcpuBackend,
	consts::{EXIT_REASON_HLT, EXIT_REASON_IO},
};

/// General purpose register file of an x86-64 vCPU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rsp: u64,
	pub rbp: u64,
	pub r8: u64,
	pub r9: u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	pub rip: u64,
	pub rflags: u64,
}

impl fmt::Display for Registers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "rax: {:#18x}       r8: {:#18x}", self.rax, self.r8)?;
		writeln!(f, "rbx: {:#18x}       r9: {:#18x}", self.rbx, self.r9)?;
		writeln!(f, "rcx: {:#18x}      r10: {:#18x}", self.rcx, self.r10)?;
		writeln!(f, "rdx: {:#18x}      r11: {:#18x}", self.rdx, self.r11)?;
		writeln!(f, "rsi: {:#18x}      r12: {:#18x}", self.rsi, self.r12)?;
		writeln!(f, "rdi: {:#18x}      r13: {:#18x}", self.rdi, self.r13)?;
		writeln!(f, "rsp: {:#18x}      r14: {:#18x}", self.rsp, self.r14)?;
		writeln!(f, "rbp: {:#18x}      r15: {:#18x}", self.rbp, self.r15)?;
		write!(f, "rip: {:#18x}   rflags: {:#18x}", self.rip, self.rflags)
	}
}

/// The part of the register file exposed for external polling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
	pub rip: u64,
	pub rax: u64,
}

impl From<&Registers> for RegisterSnapshot {
	fn from(regs: &Registers) -> Self {
		Self {
			rip: regs.rip,
			rax: regs.rax,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
	In,
	Out,
}

/// Port-I/O details of an exit, as found in the shared control structure.
#[derive(Debug)]
pub struct PortIo<'a> {
	pub direction: IoDirection,
	pub port: u16,
	/// Width of one access in bytes.
	pub size: u8,
	/// Number of accesses (`rep` string instructions).
	pub count: u32,
	/// The payload inside the shared control structure, `size * count` bytes.
	pub data: &'a [u8],
}

/// Reasons for vCPU exits, borrowed from the shared control structure the
/// kernel filled in during the last resume.
#[derive(Debug)]
pub enum VcpuExit<'a> {
	/// The guest executed `hlt`.
	Halt,

	/// The guest accessed an I/O port.
	PortIo(PortIo<'a>),

	/// Any other exit reason, with its raw code.
	Other(u32),
}

impl VcpuExit<'_> {
	/// The raw exit reason code.
	pub fn reason_code(&self) -> u32 {
		match self {
			Self::Halt => EXIT_REASON_HLT,
			Self::PortIo(_) => EXIT_REASON_IO,
			Self::Other(code) => *code,
		}
	}
}

/// One vCPU of a [`VirtualMachine`](crate::vm::VirtualMachine).
///
/// The backend vCPU sits behind a mutex which is held across every resume
/// and every register access, so the kernel never mutates the register
/// file or the shared control structure while another thread reads it.
#[derive(Debug)]
pub struct VcpuContext<V> {
	index: usize,
	cpu: Mutex<V>,
}

impl<V: VcpuBackend> VcpuContext<V> {
	pub(crate) fn new(index: usize, cpu: V) -> Self {
		Self {
			index,
			cpu: Mutex::new(cpu),
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn registers(&self) -> HypervisorResult<Registers> {
		self.cpu
			.lock()
			.unwrap()
			.registers()
			.map_err(|source| VmmError::RegisterIOFailed {
				index: self.index,
				source,
			})
	}

	pub fn set_registers(&self, regs: &Registers) -> HypervisorResult<()> {
		self.cpu
			.lock()
			.unwrap()
			.set_registers(regs)
			.map_err(|source| VmmError::RegisterIOFailed {
				index: self.index,
				source,
			})
	}

	pub fn snapshot(&self) -> HypervisorResult<RegisterSnapshot> {
		self.registers().map(|regs| RegisterSnapshot::from(&regs))
	}

	/// Puts the vCPU into real mode, starting execution at `entry_point`.
	pub fn enter_real_mode(&self, entry_point: u64) -> HypervisorResult<()> {
		debug!("vCPU {}: enter real mode at {entry_point:#x}", self.index);
		self.cpu
			.lock()
			.unwrap()
			.enter_real_mode(entry_point)
			.map_err(|source| VmmError::ModeConfigurationFailed {
				index: self.index,
				source,
			})
	}

	/// Runs the guest until the next exit and hands the exit to `f`.
	///
	/// The vCPU stays locked while `f` runs, as the exit borrows from the
	/// shared control structure.
	pub fn resume<R>(
		&self,
		f: impl FnOnce(VcpuExit<'_>) -> HypervisorResult<R>,
	) -> HypervisorResult<R> {
		let mut cpu = self.cpu.lock().unwrap();
		let exit = cpu.resume().map_err(|source| VmmError::ResumeFailed {
			index: self.index,
			source,
		})?;
		trace!("vCPU {}: {exit:?}", self.index);
		f(exit)
	}
}
