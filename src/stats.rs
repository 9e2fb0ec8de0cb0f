use std::{
	collections::HashMap,
	fmt::Display,
	time::{Duration, Instant},
};

use crate::vcpu::{IoDirection, VcpuExit};

/// Possible causes a VM exit (guest -> host transition)
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum VmExit {
	Halt,
	PortIn(u16),
	PortOut(u16),
	Other(u32),
}

impl From<&VcpuExit<'_>> for VmExit {
	fn from(exit: &VcpuExit<'_>) -> Self {
		match exit {
			VcpuExit::Halt => Self::Halt,
			VcpuExit::PortIo(io) => match io.direction {
				IoDirection::In => Self::PortIn(io.port),
				IoDirection::Out => Self::PortOut(io.port),
			},
			VcpuExit::Other(code) => Self::Other(*code),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CpuStats {
	id: usize,
	vm_exits: HashMap<VmExit, usize>,
	runtime: Option<Duration>,
	start_time: Option<Instant>,
}
impl CpuStats {
	pub(crate) fn new(id: usize) -> Self {
		Self {
			id,
			vm_exits: HashMap::new(),
			runtime: None,
			start_time: None,
		}
	}

	#[inline]
	pub(crate) fn increment_val(&mut self, val: VmExit) {
		*self.vm_exits.entry(val).or_insert(0) += 1;
	}

	pub(crate) fn start_time_measurement(&mut self) {
		let _ = self.start_time.insert(Instant::now());
	}

	pub(crate) fn stop_time_measurement(&mut self) {
		if let Some(start_time) = self.start_time {
			self.runtime = Some(start_time.elapsed());
		}
	}

	pub fn id(&self) -> usize {
		self.id
	}

	/// Number of recorded exits of the given kind.
	pub fn count(&self, exit: VmExit) -> usize {
		self.vm_exits.get(&exit).copied().unwrap_or(0)
	}

	pub fn total_exits(&self) -> usize {
		self.vm_exits.values().sum()
	}

	pub fn runtime(&self) -> Option<Duration> {
		self.runtime
	}
}

impl Display for CpuStats {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "VM exits of cpu{}:             total", self.id)?;
		let mut exits: Vec<_> = self.vm_exits.iter().collect();
		exits.sort_by_key(|(_, count)| std::cmp::Reverse(**count));
		for (exit, count) in exits {
			writeln!(f, "  {:<28} {count:>6.}", format!("{exit:?}:"))?;
		}
		if let Some(runtime) = self.runtime {
			writeln!(f, "Runtime: {runtime:?}")?;
		}
		Ok(())
	}
}
