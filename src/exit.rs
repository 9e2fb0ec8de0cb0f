//! Turns vCPU exits into VMM actions.

use crate::{
	HypervisorResult, VmmError,
	params::IoPortPolicy,
	vcpu::{IoDirection, VcpuExit},
};

/// What the run loop does after an exit.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitAction<'a> {
	/// Resume the guest.
	Continue,
	/// Write these bytes to the console, then resume the guest.
	ConsoleWrite(&'a [u8]),
	/// The guest halted. No further resume.
	Halt,
}

/// Decides how to proceed after `exit`.
///
/// Only `hlt` and output to `console_port` are modeled. Port I/O on other
/// ports follows `policy`; every other exit reason is an
/// [`VmmError::UnhandledExit`].
pub fn dispatch<'a>(
	exit: &VcpuExit<'a>,
	console_port: u16,
	policy: IoPortPolicy,
) -> HypervisorResult<ExitAction<'a>> {
	match exit {
		VcpuExit::Halt => Ok(ExitAction::Halt),
		VcpuExit::PortIo(io) if io.direction == IoDirection::Out && io.port == console_port => {
			Ok(ExitAction::ConsoleWrite(io.data))
		}
		VcpuExit::PortIo(io) => match policy {
			IoPortPolicy::Ignore => {
				warn!(
					"ignoring {:?} access of {} bytes to I/O port {:#x}",
					io.direction, io.size, io.port
				);
				Ok(ExitAction::Continue)
			}
			IoPortPolicy::Fatal => {
				error!(
					"unhandled {:?} access of {} bytes to I/O port {:#x}",
					io.direction, io.size, io.port
				);
				Err(VmmError::UnhandledExit {
					code: exit.reason_code(),
				})
			}
		},
		VcpuExit::Other(code) => {
			error!("unhandled exit reason {code}");
			Err(VmmError::UnhandledExit { code: *code })
		}
	}
}
