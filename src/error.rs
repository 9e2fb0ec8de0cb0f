use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::hypervisor::Capability;

pub type HypervisorResult<T> = Result<T, VmmError>;

/// Failures of the VMM core.
///
/// Variants caused by a kernel call carry the OS error number as their
/// `source`, so the underlying diagnostic survives without being the
/// discriminator.
#[derive(Error, Debug)]
pub enum VmmError {
	#[error("the hypervisor subsystem is unavailable")]
	SubsystemUnavailable(#[source] Errno),

	#[error("querying capability {cap:?} failed")]
	CapabilityQueryFailed {
		cap: Capability,
		#[source]
		source: Errno,
	},

	#[error("creating virtual machine {id} failed")]
	CreationFailed {
		id: u64,
		#[source]
		source: Errno,
	},

	#[error("memory slot {0} is already in use")]
	SlotAlreadyExists(u32),

	#[error("memory slot {slot} exceeds the supported maximum of {max} slots")]
	SlotLimitExceeded { slot: u32, max: usize },

	#[error("memory slot {slot}: a region of {pages} pages is not a valid size")]
	InvalidRegionSize { slot: u32, pages: usize },

	#[error("memory slot {slot}: guest address {guest_address:#x} is not page aligned")]
	MisalignedGuestAddress { slot: u32, guest_address: u64 },

	#[error("memory slot {slot}: [{start:#x}, {end:#x}) overlaps slot {existing}")]
	RegionOverlap {
		slot: u32,
		start: u64,
		end: u64,
		existing: u32,
	},

	#[error("memory slot {slot}: allocating the host mapping failed")]
	HostMappingFailed {
		slot: u32,
		#[source]
		source: Errno,
	},

	#[error("memory slot {slot}: registering the region with the kernel failed")]
	RegionRegistrationFailed {
		slot: u32,
		#[source]
		source: Errno,
	},

	#[error("memory slot {slot}: removing the region from the kernel failed")]
	RegionDeregistrationFailed {
		slot: u32,
		#[source]
		source: Errno,
	},

	#[error("memory slot {0} does not exist")]
	UnknownSlot(u32),

	#[error("guest range {address:#x}+{len:#x} is not covered by a memory region")]
	OutOfSlotBounds { address: u64, len: usize },

	#[error("guest address {address:#x} lies below the base {base:#x} of its region")]
	AddressBelowRegion { address: u64, base: u64 },

	#[error("the supported maximum of {max} vCPUs is reached")]
	VcpuLimitExceeded { max: usize },

	#[error("vCPU {index}: mapping the shared control structure failed")]
	SharedPageMapFailed {
		index: usize,
		#[source]
		source: Errno,
	},

	#[error("vCPU {0} does not exist")]
	InvalidVcpuIndex(usize),

	#[error("vCPU {index}: register access failed")]
	RegisterIOFailed {
		index: usize,
		#[source]
		source: Errno,
	},

	#[error("vCPU {index}: configuring the processor mode failed")]
	ModeConfigurationFailed {
		index: usize,
		#[source]
		source: Errno,
	},

	#[error("vCPU {index}: resuming guest execution failed")]
	ResumeFailed {
		index: usize,
		#[source]
		source: Errno,
	},

	#[error("unhandled exit reason {code}")]
	UnhandledExit { code: u32 },

	#[error("the memory layout cannot change while a vCPU is running")]
	VmIsRunning,

	#[error("console output failed")]
	Console(#[from] io::Error),
}
