pub const PAGE_SIZE: usize = 0x1000;

/// The port the guest writes console bytes to (COM1 data register).
pub const CONSOLE_PORT: u16 = 0x3f8;

/// Default guest-physical load address (and entry point) of a payload.
pub const DEFAULT_LOAD_ADDRESS: u64 = 0x1000;

/// Bit 1 of RFLAGS is reserved and must always be set on VM entry.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// Exit reason codes as written into the shared control structure.
/// The numbering follows the KVM ABI (`KVM_EXIT_*`).
pub const EXIT_REASON_IO: u32 = 2;
pub const EXIT_REASON_HLT: u32 = 5;

/// Direction values of a port-I/O exit.
pub const IO_DIRECTION_IN: u8 = 0;
pub const IO_DIRECTION_OUT: u8 = 1;
