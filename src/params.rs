use std::{convert::Infallible, fmt, path::PathBuf, str::FromStr};

use byte_unit::{Byte, Unit};
use thiserror::Error;

use crate::consts::{CONSOLE_PORT, PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct Params {
	/// Port whose output is forwarded to the console
	pub console_port: u16,

	/// What to do with port I/O on any other port
	pub io_port_policy: IoPortPolicy,

	/// Advise Kernel Samepage Merging on guest RAM
	pub ksm: bool,

	/// Console output handling
	pub output: Output,

	/// Collect exit statistics
	pub stats: bool,
}

impl Default for Params {
	fn default() -> Self {
		Self {
			console_port: CONSOLE_PORT,
			io_port_policy: Default::default(),
			ksm: true,
			output: Default::default(),
			stats: false,
		}
	}
}

/// Treatment of a port-I/O exit that does not target the console port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoPortPolicy {
	/// Stop the vCPU with [`VmmError::UnhandledExit`](crate::VmmError::UnhandledExit).
	#[default]
	Fatal,
	/// Log a warning and resume the guest.
	Ignore,
}

#[derive(Debug, Clone, Default)]
pub enum Output {
	#[default]
	StdIo,
	File(PathBuf),
	Buffer,
	None,
}

impl FromStr for Output {
	type Err = Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"none" | "None" => Ok(Self::None),
			"-" => Ok(Self::StdIo),
			p => Ok(Self::File(p.into())),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct GuestMemorySize(Byte);

impl GuestMemorySize {
	/// Number of host pages backing this amount of memory.
	pub fn pages(self) -> usize {
		(self.0.as_u64() / PAGE_SIZE as u64) as usize
	}

	pub fn get(self) -> u64 {
		self.0.as_u64()
	}
}

impl Default for GuestMemorySize {
	fn default() -> Self {
		Self(Byte::from_u64_with_unit(64, Unit::KiB).unwrap())
	}
}

impl fmt::Display for GuestMemorySize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[derive(Error, Debug)]
pub enum InvalidGuestMemorySizeError {
	#[error("Guest memory must not be empty")]
	Empty,
	#[error(
		"Invalid amount of guest memory. Must be a multiple of {page} bytes (is {cur:#.3})",
		page = PAGE_SIZE,
		cur = .0.get_adjusted_unit(Unit::KiB),
	)]
	NotPageAligned(Byte),
}

impl TryFrom<Byte> for GuestMemorySize {
	type Error = InvalidGuestMemorySizeError;

	fn try_from(value: Byte) -> Result<Self, Self::Error> {
		if value.as_u64() == 0 {
			Err(InvalidGuestMemorySizeError::Empty)
		} else if value.as_u64() % PAGE_SIZE as u64 != 0 {
			Err(InvalidGuestMemorySizeError::NotPageAligned(value))
		} else {
			Ok(Self(value))
		}
	}
}

#[derive(Error, Debug)]
pub enum ParseByteError {
	#[error(transparent)]
	Parse(#[from] byte_unit::ParseError),

	#[error(transparent)]
	InvalidMemorySize(#[from] InvalidGuestMemorySizeError),
}

impl FromStr for GuestMemorySize {
	type Err = ParseByteError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let requested = Byte::from_str(s)?;
		let memory_size = requested.try_into()?;
		Ok(memory_size)
	}
}
