//! Console output functionality
use std::{
	fs::{File, OpenOptions},
	io::{self, Write},
	sync::{Arc, Mutex},
};

use crate::params;

/// The destination of the guest's console output.
#[derive(Debug, Default)]
pub enum Destination {
	/// Same IO as the VMM process.
	#[default]
	StdIo,
	/// Redirect output to a file.
	File(Arc<Mutex<File>>),
	/// Redirect output to a buffer.
	Buffer(Arc<Mutex<Vec<u8>>>),
	/// Ignore all console output.
	None,
}

/// Handles console output functionality.
#[derive(Debug)]
pub(crate) struct VmmSerial {
	pub(crate) destination: Destination,
}
impl VmmSerial {
	pub fn from_params(params: &params::Output) -> io::Result<Self> {
		Ok(Self {
			destination: match params {
				params::Output::None => Destination::None,
				params::Output::StdIo => Destination::StdIo,
				params::Output::Buffer => {
					Destination::Buffer(Arc::new(Mutex::new(Vec::with_capacity(8096))))
				}
				params::Output::File(path) => {
					let f = OpenOptions::new()
						.read(false)
						.write(true)
						.create_new(true)
						.open(path)
						.inspect_err(|e| error!("Cant create console output file: {e}"))?;
					Destination::File(Arc::new(Mutex::new(f)))
				}
			},
		})
	}

	/// Writes `buf` to the configured destination and flushes it, so the
	/// bytes are visible before the guest continues.
	pub fn output(&self, buf: &[u8]) -> io::Result<()> {
		match &self.destination {
			Destination::StdIo => {
				let mut stdout = io::stdout().lock();
				stdout.write_all(buf)?;
				stdout.flush()
			}
			Destination::None => Ok(()),
			Destination::Buffer(b) => {
				b.lock().unwrap().extend_from_slice(buf);
				Ok(())
			}
			Destination::File(f) => {
				let mut f = f.lock().unwrap();
				f.write_all(buf)?;
				f.flush()
			}
		}
	}

	/// Returns a copy of everything written so far, if the output goes to a buffer.
	pub fn buffered_output(&self) -> Option<Vec<u8>> {
		match &self.destination {
			Destination::Buffer(b) => Some(b.lock().unwrap().clone()),
			_ => None,
		}
	}
}
