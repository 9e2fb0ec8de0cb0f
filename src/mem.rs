use std::{num::NonZeroUsize, os::raw::c_void, ptr::NonNull};

use nix::{
	errno::Errno,
	sys::mman::{MapFlags, MmapAdvise, ProtFlags, madvise, mmap_anonymous, munmap},
};

/// An anonymous, private and zero initialized host mapping backing one
/// guest memory region. The mapping is released when the value is dropped.
#[derive(Debug)]
pub(crate) struct MmapMemory {
	ptr: NonNull<c_void>,
	size: usize,
}

// The mapping is plain memory without thread affinity. `write_at` takes
// `&self`, so the owner must keep writes exclusive of other host accesses;
// the VM only copies into guest memory under the slot table's write lock.
unsafe impl Send for MmapMemory {}
unsafe impl Sync for MmapMemory {}

impl MmapMemory {
	pub fn new(memory_size: usize, mergeable: bool) -> nix::Result<Self> {
		let length = NonZeroUsize::new(memory_size).ok_or(Errno::EINVAL)?;
		let ptr = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
			)?
		};

		if mergeable {
			debug!("Enable kernel feature to merge same pages");
			if let Err(err) = unsafe { madvise(ptr, memory_size, MmapAdvise::MADV_MERGEABLE) } {
				warn!("Kernel samepage merging is not available: {err}");
			}
		}

		Ok(Self {
			ptr,
			size: memory_size,
		})
	}

	/// Returns the size of the memory in bytes
	pub fn size(&self) -> usize {
		self.size
	}

	/// Returns a pointer to the beginning of the memory on the host.
	pub fn host_start(&self) -> *mut u8 {
		self.ptr.as_ptr().cast()
	}

	/// Copies `data` into the mapping, starting `offset` bytes into it.
	///
	/// Panics if the range exceeds the mapping; callers translate and
	/// check guest ranges beforehand.
	pub fn write_at(&self, offset: usize, data: &[u8]) {
		assert!(offset.checked_add(data.len()).is_some_and(|end| end <= self.size));
		unsafe {
			std::ptr::copy_nonoverlapping(data.as_ptr(), self.host_start().add(offset), data.len());
		}
	}

	/// Copies `buf.len()` bytes starting `offset` bytes into the mapping.
	pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
		assert!(offset.checked_add(buf.len()).is_some_and(|end| end <= self.size));
		unsafe {
			std::ptr::copy_nonoverlapping(self.host_start().add(offset), buf.as_mut_ptr(), buf.len());
		}
	}

	/// # Safety
	///
	/// The slice aliases memory the guest may modify while it runs. It must
	/// only be used while no vCPU of the owning VM executes.
	#[cfg(test)]
	pub unsafe fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.host_start(), self.size) }
	}
}

impl Drop for MmapMemory {
	fn drop(&mut self) {
		if let Err(err) = unsafe { munmap(self.ptr, self.size) } {
			error!("Unable to unmap guest memory at {:p}: {err}", self.ptr);
			panic!("releasing a host mapping failed: {err}");
		}
	}
}
