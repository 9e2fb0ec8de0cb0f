//! Guest physical address space bookkeeping.

use std::{collections::BTreeMap, mem, ops::Range, sync::Arc};

use bitflags::bitflags;

use crate::{HypervisorResult, VmmError, backend::VmBackend, consts::PAGE_SIZE, mem::MmapMemory};

bitflags! {
	/// Flags passed through to the kernel when a region is registered.
	/// The values follow the KVM ABI (`KVM_MEM_*`).
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct MemoryFlags: u32 {
		const LOG_DIRTY_PAGES = 1 << 0;
		const READONLY = 1 << 1;
	}
}

/// One contiguous range of guest physical memory backed by a host mapping.
#[derive(Debug)]
pub struct MemoryRegion {
	slot: u32,
	flags: MemoryFlags,
	guest_address: u64,
	mem: MmapMemory,
}

impl MemoryRegion {
	pub fn slot(&self) -> u32 {
		self.slot
	}

	pub fn flags(&self) -> MemoryFlags {
		self.flags
	}

	pub fn guest_address(&self) -> u64 {
		self.guest_address
	}

	/// Returns the size of the region in bytes
	pub fn size(&self) -> usize {
		self.mem.size()
	}

	/// Host virtual address backing [`Self::guest_address`].
	pub fn host_address(&self) -> u64 {
		self.mem.host_start() as u64
	}

	/// Produces a (exclusive) range of all guest addresses in this region.
	pub fn address_range(&self) -> Range<u64> {
		self.guest_address..self.guest_address + self.size() as u64
	}

	fn contains(&self, address: u64) -> bool {
		self.address_range().contains(&address)
	}

	/// Offset of `address` from the start of the region.
	fn offset_of(&self, address: u64) -> HypervisorResult<usize> {
		address
			.checked_sub(self.guest_address)
			.map(|offset| offset as usize)
			.ok_or(VmmError::AddressBelowRegion {
				address,
				base: self.guest_address,
			})
	}

	pub fn info(&self) -> RegionInfo {
		RegionInfo {
			slot: self.slot,
			flags: self.flags,
			guest_address: self.guest_address,
			size: self.size(),
			host_address: self.host_address(),
		}
	}
}

/// A plain copy of a region's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
	pub slot: u32,
	pub flags: MemoryFlags,
	pub guest_address: u64,
	pub size: usize,
	pub host_address: u64,
}

impl RegionInfo {
	pub fn address_range(&self) -> Range<u64> {
		self.guest_address..self.guest_address + self.size as u64
	}
}

/// The memory slots of one VM.
///
/// Slot ids are unique and below the kernel's slot limit, and the guest
/// ranges of all regions are pairwise disjoint. A region is registered with
/// the kernel before it is recorded and deregistered before its host
/// mapping is released, including when the table is dropped.
#[derive(Debug)]
pub struct MemorySlotTable<B: VmBackend> {
	regions: BTreeMap<u32, MemoryRegion>,
	max_slots: usize,
	mergeable: bool,
	backend: Arc<B>,
}

impl<B: VmBackend> MemorySlotTable<B> {
	pub fn new(backend: Arc<B>, max_slots: usize, mergeable: bool) -> Self {
		Self {
			regions: BTreeMap::new(),
			max_slots,
			mergeable,
			backend,
		}
	}

	pub fn len(&self) -> usize {
		self.regions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.regions.is_empty()
	}

	pub fn region(&self, slot: u32) -> Option<&MemoryRegion> {
		self.regions.get(&slot)
	}

	/// Iterates the regions in slot order.
	pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
		self.regions.values()
	}

	/// Where the next region goes with the append-only placement: right
	/// behind the highest region, or at 0 for the first one.
	pub fn next_guest_address(&self) -> u64 {
		self.regions
			.values()
			.map(|region| region.address_range().end)
			.max()
			.unwrap_or(0)
	}

	/// Adds a region of `pages` pages behind all existing regions.
	pub fn add_region(
		&mut self,
		slot: u32,
		pages: usize,
		flags: MemoryFlags,
	) -> HypervisorResult<&MemoryRegion> {
		let guest_address = self.next_guest_address();
		self.add_region_at(slot, guest_address, pages, flags)
	}

	/// Adds a region of `pages` pages at `guest_address` and registers it
	/// with the kernel.
	pub fn add_region_at(
		&mut self,
		slot: u32,
		guest_address: u64,
		pages: usize,
		flags: MemoryFlags,
	) -> HypervisorResult<&MemoryRegion> {
		if slot as usize >= self.max_slots {
			return Err(VmmError::SlotLimitExceeded {
				slot,
				max: self.max_slots,
			});
		}
		if self.regions.contains_key(&slot) {
			return Err(VmmError::SlotAlreadyExists(slot));
		}
		if guest_address % PAGE_SIZE as u64 != 0 {
			return Err(VmmError::MisalignedGuestAddress {
				slot,
				guest_address,
			});
		}

		let size = pages
			.checked_mul(PAGE_SIZE)
			.filter(|size| *size > 0)
			.ok_or(VmmError::InvalidRegionSize { slot, pages })?;
		let end = guest_address
			.checked_add(size as u64)
			.ok_or(VmmError::InvalidRegionSize { slot, pages })?;
		if let Some(existing) = self
			.regions
			.values()
			.find(|region| guest_address < region.address_range().end && region.guest_address < end)
		{
			return Err(VmmError::RegionOverlap {
				slot,
				start: guest_address,
				end,
				existing: existing.slot,
			});
		}

		let mem = MmapMemory::new(size, self.mergeable)
			.map_err(|source| VmmError::HostMappingFailed { slot, source })?;
		let region = MemoryRegion {
			slot,
			flags,
			guest_address,
			mem,
		};

		// On failure `region` is dropped here, which releases the mapping.
		self.backend
			.register_region(&region)
			.map_err(|source| VmmError::RegionRegistrationFailed { slot, source })?;
		debug!(
			"Registered slot {slot}: guest {guest_address:#x}..{end:#x} at host {:#x}",
			region.host_address()
		);

		Ok(self.regions.entry(slot).or_insert(region))
	}

	/// Removes the region in `slot`. The kernel forgets the region before
	/// its host mapping is released.
	pub fn remove_region(&mut self, slot: u32) -> HypervisorResult<()> {
		let region = self.regions.get(&slot).ok_or(VmmError::UnknownSlot(slot))?;
		self.backend
			.unregister_region(region)
			.map_err(|source| VmmError::RegionDeregistrationFailed { slot, source })?;
		self.regions.remove(&slot);
		debug!("Removed slot {slot}");
		Ok(())
	}

	/// Removes all regions during teardown.
	///
	/// A region the kernel refuses to forget is leaked instead of unmapped
	/// and the failure is fatal.
	fn release_all(&mut self) {
		while let Some((slot, region)) = self.regions.pop_first() {
			if let Err(err) = self.backend.unregister_region(&region) {
				error!("Unable to remove memory slot {slot} from the kernel: {err}");
				mem::forget(region);
				panic!("memory slot {slot} could not be released: {err}");
			}
		}
	}

	/// Finds the region holding `[address, address + len)` and the offset
	/// of `address` inside it.
	pub fn translate(&self, address: u64, len: usize) -> HypervisorResult<(&MemoryRegion, usize)> {
		let region = self
			.regions
			.values()
			.find(|region| region.contains(address))
			.ok_or(VmmError::OutOfSlotBounds { address, len })?;
		debug_assert!(
			address >= region.guest_address,
			"slot {} selected for {address:#x} below its base",
			region.slot
		);
		let offset = region.offset_of(address)?;
		if len > region.size() - offset {
			return Err(VmmError::OutOfSlotBounds { address, len });
		}
		Ok((region, offset))
	}

	/// Translates `address` into a host virtual address.
	pub fn host_address(&self, address: u64) -> HypervisorResult<u64> {
		let (region, offset) = self.translate(address, 0)?;
		Ok(region.host_address() + offset as u64)
	}

	pub fn copy_to_guest(&self, address: u64, data: &[u8]) -> HypervisorResult<()> {
		let (region, offset) = self.translate(address, data.len())?;
		region.mem.write_at(offset, data);
		Ok(())
	}

	pub fn copy_from_guest(&self, address: u64, buf: &mut [u8]) -> HypervisorResult<()> {
		let (region, offset) = self.translate(address, buf.len())?;
		region.mem.read_at(offset, buf);
		Ok(())
	}
}

impl<B: VmBackend> Drop for MemorySlotTable<B> {
	fn drop(&mut self) {
		self.release_all();
	}
}
