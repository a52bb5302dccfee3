//! The segregated free-list allocator: size classing, free-list link/unlink, split on
//! allocation, coalesce on free.

use crate::error::Error;
use crate::error::Result;
use crate::handle::Crate;
use crate::layout::size_class;
use crate::layout::RecordHeader;
use crate::layout::GROUP_COUNT;
use crate::layout::MIN_RECORD_SIZE;
use crate::layout::NONE;
use crate::layout::RECORD_OVERHEAD;
use crate::logger::crate_log;

impl Crate {
	/// Allocates `size` payload bytes and returns a native address into the mapping. The
	/// returned record's total on-disk size is `size + 24` (rounded up by whatever split slack
	/// remains when a victim can't be split cleanly).
	pub fn alloc(&self, size: u64) -> Result<*mut u8> {
		if size == 0 {
			return Err(Error::BadArgument("alloc size must be greater than zero"));
		}
		let total = size.checked_add(RECORD_OVERHEAD).ok_or(Error::BadArgument("requested size overflows"))?;
		let start_group = size_class(total);

		for group in start_group..GROUP_COUNT {
			if let Some(victim_offset) = self.find_fit(group, total)? {
				self.unlink_from_group(victim_offset, group)?;
				let addr = self.carve(victim_offset, total)?;
				crate_log!("alloc", "size={size} total={total} -> offset={victim_offset}");
				return Ok(addr);
			}
		}

		crate_log!("alloc", "size={size} total={total} -> CapacityExhausted");
		Err(Error::CapacityExhausted)
	}

	/// Releases a previously allocated payload address, coalescing with free neighbors.
	pub fn free(&self, address: *mut u8) -> Result<()> {
		if address.is_null() {
			return Err(Error::BadArgument("free requires a non-null address"));
		}
		let payload_offset = self.raw_offset(address)?;
		let header_offset = payload_offset
			.checked_sub(RecordHeader::SIZE)
			.ok_or(Error::OutOfBounds)?;

		if self.header(header_offset)?.is_free() {
			return Err(Error::Corruption("double free: record is already on a free list"));
		}
		self.header_mut(header_offset)?.set_free(true);

		let mut offset = header_offset;
		offset = self.coalesce_forward(offset)?;
		offset = self.coalesce_backward(offset)?;

		let group = size_class(self.header(offset)?.real_length());
		self.link_to_group(offset, group)?;
		crate_log!("free", "header_offset={header_offset} -> merged_offset={offset}");
		Ok(())
	}

	/// Absorbs the forward neighbor of `offset` into it if that neighbor is free. Returns the
	/// (possibly unchanged) offset of the surviving record.
	fn coalesce_forward(&self, offset: u64) -> Result<u64> {
		if self.header(offset)?.is_last() {
			return Ok(offset);
		}
		let next_offset = offset + self.header(offset)?.real_length();
		if !self.header(next_offset)?.is_free() {
			return Ok(offset);
		}

		let next_group = size_class(self.header(next_offset)?.real_length());
		self.unlink_from_group(next_offset, next_group)?;

		let merged_length = self.header(offset)?.real_length() + self.header(next_offset)?.real_length();
		let next_is_last = self.header(next_offset)?.is_last();
		let header = self.header_mut(offset)?;
		header.set_real_length(merged_length);
		header.set_last(next_is_last);
		self.set_trailer(offset)?;
		Ok(offset)
	}

	/// Absorbs `offset` into its backward neighbor if that neighbor is free. Returns the
	/// (possibly unchanged) offset of the surviving record.
	fn coalesce_backward(&self, offset: u64) -> Result<u64> {
		if offset == self.superblock().first_object_offset {
			return Ok(offset);
		}
		let prev_offset = self.read_trailer_at(offset - 8)?;
		if !self.header(prev_offset)?.is_free() {
			return Ok(offset);
		}

		let prev_group = size_class(self.header(prev_offset)?.real_length());
		self.unlink_from_group(prev_offset, prev_group)?;

		let merged_length = self.header(prev_offset)?.real_length() + self.header(offset)?.real_length();
		let cur_is_last = self.header(offset)?.is_last();
		let header = self.header_mut(prev_offset)?;
		header.set_real_length(merged_length);
		header.set_last(cur_is_last);
		self.set_trailer(prev_offset)?;
		Ok(prev_offset)
	}

	/// Scans free-list class `group` for the first record whose total length is at least
	/// `total` (first-fit within the class; classes are otherwise unordered).
	fn find_fit(&self, group: usize, total: u64) -> Result<Option<u64>> {
		let mut offset = self.superblock().head_group_offset[group];
		while offset != NONE {
			let header = self.header(offset)?;
			if !header.is_free() {
				return Err(Error::Corruption("free-list record is not marked FREE"));
			}
			if header.real_length() >= total {
				return Ok(Some(offset));
			}
			offset = header.next_group_offset;
		}
		Ok(None)
	}

	/// Splits `victim_offset` if there is enough slack to leave a usable free remainder,
	/// otherwise consumes the whole record. Returns the payload address of the allocated
	/// record.
	fn carve(&self, victim_offset: u64, total: u64) -> Result<*mut u8> {
		let (real_length, was_last) = {
			let header = self.header(victim_offset)?;
			(header.real_length(), header.is_last())
		};

		if real_length >= total + MIN_RECORD_SIZE {
			let remainder_offset = victim_offset + total;
			let remainder_length = real_length - total;
			{
				let remainder = self.header_mut(remainder_offset)?;
				remainder.length_and_flags = 0;
				remainder.set_real_length(remainder_length);
				remainder.set_free(true);
				remainder.set_last(was_last);
				remainder.next_group_offset = NONE;
			}
			self.set_trailer(remainder_offset)?;
			let remainder_group = size_class(remainder_length);
			self.link_to_group(remainder_offset, remainder_group)?;

			let header = self.header_mut(victim_offset)?;
			header.length_and_flags = 0;
			header.set_real_length(total);
			header.set_free(false);
			header.set_last(false);
			header.next_group_offset = NONE;
		} else {
			let header = self.header_mut(victim_offset)?;
			header.set_free(false);
			header.next_group_offset = NONE;
		}
		self.set_trailer(victim_offset)?;

		self.raw_ptr(victim_offset + RecordHeader::SIZE, total - RECORD_OVERHEAD)
	}

	/// Splices `record_offset` out of free-list class `group`, wherever in the chain it sits.
	/// The reference implementation only supports unlinking the head; coalescing a mid-chain
	/// neighbor requires scanning to find and rewrite its predecessor.
	pub(crate) fn unlink_from_group(&self, record_offset: u64, group: usize) -> Result<()> {
		let head = self.superblock().head_group_offset[group];
		if head == record_offset {
			let next = self.header(record_offset)?.next_group_offset;
			self.superblock_mut().head_group_offset[group] = next;
			self.header_mut(record_offset)?.next_group_offset = NONE;
			return Ok(());
		}

		let mut prev_offset = head;
		while prev_offset != NONE {
			let next_offset = self.header(prev_offset)?.next_group_offset;
			if next_offset == record_offset {
				let after = self.header(record_offset)?.next_group_offset;
				self.header_mut(prev_offset)?.next_group_offset = after;
				self.header_mut(record_offset)?.next_group_offset = NONE;
				return Ok(());
			}
			prev_offset = next_offset;
		}

		Err(Error::Corruption("record is not a member of its free-list class"))
	}

	/// Pushes `record_offset` onto the head of free-list class `group`.
	pub(crate) fn link_to_group(&self, record_offset: u64, group: usize) -> Result<()> {
		let head = self.superblock().head_group_offset[group];
		self.header_mut(record_offset)?.next_group_offset = head;
		self.superblock_mut().head_group_offset[group] = record_offset;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::layout::SuperblockRaw;

	fn open_tmp(capacity: u64) -> (tempfile::TempDir, Box<Crate>) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("c");
		let handle = Crate::open_with_capacity(&path, true, false, capacity).unwrap();
		(dir, handle)
	}

	#[test]
	fn alloc_100_bytes_matches_scenario() {
		let (_dir, c) = open_tmp(crate::handle::DEFAULT_CAPACITY);
		let first = SuperblockRaw::SIZE;
		let initial_len = c.header(first).unwrap().real_length();

		let addr = c.alloc(100).unwrap();
		let header_offset = c.raw_offset(addr).unwrap() - RecordHeader::SIZE;
		assert_eq!(header_offset, first);
		let header = c.header(header_offset).unwrap();
		assert_eq!(header.real_length(), 124);
		assert!(!header.is_free());
		assert!(!header.is_last());

		let remainder_offset = header_offset + 124;
		let remainder = c.header(remainder_offset).unwrap();
		assert!(remainder.is_free());
		assert!(remainder.is_last());
		assert_eq!(remainder.real_length(), initial_len - 124);
	}

	#[test]
	fn alloc_tiny_capacity_exhausts() {
		let (_dir, c) = open_tmp(4096);
		let mut count = 0;
		loop {
			match c.alloc(200) {
				Ok(_) => count += 1,
				Err(Error::CapacityExhausted) => break,
				Err(e) => panic!("unexpected error: {e}"),
			}
			if count > 100 {
				panic!("allocator never exhausted");
			}
		}
		assert!(count > 0);
		assert_tiling(&c);
	}

	#[test]
	fn free_coalesces_neighbors_and_tiles() {
		let (_dir, c) = open_tmp(crate::handle::DEFAULT_CAPACITY);
		let a = c.alloc(64).unwrap();
		let b = c.alloc(64).unwrap();
		let d = c.alloc(64).unwrap();

		c.free(b).unwrap();
		assert_tiling(&c);

		c.free(a).unwrap();
		assert_tiling(&c);

		c.free(d).unwrap();
		assert_tiling(&c);

		// Everything should have merged back into a single free+last record.
		let first = c.superblock().first_object_offset;
		let header = c.header(first).unwrap();
		assert!(header.is_free());
		assert!(header.is_last());
		assert_eq!(header.real_length(), crate::handle::DEFAULT_CAPACITY - first);
	}

	#[test]
	fn double_free_is_rejected() {
		let (_dir, c) = open_tmp(crate::handle::DEFAULT_CAPACITY);
		let a = c.alloc(16).unwrap();
		c.free(a).unwrap();
		let err = c.free(a).unwrap_err();
		assert!(matches!(err, Error::Corruption(_)));
	}

	/// Walks the heap and checks invariant 1 and 2 from the data model: records tile
	/// `[first_object_offset, capacity)` contiguously with exactly one LAST record.
	fn assert_tiling(c: &Crate) {
		let first = c.superblock().first_object_offset;
		let mut offset = first;
		let mut last_count = 0;
		loop {
			let header = c.header(offset).unwrap();
			let trailer = c.read_trailer_at(offset + header.real_length() - 8).unwrap();
			assert_eq!(trailer, offset, "trailer consistency violated at {offset}");
			if header.is_last() {
				last_count += 1;
				assert_eq!(offset + header.real_length(), c.capacity());
				break;
			}
			offset += header.real_length();
		}
		assert_eq!(last_count, 1);
	}
}
