//! A doubly-linked list built entirely out of crate-allocated objects: the list header, every
//! entry, and the cross-references between them are all offsets into the same heap, so a list
//! survives unmap/remap the same way any other object does.

use crate::error::Error;
use crate::error::Result;
use crate::handle::Crate;
use crate::layout::NONE;
use crate::logger::crate_log;

/// Tag distinguishing a formatted [`ListHeader`] from an arbitrary allocation: `"listObj"`
/// plus the NUL terminator the reference's `*(uint64_t *)"listObj"` cast picks up as its 8th
/// byte.
const MAGIC_LIST: u64 = u64::from_le_bytes(*b"listObj\0");
/// Tag distinguishing a formatted [`ListEntry`] from an arbitrary allocation: `"listEnty"`.
const MAGIC_LISTENTRY: u64 = u64::from_le_bytes(*b"listEnty");

/// The persistent head of a list: allocated like any other object, addressed like any other
/// object.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ListHeader {
	magic: u64,
	count: u64,
	head_offset: u64,
}

/// One node in a list, carrying the offset of the data it points to rather than the data
/// itself.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ListEntry {
	magic: u64,
	prev_offset: u64,
	next_offset: u64,
	data_offset: u64,
}

impl Crate {
	/// Allocates and initializes a new, empty list. Returns the native address of its header.
	pub fn list_alloc(&self) -> Result<*mut u8> {
		let addr = self.alloc(std::mem::size_of::<ListHeader>() as u64)?;
		self.list_init(addr)?;
		Ok(addr)
	}

	/// Initializes an already-allocated [`ListHeader`] in place.
	pub fn list_init(&self, header: *mut u8) -> Result<()> {
		let header = self.list_header_mut(header)?;
		header.magic = MAGIC_LIST;
		header.count = 0;
		header.head_offset = NONE;
		Ok(())
	}

	/// Prepends a new entry pointing at `data` to `list`. Returns the native address of the new
	/// entry.
	pub fn list_add(&self, list: *mut u8, data: *mut u8) -> Result<*mut u8> {
		let list_offset = self.raw_offset(list)?;
		let data_offset = self.raw_offset(data)?;

		let entry_addr = self.alloc(std::mem::size_of::<ListEntry>() as u64)?;
		let entry_offset = self.raw_offset(entry_addr)?;

		let old_head = self.list_header(list)?.head_offset;
		if old_head != NONE {
			self.list_entry_mut_at(old_head)?.prev_offset = entry_offset;
		}

		let entry = self.list_entry_mut(entry_addr)?;
		entry.magic = MAGIC_LISTENTRY;
		entry.data_offset = data_offset;
		entry.prev_offset = NONE;
		entry.next_offset = old_head;

		let header = self.list_header_mut(list)?;
		header.head_offset = entry_offset;
		header.count += 1;

		crate_log!("list_add", "list={list_offset} entry={entry_offset} data={data_offset}");
		Ok(entry_addr)
	}

	/// Removes the first entry of `list` whose data pointer is `data`. Returns `Ok(true)` if an
	/// entry was removed, `Ok(false)` if `data` wasn't found.
	pub fn list_del(&self, list: *mut u8, data: *mut u8) -> Result<bool> {
		let data_offset = self.raw_offset(data)?;

		let mut cursor = self.list_header(list)?.head_offset;
		while cursor != NONE {
			let entry = *self.list_entry_at(cursor)?;
			if entry.data_offset == data_offset {
				if entry.prev_offset != NONE {
					self.list_entry_mut_at(entry.prev_offset)?.next_offset = entry.next_offset;
				}
				if entry.next_offset != NONE {
					self.list_entry_mut_at(entry.next_offset)?.prev_offset = entry.prev_offset;
				}

				let header = self.list_header_mut(list)?;
				if header.head_offset == cursor {
					header.head_offset = entry.next_offset;
				}
				header.count -= 1;

				let entry_addr = self.raw_ptr(cursor, std::mem::size_of::<ListEntry>() as u64)?;
				self.free(entry_addr)?;
				crate_log!("list_del", "removed entry at {cursor}");
				return Ok(true);
			}
			cursor = entry.next_offset;
		}
		Ok(false)
	}

	/// Number of entries currently in `list`.
	pub fn list_count(&self, list: *mut u8) -> Result<u64> {
		Ok(self.list_header(list)?.count)
	}

	/// The first entry of `list`, or `None` if it is empty.
	pub fn list_begin(&self, list: *mut u8) -> Result<Option<*mut u8>> {
		let head = self.list_header(list)?.head_offset;
		if head == NONE {
			return Ok(None);
		}
		Ok(Some(self.raw_ptr(head, std::mem::size_of::<ListEntry>() as u64)?))
	}

	/// The entry following `entry`, or `None` if `entry` is the tail.
	pub fn list_next(&self, entry: *mut u8) -> Result<Option<*mut u8>> {
		let next = self.list_entry(entry)?.next_offset;
		if next == NONE {
			return Ok(None);
		}
		Ok(Some(self.raw_ptr(next, std::mem::size_of::<ListEntry>() as u64)?))
	}

	/// The data address an entry points to.
	pub fn list_data(&self, entry: *mut u8) -> Result<*mut u8> {
		let data_offset = self.list_entry(entry)?.data_offset;
		self.raw_ptr(data_offset, 0)
	}

	fn list_header(&self, addr: *mut u8) -> Result<&ListHeader> {
		let offset = self.raw_offset(addr)?;
		self.check_bounds(offset, std::mem::size_of::<ListHeader>() as u64)?;
		let header = unsafe { &*(addr as *const ListHeader) };
		if header.magic != MAGIC_LIST {
			return Err(Error::Corruption("address does not point to a list header"));
		}
		Ok(header)
	}

	fn list_header_mut(&self, addr: *mut u8) -> Result<&mut ListHeader> {
		let offset = self.raw_offset(addr)?;
		self.check_bounds(offset, std::mem::size_of::<ListHeader>() as u64)?;
		Ok(unsafe { &mut *(addr as *mut ListHeader) })
	}

	fn list_entry(&self, addr: *mut u8) -> Result<&ListEntry> {
		let offset = self.raw_offset(addr)?;
		self.check_bounds(offset, std::mem::size_of::<ListEntry>() as u64)?;
		let entry = unsafe { &*(addr as *const ListEntry) };
		if entry.magic != MAGIC_LISTENTRY {
			return Err(Error::Corruption("address does not point to a list entry"));
		}
		Ok(entry)
	}

	fn list_entry_mut(&self, addr: *mut u8) -> Result<&mut ListEntry> {
		let offset = self.raw_offset(addr)?;
		self.check_bounds(offset, std::mem::size_of::<ListEntry>() as u64)?;
		Ok(unsafe { &mut *(addr as *mut ListEntry) })
	}

	fn list_entry_at(&self, offset: u64) -> Result<&ListEntry> {
		let addr = self.raw_ptr(offset, std::mem::size_of::<ListEntry>() as u64)?;
		self.list_entry(addr)
	}

	fn list_entry_mut_at(&self, offset: u64) -> Result<&mut ListEntry> {
		let addr = self.raw_ptr(offset, std::mem::size_of::<ListEntry>() as u64)?;
		self.list_entry_mut(addr)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn list_of_ten_ints_preserves_insertion_order_reversed() {
		let dir = tempfile::tempdir().unwrap();
		let c = Crate::open(dir.path().join("c"), true, false).unwrap();

		let list = c.list_alloc().unwrap();
		let mut values = Vec::new();
		for i in 0..10u64 {
			let slot = c.alloc(8).unwrap();
			unsafe { std::ptr::write_unaligned(slot as *mut u64, i) };
			values.push(slot);
			c.list_add(list, slot).unwrap();
		}
		assert_eq!(c.list_count(list).unwrap(), 10);

		let mut collected = Vec::new();
		let mut cursor = c.list_begin(list).unwrap();
		while let Some(entry) = cursor {
			let data = c.list_data(entry).unwrap();
			collected.push(unsafe { std::ptr::read_unaligned(data as *const u64) });
			cursor = c.list_next(entry).unwrap();
		}
		// Each add prepends, so iteration order is the reverse of insertion order.
		assert_eq!(collected, (0..10u64).rev().collect::<Vec<_>>());
	}

	#[test]
	fn delete_then_readd_keeps_list_consistent() {
		let dir = tempfile::tempdir().unwrap();
		let c = Crate::open(dir.path().join("c"), true, false).unwrap();

		let list = c.list_alloc().unwrap();
		let a = c.alloc(8).unwrap();
		let b = c.alloc(8).unwrap();
		let d = c.alloc(8).unwrap();
		c.list_add(list, a).unwrap();
		c.list_add(list, b).unwrap();
		c.list_add(list, d).unwrap();
		assert_eq!(c.list_count(list).unwrap(), 3);

		assert!(c.list_del(list, b).unwrap());
		assert_eq!(c.list_count(list).unwrap(), 2);
		assert!(!c.list_del(list, b).unwrap());

		c.list_add(list, b).unwrap();
		assert_eq!(c.list_count(list).unwrap(), 3);

		let mut seen = Vec::new();
		let mut cursor = c.list_begin(list).unwrap();
		while let Some(entry) = cursor {
			seen.push(c.list_data(entry).unwrap());
			cursor = c.list_next(entry).unwrap();
		}
		assert_eq!(seen.len(), 3);
		assert!(seen.contains(&a));
		assert!(seen.contains(&b));
		assert!(seen.contains(&d));
	}
}
