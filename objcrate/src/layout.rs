//! On-disk structure definitions shared by the super-block, the allocator, and the object
//! walk. Every structure here is `#[repr(C, packed)]` and read or written through a raw
//! pointer into the mapping: records tile the heap at arbitrary byte offsets, so nothing here
//! can assume natural alignment (see `partition.rs`'s `MBRTable`/`GPT` handling for the same
//! pointer-cast technique applied to on-disk structures with a known byte layout).

use std::mem::size_of;

/// Eight ASCII bytes identifying a formatted crate file.
pub const MAGIC_SUPER: [u8; 8] = *b"objSuper";
/// The only super-block layout version this build understands.
pub const VERSION: u64 = 1;

/// Number of segregated free-list size classes (bytes, KiB, MiB, GiB, TiB, PiB, EiB, and an
/// open-ended eighth class).
pub const GROUP_COUNT: usize = 8;

/// Sentinel meaning "no offset" / "empty list" / "not linked".
pub const NONE: u64 = u64::MAX;

/// Per-record header overhead plus trailer: 16 bytes of header, 8 bytes of trailer.
pub const RECORD_OVERHEAD: u64 = 24;
/// The smallest a record may be: overhead plus one payload byte.
pub const MIN_RECORD_SIZE: u64 = RECORD_OVERHEAD + 1;

/// High bit of `length_and_flags`: the record is on a free list.
pub const FREE_BIT: u64 = 1 << 63;
/// Second-highest bit: the record is the last one in the heap, in address order.
pub const LAST_BIT: u64 = 1 << 62;
/// Mask isolating the real record length (header + payload + trailer) from the flag bits.
pub const LENGTH_MASK: u64 = !(FREE_BIT | LAST_BIT);

/// The persistent header at offset 0 of a crate file.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SuperblockRaw {
	pub magic: [u8; 8],
	pub version: u64,
	pub index_offset: u64,
	pub index_length: u64,
	pub head_group_offset: [u64; GROUP_COUNT],
	pub first_object_offset: u64,
}

impl SuperblockRaw {
	/// Size of the super-block in bytes; also the offset of the first heap record.
	pub const SIZE: u64 = size_of::<SuperblockRaw>() as u64;
}

/// The 16-byte header prefixing every record in the heap.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RecordHeader {
	/// Lower 62 bits: total record size (header + payload + trailer). Bit 63: FREE. Bit 62:
	/// LAST.
	pub length_and_flags: u64,
	/// Free-list intrusive link; `NONE` when the record is allocated or not linked.
	pub next_group_offset: u64,
}

impl RecordHeader {
	pub const SIZE: u64 = size_of::<RecordHeader>() as u64;

	pub fn real_length(&self) -> u64 {
		self.length_and_flags & LENGTH_MASK
	}

	pub fn is_free(&self) -> bool {
		self.length_and_flags & FREE_BIT != 0
	}

	pub fn is_last(&self) -> bool {
		self.length_and_flags & LAST_BIT != 0
	}

	pub fn set_real_length(&mut self, length: u64) {
		let flags = self.length_and_flags & !LENGTH_MASK;
		self.length_and_flags = flags | (length & LENGTH_MASK);
	}

	pub fn set_free(&mut self, free: bool) {
		if free {
			self.length_and_flags |= FREE_BIT;
		} else {
			self.length_and_flags &= !FREE_BIT;
		}
	}

	pub fn set_last(&mut self, last: bool) {
		if last {
			self.length_and_flags |= LAST_BIT;
		} else {
			self.length_and_flags &= !LAST_BIT;
		}
	}
}

/// Maps a total record length to its free-list size class: group `g` holds lengths in
/// `[1024^g, 1024^(g+1))`, clamped to `[0, GROUP_COUNT)`.
pub fn size_class(total_length: u64) -> usize {
	let mut length = total_length;
	let mut group = 0usize;
	while length >= 1024 && group + 1 < GROUP_COUNT {
		length /= 1024;
		group += 1;
	}
	group
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn superblock_layout_size() {
		// magic(8) + version(8) + index_offset(8) + index_length(8) + heads(8*8) + first(8)
		assert_eq!(SuperblockRaw::SIZE, 8 + 8 + 8 + 8 + 64 + 8);
	}

	#[test]
	fn record_header_size() {
		assert_eq!(RecordHeader::SIZE, 16);
	}

	#[test]
	fn size_class_boundaries() {
		assert_eq!(size_class(0), 0);
		assert_eq!(size_class(1023), 0);
		assert_eq!(size_class(1024), 1);
		assert_eq!(size_class(1024 * 1024 - 1), 1);
		assert_eq!(size_class(1024 * 1024), 2);
		assert_eq!(size_class(1024u64.pow(7)), 7);
		assert_eq!(size_class(u64::MAX), 7);
	}

	#[test]
	fn flags_roundtrip() {
		let mut h = RecordHeader { length_and_flags: 0, next_group_offset: NONE };
		h.set_real_length(100);
		h.set_free(true);
		h.set_last(true);
		assert_eq!(h.real_length(), 100);
		assert!(h.is_free());
		assert!(h.is_last());
		h.set_free(false);
		assert!(!h.is_free());
		assert!(h.is_last());
		assert_eq!(h.real_length(), 100);
	}
}
