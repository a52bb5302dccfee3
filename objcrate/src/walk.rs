//! Bidirectional object walk and the `debugDump` diagnostic.

use crate::error::Result;
use crate::handle::Crate;
use crate::layout::NONE;
use crate::logger::crate_log;

impl Crate {
	/// Offset of the first record in the heap (`super.first_object_offset`).
	pub fn first_record_offset(&self) -> u64 {
		self.superblock().first_object_offset
	}

	/// Offset of the record immediately after `offset`, or `None` if `offset` carries the LAST
	/// bit.
	pub fn next_record_offset(&self, offset: u64) -> Result<Option<u64>> {
		let header = self.header(offset)?;
		if header.is_last() {
			return Ok(None);
		}
		Ok(Some(offset + header.real_length()))
	}

	/// Offset of the record immediately before `offset`, resolved through its trailer, or
	/// `None` if `offset` is the first record in the heap.
	pub fn prev_record_offset(&self, offset: u64) -> Result<Option<u64>> {
		if offset == self.first_record_offset() {
			return Ok(None);
		}
		Ok(Some(self.read_trailer_at(offset - 8)?))
	}

	/// Logs `(offset, free, last, length, nextGroupOffset, trailer)` for every record in the
	/// heap, walking forward from the first record until the LAST record. Purely a
	/// best-effort diagnostic: failures while walking are logged and stop the dump early
	/// rather than propagating to the caller.
	pub fn debug_dump(&self) {
		crate_log!("debug_dump", "i, head");
		let heads = self.superblock().head_group_offset;
		for (i, head) in heads.iter().enumerate() {
			crate_log!("debug_dump", "{i} {head}");
		}

		crate_log!(
			"debug_dump",
			"{:<20} {:<4} {:<4} {:<20} {:<20} {:<20}",
			"@offset",
			"free",
			"last",
			"length",
			"next",
			"trailer"
		);

		let mut offset = self.first_record_offset();
		loop {
			let header = match self.header(offset) {
				Ok(h) => h,
				Err(_) => {
					crate_log!("debug_dump", "can't read header at {offset}");
					return;
				}
			};
			let trailer_offset = offset + header.real_length() - 8;
			let trailer = self.read_trailer_at(trailer_offset).unwrap_or(NONE);
			let next_group_offset = header.next_group_offset;
			crate_log!(
				"debug_dump",
				"{:<20} {:<4} {:<4} {:<20} {:<20} {:<20}",
				offset,
				header.is_free(),
				header.is_last(),
				header.real_length(),
				next_group_offset,
				trailer
			);

			match self.next_record_offset(offset) {
				Ok(Some(next)) => offset = next,
				Ok(None) => break,
				Err(_) => {
					crate_log!("debug_dump", "can't get next record after {offset}");
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn forward_walk_tiles_fresh_crate() {
		let dir = tempfile::tempdir().unwrap();
		let c = Crate::open_with_capacity(dir.path().join("c"), true, false, crate::handle::DEFAULT_CAPACITY).unwrap();
		let first = c.first_record_offset();
		assert_eq!(c.next_record_offset(first).unwrap(), None);
		assert_eq!(c.prev_record_offset(first).unwrap(), None);
	}

	#[test]
	fn walk_visits_split_records_in_both_directions() {
		let dir = tempfile::tempdir().unwrap();
		let c = Crate::open_with_capacity(dir.path().join("c"), true, false, crate::handle::DEFAULT_CAPACITY).unwrap();
		let addr = c.alloc(32).unwrap();
		let first = c.first_record_offset();
		let allocated_offset = c.raw_offset(addr).unwrap() - 16;
		assert_eq!(allocated_offset, first);

		let next = c.next_record_offset(first).unwrap().unwrap();
		assert_eq!(c.prev_record_offset(next).unwrap(), Some(first));
		assert_eq!(c.next_record_offset(next).unwrap(), None);
	}
}
