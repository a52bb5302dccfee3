//! The thread-local "active crate" handle.
//!
//! The reference interface keeps a single ambient crate per thread (backed by pthread TLS) so
//! that object-manipulation calls don't have to thread a handle through every call site. The
//! same shape here is a `Cell<*const Crate>` behind `thread_local!`: safe because every handle
//! that can be activated is boxed (see `handle::Crate::open`), so the address stored here stays
//! valid for as long as the box isn't dropped.

use std::cell::Cell;

use crate::error::Error;
use crate::error::Result;
use crate::handle::Crate;

thread_local! {
	static ACTIVE: Cell<*const Crate> = const { Cell::new(std::ptr::null()) };
}

/// Sets (or clears, if `handle` is `None`) the calling thread's active crate.
pub fn set_active(handle: Option<&Crate>) {
	ACTIVE.with(|cell| {
		cell.set(handle.map_or(std::ptr::null(), |h| h as *const Crate));
	});
}

/// Clears the active slot if it currently points at `handle`, a no-op otherwise. Called from
/// [`Crate::close`](crate::handle::Crate::close) so a closed handle can never be left dangling
/// in the slot.
pub(crate) fn clear_if_current(handle: &Crate) {
	ACTIVE.with(|cell| {
		if cell.get() == handle as *const Crate {
			cell.set(std::ptr::null());
		}
	});
}

/// Runs `f` with a reference to the calling thread's active crate, or returns
/// [`Error::NotActive`] if none is set.
pub(crate) fn with_active<T>(f: impl FnOnce(&Crate) -> Result<T>) -> Result<T> {
	let ptr = ACTIVE.with(|cell| cell.get());
	if ptr.is_null() {
		return Err(Error::NotActive);
	}
	// Sound: `ptr` only ever came from `set_active`, which requires a live `&Crate` borrowed
	// from a `Box<Crate>`; the box's stable heap address means this reference stays valid for
	// as long as the slot isn't cleared, which happens no later than the box's `close`/`Drop`.
	f(unsafe { &*ptr })
}

/// Allocates `size` payload bytes from the calling thread's active crate.
pub fn alloc(size: u64) -> Result<*mut u8> {
	with_active(|c| c.alloc(size))
}

/// Releases `address`, previously returned by [`alloc`], back to the active crate.
pub fn free(address: *mut u8) -> Result<()> {
	with_active(|c| c.free(address))
}

/// Converts an offset into the active crate's mapping to a native address.
pub fn ptr(offset: u64, length: u64) -> Result<*mut u8> {
	with_active(|c| c.raw_ptr(offset, length))
}

/// Converts a native address inside the active crate's mapping to an offset.
pub fn offset(address: *const u8) -> Result<u64> {
	with_active(|c| c.raw_offset(address))
}

/// Publishes a root object descriptor in the active crate's super-block.
pub fn set_index(address: *mut u8, length: u64) -> Result<()> {
	with_active(|c| c.set_index(address, length))
}

/// Resolves the active crate's published index descriptor, if any.
pub fn get_index() -> Result<Option<*mut u8>> {
	with_active(|c| c.get_index())
}

/// Flushes the active crate's dirty mapped pages to disk.
pub fn sync(block: bool) -> Result<()> {
	with_active(|c| c.sync(block))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn no_active_crate_is_not_active_error() {
		let err = alloc(16).unwrap_err();
		assert!(matches!(err, Error::NotActive));
	}

	#[test]
	fn activation_and_clear_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("c");
		let handle = Crate::open(&path, true, true).unwrap();

		let addr = alloc(32).unwrap();
		assert!(!addr.is_null());
		free(addr).unwrap();

		handle.close();
		let err = alloc(16).unwrap_err();
		assert!(matches!(err, Error::NotActive));
	}
}
