//! The backing store: opening, formatting, and mapping a crate file; bounds-checked raw
//! accessors into the mapping used by every other module.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr;

use crate::error::last_os_error;
use crate::error::Error;
use crate::error::Result;
use crate::layout::RecordHeader;
use crate::layout::SuperblockRaw;
use crate::layout::MAGIC_SUPER;
use crate::layout::NONE;
use crate::layout::VERSION;
use crate::logger::crate_log;

/// Default capacity of a freshly created crate file: 5 MiB.
pub const DEFAULT_CAPACITY: u64 = 5 * 1024 * 1024;

/// A single opened crate: a memory-mapped, fixed-capacity backing file plus the file
/// descriptor that holds it open.
///
/// All offset-to-address and address-to-offset conversions performed through methods on this
/// handle are scoped to its own mapping; the free-standing [`crate::active`] functions are a
/// thread-local convenience built on top of the same methods.
#[derive(Debug)]
pub struct Crate {
	pub(crate) file: File,
	pub(crate) path: PathBuf,
	pub(crate) base: *mut u8,
	pub(crate) len: u64,
}

// The mapping is plain shared memory; moving the handle across threads carries no more risk
// than moving the `File` it wraps. Concurrent *use* from multiple threads without external
// synchronization is unsound and is the caller's responsibility to avoid (see the concurrency
// model); `Crate` stays `!Sync` by virtue of the raw pointer to reflect that `&Crate` methods
// perform unsynchronized mutation through the mapping.
unsafe impl Send for Crate {}

impl Crate {
	/// Opens (and, if `create`, creates) the crate file at `path`, formatting it if it is
	/// fresh, with the default 5 MiB capacity. If `activate`, the returned handle becomes the
	/// calling thread's active crate before it is returned.
	pub fn open(path: impl AsRef<Path>, create: bool, activate: bool) -> Result<Box<Self>> {
		Self::open_with_capacity(path, create, activate, DEFAULT_CAPACITY)
	}

	/// Like [`Crate::open`], but lets the caller choose the capacity used when formatting a
	/// fresh file. Ignored when opening an already-formatted file.
	pub fn open_with_capacity(
		path: impl AsRef<Path>,
		create: bool,
		activate: bool,
		capacity: u64,
	) -> Result<Box<Self>> {
		let path = path.as_ref().to_path_buf();
		crate_log!("open", "path={:?} create={create} capacity={capacity}", path);

		let mut options = OpenOptions::new();
		options.read(true).write(true);
		if create {
			options.create(true);
		}
		let file = options.open(&path)?;
		set_no_atime(&file);

		// Hold the exclusive lock while deciding whether the file needs formatting and, if
		// so, while formatting it: two processes racing to create the same fresh file must
		// serialize here, or both could observe `len == 0` and format independently.
		let lock = FileLock::acquire(file.as_raw_fd())?;
		let metadata = file.metadata()?;
		let is_fresh = metadata.len() == 0;

		if is_fresh {
			unsafe {
				if libc::ftruncate(file.as_raw_fd(), capacity as libc::off_t) < 0 {
					return Err(last_os_error());
				}
			}
		}
		let len = if is_fresh { capacity } else { metadata.len() };

		let base = unsafe {
			libc::mmap(
				ptr::null_mut(),
				len as libc::size_t,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED,
				file.as_raw_fd(),
				0,
			)
		};
		if base == libc::MAP_FAILED {
			return Err(last_os_error());
		}

		let handle = Self { file, path, base: base as *mut u8, len };

		if is_fresh {
			handle.format(capacity);
		} else {
			handle.check_header()?;
		}
		drop(lock);

		let handle = Box::new(handle);
		if activate {
			// Boxed, so the address taken here stays valid even though `handle` itself (the
			// `Box`) is about to move into the caller's variable.
			crate::active::set_active(Some(&*handle));
		}

		Ok(handle)
	}

	/// Closes the handle: unmaps the file and clears the thread's active-crate slot if it
	/// currently points at this handle. The file descriptor is released when the box drops.
	pub fn close(self: Box<Self>) {
		crate_log!("close", "path={:?}", self.path);
		crate::active::clear_if_current(&self);
		// Dropping the box performs the unmap.
	}

	fn format(&self, capacity: u64) {
		crate_log!("format", "capacity={capacity}");
		let super_ = self.superblock_mut();
		super_.magic = MAGIC_SUPER;
		super_.version = VERSION;
		super_.index_offset = NONE;
		super_.index_length = 0;
		super_.head_group_offset = [NONE; crate::layout::GROUP_COUNT];
		super_.first_object_offset = SuperblockRaw::SIZE;

		let first_offset = SuperblockRaw::SIZE;
		let header = unsafe { &mut *(self.base.add(first_offset as usize) as *mut RecordHeader) };
		header.length_and_flags = 0;
		header.set_real_length(capacity - first_offset);
		header.set_free(true);
		header.set_last(true);
		header.next_group_offset = NONE;
		self.write_trailer_unchecked(first_offset, first_offset);

		let group = crate::layout::size_class(capacity - first_offset);
		let super_ = self.superblock_mut();
		super_.head_group_offset[group] = first_offset;
	}

	fn check_header(&self) -> Result<()> {
		let super_ = self.superblock();
		if super_.magic != MAGIC_SUPER {
			return Err(Error::NotFormatted);
		}
		if super_.version != VERSION {
			return Err(Error::VersionMismatch { found: super_.version, expected: VERSION });
		}
		Ok(())
	}

	/// Total size of the mapping in bytes.
	pub fn capacity(&self) -> u64 {
		self.len
	}

	pub(crate) fn superblock(&self) -> &SuperblockRaw {
		unsafe { &*(self.base as *const SuperblockRaw) }
	}

	pub(crate) fn superblock_mut(&self) -> &mut SuperblockRaw {
		unsafe { &mut *(self.base as *mut SuperblockRaw) }
	}

	/// Bounds-checks `[offset, offset+length)` against the mapping.
	pub(crate) fn check_bounds(&self, offset: u64, length: u64) -> Result<()> {
		match offset.checked_add(length) {
			Some(end) if end <= self.len => Ok(()),
			_ => Err(Error::OutOfBounds),
		}
	}

	/// Returns a raw, bounds-checked pointer into the mapping. This is the primitive behind
	/// both the public `ptr()` conversion and every internal record access.
	pub(crate) fn raw_ptr(&self, offset: u64, length: u64) -> Result<*mut u8> {
		self.check_bounds(offset, length)?;
		Ok(unsafe { self.base.add(offset as usize) })
	}

	/// Given an address previously returned by `raw_ptr`/`alloc`, returns its offset into this
	/// mapping.
	pub(crate) fn raw_offset(&self, address: *const u8) -> Result<u64> {
		let base = self.base as usize;
		let addr = address as usize;
		if addr < base || addr > base + self.len as usize {
			return Err(Error::OutOfBounds);
		}
		Ok((addr - base) as u64)
	}

	pub(crate) fn header(&self, offset: u64) -> Result<&RecordHeader> {
		self.check_bounds(offset, RecordHeader::SIZE)?;
		Ok(unsafe { &*(self.base.add(offset as usize) as *const RecordHeader) })
	}

	pub(crate) fn header_mut(&self, offset: u64) -> Result<&mut RecordHeader> {
		self.check_bounds(offset, RecordHeader::SIZE)?;
		Ok(unsafe { &mut *(self.base.add(offset as usize) as *mut RecordHeader) })
	}

	/// Reads the 8-byte trailer stored at `record_offset + length - 8`.
	pub(crate) fn read_trailer_at(&self, trailer_offset: u64) -> Result<u64> {
		self.check_bounds(trailer_offset, 8)?;
		Ok(unsafe { ptr::read_unaligned(self.base.add(trailer_offset as usize) as *const u64) })
	}

	fn write_trailer_unchecked(&self, record_offset: u64, value: u64) {
		let header = self.header(record_offset).expect("record offset must be valid");
		let trailer_offset = record_offset + header.real_length() - 8;
		unsafe {
			ptr::write_unaligned(self.base.add(trailer_offset as usize) as *mut u64, value);
		}
	}

	/// Writes a record's own header offset into its trailer; called whenever a record's size
	/// changes.
	pub(crate) fn set_trailer(&self, record_offset: u64) -> Result<()> {
		let header = self.header(record_offset)?;
		let trailer_offset = record_offset + header.real_length() - 8;
		self.check_bounds(trailer_offset, 8)?;
		unsafe {
			ptr::write_unaligned(self.base.add(trailer_offset as usize) as *mut u64, record_offset);
		}
		Ok(())
	}

	/// Publishes a root object descriptor in the super-block.
	pub fn set_index(&self, address: *mut u8, length: u64) -> Result<()> {
		if address.is_null() || length == 0 {
			return Err(Error::BadArgument("set_index requires a non-null address and length"));
		}
		let offset = self.raw_offset(address)?;
		let super_ = self.superblock_mut();
		super_.index_offset = offset;
		super_.index_length = length;
		Ok(())
	}

	/// Resolves the super-block's published index descriptor, if any.
	pub fn get_index(&self) -> Result<Option<*mut u8>> {
		let super_ = self.superblock();
		let offset = super_.index_offset;
		let length = super_.index_length;
		if offset == NONE {
			return Ok(None);
		}
		Ok(Some(self.raw_ptr(offset, length)?))
	}

	/// Flushes dirty mapped pages to the backing file. `block = true` waits for completion
	/// (`MS_SYNC`); `block = false` only schedules the write-back (`MS_ASYNC`).
	pub fn sync(&self, block: bool) -> Result<()> {
		let flags = if block { libc::MS_SYNC } else { libc::MS_ASYNC };
		let ret = unsafe { libc::msync(self.base as *mut libc::c_void, self.len as libc::size_t, flags) };
		if ret < 0 {
			return Err(last_os_error());
		}
		Ok(())
	}
}

impl Drop for Crate {
	fn drop(&mut self) {
		if !self.base.is_null() {
			unsafe {
				libc::munmap(self.base as *mut libc::c_void, self.len as libc::size_t);
			}
			self.base = ptr::null_mut();
		}
	}
}

fn set_no_atime(file: &File) {
	unsafe {
		let flags = libc::fcntl(file.as_raw_fd(), libc::F_GETFL);
		if flags >= 0 {
			libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NOATIME);
		}
	}
}

/// RAII whole-file advisory exclusive lock, held only for the duration of formatting a fresh
/// file (see the concurrency model: concurrent opens of the same unformatted path serialize on
/// this lock; it is released once the file is formatted).
struct FileLock {
	fd: RawFd,
}

impl FileLock {
	fn acquire(fd: RawFd) -> Result<Self> {
		let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
		if ret < 0 {
			return Err(last_os_error());
		}
		Ok(Self { fd })
	}
}

impl Drop for FileLock {
	fn drop(&mut self) {
		unsafe {
			libc::flock(self.fd, libc::LOCK_UN);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::layout::SuperblockRaw;

	#[test]
	fn fresh_crate_is_formatted() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("c");
		let handle = Crate::open_with_capacity(&path, true, false, DEFAULT_CAPACITY).unwrap();
		let super_ = handle.superblock();
		let version = super_.version;
		let first_object_offset = super_.first_object_offset;
		let head_group_offset = super_.head_group_offset;
		assert_eq!(super_.magic, MAGIC_SUPER);
		assert_eq!(version, VERSION);
		assert_eq!(first_object_offset, SuperblockRaw::SIZE);
		for (i, head) in head_group_offset.iter().enumerate() {
			if i == crate::layout::size_class(DEFAULT_CAPACITY - SuperblockRaw::SIZE) {
				assert_eq!(*head, SuperblockRaw::SIZE);
			} else {
				assert_eq!(*head, NONE);
			}
		}
		let header = handle.header(SuperblockRaw::SIZE).unwrap();
		assert!(header.is_free());
		assert!(header.is_last());
		assert_eq!(header.real_length(), DEFAULT_CAPACITY - SuperblockRaw::SIZE);
	}

	#[test]
	fn reopen_of_formatted_file_succeeds() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("c");
		{
			let _handle = Crate::open_with_capacity(&path, true, false, DEFAULT_CAPACITY).unwrap();
		}
		let handle = Crate::open(&path, false, false).unwrap();
		assert_eq!(handle.capacity(), DEFAULT_CAPACITY);
	}

	#[test]
	fn open_unformatted_non_empty_file_fails() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("c");
		std::fs::write(&path, vec![0u8; DEFAULT_CAPACITY as usize]).unwrap();
		let err = Crate::open(&path, false, false).unwrap_err();
		assert!(matches!(err, Error::NotFormatted));
	}
}
