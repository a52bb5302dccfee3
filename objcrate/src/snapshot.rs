//! Point-in-time snapshot of the active crate's backing file.
//!
//! The reference implementation walks `FS_IOC_FIEMAP` in batches of 64 extents and `pwrite`s
//! only the mapped (non-hole) regions, so a sparse crate file snapshots to a sparse copy without
//! ever reading or writing the holes. The source is sync'd (both a blocking `msync` up front and
//! `FIEMAP_FLAG_SYNC` on every call) before extents are enumerated, so dirty-but-unflushed pages
//! are accounted for in the map. `FS_IOC_FIEMAP` isn't exposed by the `libc` crate, so the ioctl
//! number and the on-wire `fiemap`/`fiemap_extent` layouts are defined here the same way
//! `utils/src/disk.rs` defines `BLKGETSIZE64`: a small `ioc!`-style macro plus a `#[repr(C)]`
//! struct matching the kernel ABI.

use std::ffi::c_long;
use std::ffi::c_void;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::last_os_error;
use crate::error::Error;
use crate::error::Result;
use crate::handle::Crate;
use crate::logger::crate_log;

const MAX_EXTENT: usize = 64;
const FIEMAP_EXTENT_LAST: u32 = 0x0001;
const FIEMAP_FLAG_SYNC: u32 = 0x0001;

macro_rules! ioc {
	($dir:expr, $kind:expr, $nr:expr, $size:expr) => {
		(($dir) << 30) | (($kind) << 8) | ($nr) | (($size) << 16)
	};
}

/// `_IOC_READ | _IOC_WRITE`, kernel type `'f'`, command 11, sized for the base `struct fiemap`
/// (the variable-length `fm_extents` tail isn't part of the ioctl's declared size).
const FS_IOC_FIEMAP: c_long = ioc!(3, 0x66, 11, std::mem::size_of::<FiemapHeader>() as c_long);

#[repr(C)]
struct FiemapHeader {
	fm_start: u64,
	fm_length: u64,
	fm_flags: u32,
	fm_mapped_extents: u32,
	fm_extent_count: u32,
	fm_reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
	fe_logical: u64,
	fe_physical: u64,
	fe_length: u64,
	fe_reserved64: [u64; 2],
	fe_flags: u32,
	fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapRequest {
	header: FiemapHeader,
	extents: [FiemapExtent; MAX_EXTENT],
}

impl Crate {
	/// Copies the crate's backing file to `destination`, creating it fresh (the destination
	/// must not already exist). Mapped extents are copied with `pwrite`; unmapped regions
	/// (holes) are skipped, so snapshotting a sparse crate produces a sparse copy. Falls back to
	/// a byte-for-byte whole-file copy if the underlying filesystem doesn't support
	/// `FS_IOC_FIEMAP` (the copy loses sparseness in that case, but not correctness).
	pub fn snapshot(&self, destination: impl AsRef<Path>) -> Result<()> {
		let destination = destination.as_ref();
		crate_log!("snapshot", "destination={:?}", destination);

		// Extents are enumerated after a blocking sync, so freshly-written allocations that
		// haven't reached disk yet are still present in the map.
		self.sync(true)?;

		let mut out = OpenOptions::new()
			.read(true)
			.write(true)
			.create_new(true)
			.custom_flags(libc::O_NOATIME)
			.open(destination)?;
		out.set_len(self.capacity())?;

		match self.snapshot_via_fiemap(&out) {
			Ok(()) => Ok(()),
			Err(Error::IoFailure(e)) if e.raw_os_error() == Some(libc::EOPNOTSUPP) || e.raw_os_error() == Some(libc::ENOTTY) => {
				crate_log!("snapshot", "FIEMAP unsupported, falling back to whole-file copy");
				self.snapshot_via_copy(&mut out)
			}
			Err(e) => Err(e),
		}
	}

	fn snapshot_via_fiemap(&self, out: &File) -> Result<()> {
		let mut request: FiemapRequest = unsafe { std::mem::zeroed() };
		let mut start = 0u64;
		let end = self.capacity();

		while start < end {
			request.header.fm_start = start;
			request.header.fm_length = end - start;
			request.header.fm_flags = FIEMAP_FLAG_SYNC;
			request.header.fm_extent_count = MAX_EXTENT as u32;

			let ret = unsafe { libc::ioctl(self.fd(), FS_IOC_FIEMAP as _, &mut request) };
			if ret < 0 {
				return Err(last_os_error());
			}

			let mapped = request.header.fm_mapped_extents as usize;
			if mapped == 0 {
				break;
			}

			for extent in &request.extents[..mapped] {
				let buf = unsafe {
					std::slice::from_raw_parts(
						self.raw_ptr(extent.fe_logical, extent.fe_length)?,
						extent.fe_length as usize,
					)
				};
				pwrite_all(out, buf, extent.fe_logical)?;

				start = extent.fe_logical + extent.fe_length;
				if extent.fe_flags & FIEMAP_EXTENT_LAST != 0 {
					start = end;
				}
			}
		}
		Ok(())
	}

	fn snapshot_via_copy(&self, out: &mut File) -> Result<()> {
		let buf = unsafe { std::slice::from_raw_parts(self.raw_ptr(0, self.capacity())?, self.capacity() as usize) };
		out.write_all(buf)?;
		Ok(())
	}

	pub(crate) fn fd(&self) -> i32 {
		self.file.as_raw_fd()
	}
}

fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> Result<()> {
	let ret = unsafe {
		libc::pwrite(file.as_raw_fd(), buf.as_ptr() as *const c_void, buf.len(), offset as libc::off_t)
	};
	if ret < 0 || ret as usize != buf.len() {
		return Err(last_os_error());
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn snapshot_round_trips_allocated_data() {
		let dir = tempfile::tempdir().unwrap();
		let src_path = dir.path().join("source");
		let dst_path = dir.path().join("snapshot");

		let src = Crate::open(&src_path, true, false).unwrap();
		let addr = src.alloc(16).unwrap();
		unsafe {
			std::ptr::copy_nonoverlapping(b"hello snapshot!!".as_ptr(), addr, 16);
		}
		src.sync(true).unwrap();
		src.snapshot(&dst_path).unwrap();

		let offset = src.raw_offset(addr as *const u8).unwrap();
		let snapshot = Crate::open(&dst_path, false, false).unwrap();
		assert_eq!(snapshot.capacity(), src.capacity());
		let snapshot_addr = snapshot.raw_ptr(offset, 16).unwrap();
		let bytes = unsafe { std::slice::from_raw_parts(snapshot_addr, 16) };
		assert_eq!(bytes, b"hello snapshot!!");
	}

	#[test]
	fn snapshot_refuses_existing_destination() {
		let dir = tempfile::tempdir().unwrap();
		let src_path = dir.path().join("source");
		let dst_path = dir.path().join("snapshot");
		std::fs::write(&dst_path, b"pre-existing").unwrap();

		let src = Crate::open(&src_path, true, false).unwrap();
		let err = src.snapshot(&dst_path).unwrap_err();
		assert!(matches!(err, Error::IoFailure(_)));
	}
}
