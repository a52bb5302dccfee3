//! Error types returned by the crate API.

use std::fmt;
use std::io;

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a crate operation can fail.
///
/// `Corruption` and `OutOfBounds` indicate the on-disk invariants (see the data model) no
/// longer hold; the handle that raised them must be closed, further operations on it are
/// undefined.
#[derive(Debug)]
pub enum Error {
	/// The file does not carry the `objSuper` magic: it has never been formatted by this
	/// library.
	NotFormatted,
	/// The file's magic matches but its `version` field is not one this build understands.
	VersionMismatch {
		/// Version found in the super-block.
		found: u64,
		/// Version this build requires.
		expected: u64,
	},
	/// No free-list class held a record large enough to satisfy the request.
	CapacityExhausted,
	/// A derived offset or address fell outside of the mapping.
	OutOfBounds,
	/// An on-disk invariant was violated (bad flag combination, free-list head mismatch,
	/// trailer/header disagreement, ...).
	Corruption(&'static str),
	/// An underlying OS call failed (open, flock, ftruncate, mmap, msync, pwrite, ioctl, ...).
	IoFailure(io::Error),
	/// The calling thread has no active crate set.
	NotActive,
	/// A null target, a zero length where disallowed, or an unknown index descriptor.
	BadArgument(&'static str),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotFormatted => write!(f, "file is not a formatted object crate"),
			Self::VersionMismatch { found, expected } => {
				write!(f, "crate version {found} is not supported (expected {expected})")
			}
			Self::CapacityExhausted => write!(f, "no free record is large enough for this allocation"),
			Self::OutOfBounds => write!(f, "offset or address falls outside of the mapping"),
			Self::Corruption(what) => write!(f, "corrupt object crate: {what}"),
			Self::IoFailure(e) => write!(f, "i/o failure: {e}"),
			Self::NotActive => write!(f, "no active crate is set on this thread"),
			Self::BadArgument(what) => write!(f, "bad argument: {what}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::IoFailure(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::IoFailure(e)
	}
}

/// Builds an [`Error::IoFailure`] from the current `errno`, as set by a failing libc call.
pub(crate) fn last_os_error() -> Error {
	Error::IoFailure(io::Error::last_os_error())
}
