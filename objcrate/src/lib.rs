//! A memory-mapped, persistent, segregated-free-list object heap.
//!
//! Opening a [`Crate`] maps a fixed-capacity backing file and exposes an allocator over it;
//! objects addressed as native pointers while the crate is open are stable at the same byte
//! offsets the next time the file is opened. [`active`] layers a thread-local ambient handle on
//! top of [`Crate`] so call sites that only ever touch one crate at a time don't have to thread
//! a handle through every call.

pub mod active;
mod alloc;
pub mod error;
mod handle;
mod layout;
mod list;
pub mod logger;
mod snapshot;
mod walk;

pub use error::Error;
pub use error::Result;
pub use handle::Crate;
pub use handle::DEFAULT_CAPACITY;
pub use list::ListEntry;
pub use list::ListHeader;
pub use logger::set_logger;
