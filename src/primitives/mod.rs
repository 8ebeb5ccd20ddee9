//! Low-level primitives the vnode pager is built from.
//!
//! Includes the backing-file abstraction, blocking coordination
//! primitives, and the pager itself.

/// Concurrency primitives and synchronization.
///
/// Owner-tracked file locks, interrupt generations and the scratch mapping window.
pub mod concurrency;

/// Backing-file abstractions.
///
/// The capability the pager reads and writes through, with std and in-memory implementations.
pub mod io;

/// The vnode pager.
///
/// Page-in, page-out, clustering and the pager lifecycle.
pub mod pager;
