//! Type aliases for Kairo core.
//!
//! This module provides centralized type aliases used throughout the Kairo framework.
//! All internal code MUST import from this module to ensure consistency.
//!
//! ## Concurrency Primitives
//!
//! We use `parking_lot` for all synchronization primitives due to:
//! - **No lock poisoning**: Panics don't poison the lock (safer under panic)
//! - **Better performance**: 2-10x faster than std::sync
//! - **Smaller memory footprint**: 1 byte vs 16-24 bytes for std::sync::RwLock
//!
//! Only state that genuinely crosses threads uses these locks — the
//! wakeup queue, the worker pool, the running-reactor guard. Objects
//! owned by the reactor thread (transports, protocols, timers) use
//! `Rc<RefCell<..>>` instead and never take a lock.
//!
//! ### Usage
//!
//! ```rust
//! use kairo_core::alias::PMutex;
//!
//! let queue = PMutex::new(vec![1, 2, 3]);
//! let mut guard = queue.lock();  // No unwrap needed!
//! guard.push(4);
//! ```

// ============ Concurrency Primitives ============

/// Priority-aware RwLock (parking_lot implementation).
///
/// This is an alias to `parking_lot::RwLock` which provides:
/// - **No poisoning**: Panics don't poison the lock
/// - **Better performance**: 2-10x faster than `std::sync::RwLock`
/// - **Smaller size**: 1 byte vs 16-24 bytes
///
/// Use this instead of `std::sync::RwLock` in all Kairo core code.
pub use parking_lot::RwLock as PRwLock;

/// Read guard for [`PRwLock`].
pub use parking_lot::RwLockReadGuard as PRwLockReadGuard;

/// Write guard for [`PRwLock`].
pub use parking_lot::RwLockWriteGuard as PRwLockWriteGuard;

/// Priority-aware Mutex (parking_lot implementation).
///
/// Similar to [`PRwLock`], this never poisons and performs better
/// than `std::sync::Mutex`.
///
/// # Example
///
/// ```rust
/// use kairo_core::alias::PMutex;
///
/// let data = PMutex::new(vec![1, 2, 3]);
///
/// let mut guard = data.lock();  // No unwrap needed!
/// guard.push(4);
/// ```
pub use parking_lot::Mutex as PMutex;

/// Mutex guard for [`PMutex`].
pub use parking_lot::MutexGuard as PMutexGuard;

// ============ Future Extensions ============
// Add more type aliases here as needed
