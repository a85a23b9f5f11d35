//! `kv-mutex` is a distributed mutual-exclusion primitive built on an
//! ordered, transactional key-value store. Any number of client processes
//! sharing a store handle coordinate through two small key ranges under a
//! caller-supplied subspace: a single owner record carrying a heartbeat
//! versionstamp, and a FIFO wait queue keyed by commit versionstamps.
//! Exactly one client owns the lock at a time; waiters queue fairly and can
//! block until promoted; reapers running [`mutex::Mutex::auto_release`]
//! reclaim locks whose owners stopped heartbeating.
//!
//! The store is pluggable behind [`store::Store`]; [`store::memory::Memory`]
//! is the bundled in-process implementation.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use kv_mutex::mutex::Mutex;
//! use kv_mutex::store::memory::Memory;
//! use kv_mutex::store::tuple::Subspace;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> kv_mutex::error::CResult<()> {
//!     let store = Arc::new(Memory::new());
//!
//!     // An empty name asks for a random 32-hex-char client identity.
//!     let mutex = Mutex::new(store, Subspace::from_bytes(b"app/locks/jobs"), "")?;
//!
//!     if mutex.try_acquire()? {
//!         // Exclusive section: this client owns the lock, and a background
//!         // heartbeat keeps reapers away until release.
//!         mutex.release()?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod mutex;
pub mod ops;
pub mod schema;
pub mod store;
