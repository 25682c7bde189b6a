//! LeaseKV Consistency - Lease locks and the guarded key-value store
//!
//! This crate provides:
//! - Lease locking over a shared row store (acquire, renew, release, wait)
//! - Scoped lease guards that release on every exit path
//! - A key-value store whose writes require a held lease token
//!
//! All coordination state lives in the backing store, so independent
//! processes opening the same SQLite file exclude each other without a
//! lock-manager process.

pub mod kv;
pub mod lock;

pub use kv::GuardedKvStore;
pub use lock::{LeaseGuard, LeaseLock, LockState, ReleaseOutcome, WaitOptions};

pub use leasekv_common::{LeaseKvError, Result, Token};
