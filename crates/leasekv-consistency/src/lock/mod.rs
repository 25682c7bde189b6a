//! Lease lock implementation
//!
//! This module provides:
//! - Lease state model and wait options
//! - Acquire / renew / release / verify over a `RowStore`
//! - `LeaseGuard`, the scoped holder of a token

mod guard;
mod model;
mod service;

pub use guard::*;
pub use model::*;
pub use service::*;
