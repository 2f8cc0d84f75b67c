//! Push Dispatch
//!
//! Multi-tenant dispatch: a single-flight cache of providers keyed by
//! application and device type, and the manager that resolves installations,
//! routes notifications to providers and re-emits their events with tenant
//! context.

mod cache;
mod config;
mod manager;
mod memory;
mod shutdown;
mod traits;

pub use cache::*;
pub use config::*;
pub use manager::*;
pub use memory::*;
pub use shutdown::*;
pub use traits::*;
