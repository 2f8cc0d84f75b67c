//! Push Providers
//!
//! A provider sends one application's notifications for one device type:
//! it shapes messages for its platform, queues them with bounded
//! concurrency, spreads them over a rotating connection pool and reports
//! every outcome as a normalized event.

mod metrics;
mod platform;
mod pool;
mod provider;
mod queue;
mod task;
mod work;

pub use metrics::*;
pub use platform::*;
pub use pool::*;
pub use provider::*;
pub use queue::*;
pub use task::*;
pub use work::*;
