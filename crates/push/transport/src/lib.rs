//! Push Transports
//!
//! The transport capability boundary: platform message shapes, resolved
//! transport options, and the `Transport`/`Connector` traits. Ships an APNs
//! connector built on the a2 crate.

mod apns;
mod message;
mod options;
mod traits;

pub use apns::*;
pub use message::*;
pub use options::*;
pub use traits::*;
