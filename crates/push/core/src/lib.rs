//! Push Core Types
//!
//! Device keys, notifications, installations, events and the error taxonomy
//! shared by the push dispatch crates.

mod device;
mod error;
mod event;
mod installation;
mod notification;

pub use device::*;
pub use error::*;
pub use event::*;
pub use installation::*;
pub use notification::*;
