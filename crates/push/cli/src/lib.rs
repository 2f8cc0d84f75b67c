//! Push CLI
//!
//! Loads applications and installations from a TOML fixture and drives the
//! dispatch core from the command line.

mod fixture;

pub use fixture::*;
