//! Common types and traits for daemonwatch
//!
//! This crate provides the data structures and lookup abstractions shared
//! between the trackers and the code consuming their results.

pub mod events;
pub mod platform;
pub mod resolver;

pub use events::*;
pub use platform::*;
pub use resolver::*;
