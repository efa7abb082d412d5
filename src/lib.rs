#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pylonbus_lib
//!
//! This crate polls battery units sharing one multi-drop console bus, applies
//! a derating and alarm policy per unit and consolidates all units into one
//! fleet record.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pylonbus` daemon and pulls in `serialport`.
//!
//! ### Client Features
//! - `serialport`: Enables opening a [`link::LinkSession`] on a real serial device using the `serialport` crate.
//!   Without it the session can still be driven by any [`link::Port`] implementation.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `pylonbus` binary executable.

/// Contains error types for the library.
mod error;
/// Consecutive link failure tracking.
pub mod breaker;
/// Fleet aggregation across units.
pub mod fleet;
/// Learned and configured current ceilings.
pub mod limits;
/// Serial session with the bus.
pub mod link;
/// Per unit derating and alarm policy.
pub mod policy;
/// One acquisition cycle over all configured units.
pub mod poller;
/// Defines the console protocol of the battery bus.
pub mod protocol;
/// Published record types.
pub mod telemetry;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{Error, Result, Tripped};
