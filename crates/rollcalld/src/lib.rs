//! rollcalld: attendance daemon internals.
//!
//! The binary wires these together; the operator CLI uses [`config`] to
//! find the same ledger the daemon writes.

pub mod config;
pub mod dbus_interface;
pub mod engine;
#[cfg(test)]
mod fakes;
pub mod pipeline;
pub mod session;
