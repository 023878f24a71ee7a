//! Backend-neutral core of portly
//!
//! - [`rule`]: NAT and filter rule types and their validation
//! - [`error`]: Error types shared by every layer
//! - [`exec`]: Bounded, cancellable execution of native tools
//! - [`ledger`]: Persistent record of applied rules
//! - [`manager`]: Rule lifecycle on top of a provider and the ledger

pub mod error;
pub mod exec;
pub mod ledger;
pub mod manager;
pub mod rule;

#[cfg(test)]
pub mod test_helpers;
