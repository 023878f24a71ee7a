//! portly - port forwarding and filter rules over the host's native firewall
//!
//! One rule model, three backends: firewalld rich rules, nftables tables with a persisted
//! fragment, and pf anchor files. The backend is picked from the host OS and the tools it
//! has installed.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, errors, command execution, ledger and rule manager
//! - [`drivers`] - The `Provider` contract, backend selection and the three backends
//! - [`platform`] - OS detection and host probes
//! - [`audit`] - Audit logging for every rule change
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Directories and atomic file writes
//!
//! # Safety Features
//!
//! - Every rule is validated before any native tool runs
//! - Conflicting port mappings are rejected, including ones made outside portly
//! - Every native invocation is bounded by a deadline and killed on cancellation
//! - Atomic file writes with a SHA-256 checksum for the ledger

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod drivers;
pub mod platform;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::manager::RuleManager;
pub use core::rule::{FilterKind, FilterRule, NatRule, Protocol};
pub use drivers::{BackendKind, Provider, ProviderFactory};
