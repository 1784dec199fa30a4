//! Shared infrastructure for the racetrap crates.
//!
//! - [`debug`] - Per-module logging controlled via `RACETRAP_DEBUG`
//! - [`hex`] - Address formatting helpers used in logs and fault reports

pub mod debug;
pub mod hex;

pub use debug::{create_logger, Logger};
pub use hex::{align_down, align_up, Addr};
