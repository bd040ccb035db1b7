//! Common utilities and types shared across the graphfs crates.
//!
//! This module provides the error taxonomy every drive operation reports
//! through, and the normalized path type used to address remote items.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::DrivePath;
