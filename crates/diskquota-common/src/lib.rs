//! Diskquota Common - Shared types and utilities
//!
//! This crate provides the identifier types, quota classification enums,
//! error definitions and size-string parsing used across all diskquota
//! components.

pub mod error;
pub mod size;
pub mod types;

pub use error::{Error, ExceededQuota, Result};
pub use size::parse_size_mb;
pub use types::*;
