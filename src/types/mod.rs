//! Shared types

pub mod error;

pub use error::{is_duplicate_key, MirrorError, Result};
