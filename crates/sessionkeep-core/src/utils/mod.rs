//! Utility functions for display formatting.

pub mod format;

pub use format::{format_remaining, format_timestamp, mask_token};
