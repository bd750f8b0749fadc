//! Shared types

pub mod error;

pub use error::{CoordinatorError, Result};
