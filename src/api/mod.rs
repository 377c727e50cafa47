//! analysis status http api

mod client;
mod error;

pub use client::StatusClient;
pub use error::Error;

/// Result type for api module
pub type Result<T> = std::result::Result<T, Error>;
