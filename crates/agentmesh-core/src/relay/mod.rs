//! Relay API: signed HTTP client and the request/response types shared with
//! the relay implementation.

pub mod client;
pub mod types;

pub use client::{ApiError, RelayClient};
pub use types::*;
