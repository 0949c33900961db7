//! HTTP client building for provider endpoints.

mod client;

pub use client::{HttpClientBuilder, HttpClientConfig};
