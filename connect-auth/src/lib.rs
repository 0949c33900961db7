//! # connect-auth
//!
//! Account linking and webhook authentication for third-party social media providers:
//! - OAuth 2.0 authorization-code flows with single-use state values and PKCE
//! - Provider adapters for Instagram, TikTok and Google Photos behind one `Provider` trait
//! - Token lifecycle management with single-flight refresh per linked account
//! - HMAC-SHA256 webhook signature verification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use connect_auth::{
//!     oauth::{providers, MemoryStateBackend, ProviderKind, Registry, StateManager},
//!     oauth::token::{Manager, MemoryStorage},
//!     webhook::WebhookVerifier,
//! };
//! ```

pub mod error;
pub mod http;
pub mod oauth;
pub mod webhook;

// Re-export commonly used types
pub use error::{Error, ErrorKind};
