//! OAuth 2.0 account linking.
//!
//! Provides authorization-code flows with single-use state values and PKCE for the
//! supported social media providers.

mod pkce;
mod provider;
mod registry;
mod state;

pub mod providers;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use pkce::{PkceChallenge, PkcePair, PkceVerifier, CHALLENGE_METHOD};
pub use provider::{
    Capabilities, Endpoints, Provider, ProviderConfig, ProviderKind, RefreshOutcome,
};
pub use registry::Registry;
pub use state::{
    FlowContext, MemoryStateBackend, OAuthState, StateBackend, StateManager, StateRecord,
    DEFAULT_STATE_TTL_SECONDS,
};
pub use token::TokenSet;
