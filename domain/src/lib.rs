//! Wiring between process configuration and the `connect-auth` core.
//!
//! `web` talks to this crate only: it never sees `connect-auth` error kinds or adapters.

pub use connect_auth::oauth::token::{AuthorizationRequest, LinkState, LinkStatus, TokenAccess};
pub use connect_auth::oauth::ProviderKind;

pub mod data_deletion;
pub mod error;
pub mod integrations;
pub mod providers;
pub mod webhook;

pub use data_deletion::{DeletionQueue, DeletionRequest, DeletionStatus, MemoryDeletionQueue};
pub use integrations::{parse_provider, ConnectOutcome, FailureReason, Integrations};
pub use webhook::{DeletionReceipt, WebhookAck};

/// Provider doubles and configuration helpers for tests of this crate and of `web`.
#[cfg(any(test, feature = "testing"))]
pub mod test_support {
    use clap::Parser;
    use connect_auth::webhook::HmacWebhookValidator;
    use secrecy::SecretString;
    use service::config::Config;

    pub use connect_auth::oauth::testing::{FakeProvider, FakeRefresh};
    pub use connect_auth::oauth::{MemoryStateBackend, ProviderKind, Registry};
    pub use connect_auth::oauth::token::MemoryStorage;
    pub use connect_auth::webhook::SignatureScheme;

    /// Instagram-style signature scheme used by test webhooks.
    pub const SCHEME: SignatureScheme = SignatureScheme::PrefixedHex {
        header: "X-Hub-Signature-256",
        prefix: "sha256=",
    };

    /// Parse a `Config` from flags alone.
    pub fn config(args: &[&str]) -> Config {
        let mut argv = vec!["social_connect_rs"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    /// Signature header for `body` under [`SCHEME`].
    pub fn sign(secret: &str, body: &[u8]) -> String {
        HmacWebhookValidator::new(
            ProviderKind::Instagram,
            SecretString::new(secret.to_string()),
            SCHEME,
        )
        .sign(body, chrono::Utc::now().timestamp())
        .unwrap()
    }
}
