use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

/// Credentials, scopes and endpoint overrides for one provider, as configured.
///
/// Missing values stay `None`; the domain layer decides what a missing value means.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub scopes: Vec<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub api_base_url: Option<String>,
}

impl ProviderSettings {
    pub fn has_credentials(&self) -> bool {
        self.client_id.as_deref().is_some_and(|v| !v.is_empty())
            && self.client_secret.as_deref().is_some_and(|v| !v.is_empty())
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scopes", &self.scopes)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

#[derive(Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap_or(RustEnv::Development)),
    )]
    pub runtime_env: RustEnv,

    /// Public base URL of this service. Every provider redirect URI is
    /// `{oauth_redirect_base_url}/auth/{provider}/callback`.
    #[arg(long, env, default_value = "http://localhost:4000")]
    oauth_redirect_base_url: String,

    /// Base URL of the frontend application the browser returns to after connecting.
    #[arg(long, env, default_value = "http://localhost:3000")]
    app_base_url: String,

    /// Lifetime of an OAuth state value (and its cookie) in seconds
    #[arg(long, env, default_value_t = 600)]
    pub oauth_state_ttl_seconds: u64,

    /// Refresh access tokens this many seconds before they expire
    #[arg(long, env, default_value_t = 60)]
    pub token_refresh_margin_seconds: u64,

    /// Timeout in seconds for each call to a provider token endpoint
    #[arg(long, env, default_value_t = 10)]
    pub provider_http_timeout_seconds: u64,

    /// Days within which a provider data-deletion request must be completed
    #[arg(long, env, default_value_t = 30)]
    pub data_deletion_sla_days: u32,

    /// Instagram app id.
    #[arg(long, env)]
    instagram_client_id: Option<String>,
    /// Instagram app secret.
    #[arg(long, env)]
    instagram_client_secret: Option<String>,
    /// Secret Instagram signs webhook bodies with.
    #[arg(long, env)]
    instagram_webhook_secret: Option<String>,
    /// Comma-delimited override of the default Instagram scopes.
    #[arg(long, env, value_delimiter = ',')]
    instagram_scopes: Vec<String>,
    /// Override the Instagram authorization endpoint.
    #[arg(long, env)]
    instagram_auth_url: Option<String>,
    /// Override the Instagram token endpoint.
    #[arg(long, env)]
    instagram_token_url: Option<String>,
    /// Override the Instagram Graph API base URL.
    #[arg(long, env)]
    instagram_api_base_url: Option<String>,

    /// TikTok client key.
    #[arg(long, env)]
    tiktok_client_id: Option<String>,
    /// TikTok client secret.
    #[arg(long, env)]
    tiktok_client_secret: Option<String>,
    /// Secret TikTok signs webhook bodies with.
    #[arg(long, env)]
    tiktok_webhook_secret: Option<String>,
    /// Comma-delimited override of the default TikTok scopes.
    #[arg(long, env, value_delimiter = ',')]
    tiktok_scopes: Vec<String>,
    /// Override the TikTok authorization endpoint.
    #[arg(long, env)]
    tiktok_auth_url: Option<String>,
    /// Override the TikTok token endpoint.
    #[arg(long, env)]
    tiktok_token_url: Option<String>,
    /// Override the TikTok Open API base URL.
    #[arg(long, env)]
    tiktok_api_base_url: Option<String>,

    /// Google OAuth client id.
    #[arg(long, env)]
    google_photos_client_id: Option<String>,
    /// Google OAuth client secret.
    #[arg(long, env)]
    google_photos_client_secret: Option<String>,
    /// Comma-delimited override of the default Google Photos scopes.
    #[arg(long, env, value_delimiter = ',')]
    google_photos_scopes: Vec<String>,
    /// Override the Google authorization endpoint.
    #[arg(long, env)]
    google_photos_auth_url: Option<String>,
    /// Override the Google token endpoint.
    #[arg(long, env)]
    google_photos_token_url: Option<String>,
    /// Override the Google Photos API base URL.
    #[arg(long, env)]
    google_photos_api_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    /// Redirect URI registered with a provider, given its route segment.
    pub fn oauth_redirect_uri(&self, provider: &str) -> String {
        format!(
            "{}/auth/{}/callback",
            self.oauth_redirect_base_url.trim_end_matches('/'),
            provider
        )
    }

    pub fn app_base_url(&self) -> &str {
        self.app_base_url.trim_end_matches('/')
    }

    pub fn instagram(&self) -> ProviderSettings {
        ProviderSettings {
            client_id: self.instagram_client_id.clone(),
            client_secret: self.instagram_client_secret.clone(),
            webhook_secret: self.instagram_webhook_secret.clone(),
            scopes: self.instagram_scopes.clone(),
            auth_url: self.instagram_auth_url.clone(),
            token_url: self.instagram_token_url.clone(),
            api_base_url: self.instagram_api_base_url.clone(),
        }
    }

    pub fn tiktok(&self) -> ProviderSettings {
        ProviderSettings {
            client_id: self.tiktok_client_id.clone(),
            client_secret: self.tiktok_client_secret.clone(),
            webhook_secret: self.tiktok_webhook_secret.clone(),
            scopes: self.tiktok_scopes.clone(),
            auth_url: self.tiktok_auth_url.clone(),
            token_url: self.tiktok_token_url.clone(),
            api_base_url: self.tiktok_api_base_url.clone(),
        }
    }

    /// Google Photos sends no signed webhooks, so there is no webhook secret.
    pub fn google_photos(&self) -> ProviderSettings {
        ProviderSettings {
            client_id: self.google_photos_client_id.clone(),
            client_secret: self.google_photos_client_secret.clone(),
            webhook_secret: None,
            scopes: self.google_photos_scopes.clone(),
            auth_url: self.google_photos_auth_url.clone(),
            token_url: self.google_photos_token_url.clone(),
            api_base_url: self.google_photos_api_base_url.clone(),
        }
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    /// Whether cookies are restricted to HTTPS. Off only in development, for plain-http localhost.
    pub fn secure_cookies(&self) -> bool {
        self.runtime_env() != RustEnv::Development
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("log_level_filter", &self.log_level_filter)
            .field("runtime_env", &self.runtime_env)
            .field("oauth_redirect_base_url", &self.oauth_redirect_base_url)
            .field("app_base_url", &self.app_base_url)
            .field("oauth_state_ttl_seconds", &self.oauth_state_ttl_seconds)
            .field(
                "token_refresh_margin_seconds",
                &self.token_refresh_margin_seconds,
            )
            .field(
                "provider_http_timeout_seconds",
                &self.provider_http_timeout_seconds,
            )
            .field("data_deletion_sla_days", &self.data_deletion_sla_days)
            .field("instagram", &self.instagram())
            .field("tiktok", &self.tiktok())
            .field("google_photos", &self.google_photos())
            .finish()
    }
}
