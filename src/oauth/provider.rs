//! Third-party provider endpoints and client credentials.

use serde::{Deserialize, Serialize};

/// Endpoint set for the upstream OAuth provider.
///
/// Deserialized from the `[provider]` section of the config file; client
/// credentials are deliberately absent here and come from the environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    /// OAuth authorization endpoint URL
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    /// OAuth token exchange endpoint URL
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Profile endpoint used to learn the provider's own user id
    #[serde(default = "default_profile_url")]
    pub profile_url: String,

    /// OAuth scopes requested at authorization
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_authorize_url() -> String {
    "https://accounts.spotify.com/authorize".to_string()
}

fn default_token_url() -> String {
    "https://accounts.spotify.com/api/token".to_string()
}

fn default_profile_url() -> String {
    "https://api.spotify.com/v1/me".to_string()
}

fn default_scopes() -> Vec<String> {
    [
        "user-library-read",
        "playlist-read-private",
        "user-read-playback-state",
        "playlist-modify-public",
        "playlist-modify-private",
        "user-read-currently-playing",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            profile_url: default_profile_url(),
            scopes: default_scopes(),
        }
    }
}

/// Fully-resolved provider configuration: endpoints plus client credentials
/// and the callback redirect URI.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl ProviderConfig {
    /// Resolve the provider configuration from endpoints plus environment
    /// client credentials. Returns `None` when either credential variable is
    /// unset, so callers can report a configuration problem instead of
    /// redirecting users to a broken authorization URL.
    pub fn from_env(endpoints: &ProviderEndpoints, public_base_url: &str) -> Option<Self> {
        let client_id = std::env::var("STAGEPASS_PROVIDER_CLIENT_ID").ok()?;
        let client_secret = std::env::var("STAGEPASS_PROVIDER_CLIENT_SECRET").ok()?;

        Some(Self {
            authorize_url: endpoints.authorize_url.clone(),
            token_url: endpoints.token_url.clone(),
            profile_url: endpoints.profile_url.clone(),
            scopes: endpoints.scopes.clone(),
            client_id,
            client_secret,
            redirect_uri: derive_redirect_uri(public_base_url),
        })
    }

    /// Build the authorization URL embedding the signed state parameter.
    pub fn build_authorize_url(&self, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}

/// The callback route is fixed; only the public base varies per deployment.
fn derive_redirect_uri(public_base_url: &str) -> String {
    format!("{}/auth/callback", public_base_url.trim_end_matches('/'))
}
