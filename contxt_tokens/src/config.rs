//! Session configuration
//!
//! A [`SessionConfig`] can be built in code with the `with_*` methods or
//! deserialized from JSON using the same field names as the JavaScript SDK
//! configuration (`sessionType`, `audiences`, `auth.clientId`, ...).

use contxt_clock::DurationSecs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{provider::DEFAULT_PROVIDER_URL, Audiences, ClientId, ClientSecret, ConfigurationError};

/// The primary-authentication strategy a session uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SessionKind {
    /// Interactive login through a browser redirect
    #[serde(rename = "auth0WebAuth")]
    WebAuth,
    /// Interactive login through the operating system's authorization UI
    #[serde(rename = "auth0WebAuthNative")]
    NativeAuth,
    /// Client credentials issued to a machine
    #[serde(rename = "machineAuth")]
    MachineAuth,
    /// A user's username and password
    #[serde(rename = "passwordGrantAuth")]
    PasswordGrantAuth,
}

/// The default buffer before expiry in which credentials are renewed
pub const DEFAULT_TOKEN_EXPIRES_AT_BUFFER: DurationSecs = DurationSecs(300);

/// The default path the identity provider redirects back to
pub const DEFAULT_AUTHORIZATION_PATH: &str = "/callback";

fn default_provider_url() -> Url {
    Url::parse(DEFAULT_PROVIDER_URL).expect("default provider URL is valid")
}

fn default_authorization_path() -> String {
    DEFAULT_AUTHORIZATION_PATH.to_owned()
}

fn default_token_expires_at_buffer() -> DurationSecs {
    DEFAULT_TOKEN_EXPIRES_AT_BUFFER
}

/// Settings for primary authentication
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// The client ID of this application
    #[serde(default)]
    pub client_id: Option<ClientId>,
    /// The client secret of this application, used by machine sessions
    #[serde(default, skip_serializing)]
    pub client_secret: Option<ClientSecret>,
    /// The identity provider's base URL
    #[serde(default = "default_provider_url")]
    pub provider_url: Url,
    /// The origin the application is served from, used for redirects
    #[serde(default)]
    pub app_origin: Option<Url>,
    /// The path the identity provider redirects back to after login
    #[serde(default = "default_authorization_path")]
    pub authorization_path: String,
    /// How long before expiry a credential is renewed
    #[serde(default = "default_token_expires_at_buffer")]
    pub token_expires_at_buffer: DurationSecs,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            provider_url: default_provider_url(),
            app_origin: None,
            authorization_path: default_authorization_path(),
            token_expires_at_buffer: DEFAULT_TOKEN_EXPIRES_AT_BUFFER,
        }
    }
}

impl AuthConfig {
    /// Sets the client ID of this application
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Sets the client secret of this application
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    /// Sets the identity provider's base URL
    pub fn with_provider_url(mut self, provider_url: Url) -> Self {
        self.provider_url = provider_url;
        self
    }

    /// Sets the origin the application is served from
    pub fn with_app_origin(mut self, app_origin: Url) -> Self {
        self.app_origin = Some(app_origin);
        self
    }

    /// Sets the path the identity provider redirects back to
    pub fn with_authorization_path(mut self, authorization_path: impl Into<String>) -> Self {
        self.authorization_path = authorization_path.into();
        self
    }

    /// Sets how long before expiry a credential is renewed
    pub fn with_token_expires_at_buffer(mut self, buffer: DurationSecs) -> Self {
        self.token_expires_at_buffer = buffer;
        self
    }

    /// The client ID, or an error naming the missing setting
    pub fn require_client_id(&self) -> Result<&ClientId, ConfigurationError> {
        self.client_id
            .as_ref()
            .ok_or(ConfigurationError::MissingSetting("auth.clientId"))
    }

    /// The client secret, or an error naming the missing setting
    pub fn require_client_secret(&self) -> Result<&ClientSecret, ConfigurationError> {
        self.client_secret
            .as_ref()
            .ok_or(ConfigurationError::MissingSetting("auth.clientSecret"))
    }

    /// The application origin, or an error naming the missing setting
    pub fn require_app_origin(&self) -> Result<&Url, ConfigurationError> {
        self.app_origin
            .as_ref()
            .ok_or(ConfigurationError::MissingSetting("auth.appOrigin"))
    }

    /// The URL the identity provider redirects back to after login
    pub fn redirect_uri(&self) -> Result<Url, ConfigurationError> {
        self.require_app_origin()?
            .join(&self.authorization_path)
            .map_err(|err| ConfigurationError::InvalidUrl {
                what: "redirect URI",
                message: err.to_string(),
            })
    }
}

/// Everything needed to construct a session
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// The primary-authentication strategy
    pub session_type: SessionKind,
    /// The audiences tokens may be requested for
    #[serde(default)]
    pub audiences: Audiences,
    /// Primary authentication settings
    #[serde(default)]
    pub auth: AuthConfig,
}

impl SessionConfig {
    /// Constructs a configuration for `session_type` with no audiences and default settings
    pub fn new(session_type: SessionKind) -> Self {
        Self {
            session_type,
            audiences: Audiences::new(),
            auth: AuthConfig::default(),
        }
    }

    /// Replaces the configured audiences
    pub fn with_audiences(mut self, audiences: Audiences) -> Self {
        self.audiences = audiences;
        self
    }

    /// Replaces the primary authentication settings
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Parses a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
