//! A client for the identity provider that issues primary credentials
//!
//! The provider speaks the Auth0 dialect: an `/authorize` endpoint for
//! browser logins, `/oauth/token` for the password grant, `/userinfo` for
//! profiles, and `/v2/logout` to end the provider's own session.

use std::sync::Arc;

use url::Url;

use crate::{
    AccessTokenRef, ClientId, ClientIdRef, ConfigurationError, LogInError, PasswordRef,
    ProviderError,
};

mod dto;

pub(crate) use dto::ErrorResponse;
pub use dto::{ProviderTokens, UserProfile};

/// The identity provider used when none is configured
pub const DEFAULT_PROVIDER_URL: &str = "https://ndustrial.auth0.com";

/// The scope requested for interactive and password logins
pub const DEFAULT_SCOPE: &str = "email profile openid";

/// Parameters of a browser authorization request
#[derive(Clone, Debug)]
pub struct AuthorizeRequest<'a> {
    /// Where the provider sends the browser once the user has logged in
    pub redirect_uri: &'a Url,
    /// The client ID of the authorization server the token is for
    pub audience: &'a ClientIdRef,
    /// Opaque value correlating the callback with this request
    pub state: &'a str,
    /// Opaque value bound into the issued ID token
    pub nonce: &'a str,
    /// Ask the user to log in even if the provider has a session for them
    pub force_login: bool,
}

/// A client for an Auth0-compatible identity provider
#[derive(Clone, Debug)]
pub struct IdentityProvider {
    client: reqwest::Client,
    base_url: Url,
    client_id: ClientId,
}

impl IdentityProvider {
    /// Constructs a client for the provider at `base_url`, identifying as `client_id`
    pub fn new(client: reqwest::Client, base_url: Url, client_id: ClientId) -> Self {
        Self {
            client,
            base_url,
            client_id,
        }
    }

    /// The provider's base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The client ID this application identifies as
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConfigurationError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|err| ConfigurationError::InvalidUrl {
            what: "identity provider endpoint",
            message: err.to_string(),
        })
    }

    /// Builds the URL the browser is sent to for an implicit-flow login
    pub fn authorize_url(&self, request: &AuthorizeRequest) -> Result<Url, ConfigurationError> {
        let mut url = self.endpoint("authorize")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "token")
                .append_pair("client_id", self.client_id.as_str())
                .append_pair("redirect_uri", request.redirect_uri.as_str())
                .append_pair("audience", request.audience.as_str())
                .append_pair("scope", DEFAULT_SCOPE)
                .append_pair("state", request.state)
                .append_pair("nonce", request.nonce);
            if request.force_login {
                query.append_pair("prompt", "login");
            }
        }
        Ok(url)
    }

    /// Builds the URL that ends the provider's session and returns to `return_to`
    pub fn logout_url(&self, return_to: &Url) -> Result<Url, ConfigurationError> {
        let mut url = self.endpoint("v2/logout")?;
        url.query_pairs_mut()
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("returnTo", return_to.as_str());
        Ok(url)
    }

    /// Logs a user in with their username and password
    #[tracing::instrument(err, skip_all, fields(provider = %self.base_url))]
    pub async fn password_grant(
        &self,
        username: &str,
        password: &PasswordRef,
        audience: &ClientIdRef,
    ) -> Result<ProviderTokens, LogInError> {
        let url = self.endpoint("oauth/token")?;

        let grant = dto::PasswordGrant {
            client_id: &self.client_id,
            audience,
            username,
            password,
            scope: DEFAULT_SCOPE,
        };

        tracing::trace!("requesting password grant from identity provider");

        let resp = self
            .client
            .post(url)
            .json(&grant)
            .send()
            .await
            .map_err(|err| LogInError::Transport(Arc::new(err)))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received password grant response"
        );

        let body = resp
            .bytes()
            .await
            .map_err(|err| LogInError::Transport(Arc::new(err)))?;

        if !status.is_success() {
            return Err(LogInError::Rejected {
                status,
                message: dto::ErrorResponse::describe(&String::from_utf8_lossy(&body)),
            });
        }

        let tokens: ProviderTokens =
            serde_json::from_slice(&body).map_err(|err| LogInError::Body(Arc::new(err)))?;

        tracing::info!("user logged in with password grant");

        Ok(tokens)
    }

    /// Fetches the profile of the user `access_token` was issued to
    #[tracing::instrument(err, skip_all, fields(provider = %self.base_url))]
    pub async fn user_info(&self, access_token: &AccessTokenRef) -> Result<UserProfile, ProviderError> {
        let url = self.endpoint("userinfo")?;

        let resp = self
            .client
            .get(url)
            .bearer_auth(access_token.as_str())
            .send()
            .await
            .map_err(|err| ProviderError::Transport(Arc::new(err)))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|err| ProviderError::Transport(Arc::new(err)))?;

        if !status.is_success() {
            return Err(ProviderError::Rejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|err| ProviderError::Body(Arc::new(err)))
    }
}
