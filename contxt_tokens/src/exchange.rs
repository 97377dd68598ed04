//! Exchanging a primary credential for audience-scoped API tokens

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    nonce::{NonceSource, StaticNonce},
    AccessToken, AccessTokenRef, AudienceDescriptor, AudienceName, Audiences, ClientIdRef,
    ConfigurationError, TokenExchangeError,
};

/// Trades a primary credential for an API token scoped to one or more audiences
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Requests a token for `audiences` using `primary` as the bearer credential
    ///
    /// Audiences without a client ID are skipped.
    async fn exchange(
        &self,
        primary: &AccessTokenRef,
        audiences: &[AudienceDescriptor],
    ) -> Result<AccessToken, TokenExchangeError>;
}

#[async_trait]
impl<T: TokenExchange + ?Sized> TokenExchange for Arc<T> {
    async fn exchange(
        &self,
        primary: &AccessTokenRef,
        audiences: &[AudienceDescriptor],
    ) -> Result<AccessToken, TokenExchangeError> {
        (**self).exchange(primary, audiences).await
    }
}

/// Performs token exchanges against the Contxt authorization server's `/v1/token` endpoint
#[derive(Clone)]
pub struct ContxtTokenExchange {
    client: reqwest::Client,
    token_url: Url,
    nonce_source: Arc<dyn NonceSource>,
}

impl ContxtTokenExchange {
    /// Constructs a new exchange client posting to `token_url`
    ///
    /// Requests carry the literal nonce `nonce` unless another source is set
    /// with [`with_nonce_source()`][Self::with_nonce_source()].
    pub fn new(client: reqwest::Client, token_url: Url) -> Self {
        Self {
            client,
            token_url,
            nonce_source: Arc::new(StaticNonce::default()),
        }
    }

    /// Constructs a new exchange client for the configured authorization server audience
    pub fn from_audiences(
        client: reqwest::Client,
        audiences: &Audiences,
    ) -> Result<Self, ConfigurationError> {
        let token_url = audiences.auth()?.endpoint("v1/token")?;
        Ok(Self::new(client, token_url))
    }

    /// Replaces the source of request nonces
    pub fn with_nonce_source(mut self, nonce_source: impl NonceSource + 'static) -> Self {
        self.nonce_source = Arc::new(nonce_source);
        self
    }

    /// The endpoint exchanges are posted to
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

impl fmt::Debug for ContxtTokenExchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ContxtTokenExchange")
            .field("token_url", &self.token_url.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    audiences: Vec<&'a ClientIdRef>,
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: AccessToken,
}

#[async_trait]
impl TokenExchange for ContxtTokenExchange {
    #[tracing::instrument(
        err,
        skip_all,
        fields(
            token_url = %self.token_url,
            audiences = ?audiences.iter().map(|a| a.name().as_str()).collect::<Vec<_>>(),
        ),
    )]
    async fn exchange(
        &self,
        primary: &AccessTokenRef,
        audiences: &[AudienceDescriptor],
    ) -> Result<AccessToken, TokenExchangeError> {
        let names = || -> Vec<AudienceName> { audiences.iter().map(|a| a.name().to_owned()).collect() };

        let targets: Vec<&ClientIdRef> = audiences.iter().filter_map(|a| a.client_id()).collect();
        if targets.is_empty() {
            return Err(TokenExchangeError::NoTargets(names()));
        }

        let payload = ExchangeRequest {
            audiences: targets,
            nonce: self.nonce_source.nonce(),
        };

        tracing::trace!("requesting api token from authorization server");

        let resp = self
            .client
            .post(self.token_url.clone())
            .bearer_auth(primary.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|err| TokenExchangeError::Transport(Arc::new(err)))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token exchange response"
        );

        if !status.is_success() {
            let body = resp
                .text()
                .await
                .map_err(|err| TokenExchangeError::Transport(Arc::new(err)))?;
            return Err(TokenExchangeError::Rejected {
                audiences: names(),
                status,
                body,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| TokenExchangeError::Transport(Arc::new(err)))?;
        let resp: ExchangeResponse =
            serde_json::from_slice(&body).map_err(|err| TokenExchangeError::Body(Arc::new(err)))?;

        tracing::info!("received new api token");

        Ok(resp.access_token)
    }
}
