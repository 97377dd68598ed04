//! Construction of sessions from configuration

use std::{fmt, sync::Arc};

use contxt_clock::{Clock, System};
use url::Url;

use super::{
    MachineAuthSession, NativeAuthSession, NativeAuthorizer, PasswordGrantSession, RedirectHook,
    Session, SessionCore, WebAuthSession,
};
use crate::{
    exchange::{ContxtTokenExchange, TokenExchange},
    nonce::NonceSource,
    provider::IdentityProvider,
    stores::{CredentialStore, InMemoryCredentialStore},
    AudienceName, ConfigurationError, SessionConfig, SessionKind, CONTXT_AUTH_AUDIENCE,
};

/// Constructs the session strategy named by a [`SessionConfig`]
pub struct SessionBuilder<C = System> {
    config: SessionConfig,
    client: Option<reqwest::Client>,
    store: Option<Arc<dyn CredentialStore>>,
    authorizer: Option<Arc<dyn NativeAuthorizer>>,
    exchange: Option<Arc<dyn TokenExchange>>,
    nonce_source: Option<Arc<dyn NonceSource>>,
    on_redirect: Option<RedirectHook>,
    clock: C,
}

impl SessionBuilder<System> {
    /// Starts building a session from `config`
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            client: None,
            store: None,
            authorizer: None,
            exchange: None,
            nonce_source: None,
            on_redirect: None,
            clock: System,
        }
    }
}

impl<C> SessionBuilder<C> {
    /// Uses `client` for all HTTP requests
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Persists interactive sessions in `store`
    ///
    /// Without a store, interactive sessions are kept in memory only.
    pub fn with_store(mut self, store: impl CredentialStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Uses `authorizer` as the native authorization UI
    ///
    /// Required for native sessions.
    pub fn with_native_authorizer(mut self, authorizer: impl NativeAuthorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Replaces the HTTP token exchange with another implementation
    pub fn with_token_exchange(mut self, exchange: impl TokenExchange + 'static) -> Self {
        self.exchange = Some(Arc::new(exchange));
        self
    }

    /// Replaces the source of token exchange nonces
    pub fn with_nonce_source(mut self, nonce_source: impl NonceSource + 'static) -> Self {
        self.nonce_source = Some(Arc::new(nonce_source));
        self
    }

    /// Calls `on_redirect` whenever the application should navigate elsewhere
    ///
    /// Web sessions use this to send the user to the identity provider on
    /// login and to its logout endpoint on logout.
    pub fn with_redirect_hook(mut self, on_redirect: impl Fn(&Url) + Send + Sync + 'static) -> Self {
        self.on_redirect = Some(Arc::new(on_redirect));
        self
    }

    /// Reads time from `clock` instead of the system clock
    pub fn with_clock<C2>(self, clock: C2) -> SessionBuilder<C2> {
        SessionBuilder {
            config: self.config,
            client: self.client,
            store: self.store,
            authorizer: self.authorizer,
            exchange: self.exchange,
            nonce_source: self.nonce_source,
            on_redirect: self.on_redirect,
            clock,
        }
    }
}

impl<C> SessionBuilder<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Validates the configuration and constructs the session
    ///
    /// Interactive sessions restore any persisted credential before this
    /// returns.
    pub async fn build(self) -> Result<Session<C>, ConfigurationError> {
        let Self {
            config,
            client,
            store,
            authorizer,
            exchange,
            nonce_source,
            on_redirect,
            clock,
        } = self;

        let client = client.unwrap_or_default();
        let auth_audience = config.audiences.auth()?;
        let auth_client_id = auth_audience
            .client_id()
            .ok_or_else(|| {
                ConfigurationError::MissingClientId(AudienceName::from_static(CONTXT_AUTH_AUDIENCE))
            })?
            .to_owned();

        let exchange: Arc<dyn TokenExchange> = match exchange {
            Some(exchange) => exchange,
            None => {
                let mut http =
                    ContxtTokenExchange::from_audiences(client.clone(), &config.audiences)?;
                if let Some(nonce_source) = nonce_source {
                    http = http.with_nonce_source(nonce_source);
                }
                Arc::new(http)
            }
        };

        let core = SessionCore::new(config.audiences.clone(), exchange, clock);
        let store: Arc<dyn CredentialStore> = match store {
            Some(store) => store,
            None => Arc::new(InMemoryCredentialStore::new()),
        };
        let provider = || -> Result<IdentityProvider, ConfigurationError> {
            Ok(IdentityProvider::new(
                client.clone(),
                config.auth.provider_url.clone(),
                config.auth.require_client_id()?.clone(),
            ))
        };

        let session = match config.session_type {
            SessionKind::WebAuth => Session::Web(
                WebAuthSession::new(
                    core,
                    provider()?,
                    auth_client_id,
                    config.auth.redirect_uri()?,
                    config.auth.require_app_origin()?.clone(),
                    store,
                    on_redirect,
                )
                .await,
            ),
            SessionKind::NativeAuth => {
                let authorizer =
                    authorizer.ok_or(ConfigurationError::MissingSetting("native authorizer"))?;
                Session::Native(
                    NativeAuthSession::new(core, provider()?, auth_client_id, authorizer, store)
                        .await,
                )
            }
            SessionKind::MachineAuth => Session::Machine(MachineAuthSession::new(
                core,
                client.clone(),
                auth_audience.endpoint("v1/oauth/token")?,
                config.auth.require_client_id()?.clone(),
                config.auth.require_client_secret()?.clone(),
                auth_client_id,
                config.auth.token_expires_at_buffer,
            )),
            SessionKind::PasswordGrantAuth => Session::PasswordGrant(PasswordGrantSession::new(
                core,
                provider()?,
                auth_client_id,
            )),
        };

        tracing::debug!(kind = ?config.session_type, "built session");

        Ok(session)
    }
}

impl<C: fmt::Debug> fmt::Debug for SessionBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .field("has_native_authorizer", &self.authorizer.is_some())
            .field("has_token_exchange", &self.exchange.is_some())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use contxt_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{sessions::SessionStrategy, AuthConfig, ClientId, ClientSecret};

    fn config(kind: SessionKind) -> SessionConfig {
        SessionConfig::new(kind).with_audiences(crate::sessions::test_support::audiences())
    }

    #[tokio::test]
    async fn machine_requires_client_secret() {
        let err = SessionBuilder::new(config(SessionKind::MachineAuth).with_auth(
            AuthConfig::default().with_client_id(ClientId::from_static("machine")),
        ))
        .build()
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::MissingSetting("auth.clientSecret")
        ));
    }

    #[tokio::test]
    async fn machine_posts_to_auth_host() {
        let session = SessionBuilder::new(
            config(SessionKind::MachineAuth).with_auth(
                AuthConfig::default()
                    .with_client_id(ClientId::from_static("machine"))
                    .with_client_secret(ClientSecret::from_static("secret")),
            ),
        )
        .with_clock(TestClock::new(UnixTime(0)))
        .build()
        .await
        .unwrap();

        match session {
            Session::Machine(machine) => assert_eq!(
                machine.token_url().as_str(),
                "https://auth.example/v1/oauth/token"
            ),
            other => panic!("unexpected session: {other:?}"),
        }
    }

    #[tokio::test]
    async fn web_requires_app_origin() {
        let err = SessionBuilder::new(config(SessionKind::WebAuth).with_auth(
            AuthConfig::default().with_client_id(ClientId::from_static("app")),
        ))
        .build()
        .await
        .unwrap_err();

        assert!(matches!(err, ConfigurationError::MissingSetting("auth.appOrigin")));
    }

    #[tokio::test]
    async fn native_requires_authorizer() {
        let err = SessionBuilder::new(config(SessionKind::NativeAuth).with_auth(
            AuthConfig::default().with_client_id(ClientId::from_static("app")),
        ))
        .build()
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::MissingSetting("native authorizer")
        ));
    }

    #[tokio::test]
    async fn auth_audience_is_required() {
        let err = SessionBuilder::new(SessionConfig::new(SessionKind::PasswordGrantAuth))
            .build()
            .await
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::MissingAuthAudience));
    }

    #[tokio::test]
    async fn builds_password_session() {
        let session = SessionBuilder::new(config(SessionKind::PasswordGrantAuth).with_auth(
            AuthConfig::default().with_client_id(ClientId::from_static("app")),
        ))
        .build()
        .await
        .unwrap();

        assert_eq!(session.kind(), SessionKind::PasswordGrantAuth);
        assert!(!session.is_authenticated());
    }
}
