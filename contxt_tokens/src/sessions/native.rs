//! Logins through the operating system's authorization UI

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use contxt_clock::{Clock, System};

use super::{LogInOptions, LogInOutcome, SessionCore, SessionStrategy};
use crate::{
    provider::{IdentityProvider, ProviderTokens, UserProfile, DEFAULT_SCOPE},
    stores::{CredentialStore, StorageKey},
    AccessToken, AudienceNameRef, ClientId, LogInError, ProviderError, SessionError, SessionKind,
};

/// What a native authorization UI is asked to obtain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeAuthorizeRequest {
    /// The client ID of the authorization server the token is for
    pub audience: ClientId,
    /// The scope to request
    pub scope: &'static str,
    /// Ask the user to log in even if the provider has a session for them
    pub force_login: bool,
}

/// The platform's interactive authorization UI
///
/// Implementations typically open a system browser sheet against the
/// identity provider and wait for it to hand back tokens.
#[async_trait]
pub trait NativeAuthorizer: Send + Sync {
    /// Shows the authorization UI and returns the tokens it obtained
    ///
    /// A user dismissing the UI should be reported as [`LogInError::Cancelled`].
    async fn authorize(&self, request: NativeAuthorizeRequest) -> Result<ProviderTokens, LogInError>;

    /// Clears the identity provider's session held by the UI
    async fn clear_session(&self) -> Result<(), ProviderError>;
}

/// A session whose user logs in through a native authorization UI
pub struct NativeAuthSession<C = System> {
    core: SessionCore<C>,
    provider: IdentityProvider,
    auth_audience: ClientId,
    authorizer: Arc<dyn NativeAuthorizer>,
    store: Arc<dyn CredentialStore>,
}

impl<C> NativeAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub(crate) async fn new(
        core: SessionCore<C>,
        provider: IdentityProvider,
        auth_audience: ClientId,
        authorizer: Arc<dyn NativeAuthorizer>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let session = Self {
            core,
            provider,
            auth_audience,
            authorizer,
            store,
        };

        match session.store.load(StorageKey::NATIVE).await {
            Ok(Some(credential)) if credential.is_valid_at(session.core.now()) => {
                tracing::debug!("restored persisted native session");
                session.core.establish(credential);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "unable to load persisted native session"),
        }

        session
    }

    /// The shared session state
    pub fn core(&self) -> &SessionCore<C> {
        &self.core
    }
}

#[async_trait]
impl<C> SessionStrategy for NativeAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> SessionKind {
        SessionKind::NativeAuth
    }

    fn is_authenticated(&self) -> bool {
        self.core.is_authenticated()
    }

    async fn get_current_api_token(
        &self,
        audience: &AudienceNameRef,
    ) -> Result<AccessToken, SessionError> {
        self.core.api_token(audience).await
    }

    fn clear_current_api_token(&self, audience: &AudienceNameRef) {
        self.core.clear_api_token(audience)
    }

    async fn get_current_access_token(&self) -> Result<AccessToken, SessionError> {
        self.core.access_token()
    }

    #[tracing::instrument(err, skip_all, fields(force_login = options.force_login))]
    async fn log_in(&self, options: LogInOptions) -> Result<LogInOutcome, SessionError> {
        let generation = self.core.generation();
        let tokens = self
            .authorizer
            .authorize(NativeAuthorizeRequest {
                audience: self.auth_audience.clone(),
                scope: DEFAULT_SCOPE,
                force_login: options.force_login,
            })
            .await?;

        let credential = self
            .core
            .lifetime()
            .create_credential(tokens.access_token, tokens.expires_in);

        let _transition = self.core.transition().await;
        if !self.core.establish_since(generation, credential.clone()) {
            return Err(LogInError::Superseded.into());
        }

        if let Err(error) = self.store.save(StorageKey::NATIVE, &credential).await {
            tracing::warn!(%error, "unable to persist native session");
        }

        Ok(LogInOutcome::Authenticated)
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        {
            let _transition = self.core.transition().await;
            self.core.clear();

            if let Err(error) = self.store.clear(StorageKey::NATIVE).await {
                tracing::warn!(%error, "unable to remove persisted native session");
            }
        }

        if let Err(error) = self.authorizer.clear_session().await {
            tracing::warn!(%error, "unable to end identity provider session");
        }

        Ok(())
    }

    async fn get_profile(&self) -> Result<UserProfile, SessionError> {
        let token = self.core.access_token()?;
        self.provider
            .user_info(&token)
            .await
            .map_err(SessionError::Profile)
    }
}

impl<C: fmt::Debug> fmt::Debug for NativeAuthSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NativeAuthSession")
            .field("core", &self.core)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use contxt_clock::{DurationSecs, TestClock, UnixTime};
    use url::Url;

    use super::*;
    use crate::{sessions::test_support::*, stores::InMemoryCredentialStore};

    #[derive(Default)]
    struct ScriptedAuthorizer {
        outcome: Mutex<Option<Result<ProviderTokens, LogInError>>>,
        requests: Mutex<Vec<NativeAuthorizeRequest>>,
        cleared: AtomicUsize,
        fail_clear: bool,
        /// Paused on twice: once on entry and once before answering
        gate: Option<Arc<tokio::sync::Barrier>>,
    }

    impl ScriptedAuthorizer {
        fn granting(token: &'static str) -> Self {
            Self {
                outcome: Mutex::new(Some(Ok(ProviderTokens {
                    access_token: AccessToken::from_static(token),
                    id_token: None,
                    expires_in: Some(DurationSecs(600)),
                    token_type: Some("Bearer".to_owned()),
                }))),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl NativeAuthorizer for ScriptedAuthorizer {
        async fn authorize(
            &self,
            request: NativeAuthorizeRequest,
        ) -> Result<ProviderTokens, LogInError> {
            self.requests.lock().unwrap().push(request);
            if let Some(gate) = &self.gate {
                gate.wait().await;
                gate.wait().await;
            }
            self.outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(LogInError::Cancelled))
        }

        async fn clear_session(&self) -> Result<(), ProviderError> {
            self.cleared.fetch_add(1, Ordering::SeqCst);
            if self.fail_clear {
                Err(ProviderError::Revocation("browser closed".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    async fn session(
        authorizer: Arc<ScriptedAuthorizer>,
        store: Arc<InMemoryCredentialStore>,
    ) -> NativeAuthSession<TestClock> {
        NativeAuthSession::new(
            SessionCore::new(
                audiences(),
                Arc::new(RecordingExchange::default()),
                TestClock::new(UnixTime(1_000)),
            ),
            IdentityProvider::new(
                reqwest::Client::new(),
                Url::parse("https://tenant.example").unwrap(),
                ClientId::from_static("app-client"),
            ),
            ClientId::from_static("auth-id"),
            authorizer,
            store,
        )
        .await
    }

    #[tokio::test]
    async fn login_persists_credential_and_restores_it() {
        let authorizer = Arc::new(ScriptedAuthorizer::granting("native-primary"));
        let store = Arc::new(InMemoryCredentialStore::new());
        let first = session(authorizer.clone(), store.clone()).await;

        let outcome = first.log_in(LogInOptions::default().forced()).await.unwrap();

        assert_eq!(outcome, LogInOutcome::Authenticated);
        {
            let requests = authorizer.requests.lock().unwrap();
            assert_eq!(requests[0].audience.as_str(), "auth-id");
            assert!(requests[0].force_login);
        }
        let persisted = store.load(StorageKey::NATIVE).await.unwrap().unwrap();
        assert_eq!(persisted.expires_at(), Some(UnixTime(1_600)));

        let second = session(Arc::new(ScriptedAuthorizer::default()), store).await;
        assert!(second.is_authenticated());
        assert_eq!(
            second
                .get_current_api_token(facilities())
                .await
                .unwrap()
                .as_str(),
            "native-primary:facilities:1"
        );
    }

    #[tokio::test]
    async fn expired_persisted_credential_is_ignored() {
        let store = Arc::new(InMemoryCredentialStore::new());
        store
            .save(
                StorageKey::NATIVE,
                &crate::PrimaryCredential::with_expiry(
                    AccessToken::from_static("old"),
                    UnixTime(0),
                    UnixTime(500),
                ),
            )
            .await
            .unwrap();

        let session = session(Arc::new(ScriptedAuthorizer::default()), store).await;

        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn cancelled_login_stays_unauthenticated() {
        let session = session(
            Arc::new(ScriptedAuthorizer::default()),
            Arc::new(InMemoryCredentialStore::new()),
        )
        .await;

        let err = session.log_in(LogInOptions::default()).await.unwrap_err();

        assert!(matches!(err, SessionError::LogIn(LogInError::Cancelled)));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn log_out_clears_locally_even_if_provider_fails() {
        let authorizer = Arc::new(ScriptedAuthorizer {
            fail_clear: true,
            ..ScriptedAuthorizer::granting("native-primary")
        });
        let store = Arc::new(InMemoryCredentialStore::new());
        let session = session(authorizer.clone(), store.clone()).await;
        session.log_in(LogInOptions::default()).await.unwrap();

        session.log_out().await.unwrap();

        assert!(!session.is_authenticated());
        assert_eq!(store.load(StorageKey::NATIVE).await.unwrap(), None);
        assert_eq!(authorizer.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn log_out_during_login_is_not_undone() {
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let authorizer = Arc::new(ScriptedAuthorizer {
            gate: Some(gate.clone()),
            ..ScriptedAuthorizer::granting("late-primary")
        });
        let store = Arc::new(InMemoryCredentialStore::new());
        let session = Arc::new(session(authorizer, store.clone()).await);

        let login = tokio::spawn({
            let session = session.clone();
            async move { session.log_in(LogInOptions::default()).await }
        });
        gate.wait().await;
        session.log_out().await.unwrap();
        gate.wait().await;

        let err = login.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::LogIn(LogInError::Superseded)));
        assert!(!session.is_authenticated());
        assert_eq!(store.load(StorageKey::NATIVE).await.unwrap(), None);
    }
}
