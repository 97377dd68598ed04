//! Session strategies
//!
//! A session owns one primary credential and the API tokens exchanged for it.
//! The four strategies differ only in how the primary credential is
//! obtained; everything after that, from audience lookup through the
//! coalescing token cache, is shared in [`SessionCore`].
//!
//! Use a [`SessionBuilder`] to construct the strategy named by a
//! [`SessionConfig`][crate::SessionConfig].

use std::{
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use contxt_clock::{Clock, System, UnixTime};
use url::Url;

use crate::{
    cache::AudienceTokenCache, exchange::TokenExchange, provider::UserProfile, AccessToken,
    AudienceDescriptor, AudienceNameRef, Audiences, ConfigurationError, CredentialLifetimeConfig, Password,
    PrimaryCredential, SessionError, SessionKind, UnauthorizedError,
};

mod builder;
mod machine;
mod native;
mod password;
mod web;

pub use builder::SessionBuilder;
pub use machine::MachineAuthSession;
pub use native::{NativeAuthSession, NativeAuthorizeRequest, NativeAuthorizer};
pub use password::PasswordGrantSession;
pub use web::{RedirectHook, WebAuthSession};

/// Options for [`SessionStrategy::log_in()`]
#[derive(Clone, Debug, Default)]
pub struct LogInOptions {
    /// Require the user to log in again even if the provider remembers them
    pub force_login: bool,
    /// The username for password logins
    pub username: Option<String>,
    /// The password for password logins
    pub password: Option<Password>,
}

impl LogInOptions {
    /// Options for a password login
    pub fn password(username: impl Into<String>, password: Password) -> Self {
        Self {
            force_login: false,
            username: Some(username.into()),
            password: Some(password),
        }
    }

    /// Requires the user to log in again
    pub fn forced(mut self) -> Self {
        self.force_login = true;
        self
    }
}

/// What the caller needs to do after starting a login
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogInOutcome {
    /// The user must be sent to this URL; the login completes on callback
    Redirect(Url),
    /// The session holds a new primary credential
    Authenticated,
}

/// The contract shared by every session strategy
#[async_trait]
pub trait SessionStrategy: Send + Sync {
    /// The kind of strategy
    fn kind(&self) -> SessionKind;

    /// Whether the session holds a primary credential that has not expired
    fn is_authenticated(&self) -> bool;

    /// Gets an API token for the named audience
    ///
    /// Fails with [`SessionError::Unauthorized`] without any network call if
    /// the session is not authenticated. Concurrent calls for the same
    /// audience share a single token exchange.
    async fn get_current_api_token(
        &self,
        audience: &AudienceNameRef,
    ) -> Result<AccessToken, SessionError>;

    /// Forgets the API token for the named audience
    ///
    /// The next request for the audience performs a new exchange.
    fn clear_current_api_token(&self, audience: &AudienceNameRef);

    /// Gets the raw primary credential
    async fn get_current_access_token(&self) -> Result<AccessToken, SessionError>;

    /// Starts or performs a login
    async fn log_in(&self, options: LogInOptions) -> Result<LogInOutcome, SessionError>;

    /// Ends the session, discarding every credential it holds
    async fn log_out(&self) -> Result<(), SessionError>;

    /// Gets the profile of the logged-in user
    async fn get_profile(&self) -> Result<UserProfile, SessionError>;
}

#[async_trait]
impl<T: SessionStrategy + ?Sized> SessionStrategy for Arc<T> {
    fn kind(&self) -> SessionKind {
        (**self).kind()
    }

    fn is_authenticated(&self) -> bool {
        (**self).is_authenticated()
    }

    async fn get_current_api_token(
        &self,
        audience: &AudienceNameRef,
    ) -> Result<AccessToken, SessionError> {
        (**self).get_current_api_token(audience).await
    }

    fn clear_current_api_token(&self, audience: &AudienceNameRef) {
        (**self).clear_current_api_token(audience)
    }

    async fn get_current_access_token(&self) -> Result<AccessToken, SessionError> {
        (**self).get_current_access_token().await
    }

    async fn log_in(&self, options: LogInOptions) -> Result<LogInOutcome, SessionError> {
        (**self).log_in(options).await
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        (**self).log_out().await
    }

    async fn get_profile(&self) -> Result<UserProfile, SessionError> {
        (**self).get_profile().await
    }
}

/// A primary credential slot that can be shared with in-flight exchanges
#[derive(Clone, Debug, Default)]
pub(crate) struct CredentialSlot(Arc<RwLock<Option<PrimaryCredential>>>);

impl CredentialSlot {
    pub(crate) fn get(&self) -> Option<PrimaryCredential> {
        self.with_read(Option::clone)
    }

    fn with_read<T>(&self, f: impl FnOnce(&Option<PrimaryCredential>) -> T) -> T {
        let slot = self.0.read().unwrap_or_else(PoisonError::into_inner);
        f(&slot)
    }

    /// Replaces the credential only if `allow` still holds once the slot is locked
    pub(crate) fn replace_if(&self, credential: PrimaryCredential, allow: impl FnOnce() -> bool) -> bool {
        let mut slot = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if allow() {
            *slot = Some(credential);
            true
        } else {
            false
        }
    }

    fn with_write<T>(&self, f: impl FnOnce(&mut Option<PrimaryCredential>) -> T) -> T {
        let mut slot = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut slot)
    }
}

/// The state every strategy shares: audiences, credential, and token cache
///
/// Replacing or clearing the credential resets the token cache while the
/// credential is still write-locked. A token exchange reads the credential
/// and the cache generation under the read lock, so an exchange is only ever
/// registered in the generation of the credential it was built from.
pub struct SessionCore<C = System> {
    audiences: Audiences,
    exchange: Arc<dyn TokenExchange>,
    credential: CredentialSlot,
    cache: AudienceTokenCache<C>,
    lifetime: CredentialLifetimeConfig<C>,
    transitions: tokio::sync::Mutex<()>,
}

impl<C> SessionCore<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(audiences: Audiences, exchange: Arc<dyn TokenExchange>, clock: C) -> Self {
        Self {
            audiences,
            exchange,
            credential: CredentialSlot::default(),
            cache: AudienceTokenCache::with_clock(clock.clone()),
            lifetime: CredentialLifetimeConfig::new(clock),
            transitions: tokio::sync::Mutex::new(()),
        }
    }

    /// The configured audiences
    pub fn audiences(&self) -> &Audiences {
        &self.audiences
    }

    /// The per-audience token cache
    pub fn cache(&self) -> &AudienceTokenCache<C> {
        &self.cache
    }

    pub(crate) fn credential_slot(&self) -> &CredentialSlot {
        &self.credential
    }

    pub(crate) fn lifetime(&self) -> &CredentialLifetimeConfig<C> {
        &self.lifetime
    }

    /// The current time according to the session's clock
    pub fn now(&self) -> UnixTime {
        self.lifetime.now()
    }

    /// The primary credential, if one is held and still valid
    pub fn credential(&self) -> Option<PrimaryCredential> {
        let now = self.now();
        self.credential.get().filter(|c| c.is_valid_at(now))
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }

    pub(crate) fn require_credential(&self) -> Result<PrimaryCredential, UnauthorizedError> {
        self.credential().ok_or_else(UnauthorizedError::local)
    }

    pub(crate) fn access_token(&self) -> Result<AccessToken, SessionError> {
        Ok(self.require_credential()?.access_token().to_owned())
    }

    /// The credential and the cache generation it belongs to
    fn snapshot(&self) -> (Option<PrimaryCredential>, u64) {
        self.credential
            .with_read(|slot| (slot.clone(), self.cache.generation()))
    }

    /// The current session generation, advanced by every login and logout
    pub(crate) fn generation(&self) -> u64 {
        self.cache.generation()
    }

    /// Gets an API token using the held primary credential
    pub(crate) async fn api_token(&self, audience: &AudienceNameRef) -> Result<AccessToken, SessionError> {
        loop {
            let (credential, generation) = self.snapshot();
            let now = self.now();
            let primary = credential
                .filter(|c| c.is_valid_at(now))
                .ok_or_else(UnauthorizedError::local)?
                .access_token()
                .to_owned();
            let descriptor = self.audiences.require_token_audience(audience)?.clone();

            let fetched = self
                .fetch_in(audience, descriptor, generation, async move { Ok(primary) })
                .await;
            if let Some(result) = fetched {
                return result;
            }
            tracing::debug!(%audience, "credential changed before exchanging, retrying");
        }
    }

    /// Gets an API token, resolving the primary credential only if an exchange is needed
    pub(crate) async fn api_token_with<F, P>(
        &self,
        audience: &AudienceNameRef,
        primary: F,
    ) -> Result<AccessToken, SessionError>
    where
        F: Fn() -> P,
        P: Future<Output = Result<AccessToken, SessionError>> + Send + 'static,
    {
        let descriptor = self.audiences.require_token_audience(audience)?.clone();

        loop {
            let generation = self.generation();
            let fetched = self
                .fetch_in(audience, descriptor.clone(), generation, primary())
                .await;
            if let Some(result) = fetched {
                return result;
            }
            tracing::debug!(%audience, "session reset before exchanging, retrying");
        }
    }

    async fn fetch_in<P>(
        &self,
        audience: &AudienceNameRef,
        descriptor: AudienceDescriptor,
        generation: u64,
        primary: P,
    ) -> Option<Result<AccessToken, SessionError>>
    where
        P: Future<Output = Result<AccessToken, SessionError>> + Send + 'static,
    {
        let exchange = Arc::clone(&self.exchange);

        self.cache
            .fetch_in_generation(audience, generation, move || async move {
                let primary = primary.await?;
                let token = exchange
                    .exchange(&primary, std::slice::from_ref(&descriptor))
                    .await?;
                Ok::<_, SessionError>(token)
            })
            .await
    }

    pub(crate) fn clear_api_token(&self, audience: &AudienceNameRef) {
        self.cache.invalidate(audience);
    }

    /// Installs a new primary credential and forgets every API token
    pub(crate) fn establish(&self, credential: PrimaryCredential) {
        self.credential.with_write(|slot| {
            *slot = Some(credential);
            self.cache.reset();
        });
        tracing::info!("established new primary credential");
    }

    /// Installs a new primary credential unless the session was reset since `generation`
    ///
    /// Used by logins that waited on the user or the network, so that a
    /// logout in the meantime is not undone.
    pub(crate) fn establish_since(&self, generation: u64, credential: PrimaryCredential) -> bool {
        let established = self.credential.with_write(|slot| {
            if self.cache.generation() != generation {
                return false;
            }
            *slot = Some(credential);
            self.cache.reset();
            true
        });

        if established {
            tracing::info!("established new primary credential");
        } else {
            tracing::debug!("session was reset during login, discarding credential");
        }
        established
    }

    /// Serializes logins and logouts that touch persisted state
    ///
    /// Held across the store write of a login and the store removal of a
    /// logout, so that neither can interleave with the other.
    pub(crate) async fn transition(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.transitions.lock().await
    }

    /// Forgets the primary credential and every API token
    pub(crate) fn clear(&self) {
        self.credential.with_write(|slot| {
            *slot = None;
            self.cache.reset();
        });
        tracing::debug!("cleared session credentials");
    }
}

pub(crate) fn unsupported(kind: SessionKind, operation: &'static str) -> SessionError {
    ConfigurationError::UnsupportedOperation {
        session: kind,
        operation,
    }
    .into()
}

impl<C: fmt::Debug> fmt::Debug for SessionCore<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("audiences", &self.audiences)
            .field("cache", &self.cache)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// A session of any kind, as selected by configuration
#[derive(Debug)]
pub enum Session<C = System> {
    /// Browser redirect login
    Web(WebAuthSession<C>),
    /// Operating system authorization UI
    Native(NativeAuthSession<C>),
    /// Client credentials
    Machine(MachineAuthSession<C>),
    /// Username and password
    PasswordGrant(PasswordGrantSession<C>),
}

impl<C> Session<C>
where
    C: Clock + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn strategy(&self) -> &dyn SessionStrategy {
        match self {
            Self::Web(s) => s,
            Self::Native(s) => s,
            Self::Machine(s) => s,
            Self::PasswordGrant(s) => s,
        }
    }

    /// Completes a browser login from the URL the identity provider redirected to
    ///
    /// Only web sessions receive callbacks.
    pub async fn handle_authentication(
        &self,
        callback: &Url,
    ) -> Result<PrimaryCredential, SessionError> {
        match self {
            Self::Web(s) => s.handle_authentication(callback).await,
            other => Err(unsupported(other.kind(), "handle_authentication")),
        }
    }
}

#[async_trait]
impl<C> SessionStrategy for Session<C>
where
    C: Clock + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn kind(&self) -> SessionKind {
        self.strategy().kind()
    }

    fn is_authenticated(&self) -> bool {
        self.strategy().is_authenticated()
    }

    async fn get_current_api_token(
        &self,
        audience: &AudienceNameRef,
    ) -> Result<AccessToken, SessionError> {
        self.strategy().get_current_api_token(audience).await
    }

    fn clear_current_api_token(&self, audience: &AudienceNameRef) {
        self.strategy().clear_current_api_token(audience)
    }

    async fn get_current_access_token(&self) -> Result<AccessToken, SessionError> {
        self.strategy().get_current_access_token().await
    }

    async fn log_in(&self, options: LogInOptions) -> Result<LogInOutcome, SessionError> {
        self.strategy().log_in(options).await
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        self.strategy().log_out().await
    }

    async fn get_profile(&self) -> Result<UserProfile, SessionError> {
        self.strategy().get_profile().await
    }
}


#[cfg(test)]
mod tests {
    use contxt_clock::{DurationSecs, TestClock};

    use super::{test_support::*, *};

    fn core() -> (SessionCore<TestClock>, Arc<RecordingExchange>, TestClock) {
        let clock = TestClock::new(UnixTime(1_000));
        let exchange = Arc::new(RecordingExchange::default());
        let core = SessionCore::new(audiences(), exchange.clone(), clock.clone());
        (core, exchange, clock)
    }

    mod when_unauthenticated {
        use super::*;

        #[tokio::test]
        async fn api_token_fails_locally() {
            let (core, exchange, _) = core();

            let err = core.api_token(facilities()).await.unwrap_err();

            match err {
                SessionError::Unauthorized(err) => assert!(err.is_local()),
                other => panic!("unexpected error: {other:?}"),
            }
            assert_eq!(exchange.calls(), 0);
        }

        #[tokio::test]
        async fn unauthorized_is_reported_before_configuration() {
            let (core, _, _) = core();

            let err = core
                .api_token(AudienceNameRef::from_str("nope"))
                .await
                .unwrap_err();

            assert!(err.is_unauthorized());
        }
    }

    mod when_authenticated {
        use super::*;

        fn authenticated() -> (SessionCore<TestClock>, Arc<RecordingExchange>, TestClock) {
            let (core, exchange, clock) = core();
            let credential = core
                .lifetime()
                .create_credential(AccessToken::from_static("primary"), Some(DurationSecs(3_600)));
            core.establish(credential);
            (core, exchange, clock)
        }

        #[tokio::test]
        async fn exchanges_once_per_audience() {
            let (core, exchange, _) = authenticated();

            let first = core.api_token(facilities()).await.unwrap();
            let second = core.api_token(facilities()).await.unwrap();

            assert_eq!(first.as_str(), "primary:facilities:1");
            assert_eq!(first, second);
            assert_eq!(exchange.calls(), 1);
        }

        #[tokio::test]
        async fn audience_without_client_id_is_a_configuration_error() {
            let (core, exchange, _) = authenticated();

            let err = core
                .api_token(AudienceNameRef::from_str("bus"))
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                SessionError::Configuration(ConfigurationError::MissingClientId(_))
            ));
            assert_eq!(exchange.calls(), 0);
        }

        #[tokio::test]
        async fn expired_credential_is_unauthenticated() {
            let (core, exchange, clock) = authenticated();

            clock.inc(3_600);

            assert!(!core.is_authenticated());
            assert!(core.api_token(facilities()).await.unwrap_err().is_unauthorized());
            assert_eq!(exchange.calls(), 0);
        }

        #[tokio::test]
        async fn clear_forgets_credential_and_tokens() {
            let (core, exchange, _) = authenticated();
            core.api_token(facilities()).await.unwrap();

            core.clear();

            assert!(!core.is_authenticated());
            assert!(core.cache().cached(facilities()).is_none());
            assert!(core.api_token(facilities()).await.unwrap_err().is_unauthorized());
            assert_eq!(exchange.calls(), 1);
        }

        #[tokio::test]
        async fn establishing_a_new_credential_resets_tokens() {
            let (core, _, _) = authenticated();
            core.api_token(facilities()).await.unwrap();

            core.establish(PrimaryCredential::without_expiry(
                AccessToken::from_static("second"),
                UnixTime(1_000),
            ));

            let token = core.api_token(facilities()).await.unwrap();
            assert_eq!(token.as_str(), "second:facilities:2");
        }
    }

    mod when_credential_changes_concurrently {
        use std::sync::atomic::{AtomicBool, Ordering};

        use super::*;

        fn primary(k: usize) -> PrimaryCredential {
            PrimaryCredential::without_expiry(AccessToken::new(format!("p{k}")), UnixTime(1_000))
        }

        fn assert_cached_for(core: &SessionCore<TestClock>, k: usize) {
            if let Some(cached) = core.cache().cached(facilities()) {
                let expected = format!("p{k}:");
                assert!(
                    cached.token.as_str().starts_with(&expected),
                    "cached {} while p{k} is current",
                    cached.token.as_str()
                );
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn cached_token_always_belongs_to_current_credential() {
            let (core, exchange, _) = core();
            let core = Arc::new(core);
            core.establish(primary(0));
            let stop = Arc::new(AtomicBool::new(false));

            let callers: Vec<_> = (0..4)
                .map(|_| {
                    let core = core.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        while !stop.load(Ordering::Relaxed) {
                            let _ = core.api_token(facilities()).await;
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();

            for k in 0..2_000 {
                assert_cached_for(&core, k);
                core.clear();
                core.establish(primary(k + 1));
                if k % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }

            stop.store(true, Ordering::Relaxed);
            for caller in callers {
                caller.await.unwrap();
            }

            assert_cached_for(&core, 2_000);
            let token = core.api_token(facilities()).await.unwrap();
            assert!(token.as_str().starts_with("p2000:"));
            assert!(exchange.calls() > 0);
        }

        #[tokio::test]
        async fn login_completing_after_logout_is_discarded() {
            let (core, _, _) = core();
            core.establish(primary(0));
            let generation = core.generation();

            core.clear();

            assert!(!core.establish_since(generation, primary(1)));
            assert!(!core.is_authenticated());
            assert!(core.api_token(facilities()).await.unwrap_err().is_unauthorized());
        }
    }
}
