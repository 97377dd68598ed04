//! Browser redirect logins
//!
//! [`log_in()`][SessionStrategy::log_in()] does not authenticate by itself:
//! it builds the identity provider's authorization URL and remembers the
//! `state` it sent. The login finishes when the application routes the
//! provider's redirect to [`WebAuthSession::handle_authentication()`], which
//! only accepts a callback carrying that same `state`.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use contxt_clock::{Clock, DurationSecs, System};
use url::Url;

use super::{LogInOptions, LogInOutcome, SessionCore, SessionStrategy};
use crate::{
    nonce::random_string,
    provider::{AuthorizeRequest, IdentityProvider, UserProfile},
    stores::{CredentialStore, StorageKey},
    AccessToken, AudienceNameRef, ClientId, LogInError, PrimaryCredential, SessionError,
    SessionKind,
};

const STATE_LEN: usize = 32;

/// Called with every URL the application should navigate to
pub type RedirectHook = Arc<dyn Fn(&Url) + Send + Sync>;

#[derive(Debug)]
struct PendingLogIn {
    state: String,
}

/// A session whose user logs in through a browser redirect
pub struct WebAuthSession<C = System> {
    core: SessionCore<C>,
    provider: IdentityProvider,
    auth_audience: ClientId,
    redirect_uri: Url,
    app_origin: Url,
    store: Arc<dyn CredentialStore>,
    pending: Mutex<Option<PendingLogIn>>,
    on_redirect: Option<RedirectHook>,
}

impl<C> WebAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub(crate) async fn new(
        core: SessionCore<C>,
        provider: IdentityProvider,
        auth_audience: ClientId,
        redirect_uri: Url,
        app_origin: Url,
        store: Arc<dyn CredentialStore>,
        on_redirect: Option<RedirectHook>,
    ) -> Self {
        let session = Self {
            core,
            provider,
            auth_audience,
            redirect_uri,
            app_origin,
            store,
            pending: Mutex::new(None),
            on_redirect,
        };
        session.restore().await;
        session
    }

    async fn restore(&self) {
        match self.store.load(StorageKey::WEB).await {
            Ok(Some(credential)) if credential.is_valid_at(self.core.now()) => {
                tracing::debug!("restored persisted web session");
                self.core.establish(credential);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "unable to load persisted web session"),
        }
    }

    /// The shared session state
    pub fn core(&self) -> &SessionCore<C> {
        &self.core
    }

    fn redirect(&self, url: &Url) {
        if let Some(on_redirect) = &self.on_redirect {
            on_redirect(url);
        }
    }

    fn take_pending_if(&self, matches: impl FnOnce(&PendingLogIn) -> bool) -> Result<(), LogInError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.as_ref() {
            None => Err(LogInError::NoPendingLogIn),
            Some(p) if matches(p) => {
                *pending = None;
                Ok(())
            }
            Some(_) => Err(LogInError::StateMismatch),
        }
    }

    /// Completes a login from the URL the identity provider redirected to
    ///
    /// The parameters are read from the URL fragment, falling back to the
    /// query string. The callback is rejected unless its `state` matches the
    /// login started by the most recent call to `log_in()`; a mismatched
    /// callback leaves that login pending.
    #[tracing::instrument(err, skip_all)]
    pub async fn handle_authentication(
        &self,
        callback: &Url,
    ) -> Result<PrimaryCredential, SessionError> {
        let params: HashMap<String, String> = match callback.fragment() {
            Some(fragment) if !fragment.is_empty() => {
                url::form_urlencoded::parse(fragment.as_bytes())
                    .into_owned()
                    .collect()
            }
            _ => callback.query_pairs().into_owned().collect(),
        };

        let state = params.get("state").map(String::as_str).unwrap_or_default();

        let _transition = self.core.transition().await;

        if let Some(error) = params.get("error") {
            self.take_pending_if(|p| p.state == state)?;
            return Err(LogInError::Callback {
                error: error.clone(),
                description: params
                    .get("error_description")
                    .cloned()
                    .unwrap_or_default(),
            }
            .into());
        }

        self.take_pending_if(|p| p.state == state)?;

        let access_token = params
            .get("access_token")
            .ok_or_else(|| LogInError::MalformedCallback("missing access_token".to_owned()))?;

        let expires_in = params
            .get("expires_in")
            .map(|v| {
                v.parse::<u64>().map(DurationSecs).map_err(|_| {
                    LogInError::MalformedCallback(format!("invalid expires_in `{v}`"))
                })
            })
            .transpose()?;

        let credential = self
            .core
            .lifetime()
            .create_credential(AccessToken::new(access_token.clone()), expires_in);

        self.core.establish(credential.clone());

        // Still inside the transition, so a logout cannot remove the
        // credential between these two steps and have it written back.
        if let Err(error) = self.store.save(StorageKey::WEB, &credential).await {
            tracing::warn!(%error, "unable to persist web session");
        }

        Ok(credential)
    }
}

#[async_trait]
impl<C> SessionStrategy for WebAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> SessionKind {
        SessionKind::WebAuth
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

    async fn log_in(&self, options: LogInOptions) -> Result<LogInOutcome, SessionError> {
        let state = random_string(STATE_LEN);
        let nonce = random_string(STATE_LEN);

        let url = self.provider.authorize_url(&AuthorizeRequest {
            redirect_uri: &self.redirect_uri,
            audience: &self.auth_audience,
            state: &state,
            nonce: &nonce,
            force_login: options.force_login,
        })?;

        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(PendingLogIn { state });

        tracing::debug!(force_login = options.force_login, "redirecting to identity provider");
        self.redirect(&url);

        Ok(LogInOutcome::Redirect(url))
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        {
            let _transition = self.core.transition().await;
            self.core.clear();
            *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = None;

            if let Err(error) = self.store.clear(StorageKey::WEB).await {
                tracing::warn!(%error, "unable to remove persisted web session");
            }
        }

        match self.provider.logout_url(&self.app_origin) {
            Ok(url) => self.redirect(&url),
            Err(error) => tracing::warn!(%error, "unable to end identity provider session"),
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

impl<C: fmt::Debug> fmt::Debug for WebAuthSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WebAuthSession")
            .field("core", &self.core)
            .field("provider", &self.provider)
            .field("redirect_uri", &self.redirect_uri.as_str())
            .finish_non_exhaustive()
    }
}
