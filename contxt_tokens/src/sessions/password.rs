//! Logins with a username and password

use std::fmt;

use async_trait::async_trait;
use contxt_clock::{Clock, System};

use super::{unsupported, LogInOptions, LogInOutcome, SessionCore, SessionStrategy};
use crate::{
    provider::{IdentityProvider, UserProfile},
    AccessToken, AudienceNameRef, ClientId, LogInError, SessionError, SessionKind,
};

/// A session authenticated with the resource owner password grant
///
/// Credentials are held in memory only.
pub struct PasswordGrantSession<C = System> {
    core: SessionCore<C>,
    provider: IdentityProvider,
    auth_audience: ClientId,
}

impl<C> PasswordGrantSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(core: SessionCore<C>, provider: IdentityProvider, auth_audience: ClientId) -> Self {
        Self {
            core,
            provider,
            auth_audience,
        }
    }

    /// The shared session state
    pub fn core(&self) -> &SessionCore<C> {
        &self.core
    }
}

#[async_trait]
impl<C> SessionStrategy for PasswordGrantSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> SessionKind {
        SessionKind::PasswordGrantAuth
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
        let username = options
            .username
            .as_deref()
            .ok_or(LogInError::MissingCredentials("username"))?;
        let password = options
            .password
            .as_deref()
            .ok_or(LogInError::MissingCredentials("password"))?;

        let generation = self.core.generation();
        let tokens = self
            .provider
            .password_grant(username, password, &self.auth_audience)
            .await?;

        let credential = self
            .core
            .lifetime()
            .create_credential(tokens.access_token, tokens.expires_in);
        if !self.core.establish_since(generation, credential) {
            return Err(LogInError::Superseded.into());
        }

        Ok(LogInOutcome::Authenticated)
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        self.core.clear();
        tracing::info!("logged out; session info cleared");
        Ok(())
    }

    async fn get_profile(&self) -> Result<UserProfile, SessionError> {
        Err(unsupported(self.kind(), "get_profile"))
    }
}

impl<C: fmt::Debug> fmt::Debug for PasswordGrantSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PasswordGrantSession")
            .field("core", &self.core)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}
