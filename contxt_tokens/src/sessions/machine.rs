//! Client credentials sessions for machines
//!
//! A machine session is authenticated as soon as it is configured. Its
//! primary credential is obtained on first use and renewed once it enters
//! the expiry buffer. Renewal happens on the calling task: whichever caller
//! first finds the credential stale performs the grant while the others
//! wait for it, so there is never more than one grant in flight.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use contxt_clock::{Clock, DurationSecs, System};
use serde::{Serialize, Serializer};
use tokio::sync::Mutex;
use url::Url;

use super::{unsupported, CredentialSlot, LogInOptions, LogInOutcome, SessionCore, SessionStrategy};
use crate::{
    credential::CredentialStatus,
    provider::{ErrorResponse, ProviderTokens, UserProfile},
    AccessToken, AudienceNameRef, ClientId, ClientIdRef, ClientSecret, ClientSecretRef,
    CredentialLifetimeConfig, LogInError, PrimaryCredential, SessionError, SessionKind,
    UnauthorizedError,
};

/// Client credentials with the audience they are requested for
#[derive(Debug)]
struct ClientCredentialsGrant<'a> {
    client_id: &'a ClientIdRef,
    client_secret: &'a ClientSecretRef,
    audience: &'a ClientIdRef,
}

impl Serialize for ClientCredentialsGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsGrant", 4)?;
        ser.serialize_field("audience", self.audience)?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("client_secret", self.client_secret.as_str())?;
        ser.serialize_field("grant_type", "client_credentials")?;
        ser.end()
    }
}

/// Obtains and renews the machine's primary credential
struct MachineGrant<C> {
    client: reqwest::Client,
    token_url: Url,
    client_id: ClientId,
    client_secret: ClientSecret,
    audience: ClientId,
    credential: CredentialSlot,
    lifetime: CredentialLifetimeConfig<C>,
    buffer: DurationSecs,
    logged_out: AtomicBool,
    acquiring: Mutex<()>,
}

impl<C> MachineGrant<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn check_logged_in(&self) -> Result<(), UnauthorizedError> {
        if self.logged_out.load(Ordering::SeqCst) {
            Err(UnauthorizedError::local())
        } else {
            Ok(())
        }
    }

    fn current(&self) -> Option<(PrimaryCredential, CredentialStatus)> {
        let credential = self.credential.get()?;
        let status = credential.status_at(self.lifetime.now(), self.buffer);
        Some((credential, status))
    }

    /// Gets the primary token, requesting a new one if it is missing or stale
    async fn primary_token(self: Arc<Self>) -> Result<AccessToken, SessionError> {
        self.check_logged_in()?;

        if let Some((credential, CredentialStatus::Fresh)) = self.current() {
            return Ok(credential.access_token().to_owned());
        }

        let _acquiring = self.acquiring.lock().await;

        // Another caller may have renewed the credential while we waited.
        let previous = match self.current() {
            Some((credential, CredentialStatus::Fresh)) => {
                return Ok(credential.access_token().to_owned())
            }
            Some((credential, CredentialStatus::Stale)) => Some(credential),
            _ => None,
        };

        self.check_logged_in()?;

        match self.request().await {
            Ok(credential) => {
                let token = credential.access_token().to_owned();
                if !self
                    .credential
                    .replace_if(credential, || !self.logged_out.load(Ordering::SeqCst))
                {
                    tracing::debug!("logged out while requesting, discarding credential");
                }
                Ok(token)
            }
            Err(error) => match previous {
                Some(stale) => {
                    tracing::warn!(%error, "unable to renew machine credential, using existing one");
                    Ok(stale.access_token().to_owned())
                }
                None => Err(error.into()),
            },
        }
    }

    #[tracing::instrument(err, skip(self), fields(token_url = %self.token_url, client_id = %self.client_id))]
    async fn request(&self) -> Result<PrimaryCredential, LogInError> {
        let grant = ClientCredentialsGrant {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            audience: &self.audience,
        };

        tracing::trace!("requesting machine credential from authorization server");

        let resp = self
            .client
            .post(self.token_url.clone())
            .json(&grant)
            .send()
            .await
            .map_err(|err| LogInError::Transport(Arc::new(err)))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received machine credential response"
        );

        let body = resp
            .bytes()
            .await
            .map_err(|err| LogInError::Transport(Arc::new(err)))?;

        if !status.is_success() {
            return Err(LogInError::Rejected {
                status,
                message: ErrorResponse::describe(&String::from_utf8_lossy(&body)),
            });
        }

        let tokens: ProviderTokens =
            serde_json::from_slice(&body).map_err(|err| LogInError::Body(Arc::new(err)))?;

        let credential = self
            .lifetime
            .create_credential(tokens.access_token, tokens.expires_in);

        tracing::info!(
            expires_at = credential.expires_at().map(|t| t.0),
            "obtained new machine credential"
        );

        Ok(credential)
    }
}

/// A session authenticated with the machine's own client credentials
pub struct MachineAuthSession<C = System> {
    core: SessionCore<C>,
    grant: Arc<MachineGrant<C>>,
}

impl<C> MachineAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        core: SessionCore<C>,
        client: reqwest::Client,
        token_url: Url,
        client_id: ClientId,
        client_secret: ClientSecret,
        audience: ClientId,
        buffer: DurationSecs,
    ) -> Self {
        let grant = Arc::new(MachineGrant {
            client,
            token_url,
            client_id,
            client_secret,
            audience,
            credential: core.credential_slot().clone(),
            lifetime: core.lifetime().clone(),
            buffer,
            logged_out: AtomicBool::new(false),
            acquiring: Mutex::new(()),
        });

        Self { core, grant }
    }

    /// The shared session state
    pub fn core(&self) -> &SessionCore<C> {
        &self.core
    }

    /// The endpoint client credentials are posted to
    pub fn token_url(&self) -> &Url {
        &self.grant.token_url
    }
}

#[async_trait]
impl<C> SessionStrategy for MachineAuthSession<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> SessionKind {
        SessionKind::MachineAuth
    }

    fn is_authenticated(&self) -> bool {
        !self.grant.logged_out.load(Ordering::SeqCst)
    }

    async fn get_current_api_token(
        &self,
        audience: &AudienceNameRef,
    ) -> Result<AccessToken, SessionError> {
        self.grant.check_logged_in()?;
        self.core
            .api_token_with(audience, || Arc::clone(&self.grant).primary_token())
            .await
    }

    fn clear_current_api_token(&self, audience: &AudienceNameRef) {
        self.core.clear_api_token(audience)
    }

    async fn get_current_access_token(&self) -> Result<AccessToken, SessionError> {
        Arc::clone(&self.grant).primary_token().await
    }

    async fn log_in(&self, _options: LogInOptions) -> Result<LogInOutcome, SessionError> {
        let _acquiring = self.grant.acquiring.lock().await;
        self.grant.logged_out.store(false, Ordering::SeqCst);
        let generation = self.core.generation();

        let credential = self.grant.request().await?;
        if !self.core.establish_since(generation, credential) {
            return Err(LogInError::Superseded.into());
        }

        Ok(LogInOutcome::Authenticated)
    }

    async fn log_out(&self) -> Result<(), SessionError> {
        self.grant.logged_out.store(true, Ordering::SeqCst);
        self.core.clear();
        Ok(())
    }

    async fn get_profile(&self) -> Result<UserProfile, SessionError> {
        Err(unsupported(self.kind(), "get_profile"))
    }
}

impl<C: fmt::Debug> fmt::Debug for MachineAuthSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MachineAuthSession")
            .field("core", &self.core)
            .field("token_url", &self.grant.token_url.as_str())
            .field("client_id", &self.grant.client_id)
            .field("client_secret", &self.grant.client_secret)
            .field("buffer", &self.grant.buffer)
            .field("logged_out", &self.grant.logged_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use contxt_clock::{TestClock, UnixTime};
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::sessions::test_support::*;

    fn session(
        server: &MockServer,
        clock: &TestClock,
    ) -> (MachineAuthSession<TestClock>, Arc<RecordingExchange>) {
        let exchange = Arc::new(RecordingExchange::default());
        let session = MachineAuthSession::new(
            SessionCore::new(audiences(), exchange.clone(), clock.clone()),
            reqwest::Client::new(),
            Url::parse(&format!("{}/v1/oauth/token", server.uri())).unwrap(),
            ClientId::from_static("machine-id"),
            ClientSecret::from_static("machine-secret"),
            ClientId::from_static("auth-id"),
            DurationSecs(300),
        );
        (session, exchange)
    }

    async fn grant_responds(server: &MockServer, token: &str, expires_in: u64, times: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_json(json!({
                "audience": "auth-id",
                "client_id": "machine-id",
                "client_secret": "machine-secret",
                "grant_type": "client_credentials",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": token,
                "expires_in": expires_in,
            })))
            .up_to_n_times(times)
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn is_authenticated_without_a_credential() {
        let server = MockServer::start().await;
        let (session, _) = session(&server, &TestClock::new(UnixTime(1_000)));

        assert!(session.is_authenticated());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn primary_credential_is_obtained_lazily_once() {
        let server = MockServer::start().await;
        grant_responds(&server, "machine-primary", 3_600, 1).await;
        let (session, exchange) = session(&server, &TestClock::new(UnixTime(1_000)));

        let (first, second) = futures::join!(
            session.get_current_api_token(facilities()),
            session.get_current_access_token(),
        );

        assert_eq!(first.unwrap().as_str(), "machine-primary:facilities:1");
        assert_eq!(second.unwrap().as_str(), "machine-primary");
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn stale_credential_is_renewed_before_use() {
        let server = MockServer::start().await;
        grant_responds(&server, "first", 1_000, 1).await;
        let clock = TestClock::new(UnixTime(1_000));
        let (session, _) = session(&server, &clock);

        assert_eq!(
            session.get_current_access_token().await.unwrap().as_str(),
            "first"
        );

        // 300s before expiry the credential is stale.
        clock.set(UnixTime(1_700));
        grant_responds(&server, "second", 1_000, 1).await;

        assert_eq!(
            session.get_current_access_token().await.unwrap().as_str(),
            "second"
        );
        assert_eq!(
            session.core().credential().unwrap().expires_at(),
            Some(UnixTime(2_700))
        );
    }

    #[tokio::test]
    async fn stale_credential_is_used_if_renewal_fails() {
        let server = MockServer::start().await;
        grant_responds(&server, "first", 1_000, 1).await;
        let clock = TestClock::new(UnixTime(1_000));
        let (session, _) = session(&server, &clock);
        session.get_current_access_token().await.unwrap();

        clock.set(UnixTime(1_800));
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert_eq!(
            session.get_current_access_token().await.unwrap().as_str(),
            "first"
        );
    }

    #[tokio::test]
    async fn rejected_grant_is_a_login_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "access_denied",
                "error_description": "Unauthorized",
            })))
            .mount(&server)
            .await;
        let (session, exchange) = session(&server, &TestClock::new(UnixTime(1_000)));

        let err = session
            .get_current_api_token(facilities())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::LogIn(LogInError::Rejected { ref message, .. }) if message == "Unauthorized"
        ));
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn log_out_then_log_in() {
        let server = MockServer::start().await;
        grant_responds(&server, "machine-primary", 3_600, 2).await;
        let (session, exchange) = session(&server, &TestClock::new(UnixTime(1_000)));
        session.get_current_api_token(facilities()).await.unwrap();

        session.log_out().await.unwrap();

        assert!(!session.is_authenticated());
        assert!(session
            .get_current_api_token(facilities())
            .await
            .unwrap_err()
            .is_unauthorized());
        assert!(session.core().credential().is_none());

        session.log_in(LogInOptions::default()).await.unwrap();

        assert!(session.is_authenticated());
        session.get_current_api_token(facilities()).await.unwrap();
        assert_eq!(exchange.calls(), 2);
    }
}
