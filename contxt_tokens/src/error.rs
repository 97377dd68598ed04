//! Errors raised while brokering sessions and API tokens
//!
//! Every error here is `Clone`: a single in-flight token exchange hands its
//! outcome to all of the callers waiting on it. Transport errors are shared
//! behind an [`Arc`] for that reason.

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::{AudienceName, SessionKind};

/// Any failure produced by a session strategy
#[derive(Clone, Debug, Error)]
pub enum SessionError {
    /// There is no valid primary credential
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),
    /// The request could not be attempted with the current configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The authorization server refused or failed the token exchange
    ///
    /// A `401 Unauthorized` from the exchange is reported as
    /// [`Unauthorized`][Self::Unauthorized] with a remote origin instead.
    #[error(transparent)]
    TokenExchange(TokenExchangeError),
    /// The primary authentication flow failed
    #[error(transparent)]
    LogIn(#[from] LogInError),
    /// The user's profile could not be retrieved
    #[error("unable to fetch user profile")]
    Profile(#[source] ProviderError),
}

impl SessionError {
    /// Whether this error means the caller needs to authenticate again
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<TokenExchangeError> for SessionError {
    fn from(error: TokenExchangeError) -> Self {
        if error.status() == Some(StatusCode::UNAUTHORIZED) {
            tracing::debug!(%error, "authorization server rejected the primary credential");
            Self::Unauthorized(UnauthorizedError::remote())
        } else {
            Self::TokenExchange(error)
        }
    }
}

/// Where an authorization failure was detected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthorizedOrigin {
    /// Detected locally; no request was sent
    Local,
    /// A remote call rejected the credential
    Remote,
}

/// There is no valid primary credential for the session
#[derive(Clone, Debug, Error)]
#[error("unauthorized")]
pub struct UnauthorizedError {
    origin: UnauthorizedOrigin,
}

impl UnauthorizedError {
    /// An authorization failure detected before sending any request
    pub const fn local() -> Self {
        Self {
            origin: UnauthorizedOrigin::Local,
        }
    }

    /// An authorization failure reported by a remote service
    pub const fn remote() -> Self {
        Self {
            origin: UnauthorizedOrigin::Remote,
        }
    }

    /// Where the failure was detected
    pub const fn origin(&self) -> UnauthorizedOrigin {
        self.origin
    }

    /// Whether the failure was detected locally, without a network call
    pub const fn is_local(&self) -> bool {
        matches!(self.origin, UnauthorizedOrigin::Local)
    }

    /// The HTTP status callers expecting HTTP-shaped errors should see
    pub const fn status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

/// The session is misconfigured for the requested operation
#[derive(Clone, Debug, Error)]
pub enum ConfigurationError {
    /// No audience is configured under the requested name
    #[error("no audience named `{0}` is configured")]
    UnknownAudience(AudienceName),
    /// The audience exists but has no client ID to request a token for
    #[error("audience `{0}` has no client ID")]
    MissingClientId(AudienceName),
    /// The authorization server audience is missing
    #[error("the `{}` audience is required but not configured", crate::CONTXT_AUTH_AUDIENCE)]
    MissingAuthAudience,
    /// A required setting was not provided
    #[error("missing required setting `{0}`")]
    MissingSetting(&'static str),
    /// An endpoint could not be derived from the configured host
    #[error("invalid URL for {what}: {message}")]
    InvalidUrl {
        /// The endpoint being derived
        what: &'static str,
        /// The parser's complaint
        message: String,
    },
    /// The session strategy does not support the operation
    #[error("{session:?} sessions do not support {operation}")]
    UnsupportedOperation {
        /// The active session kind
        session: SessionKind,
        /// The unsupported operation
        operation: &'static str,
    },
}

/// The authorization server refused or failed a token exchange
#[derive(Clone, Debug, Error)]
pub enum TokenExchangeError {
    /// The authority responded with a non-success status
    #[error("token exchange for {audiences:?} rejected with {status}: {body}")]
    Rejected {
        /// The audiences the exchange was requested for
        audiences: Vec<AudienceName>,
        /// The upstream status
        status: StatusCode,
        /// The upstream body
        body: String,
    },
    /// None of the requested audiences has a client ID
    #[error("no audience in {0:?} has a client ID to exchange for")]
    NoTargets(Vec<AudienceName>),
    /// Unable to send the request or read its response
    #[error("error communicating with the authorization server")]
    Transport(#[source] Arc<reqwest::Error>),
    /// The response body was not a token response
    #[error("error deserializing token exchange response")]
    Body(#[source] Arc<serde_json::Error>),
}

impl TokenExchangeError {
    /// The upstream status, when the server answered
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The primary authentication flow failed
#[derive(Clone, Debug, Error)]
pub enum LogInError {
    /// The identity provider rejected the login
    #[error("login rejected ({status}): {message}")]
    Rejected {
        /// The upstream status
        status: StatusCode,
        /// The provider's description of the failure
        message: String,
    },
    /// The user cancelled the authorization flow
    #[error("login cancelled by user")]
    Cancelled,
    /// The session was logged out before the login completed
    #[error("session was logged out while logging in")]
    Superseded,
    /// The provider redirected back with an error
    #[error("authorization failed with `{error}`: {description}")]
    Callback {
        /// The provider's error code
        error: String,
        /// The provider's description
        description: String,
    },
    /// The callback does not belong to the login attempt in progress
    #[error("authorization callback state does not match the pending login")]
    StateMismatch,
    /// A callback arrived but no login was started
    #[error("no login is in progress")]
    NoPendingLogIn,
    /// The callback did not carry the expected parameters
    #[error("malformed authorization callback: {0}")]
    MalformedCallback(String),
    /// The credentials required for this login were not supplied
    #[error("missing login credentials: {0}")]
    MissingCredentials(&'static str),
    /// The native authorization UI failed
    #[error("native authorization failed: {0}")]
    Authorizer(String),
    /// The login could not be attempted with the current configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Unable to send the request or read its response
    #[error("error communicating with the identity provider")]
    Transport(#[source] Arc<reqwest::Error>),
    /// The response body was not a token response
    #[error("error deserializing login response")]
    Body(#[source] Arc<serde_json::Error>),
}

/// A call to the identity provider failed
#[derive(Clone, Debug, Error)]
pub enum ProviderError {
    /// The provider responded with a non-success status
    #[error("identity provider responded with {status}: {body}")]
    Rejected {
        /// The upstream status
        status: StatusCode,
        /// The upstream body
        body: String,
    },
    /// Unable to send the request or read its response
    #[error("error communicating with the identity provider")]
    Transport(#[source] Arc<reqwest::Error>),
    /// The response body was not understood
    #[error("error deserializing identity provider response")]
    Body(#[source] Arc<serde_json::Error>),
    /// The external session could not be cleared
    #[error("unable to end external session: {0}")]
    Revocation(String),
    /// The request could not be built from the current configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
