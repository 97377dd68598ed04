//! Sessions and per-audience API tokens for Contxt clients
//!
//! A Contxt client authenticates once, obtaining a _primary credential_, and
//! then trades that credential with the Contxt authorization server for
//! short-lived API tokens, one per backend _audience_. This crate owns both
//! halves of that dance.
//!
//! How the primary credential is obtained depends on the kind of client, so
//! it is abstracted behind the [`SessionStrategy`] trait with four
//! implementations:
//!
//! * [`WebAuthSession`]: a browser is redirected to the identity provider
//!   and back again.
//! * [`NativeAuthSession`]: the platform's authorization UI is shown through
//!   a [`NativeAuthorizer`].
//! * [`MachineAuthSession`]: the client's own client credentials are used,
//!   with the credential renewed shortly before it expires.
//! * [`PasswordGrantSession`]: a username and password are exchanged
//!   directly.
//!
//! Every strategy hands out API tokens through the same per-audience cache.
//! Many tasks may ask for the same audience's token at once; only one token
//! exchange is ever in flight for it, and every caller sees its outcome.
//!
//! ```
//! use contxt_tokens::{SessionBuilder, SessionConfig, SessionStrategy};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::from_json(
//!     r#"{
//!         "sessionType": "machineAuth",
//!         "audiences": {
//!             "contxtAuth": { "clientId": "auth-id", "host": "https://auth.example" },
//!             "facilities": { "clientId": "fac-id", "host": "https://facilities.example" }
//!         },
//!         "auth": { "clientId": "my-machine", "clientSecret": "my-secret" }
//!     }"#,
//! )?;
//!
//! let session = SessionBuilder::new(config).build().await?;
//! # /* Commented out due to this trying to interact with the world.
//! let token = session
//!     .get_current_api_token("facilities".into())
//!     .await?;
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are enabled by default:
//!
//! * `file`: Provides [`FileCredentialStore`][stores::FileCredentialStore],
//!   which persists interactive sessions on the local filesystem.
//! * `rustls-tls`: Enables TLS in the underlying [reqwest] client using rustls.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod audience;
mod braids;
pub mod cache;
mod config;
mod credential;
mod error;
pub mod exchange;
pub mod nonce;
pub mod provider;
pub mod sessions;
pub mod stores;

pub use audience::{AudienceDescriptor, AudienceSettings, Audiences, CONTXT_AUTH_AUDIENCE};
pub use braids::*;
pub use config::{
    AuthConfig, SessionConfig, SessionKind, DEFAULT_AUTHORIZATION_PATH,
    DEFAULT_TOKEN_EXPIRES_AT_BUFFER,
};
pub use credential::{CredentialLifetimeConfig, CredentialStatus, PrimaryCredential};
pub use error::{
    ConfigurationError, LogInError, ProviderError, SessionError, TokenExchangeError,
    UnauthorizedError, UnauthorizedOrigin,
};
pub use exchange::{ContxtTokenExchange, TokenExchange};
pub use provider::{IdentityProvider, UserProfile};
pub use sessions::{
    LogInOptions, LogInOutcome, MachineAuthSession, NativeAuthSession, NativeAuthorizeRequest,
    NativeAuthorizer, PasswordGrantSession, Session, SessionBuilder, SessionStrategy,
    WebAuthSession,
};
