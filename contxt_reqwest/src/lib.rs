//! Middleware to automatically attach Contxt API tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`], include an [`AudienceTokenMiddleware`]
//! in the middleware stack to fetch the API token for one audience from a
//! session before each outbound request. Token fetches go through the
//! session's per-audience cache, so a burst of requests results in at most
//! one token exchange.
//!
//! If the session cannot provide a token, for example because nobody has
//! logged in, the request is never sent and the [`SessionError`] is returned
//! as a [`reqwest_middleware::Error::Middleware`].
//!
//! Any `Authorization` header already present on a matching request is
//! replaced with the session's token. To let callers supply their own
//! credentials for individual requests, opt in with
//! [`preserving_existing_authorization()`][AudienceTokenMiddleware::preserving_existing_authorization()].
//!
//! ```
//! use std::sync::Arc;
//!
//! use contxt_reqwest::AudienceTokenMiddleware;
//! use contxt_tokens::{SessionBuilder, SessionConfig};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let config = SessionConfig::from_json(r#"{
//! #     "sessionType": "machineAuth",
//! #     "audiences": {
//! #         "contxtAuth": { "clientId": "auth-id", "host": "https://auth.example" },
//! #         "facilities": { "clientId": "fac-id", "host": "https://facilities.example" }
//! #     },
//! #     "auth": { "clientId": "my-machine", "clientSecret": "my-secret" }
//! # }"#)?;
//! let session = Arc::new(SessionBuilder::new(config).build().await?);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AudienceTokenMiddleware::new(session, "facilities"))
//!     .build();
//!
//! let req = client
//!     .get("https://facilities.example/v1/facilities");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # Ok(())
//! # }
//! ```
//!
//! The middleware can also be configured to attach a token only
//! conditionally. This is useful when a single middleware stack is shared by
//! clients talking to several hosts and a token must only reach the host
//! of its audience.
//!
//! ```
//! use std::sync::Arc;
//!
//! use contxt_reqwest::{AudienceTokenMiddleware, ExactHostMatch, HttpsOnly};
//! use contxt_tokens::SessionStrategy;
//! use predicates::prelude::PredicateBooleanExt;
//!
//! fn middleware(session: Arc<dyn SessionStrategy>) -> impl reqwest_middleware::Middleware {
//!     AudienceTokenMiddleware::new(session, "facilities")
//!         .with_predicate(HttpsOnly.and(ExactHostMatch::new("facilities.example")))
//! }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use contxt_tokens::{AccessTokenRef, AudienceDescriptor, AudienceName, SessionStrategy};
use predicates::{constant::BooleanPredicate, prelude::*, reflection};
use reqwest::{header, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Error, Middleware, Next, Result};

/// A middleware that injects an audience's API token into outgoing requests
#[derive(Clone)]
pub struct AudienceTokenMiddleware<P = BooleanPredicate> {
    session: Arc<dyn SessionStrategy>,
    audience: AudienceName,
    predicate: P,
    keep_existing: bool,
}

impl AudienceTokenMiddleware {
    /// Construct a new middleware that attaches tokens for `audience`
    ///
    /// By default, a token is attached to every request. To restrict which
    /// requests receive one, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: Arc<dyn SessionStrategy>, audience: impl Into<AudienceName>) -> Self {
        Self {
            session,
            audience: audience.into(),
            predicate: predicate::always(),
            keep_existing: false,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AudienceTokenMiddleware<P> {
        AudienceTokenMiddleware {
            session: self.session,
            audience: self.audience,
            predicate,
            keep_existing: self.keep_existing,
        }
    }
}

impl<P> AudienceTokenMiddleware<P> {
    /// Leaves requests that already carry an `Authorization` header untouched
    ///
    /// The session is not consulted for such requests.
    pub fn preserving_existing_authorization(self) -> Self {
        Self {
            keep_existing: true,
            ..self
        }
    }

    /// The audience whose tokens are attached
    pub fn audience(&self) -> &AudienceName {
        &self.audience
    }

    async fn authorization(&self) -> Result<header::HeaderValue> {
        let token = self
            .session
            .get_current_api_token(&self.audience)
            .await
            .map_err(|error| {
                tracing::debug!(
                    audience = %self.audience,
                    %error,
                    "no API token available; request not sent"
                );
                Error::Middleware(error.into())
            })?;

        tracing::trace!(audience = %self.audience, "obtained API token");

        bearer_header(&token)
    }
}

fn bearer_header(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(|error| Error::Middleware(error.into()))?;
    value.set_sensitive(true);
    Ok(value)
}

impl<P: fmt::Debug> fmt::Debug for AudienceTokenMiddleware<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AudienceTokenMiddleware")
            .field("session", &self.session.kind())
            .field("audience", &self.audience)
            .field("predicate", &self.predicate)
            .field("keep_existing", &self.keep_existing)
            .finish()
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AudienceTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let keep = self.keep_existing && req.headers().contains_key(header::AUTHORIZATION);
        if self.predicate.eval(&req) && !keep {
            let value = self.authorization().await?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        next.run(req, extensions).await
    }
}

/// Builds a client whose requests carry API tokens for `audience`
///
/// Applications typically hold one of these per backend audience.
pub fn audience_client(
    client: reqwest::Client,
    session: Arc<dyn SessionStrategy>,
    audience: impl Into<AudienceName>,
) -> ClientWithMiddleware {
    ClientBuilder::new(client)
        .with(AudienceTokenMiddleware::new(session, audience))
        .build()
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }

    /// Construct a predicate matching the configured host of an audience
    pub fn for_audience(audience: &AudienceDescriptor) -> Self {
        Self::new(audience.host().host_str().unwrap_or_default())
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
