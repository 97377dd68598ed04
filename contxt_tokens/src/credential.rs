use contxt_clock::{Clock, DurationSecs, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef};

/// The credential proving the user's or machine's identity to the authorization server
///
/// A primary credential is exchanged for audience-scoped API tokens. It may carry an
/// expiry; credentials without one are valid until the session logs out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryCredential {
    access_token: AccessToken,
    issued: UnixTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<UnixTime>,
}

/// A primary credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential is valid and not due for renewal
    Fresh,
    /// The credential is still valid, but inside the renewal buffer
    Stale,
    /// The credential is no longer valid
    Expired,
}

impl PrimaryCredential {
    /// Constructs a credential issued at `issued` that never expires on its own
    pub fn without_expiry(access_token: AccessToken, issued: UnixTime) -> Self {
        Self {
            access_token,
            issued,
            expires_at: None,
        }
    }

    /// Constructs a credential issued at `issued` valid until `expires_at`
    pub fn with_expiry(access_token: AccessToken, issued: UnixTime, expires_at: UnixTime) -> Self {
        Self {
            access_token,
            issued,
            expires_at: Some(expires_at),
        }
    }

    /// Gets the raw access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time the credential was obtained
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time the credential expires, if it expires at all
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Whether the credential is still valid at `time`
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > time)
    }

    /// Gets the credential's status at `time`, treating the final `buffer` before
    /// expiry as stale
    pub fn status_at(&self, time: UnixTime, buffer: DurationSecs) -> CredentialStatus {
        match self.expires_at {
            None => CredentialStatus::Fresh,
            Some(expiry) if time >= expiry => CredentialStatus::Expired,
            Some(expiry) if time >= expiry - buffer => CredentialStatus::Stale,
            Some(_) => CredentialStatus::Fresh,
        }
    }
}

/// Stamps newly obtained tokens with issue and expiry times
#[derive(Clone, Debug)]
pub struct CredentialLifetimeConfig<C> {
    clock: C,
}

impl<C: Clock> CredentialLifetimeConfig<C> {
    /// Constructs a lifetime configuration that reads time from `clock`
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    /// Builds a credential from a token and the lifetime the provider reported for it
    pub fn create_credential(
        &self,
        access_token: AccessToken,
        expires_in: Option<DurationSecs>,
    ) -> PrimaryCredential {
        let issued = self.clock.now();
        PrimaryCredential {
            access_token,
            issued,
            expires_at: expires_in.map(|lifetime| issued + lifetime),
        }
    }

    /// The current time according to the configured clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }
}
