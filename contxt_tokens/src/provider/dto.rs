//! DTOs for interacting with the identity provider

use std::collections::HashMap;

use contxt_clock::DurationSecs;
use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessToken, ClientIdRef, PasswordRef};

/// Resource owner password credentials
#[derive(Debug)]
pub(crate) struct PasswordGrant<'a> {
    pub client_id: &'a ClientIdRef,
    pub audience: &'a ClientIdRef,
    pub username: &'a str,
    pub password: &'a PasswordRef,
    pub scope: &'a str,
}

impl Serialize for PasswordGrant<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("PasswordGrant", 6)?;
        ser.serialize_field("grant_type", "password")?;
        ser.serialize_field("client_id", self.client_id)?;
        ser.serialize_field("audience", self.audience)?;
        ser.serialize_field("username", self.username)?;
        ser.serialize_field("password", self.password)?;
        ser.serialize_field("scope", self.scope)?;
        ser.end()
    }
}

/// Tokens issued by an authority for a primary login
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderTokens {
    /// The access token to use as the primary credential
    pub access_token: AccessToken,
    /// The OpenID Connect ID token, if one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Seconds until the access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
    /// The token type, usually `Bearer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorResponse {
    /// The most descriptive message available, falling back to the raw body
    pub fn describe(body: &str) -> String {
        let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
        parsed
            .error_description
            .or(parsed.message)
            .or(parsed.error)
            .unwrap_or_else(|| body.to_owned())
    }
}

/// The identity claims of the logged-in user
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct UserProfile {
    /// The subject claim of the user's token
    pub sub: String,
    /// The user's email address
    #[serde(default)]
    pub email: Option<String>,
    /// Whether the email address has been verified
    #[serde(default)]
    pub email_verified: Option<bool>,
    /// The user's full name
    #[serde(default)]
    pub name: Option<String>,
    /// The user's nickname
    #[serde(default)]
    pub nickname: Option<String>,
    /// URL to an avatar
    #[serde(default)]
    pub picture: Option<String>,
    /// ISO 8601 time the profile was last updated
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Any other claims returned by the provider
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_description_is_preferred() {
        let message =
            ErrorResponse::describe(r#"{"error":"invalid_grant","error_description":"Wrong email or password."}"#);
        assert_eq!(message, "Wrong email or password.");
    }

    #[test]
    fn unstructured_body_is_used_verbatim() {
        assert_eq!(ErrorResponse::describe("upstream down"), "upstream down");
    }

    #[test]
    fn password_grant_serializes_grant_type() {
        let grant = PasswordGrant {
            client_id: ClientIdRef::from_str("app"),
            audience: ClientIdRef::from_str("auth-id"),
            username: "user@example.com",
            password: PasswordRef::from_str("hunter2"),
            scope: "openid",
        };
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["grant_type"], "password");
        assert_eq!(json["password"], "hunter2");
        assert_eq!(json["audience"], "auth-id");
    }
}
