//! Audience configuration

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{AudienceName, AudienceNameRef, ClientId, ClientIdRef, ConfigurationError};

/// The name of the audience that hosts the authorization server
pub const CONTXT_AUTH_AUDIENCE: &str = "contxtAuth";

/// A backend service with its own token scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudienceDescriptor {
    name: AudienceName,
    client_id: Option<ClientId>,
    host: Url,
}

impl AudienceDescriptor {
    /// Constructs a new audience descriptor
    pub fn new(name: AudienceName, client_id: Option<ClientId>, host: Url) -> Self {
        Self {
            name,
            client_id,
            host,
        }
    }

    /// The audience's configured name
    pub fn name(&self) -> &AudienceNameRef {
        &self.name
    }

    /// The client ID tokens for this audience are requested for
    pub fn client_id(&self) -> Option<&ClientIdRef> {
        self.client_id.as_deref()
    }

    /// The base URL of the audience's service
    pub fn host(&self) -> &Url {
        &self.host
    }

    /// Derives an endpoint under the audience's host
    ///
    /// `path` is appended to the host's path rather than resolved against it,
    /// so hosts with a base path keep it.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigurationError> {
        let base = self.host.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|err| ConfigurationError::InvalidUrl {
            what: "audience endpoint",
            message: err.to_string(),
        })
    }
}

/// How an audience is written in configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceSettings {
    /// The audience's client ID, if tokens can be requested for it
    #[serde(default)]
    pub client_id: Option<ClientId>,
    /// The base URL of the audience's service
    pub host: Url,
}

/// The set of configured audiences, keyed by unique name
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(from = "HashMap<AudienceName, AudienceSettings>")]
pub struct Audiences {
    by_name: Arc<HashMap<AudienceName, AudienceDescriptor>>,
}

impl Audiences {
    /// Constructs an empty set of audiences
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an audience, replacing any audience with the same name
    pub fn with_audience(
        mut self,
        name: impl Into<AudienceName>,
        client_id: Option<ClientId>,
        host: Url,
    ) -> Self {
        let name = name.into();
        Arc::make_mut(&mut self.by_name).insert(
            name.clone(),
            AudienceDescriptor::new(name, client_id, host),
        );
        self
    }

    /// Looks up an audience by name
    pub fn get(&self, name: &AudienceNameRef) -> Option<&AudienceDescriptor> {
        self.by_name.get(name)
    }

    /// Looks up an audience that tokens can be requested for
    ///
    /// Fails if the audience is unknown or has no client ID.
    pub fn require_token_audience(
        &self,
        name: &AudienceNameRef,
    ) -> Result<&AudienceDescriptor, ConfigurationError> {
        let audience = self
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownAudience(name.to_owned()))?;

        if audience.client_id().is_none() {
            return Err(ConfigurationError::MissingClientId(name.to_owned()));
        }

        Ok(audience)
    }

    /// The audience hosting the authorization server
    pub fn auth(&self) -> Result<&AudienceDescriptor, ConfigurationError> {
        self.get(AudienceNameRef::from_str(CONTXT_AUTH_AUDIENCE))
            .ok_or(ConfigurationError::MissingAuthAudience)
    }

    /// Iterates over all configured audiences
    pub fn iter(&self) -> impl Iterator<Item = &AudienceDescriptor> {
        self.by_name.values()
    }
}

impl From<HashMap<AudienceName, AudienceSettings>> for Audiences {
    fn from(settings: HashMap<AudienceName, AudienceSettings>) -> Self {
        let by_name = settings
            .into_iter()
            .map(|(name, s)| {
                let descriptor = AudienceDescriptor::new(name.clone(), s.client_id, s.host);
                (name, descriptor)
            })
            .collect();

        Self {
            by_name: Arc::new(by_name),
        }
    }
}
