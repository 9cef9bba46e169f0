use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use filament::key::PropertyName;
use filament::uri::{ResourcePath, property_path};

use filament_endpoint::endpoint::Endpoint;
use filament_endpoint::registry::Registry;

use crate::error::{Error, ErrorKind, Result};

// How long a primitive keeps retrying an unresolved endpoint.
const RESOLVE_RETRY: Duration = Duration::from_millis(200);
const RESOLVE_ATTEMPTS: u32 = 25;

/// A resolved property location: an endpoint identifier plus a
/// property identity.
///
/// Pairings and rules bind their URIs to locations lazily, on first
/// use, and cache the resolved endpoint for the subscription lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PropertyAddress {
    /// The endpoint identifier.
    pub endpoint: String,
    /// The property identity.
    pub name: PropertyName,
}

impl PropertyAddress {
    /// Parses a property URI.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Resolve`] when the URI does not address
    /// a single property.
    pub fn parse(uri: &str) -> Result<Self> {
        match ResourcePath::parse(uri)? {
            ResourcePath::Property { endpoint, name } => Ok(Self { endpoint, name }),
            _ => Err(Error::new(
                ErrorKind::Resolve,
                format!("`{uri}` does not address a property"),
            )),
        }
    }

    /// Formats the property URI.
    #[must_use]
    pub fn uri(&self) -> String {
        property_path(&self.endpoint, &self.name)
    }

    /// Resolves the endpoint through the registry, retrying briefly:
    /// automation may start before every endpoint is associated.
    pub(crate) async fn resolve(&self, registry: &Registry) -> Result<Arc<dyn Endpoint>> {
        for _ in 0..RESOLVE_ATTEMPTS {
            if let Some(endpoint) = registry.find(&self.endpoint) {
                return Ok(endpoint);
            }
            tokio::time::sleep(RESOLVE_RETRY).await;
        }
        Err(Error::new(
            ErrorKind::Resolve,
            format!("`{}` never appeared in registry `{}`", self.endpoint, registry.name()),
        ))
    }
}

impl std::fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.uri().fmt(f)
    }
}

impl TryFrom<String> for PropertyAddress {
    type Error = Error;

    fn try_from(uri: String) -> Result<Self> {
        Self::parse(&uri)
    }
}

impl From<PropertyAddress> for String {
    fn from(address: PropertyAddress) -> Self {
        address.uri()
    }
}
