use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tracing::warn;

use filament::uri::{Mutation, ResourcePath, duration_from_query, parse_query};
use filament::value::{Map, Value};

use filament_endpoint::endpoint::{Endpoint, WriteOptions};
use filament_endpoint::registry::Registry;
use filament_endpoint::transport::Method;

use crate::error::{Error, ErrorKind, Result};

const fn default_method() -> Method {
    Method::Post
}

/// How an action relates to the ones after it in an action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    /// Fire and continue immediately.
    #[default]
    Async,
    /// Wait for completion, success or failure, before the next
    /// action.
    SyncWait,
    /// Wait for completion and abort the remaining list on failure.
    SyncStopOnError,
}

/// One step of a rule's or timer's action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The target URI: a property (optionally carrying mutation and
    /// duration modifiers) or a method.
    pub uri: String,
    /// The request method.
    #[serde(default = "default_method")]
    pub method: Method,
    /// The request body: the property value or the method arguments.
    #[serde(default)]
    pub body: Option<Value>,
    /// How this action relates to the ones after it.
    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl Action {
    /// Creates an [`Action`] with the default method and sync mode.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: default_method(),
            body: None,
            sync_mode: SyncMode::default(),
        }
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub const fn sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    // Resolves the URI through the registry and performs the
    // operation.
    pub(crate) async fn execute(&self, registry: &Registry) -> Result<()> {
        let query = self
            .uri
            .split_once('?')
            .map(|(_, query)| parse_query(query))
            .unwrap_or_default();

        match ResourcePath::parse(&self.uri)? {
            ResourcePath::Property { endpoint, name } => {
                let endpoint = registry.find(&endpoint).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Resolve,
                        format!("`{endpoint}` is not associated with `{}`", registry.name()),
                    )
                })?;

                let mutation = Mutation::from_query(&query);
                let mut options = WriteOptions::new();
                if let Some(duration) = duration_from_query(&query) {
                    options = options.duration(duration);
                }

                let value = self.body.clone().unwrap_or(Value::Null);
                endpoint
                    .apply(&name, value, mutation, &options)
                    .await
                    .map_err(Error::from)
            }
            ResourcePath::Method {
                endpoint,
                trait_id,
                method,
            } => {
                let endpoint = registry.find(&endpoint).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Resolve,
                        format!("`{endpoint}` is not associated with `{}`", registry.name()),
                    )
                })?;

                let args = match self.body.clone() {
                    Some(Value::Map(entries)) => entries,
                    Some(other) => {
                        return Err(Error::new(
                            ErrorKind::Configuration,
                            format!(
                                "Method arguments must be a map, found `{}`",
                                other.type_name()
                            ),
                        ));
                    }
                    None => Map::new(),
                };

                endpoint
                    .invoke(&trait_id, &method, args)
                    .await
                    .map(|_| ())
                    .map_err(Error::from)
            }
            _ => Err(Error::new(
                ErrorKind::Resolve,
                format!("`{}` is not an actionable URI", self.uri),
            )),
        }
    }
}

/// Runs an action list in declared order, honoring each action's sync
/// mode.
pub(crate) async fn run_actions(actions: &[Action], registry: &Arc<Registry>) {
    for action in actions {
        match action.sync_mode {
            SyncMode::Async => {
                let action = action.clone();
                let registry = Arc::clone(registry);
                tokio::spawn(async move {
                    if let Err(e) = action.execute(&registry).await {
                        warn!("The action `{}` failed: {e}", action.uri);
                    }
                });
            }
            SyncMode::SyncWait => {
                if let Err(e) = action.execute(registry).await {
                    warn!("The action `{}` failed: {e}", action.uri);
                }
            }
            SyncMode::SyncStopOnError => {
                if let Err(e) = action.execute(registry).await {
                    warn!(
                        "The action `{}` failed, aborting the remaining actions: {e}",
                        action.uri
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use filament::value::Value;

    use filament_endpoint::endpoint::Endpoint;
    use filament_endpoint::handler::{LevelHandler, OnOffHandler};
    use filament_endpoint::local::LocalEndpoint;
    use filament_endpoint::registry::Registry;

    use super::{Action, SyncMode, run_actions};

    fn lamp(id: &str) -> Arc<LocalEndpoint> {
        LocalEndpoint::builder(id)
            .handler(OnOffHandler::new(false))
            .handler(LevelHandler::new(0.0))
            .build()
    }

    fn registry() -> Arc<Registry> {
        let registry = Registry::new("home");
        registry.host(&lamp("lamp-1"));
        registry.host(&lamp("lamp-2"));
        registry
    }

    #[tokio::test]
    async fn property_action_applies() {
        let registry = registry();

        Action::new("/lamp-1/s/onoff/v")
            .body(true)
            .execute(&registry)
            .await
            .unwrap();

        let lamp = registry.find("lamp-1").unwrap();
        assert_eq!(
            lamp.fetch(&OnOffHandler::VALUE.name()).await.unwrap(),
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn modifier_actions_lower_like_writes() {
        let registry = registry();

        Action::new("/lamp-1/s/level/v?inc")
            .body(0.25)
            .execute(&registry)
            .await
            .unwrap();
        Action::new("/lamp-1/s/onoff/v?tog")
            .execute(&registry)
            .await
            .unwrap();

        let lamp = registry.find("lamp-1").unwrap();
        assert_eq!(
            lamp.fetch(&LevelHandler::VALUE.name()).await.unwrap(),
            Value::Number(0.25)
        );
        assert_eq!(
            lamp.fetch(&OnOffHandler::VALUE.name()).await.unwrap(),
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn method_action_invokes() {
        let registry = registry();

        Action::new("/lamp-1/f/onoff?toggle")
            .execute(&registry)
            .await
            .unwrap();

        let lamp = registry.find("lamp-1").unwrap();
        assert_eq!(
            lamp.fetch(&OnOffHandler::VALUE.name()).await.unwrap(),
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn stop_on_error_aborts_the_list() {
        let registry = registry();

        let actions = [
            Action::new("/missing/s/onoff/v")
                .body(true)
                .sync_mode(SyncMode::SyncStopOnError),
            Action::new("/lamp-2/s/onoff/v")
                .body(true)
                .sync_mode(SyncMode::SyncWait),
        ];
        run_actions(&actions, &registry).await;

        // The second action never ran.
        let lamp = registry.find("lamp-2").unwrap();
        assert_eq!(
            lamp.fetch(&OnOffHandler::VALUE.name()).await.unwrap(),
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn sync_wait_continues_past_failures() {
        let registry = registry();

        let actions = [
            Action::new("/missing/s/onoff/v")
                .body(true)
                .sync_mode(SyncMode::SyncWait),
            Action::new("/lamp-2/s/onoff/v")
                .body(true)
                .sync_mode(SyncMode::SyncWait),
        ];
        run_actions(&actions, &registry).await;

        let lamp = registry.find("lamp-2").unwrap();
        assert_eq!(
            lamp.fetch(&OnOffHandler::VALUE.name()).await.unwrap(),
            Value::Bool(true)
        );
    }
}
