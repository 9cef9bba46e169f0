use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use indexmap::IndexMap;

use tracing::{info, warn};

use filament::value::{Map, Value};

use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::group::{GROUP_PREFIX, Group};
use crate::local::LocalEndpoint;

/// An endpoint reference observed opportunistically during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredEndpoint {
    /// The endpoint identifier.
    pub endpoint_id: String,
    /// The unique id, when it was observed.
    pub uid: Option<String>,
    /// The human name, when it was observed.
    pub name: Option<String>,
}

/// The discovery collaborator.
///
/// A filterable, multicast-style query. A timeout is partial success:
/// implementations return whatever accumulated, never a failure.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Discovers endpoints matching a filter.
    ///
    /// # Errors
    ///
    /// Fails only on transport-level breakage, never on a timeout.
    async fn discover(
        &self,
        filter: &str,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredEndpoint>>;
}

/// The persistence contract of stateful components.
///
/// State is nested and keyed by component identifier so a parent can
/// aggregate and restore its children transactionally.
pub trait Persist {
    /// Copies the persistable state.
    fn copy_state(&self) -> Value;

    /// Restores previously copied state.
    ///
    /// # Errors
    ///
    /// Fails when the state does not have the expected shape.
    fn init_with_state(&self, state: &Value) -> Result<()>;
}

// A generation-counted slot; the generation survives the group so
// stale handles stay invalid forever.
struct GroupSlot {
    id: String,
    generation: u64,
    group: Option<Arc<Group>>,
}

/// A handle to a group hosted by a [`Registry`].
///
/// Handles are invalidated when the group is unhosted: lifetime is
/// explicit through the registry, never observed through garbage
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHandle {
    index: usize,
    generation: u64,
}

struct Inner {
    // Endpoints answering for their ids: locals and groups. These are
    // what the protocol adapter routes requests to.
    hosted: IndexMap<String, Arc<dyn Endpoint>>,
    // Associated mirrors of elsewhere-hosted endpoints. Addressable
    // through lookups, never through the adapter: a proxy answering
    // for its own origin would loop.
    associated: IndexMap<String, Arc<dyn Endpoint>>,
    groups: Vec<GroupSlot>,
    next_group: u64,
}

/// The technology instance: owns hosted endpoints and the group table.
///
/// The registry holds the strong references; everything else reaches
/// endpoints through lookups or generation-counted handles.
pub struct Registry {
    name: String,
    inner: Mutex<Inner>,
    weak_self: Weak<Self>,
}

impl Registry {
    /// Creates a [`Registry`] with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                hosted: IndexMap::new(),
                associated: IndexMap::new(),
                groups: Vec::new(),
                next_group: 0,
            }),
            weak_self: weak.clone(),
        })
    }

    /// Returns the registry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hosts a local endpoint, replacing any endpoint with the same
    /// identifier.
    pub fn host(&self, endpoint: &Arc<LocalEndpoint>) {
        endpoint.attach_registry(self.weak_self.clone());

        let id = endpoint.endpoint_id().to_string();
        info!("Hosting `{id}` on `{}`", self.name);

        let replaced = self
            .inner
            .lock()
            .expect("registry poisoned")
            .hosted
            .insert(id.clone(), Arc::clone(endpoint) as Arc<dyn Endpoint>);
        if replaced.is_some() {
            warn!("`{id}` replaced an already-hosted endpoint");
        }
    }

    /// Associates an externally-created endpoint, typically a remote
    /// proxy, with this registry.
    ///
    /// Associated endpoints resolve through [`Registry::find`] and may
    /// join groups, but the protocol adapter never routes inbound
    /// requests to them.
    pub fn adopt(&self, endpoint: Arc<dyn Endpoint>) {
        let id = endpoint.endpoint_id().to_string();
        self.inner
            .lock()
            .expect("registry poisoned")
            .associated
            .insert(id, endpoint);
    }

    /// Removes an endpoint or group by identifier.
    ///
    /// Returns whether anything was removed. Unhosting a group bumps
    /// its slot generation, invalidating every outstanding handle.
    pub fn unhost(&self, endpoint_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry poisoned");

        let removed = inner.hosted.shift_remove(endpoint_id).is_some()
            || inner.associated.shift_remove(endpoint_id).is_some();
        if removed {
            info!("Unhosted `{endpoint_id}` from `{}`", self.name);
        }

        if let Some(slot) = inner
            .groups
            .iter_mut()
            .find(|slot| slot.id == endpoint_id && slot.group.is_some())
        {
            slot.generation += 1;
            slot.group = None;
        }
        removed
    }

    /// Looks up an endpoint or group by identifier, hosted or
    /// associated.
    #[must_use]
    pub fn find(&self, endpoint_id: &str) -> Option<Arc<dyn Endpoint>> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .hosted
            .get(endpoint_id)
            .or_else(|| inner.associated.get(endpoint_id))
            .cloned()
    }

    // Hosted endpoints only: what inbound requests may route to.
    pub(crate) fn find_hosted(&self, endpoint_id: &str) -> Option<Arc<dyn Endpoint>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .hosted
            .get(endpoint_id)
            .cloned()
    }

    /// Checks whether an endpoint is associated with this registry.
    #[must_use]
    pub fn contains(&self, endpoint_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.hosted.contains_key(endpoint_id) || inner.associated.contains_key(endpoint_id)
    }

    /// Checks whether an identifier names a hosted group.
    #[must_use]
    pub fn is_group(&self, endpoint_id: &str) -> bool {
        endpoint_id.starts_with(GROUP_PREFIX) && self.contains(endpoint_id)
    }

    /// Returns every known endpoint identifier: hosted, associated,
    /// and groups.
    #[must_use]
    pub fn endpoint_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .hosted
            .keys()
            .chain(inner.associated.keys())
            .cloned()
            .collect()
    }

    /// Creates a group, or returns the existing one with the same
    /// identifier.
    ///
    /// Without a caller-supplied identifier, one is generated. The
    /// optional native endpoint carries the group's own configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnacceptableMember`] when the identifier
    /// collides with a non-group endpoint.
    pub fn create_group(
        &self,
        id: Option<&str>,
        native: Option<Arc<LocalEndpoint>>,
    ) -> Result<(Arc<Group>, GroupHandle)> {
        let mut inner = self.inner.lock().expect("registry poisoned");

        let full_id = match id {
            Some(id) => format!("{GROUP_PREFIX}{id}"),
            None => {
                inner.next_group += 1;
                format!("{GROUP_PREFIX}group-{}", inner.next_group)
            }
        };

        // Same identifier, same group.
        if let Some((index, slot)) = inner
            .groups
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.id == full_id && slot.group.is_some())
        {
            let handle = GroupHandle {
                index,
                generation: slot.generation,
            };
            let group = slot.group.clone().ok_or_else(|| {
                Error::new(ErrorKind::UnknownResource, "The group slot is empty.")
            })?;
            return Ok((group, handle));
        }

        if inner.hosted.contains_key(&full_id) || inner.associated.contains_key(&full_id) {
            return Err(Error::new(
                ErrorKind::UnacceptableMember,
                format!("`{full_id}` names a non-group endpoint"),
            ));
        }

        let group = Group::new(full_id.clone(), self.weak_self.clone(), native);

        inner
            .hosted
            .insert(full_id.clone(), Arc::clone(&group) as Arc<dyn Endpoint>);
        inner.groups.push(GroupSlot {
            id: full_id,
            generation: 0,
            group: Some(Arc::clone(&group)),
        });

        let handle = GroupHandle {
            index: inner.groups.len() - 1,
            generation: 0,
        };
        Ok((group, handle))
    }

    /// Resolves a group handle.
    ///
    /// Returns [`None`] once the group was unhosted: the handle's
    /// generation no longer matches.
    #[must_use]
    pub fn group(&self, handle: GroupHandle) -> Option<Arc<Group>> {
        let inner = self.inner.lock().expect("registry poisoned");
        let slot = inner.groups.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.group.clone()
    }

    /// Looks up a group by its bare identifier (without the `g/`
    /// prefix).
    #[must_use]
    pub fn group_by_id(&self, id: &str) -> Option<Arc<Group>> {
        let full_id = format!("{GROUP_PREFIX}{id}");
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .groups
            .iter()
            .find(|slot| slot.id == full_id)
            .and_then(|slot| slot.group.clone())
    }
}

impl Persist for Registry {
    // Nested by component identifier: `{"groups": {"g/kitchen":
    // {"members": ["lamp-1"]}}}`.
    fn copy_state(&self) -> Value {
        let inner = self.inner.lock().expect("registry poisoned");

        let mut groups = Map::new();
        for slot in &inner.groups {
            let Some(group) = &slot.group else { continue };
            let members = group
                .member_ids()
                .into_iter()
                .map(Value::Text)
                .collect::<Vec<_>>();

            let mut entry = Map::new();
            entry.insert("members".into(), Value::Array(members));
            groups.insert(slot.id.clone(), Value::Map(entry));
        }

        let mut state = Map::new();
        state.insert("groups".into(), Value::Map(groups));
        Value::Map(state)
    }

    fn init_with_state(&self, state: &Value) -> Result<()> {
        let Value::Map(state) = state else {
            return Err(Error::new(
                ErrorKind::UnknownResource,
                "The registry state must be a map.",
            ));
        };

        let Some(Value::Map(groups)) = state.get("groups") else {
            return Ok(());
        };

        for (full_id, entry) in groups {
            let Some(id) = full_id.strip_prefix(GROUP_PREFIX) else {
                warn!("Skipping a malformed group id: `{full_id}`");
                continue;
            };

            let (group, _) = self.create_group(Some(id), None)?;

            let Value::Map(entry) = entry else { continue };
            let Some(Value::Array(members)) = entry.get("members") else {
                continue;
            };

            for member in members {
                let Value::Text(member_id) = member else { continue };
                match self.find(member_id) {
                    Some(member) => group.add_member(member)?,
                    // Persisted membership may reference endpoints not
                    // yet associated; they rejoin when adopted.
                    None => warn!("Skipping an unknown member: `{member_id}`"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use filament::value::Value;

    use crate::endpoint::Endpoint;
    use crate::error::Result;
    use crate::handler::OnOffHandler;
    use crate::local::tests::create_lamp;

    use super::{DiscoveredEndpoint, Discoverer, Persist, Registry};

    #[tokio::test]
    async fn host_find_unhost() {
        let registry = Registry::new("home");
        let lamp = create_lamp("lamp-1");

        registry.host(&lamp);
        assert!(registry.contains("lamp-1"));
        assert_eq!(registry.find("lamp-1").unwrap().endpoint_id(), "lamp-1");

        // Deleting through the capability interface unhosts.
        assert!(lamp.delete().await.unwrap());
        assert!(!registry.contains("lamp-1"));
        assert!(registry.find("lamp-1").is_none());
    }

    #[tokio::test]
    async fn group_handles_expire_on_unhost() {
        let registry = Registry::new("home");
        let (group, handle) = registry.create_group(Some("kitchen"), None).unwrap();

        assert!(registry.group(handle).is_some());
        assert!(registry.is_group("g/kitchen"));

        // Creating again with the same id returns the same group.
        let (again, second_handle) = registry.create_group(Some("kitchen"), None).unwrap();
        assert_eq!(again.endpoint_id(), group.endpoint_id());
        assert_eq!(second_handle, handle);

        registry.unhost("g/kitchen");
        assert!(registry.group(handle).is_none());
        assert!(!registry.is_group("g/kitchen"));
    }

    #[tokio::test]
    async fn generated_group_ids_are_unique() {
        let registry = Registry::new("home");

        let (first, _) = registry.create_group(None, None).unwrap();
        let (second, _) = registry.create_group(None, None).unwrap();

        assert_ne!(first.endpoint_id(), second.endpoint_id());
    }

    #[tokio::test]
    async fn membership_survives_a_restart() {
        let registry = Registry::new("home");
        registry.host(&create_lamp("lamp-1"));
        registry.host(&create_lamp("lamp-2"));

        let (group, _) = registry.create_group(Some("kitchen"), None).unwrap();
        group.add_member(registry.find("lamp-1").unwrap()).unwrap();
        group.add_member(registry.find("lamp-2").unwrap()).unwrap();

        let state = registry.copy_state();

        // A fresh process: same endpoints, restored state.
        let restored = Registry::new("home");
        restored.host(&create_lamp("lamp-1"));
        restored.host(&create_lamp("lamp-2"));
        restored.init_with_state(&state).unwrap();

        let group = restored.group_by_id("kitchen").unwrap();
        assert_eq!(group.member_ids(), vec!["lamp-1", "lamp-2"]);

        // The restored group fans out like the original.
        let group: Arc<dyn Endpoint> = group;
        group
            .set(&OnOffHandler::VALUE.name(), Value::Bool(true))
            .await
            .unwrap();
        assert_eq!(
            restored
                .find("lamp-2")
                .unwrap()
                .fetch(&OnOffHandler::VALUE.name())
                .await
                .unwrap(),
            Value::Bool(true)
        );
    }

    struct ShelfDiscoverer {
        shelf: Vec<DiscoveredEndpoint>,
    }

    #[async_trait]
    impl Discoverer for ShelfDiscoverer {
        async fn discover(
            &self,
            filter: &str,
            _timeout: Duration,
        ) -> Result<Vec<DiscoveredEndpoint>> {
            Ok(self
                .shelf
                .iter()
                .filter(|endpoint| endpoint.endpoint_id.contains(filter))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn discovery_filters() {
        let discoverer = ShelfDiscoverer {
            shelf: vec![
                DiscoveredEndpoint {
                    endpoint_id: "lamp-1".into(),
                    uid: Some("A1".into()),
                    name: Some("Desk lamp".into()),
                },
                DiscoveredEndpoint {
                    endpoint_id: "thermostat-1".into(),
                    uid: None,
                    name: None,
                },
            ],
        };

        let found = discoverer
            .discover("lamp", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].endpoint_id, "lamp-1");
    }
}
