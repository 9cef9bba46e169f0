use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use futures_util::future::join_all;

use tokio_util::sync::CancellationToken;

use tracing::debug;

use filament::key::{Invoked, PropertyName};
use filament::section::Section;
use filament::uri::Mutation;
use filament::value::Value;

use crate::endpoint::{Endpoint, MethodArgs, SectionMap, WriteOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::listener::{ChildStream, PropertyStream};
use crate::local::LocalEndpoint;
use crate::registry::Registry;

// Group identifiers live under this prefix.
pub(crate) const GROUP_PREFIX: &str = "g/";

/// A composite endpoint fanning state operations out to its members.
///
/// A group is explicit composition: it holds a member list plus an
/// optional native local endpoint, and each operation is a small
/// dispatch over the two. State-section writes fan out to every member
/// and complete once all member operations settle; the policy is
/// best-effort with per-member failure visible. Configuration never
/// fans out: it applies to the native endpoint only.
///
/// Reads return the first member's value. Members may disagree right
/// after a partial failure; the fan-out write model converges them.
pub struct Group {
    id: String,
    registry: Weak<Registry>,
    members: Mutex<Vec<Arc<dyn Endpoint>>>,
    native: Option<Arc<LocalEndpoint>>,
    // Replaced wholesale by `cancel_pending`.
    cancel: Mutex<CancellationToken>,
}

impl Group {
    pub(crate) fn new(
        id: String,
        registry: Weak<Registry>,
        native: Option<Arc<LocalEndpoint>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            registry,
            members: Mutex::new(Vec::new()),
            native,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Adds a member endpoint.
    ///
    /// Adding a member twice is idempotent.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnacceptableMember`] when the member is
    /// itself a group or is not associated with this group's registry:
    /// both rules are checked before any state mutates.
    pub fn add_member(&self, member: Arc<dyn Endpoint>) -> Result<()> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::Remote, "The owning registry is gone.")
        })?;

        // Groups never nest; this is the cycle guard.
        if member.endpoint_id().starts_with(GROUP_PREFIX) {
            return Err(Error::new(
                ErrorKind::UnacceptableMember,
                "A group cannot contain another group.",
            ));
        }

        if !registry.contains(member.endpoint_id()) {
            return Err(Error::new(
                ErrorKind::UnacceptableMember,
                format!(
                    "`{}` is not associated with registry `{}`",
                    member.endpoint_id(),
                    registry.name()
                ),
            ));
        }

        let mut members = self.members.lock().expect("members poisoned");
        if members
            .iter()
            .any(|existing| existing.endpoint_id() == member.endpoint_id())
        {
            return Ok(());
        }

        debug!("Adding `{}` to `{}`", member.endpoint_id(), self.id);
        members.push(member);
        Ok(())
    }

    /// Removes a member by endpoint identifier.
    ///
    /// Returns whether the member existed.
    pub fn remove_member(&self, endpoint_id: &str) -> bool {
        let mut members = self.members.lock().expect("members poisoned");
        let before = members.len();
        members.retain(|member| member.endpoint_id() != endpoint_id);
        members.len() != before
    }

    /// Returns the member endpoint identifiers, in insertion order.
    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        self.members
            .lock()
            .expect("members poisoned")
            .iter()
            .map(|member| member.endpoint_id().to_string())
            .collect()
    }

    /// Cancels every in-flight fan-out.
    ///
    /// Later operations run normally.
    pub fn cancel_pending(&self) {
        let fresh = CancellationToken::new();
        let pending = std::mem::replace(
            &mut *self.cancel.lock().expect("cancel poisoned"),
            fresh,
        );
        pending.cancel();
    }

    fn snapshot(&self) -> Vec<Arc<dyn Endpoint>> {
        self.members.lock().expect("members poisoned").clone()
    }

    // The first member, falling back to the native endpoint.
    fn read_target(&self) -> Result<Arc<dyn Endpoint>> {
        if let Some(first) = self.snapshot().into_iter().next() {
            return Ok(first);
        }
        if let Some(native) = &self.native {
            return Ok(Arc::clone(native) as Arc<dyn Endpoint>);
        }
        Err(Error::new(
            ErrorKind::UnknownResource,
            format!("`{}` has no members", self.id),
        ))
    }

    fn native_target(&self) -> Result<Arc<dyn Endpoint>> {
        self.native
            .as_ref()
            .map(|native| Arc::clone(native) as Arc<dyn Endpoint>)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::UnknownResource,
                    format!("`{}` has no native endpoint", self.id),
                )
            })
    }

    async fn fan_out(
        &self,
        name: &PropertyName,
        value: Value,
        mutation: Mutation,
        options: &WriteOptions,
    ) -> Result<()> {
        let mut targets = self.snapshot();
        if let Some(native) = &self.native {
            targets.push(Arc::clone(native) as Arc<dyn Endpoint>);
        }
        if targets.is_empty() {
            return Err(Error::new(
                ErrorKind::UnknownResource,
                format!("`{}` has no members", self.id),
            ));
        }

        let cancel = self
            .cancel
            .lock()
            .expect("cancel poisoned")
            .child_token();

        let operations = targets.into_iter().map(|member| {
            let name = name.clone();
            let value = value.clone();
            let options = *options;
            async move {
                let id = member.endpoint_id().to_string();
                let result = member.apply(&name, value, mutation, &options).await;
                (id, result)
            }
        });

        // Join-then-report: every member settles before the aggregate
        // does, and cancelling the aggregate abandons them all.
        let results = tokio::select! {
            results = join_all(operations) => results,
            () = cancel.cancelled() => {
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    format!("The fan-out on `{}` was cancelled", self.id),
                ));
            }
        };

        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|_| id))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            // Best-effort: successes stay applied, failures are named.
            Err(Error::new(
                ErrorKind::Remote,
                format!("The fan-out on `{name}` failed for: {}", failed.join(", ")),
            ))
        }
    }
}

#[async_trait]
impl Endpoint for Group {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, name: &PropertyName) -> Result<Value> {
        match name.section {
            Section::State => self.read_target()?.fetch(name).await,
            Section::Config | Section::Metadata => self.native_target()?.fetch(name).await,
        }
    }

    fn cached(&self, name: &PropertyName) -> Option<Value> {
        self.read_target().ok()?.cached(name)
    }

    async fn apply(
        &self,
        name: &PropertyName,
        value: Value,
        mutation: Mutation,
        options: &WriteOptions,
    ) -> Result<()> {
        match name.section {
            Section::State => self.fan_out(name, value, mutation, options).await,
            // Configuration and metadata never fan out across a group.
            Section::Config | Section::Metadata => {
                self.native_target()?
                    .apply(name, value, mutation, options)
                    .await
            }
        }
    }

    async fn invoke(&self, trait_id: &str, method: &str, args: MethodArgs) -> Result<Invoked> {
        self.native_target()
            .map_err(|_| {
                Error::new(
                    ErrorKind::MethodNotFound,
                    format!("`{}` exposes no methods", self.id),
                )
            })?
            .invoke(trait_id, method, args)
            .await
    }

    async fn fetch_section(&self, section: Section) -> Result<SectionMap> {
        match section {
            Section::State => self.read_target()?.fetch_section(section).await,
            Section::Config | Section::Metadata => {
                self.native_target()?.fetch_section(section).await
            }
        }
    }

    async fn observe(&self, name: &PropertyName) -> Result<PropertyStream> {
        self.read_target()?.observe(name).await
    }

    async fn observe_section(&self, section: Section) -> Result<PropertyStream> {
        self.read_target()?.observe_section(section).await
    }

    async fn observe_children(&self, trait_id: &str) -> Result<ChildStream> {
        self.native_target()?.observe_children(trait_id).await
    }

    fn child(&self, trait_id: &str, child_id: &str) -> Option<Arc<dyn Endpoint>> {
        self.native.as_ref()?.child(trait_id, child_id)
    }

    fn parent(&self) -> Option<Arc<dyn Endpoint>> {
        None
    }

    async fn delete(&self) -> Result<bool> {
        match self.registry.upgrade() {
            Some(registry) => Ok(registry.unhost(&self.id)),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use filament::value::Value;

    use crate::endpoint::Endpoint;
    use crate::error::ErrorKind;
    use crate::handler::{IdentityHandler, OnOffHandler};
    use crate::local::tests::create_lamp;
    use crate::registry::Registry;
    use crate::remote::RemoteEndpoint;
    use crate::transport::LoopbackTransport;

    fn registry_with_lamps() -> Arc<Registry> {
        let registry = Registry::new("home");
        registry.host(&create_lamp("lamp-1"));
        registry.host(&create_lamp("lamp-2"));
        registry
    }

    #[tokio::test]
    async fn membership_rules() {
        let registry = registry_with_lamps();

        let (kitchen, _) = registry.create_group(Some("kitchen"), None).unwrap();
        let (bedroom, _) = registry.create_group(Some("bedroom"), None).unwrap();

        kitchen
            .add_member(registry.find("lamp-1").unwrap())
            .unwrap();
        // Idempotent.
        kitchen
            .add_member(registry.find("lamp-1").unwrap())
            .unwrap();
        assert_eq!(kitchen.member_ids(), vec!["lamp-1"]);

        // A group never contains a group.
        assert_eq!(
            kitchen
                .add_member(registry.find("g/bedroom").unwrap())
                .unwrap_err()
                .kind(),
            ErrorKind::UnacceptableMember
        );
        let _ = bedroom;

        // A foreign endpoint is not an acceptable member.
        let stranger = create_lamp("stranger");
        assert_eq!(
            kitchen
                .add_member(stranger as Arc<dyn Endpoint>)
                .unwrap_err()
                .kind(),
            ErrorKind::UnacceptableMember
        );

        assert!(kitchen.remove_member("lamp-1"));
        assert!(!kitchen.remove_member("lamp-1"));
    }

    #[tokio::test]
    async fn state_fans_out_to_every_member() {
        let registry = registry_with_lamps();
        let (group, _) = registry.create_group(Some("kitchen"), None).unwrap();

        group.add_member(registry.find("lamp-1").unwrap()).unwrap();
        group.add_member(registry.find("lamp-2").unwrap()).unwrap();

        let group: Arc<dyn Endpoint> = group;
        let on = OnOffHandler::VALUE.name();
        group.set(&on, Value::Bool(true)).await.unwrap();

        for id in ["lamp-1", "lamp-2"] {
            let member = registry.find(id).unwrap();
            assert_eq!(member.fetch(&on).await.unwrap(), Value::Bool(true));
        }

        // Reads return the first member's value.
        assert_eq!(group.fetch(&on).await.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn fan_out_is_best_effort_with_failures_named() {
        let registry = registry_with_lamps();
        let transport = LoopbackTransport::new(&registry);

        // A proxy of an endpoint nobody hosts: permanently unreachable.
        let ghost = RemoteEndpoint::new("ghost", transport.clone());
        registry.adopt(ghost);

        let (group, _) = registry.create_group(Some("kitchen"), None).unwrap();
        group.add_member(registry.find("lamp-1").unwrap()).unwrap();
        group.add_member(registry.find("lamp-2").unwrap()).unwrap();
        group.add_member(registry.find("ghost").unwrap()).unwrap();

        let group: Arc<dyn Endpoint> = group;
        let on = OnOffHandler::VALUE.name();
        let error = group.set(&on, Value::Bool(true)).await.unwrap_err();

        // The aggregate fails naming the unreachable member...
        assert_eq!(error.kind(), ErrorKind::Remote);
        assert!(error.to_string().contains("ghost"), "{error}");

        // ...while the reachable members stay mutated.
        for id in ["lamp-1", "lamp-2"] {
            let member = registry.find(id).unwrap();
            assert_eq!(member.fetch(&on).await.unwrap(), Value::Bool(true));
        }
    }

    #[tokio::test]
    async fn config_never_fans_out() {
        let registry = registry_with_lamps();
        let (group, _) = registry.create_group(Some("kitchen"), None).unwrap();
        group.add_member(registry.find("lamp-1").unwrap()).unwrap();

        let group: Arc<dyn Endpoint> = group;
        let name = IdentityHandler::NAME.name();
        // No native endpoint: the write has nowhere to go and the
        // members are left alone.
        assert!(group.set(&name, Value::Text("Kitchen".into())).await.is_err());

        let member = registry.find("lamp-1").unwrap();
        assert_eq!(
            member.fetch(&name).await.unwrap(),
            Value::Text("A lamp".into())
        );
    }

    #[tokio::test]
    async fn native_carries_group_config() {
        let registry = registry_with_lamps();
        let native = crate::local::LocalEndpoint::builder("kitchen-native")
            .handler(IdentityHandler::new("G-1", "Kitchen"))
            .build();

        let (group, _) = registry
            .create_group(Some("kitchen"), Some(native))
            .unwrap();
        group.add_member(registry.find("lamp-1").unwrap()).unwrap();

        let group: Arc<dyn Endpoint> = group;
        let name = IdentityHandler::NAME.name();

        group.set(&name, Value::Text("Kitchen 2".into())).await.unwrap();
        assert_eq!(
            group.fetch(&name).await.unwrap(),
            Value::Text("Kitchen 2".into())
        );
    }
}
