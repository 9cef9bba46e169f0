use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use hashbrown::HashMap;

use indexmap::IndexMap;

use tokio_util::sync::CancellationToken;

use tracing::debug;

use filament::key::{Invoked, PropertyName};
use filament::section::Section;
use filament::uri::Mutation;
use filament::value::Value;

use crate::endpoint::{Endpoint, MethodArgs, SectionMap, WriteOptions, lower_mutation};
use crate::error::{Error, ErrorKind, Result};
use crate::handler::TraitHandler;
use crate::listener::{ChildEvent, ChildStream, ListenerTable, PropertyEvent, PropertyStream, Topic};
use crate::registry::Registry;

// Transition interpolation tick.
const TRANSITION_TICK: Duration = Duration::from_millis(100);

/// Builds a [`LocalEndpoint`] from its composed trait handlers.
pub struct LocalEndpointBuilder {
    id: String,
    handlers: IndexMap<&'static str, Box<dyn TraitHandler>>,
}

impl LocalEndpointBuilder {
    /// Composes a [`TraitHandler`] into the endpoint.
    ///
    /// A handler with an already-registered trait id replaces the
    /// earlier one.
    #[must_use]
    pub fn handler(mut self, handler: impl TraitHandler + 'static) -> Self {
        self.handlers.insert(handler.trait_id(), Box::new(handler));
        self
    }

    /// Builds the endpoint.
    ///
    /// The dispatch table is fixed from here on: traits are composed at
    /// construction, never at runtime.
    #[must_use]
    pub fn build(self) -> Arc<LocalEndpoint> {
        Arc::new_cyclic(|weak| LocalEndpoint {
            id: self.id,
            handlers: self.handlers,
            listeners: ListenerTable::new(),
            child_listeners: ListenerTable::new(),
            children: Mutex::new(IndexMap::new()),
            parent: Mutex::new(None),
            registry: Mutex::new(None),
            transitions: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }
}

/// A locally-hosted functional endpoint.
///
/// Owns the canonical property state, composed from one
/// [`TraitHandler`] per trait, and fans out change notifications to
/// registered listeners. State-section properties support smooth
/// transitions driven by an internal interpolation timer.
pub struct LocalEndpoint {
    id: String,
    handlers: IndexMap<&'static str, Box<dyn TraitHandler>>,
    listeners: ListenerTable<PropertyEvent>,
    child_listeners: ListenerTable<ChildEvent>,
    children: Mutex<IndexMap<(String, String), Arc<dyn Endpoint>>>,
    parent: Mutex<Option<Weak<dyn Endpoint>>>,
    registry: Mutex<Option<Weak<Registry>>>,
    // In-flight transitions by flattened property key.
    transitions: Mutex<HashMap<String, CancellationToken>>,
    weak_self: Weak<Self>,
}

impl LocalEndpoint {
    /// Starts building a [`LocalEndpoint`] with the given identifier.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> LocalEndpointBuilder {
        LocalEndpointBuilder {
            id: id.into(),
            handlers: IndexMap::new(),
        }
    }

    pub(crate) fn attach_registry(&self, registry: Weak<Registry>) {
        *self.registry.lock().expect("registry link poisoned") = Some(registry);
    }

    /// Records the parent endpoint.
    ///
    /// The back-reference is weak: it never keeps the parent alive.
    pub fn set_parent(&self, parent: &Arc<dyn Endpoint>) {
        *self.parent.lock().expect("parent link poisoned") = Some(Arc::downgrade(parent));
    }

    /// Adds a child endpoint under a trait, notifying child listeners.
    pub fn add_child(
        &self,
        trait_id: impl Into<String>,
        child_id: impl Into<String>,
        child: Arc<dyn Endpoint>,
    ) {
        let trait_id = trait_id.into();
        let child_id = child_id.into();

        self.children
            .lock()
            .expect("children poisoned")
            .insert((trait_id.clone(), child_id.clone()), child);

        self.child_listeners.dispatch(
            &Topic::Children(trait_id.clone()),
            &ChildEvent {
                trait_id,
                child: child_id,
                added: true,
            },
        );
    }

    /// Removes a child endpoint, notifying child listeners.
    ///
    /// Returns whether the child existed.
    pub fn remove_child(&self, trait_id: &str, child_id: &str) -> bool {
        let removed = self
            .children
            .lock()
            .expect("children poisoned")
            .shift_remove(&(trait_id.to_string(), child_id.to_string()))
            .is_some();

        if removed {
            self.child_listeners.dispatch(
                &Topic::Children(trait_id.to_string()),
                &ChildEvent {
                    trait_id: trait_id.to_string(),
                    child: child_id.to_string(),
                    added: false,
                },
            );
        }
        removed
    }

    fn handler_for(&self, name: &PropertyName) -> Result<&dyn TraitHandler> {
        self.handlers
            .get(name.trait_id.as_ref())
            .map(|handler| handler.as_ref())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PropertyNotFound,
                    format!("`{name}` is not a property of `{}`", self.id),
                )
            })
    }

    // Writes through the handler and fans out on change.
    fn write(&self, name: &PropertyName, value: &Value) -> Result<()> {
        let handler = self.handler_for(name)?;
        let prev = handler.get(name).ok();
        if let Some(new) = handler.set(name, value)? {
            self.dispatch_property(name, new, prev);
        }
        Ok(())
    }

    fn dispatch_property(&self, name: &PropertyName, value: Value, prev: Option<Value>) {
        let event = PropertyEvent {
            endpoint: self.id.clone(),
            name: name.clone(),
            value,
            prev,
        };
        self.listeners.dispatch(&Topic::property(name), &event);
        self.listeners.dispatch(&Topic::Section(name.section), &event);
    }

    fn cancel_transition(&self, flat: &str) {
        if let Some(token) = self
            .transitions
            .lock()
            .expect("transitions poisoned")
            .remove(flat)
        {
            token.cancel();
        }
    }

    // Interpolation state machine: Idle -> Transitioning -> Idle,
    // ticking on a schedule and emitting intermediate notifications.
    fn begin_transition(&self, name: &PropertyName, start: f64, end: f64, duration: f64) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };

        let token = CancellationToken::new();
        if let Some(replaced) = self
            .transitions
            .lock()
            .expect("transitions poisoned")
            .insert(name.flat(), token.clone())
        {
            replaced.cancel();
        }

        debug!(
            "Transitioning `{}` on `{}` from {start} to {end} over {duration}s",
            name, self.id
        );

        let name = name.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(TRANSITION_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let t = (started.elapsed().as_secs_f64() / duration).min(1.0);
                let value = start + (end - start) * t;
                if this.write(&name, &Value::Number(value)).is_err() || t >= 1.0 {
                    break;
                }
            }

            this.transitions
                .lock()
                .expect("transitions poisoned")
                .remove(&name.flat());
        });
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, name: &PropertyName) -> Result<Value> {
        self.handler_for(name)?.get(name)
    }

    fn cached(&self, name: &PropertyName) -> Option<Value> {
        // The local runtime owns the canonical state; the cache is the
        // state itself.
        self.handler_for(name).ok()?.get(name).ok()
    }

    async fn apply(
        &self,
        name: &PropertyName,
        value: Value,
        mutation: Mutation,
        options: &WriteOptions,
    ) -> Result<()> {
        let handler = self.handler_for(name)?;

        // A direct write always supersedes an in-flight transition.
        self.cancel_transition(&name.flat());

        if mutation == Mutation::Set
            && name.section == Section::State
            && options.duration.is_some_and(|duration| duration > 0.0)
        {
            let duration = options.duration.unwrap_or_default();
            let start = handler.get(name)?.as_f64();
            let end = value.as_f64();
            let (Some(start), Some(end)) = (start, end) else {
                return Err(Error::new(
                    ErrorKind::InvalidPropertyValue,
                    "Only numeric properties can transition.",
                ));
            };
            self.begin_transition(name, start, end, duration);
            return Ok(());
        }

        let current = handler.get(name).ok();
        let target = lower_mutation(current.as_ref(), value, mutation)?;
        self.write(name, &target)
    }

    async fn invoke(&self, trait_id: &str, method: &str, args: MethodArgs) -> Result<Invoked> {
        let handler = self.handlers.get(trait_id).ok_or_else(|| {
            Error::new(
                ErrorKind::MethodNotFound,
                format!("`{trait_id}` is not a trait of `{}`", self.id),
            )
        })?;
        handler.invoke(method, &args)
    }

    async fn fetch_section(&self, section: Section) -> Result<SectionMap> {
        let mut map = SectionMap::new();
        for handler in self.handlers.values() {
            for name in handler.properties() {
                if name.section == section
                    && let Ok(value) = handler.get(&name)
                {
                    map.insert(name.flat(), value);
                }
            }
        }
        Ok(map)
    }

    async fn observe(&self, name: &PropertyName) -> Result<PropertyStream> {
        // Observing an unsupported property is an addressing error, not
        // an eternally-silent stream.
        self.handler_for(name)?.get(name)?;

        let (stream, _) = self.listeners.register(Topic::property(name));
        Ok(stream)
    }

    async fn observe_section(&self, section: Section) -> Result<PropertyStream> {
        let (stream, _) = self.listeners.register(Topic::Section(section));
        Ok(stream)
    }

    async fn observe_children(&self, trait_id: &str) -> Result<ChildStream> {
        let (stream, _) = self
            .child_listeners
            .register(Topic::Children(trait_id.to_string()));
        Ok(stream)
    }

    fn child(&self, trait_id: &str, child_id: &str) -> Option<Arc<dyn Endpoint>> {
        self.children
            .lock()
            .expect("children poisoned")
            .get(&(trait_id.to_string(), child_id.to_string()))
            .cloned()
    }

    fn parent(&self) -> Option<Arc<dyn Endpoint>> {
        self.parent
            .lock()
            .expect("parent link poisoned")
            .as_ref()?
            .upgrade()
    }

    async fn delete(&self) -> Result<bool> {
        let registry = self
            .registry
            .lock()
            .expect("registry link poisoned")
            .as_ref()
            .and_then(Weak::upgrade);

        match registry {
            Some(registry) => Ok(registry.unhost(&self.id)),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use filament::section::Section;
    use filament::uri::Mutation;
    use filament::value::Value;

    use crate::endpoint::{Endpoint, WriteOptions};
    use crate::error::ErrorKind;
    use crate::handler::{IdentityHandler, LevelHandler, OnOffHandler};

    use super::LocalEndpoint;

    pub(crate) fn create_lamp(id: &str) -> Arc<LocalEndpoint> {
        LocalEndpoint::builder(id)
            .handler(OnOffHandler::new(false))
            .handler(LevelHandler::new(0.0))
            .handler(IdentityHandler::new(id.to_uppercase(), "A lamp"))
            .build()
    }

    #[tokio::test]
    async fn fetch_and_mutate() {
        let lamp = create_lamp("lamp-1");
        let lamp: Arc<dyn Endpoint> = lamp;
        let on = OnOffHandler::VALUE.name();
        let level = LevelHandler::VALUE.name();

        assert_eq!(lamp.fetch(&on).await.unwrap(), Value::Bool(false));

        lamp.set(&on, Value::Bool(true)).await.unwrap();
        assert_eq!(lamp.fetch(&on).await.unwrap(), Value::Bool(true));

        lamp.toggle(&on).await.unwrap();
        assert_eq!(lamp.fetch(&on).await.unwrap(), Value::Bool(false));

        lamp.set(&level, Value::Number(0.25)).await.unwrap();
        lamp.increment(&level, 0.5).await.unwrap();
        assert_eq!(lamp.fetch(&level).await.unwrap(), Value::Number(0.75));

        assert_eq!(
            lamp.fetch(&filament::key::PropertyName::new(Section::State, "color", "v"))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::PropertyNotFound
        );
    }

    #[tokio::test]
    async fn listeners_fan_out_on_change() {
        let lamp = create_lamp("lamp-1");
        let lamp: Arc<dyn Endpoint> = lamp;
        let on = OnOffHandler::VALUE.name();

        let mut stream = lamp.observe(&on).await.unwrap();
        let mut section = lamp.observe_section(Section::State).await.unwrap();

        lamp.set(&on, Value::Bool(true)).await.unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.value, Value::Bool(true));
        assert_eq!(event.prev, Some(Value::Bool(false)));
        assert_eq!(section.recv().await.unwrap().value, Value::Bool(true));

        // An unchanged write fires no notification.
        lamp.set(&on, Value::Bool(true)).await.unwrap();
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn section_snapshot() {
        let lamp = create_lamp("lamp-1");
        let lamp: Arc<dyn Endpoint> = lamp;

        let state = lamp.fetch_section(Section::State).await.unwrap();
        assert_eq!(state.get("s/onoff/v"), Some(&Value::Bool(false)));
        assert_eq!(state.get("s/level/v"), Some(&Value::Number(0.0)));
        assert_eq!(state.len(), 2);

        let metadata = lamp.fetch_section(Section::Metadata).await.unwrap();
        assert_eq!(metadata.get("m/base/uid"), Some(&Value::Text("LAMP-1".into())));
    }

    #[tokio::test]
    async fn transition_interpolates() {
        let lamp = create_lamp("lamp-1");
        let lamp: Arc<dyn Endpoint> = lamp;
        let level = LevelHandler::VALUE.name();

        let mut stream = lamp.observe(&level).await.unwrap();

        lamp.apply(
            &level,
            Value::Number(1.0),
            Mutation::Set,
            &WriteOptions::new().duration(0.3),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(lamp.fetch(&level).await.unwrap(), Value::Number(1.0));

        // At least one intermediate step fired before the target.
        let mut seen = Vec::new();
        while let Some(event) = stream.try_recv() {
            seen.push(event.value.as_f64().unwrap());
        }
        assert!(seen.len() > 1, "expected intermediate steps, saw {seen:?}");
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn zero_duration_cancels_a_transition() {
        let lamp = create_lamp("lamp-1");
        let lamp: Arc<dyn Endpoint> = lamp;
        let level = LevelHandler::VALUE.name();

        lamp.apply(
            &level,
            Value::Number(1.0),
            Mutation::Set,
            &WriteOptions::new().duration(30.0),
        )
        .await
        .unwrap();

        lamp.apply(
            &level,
            Value::Number(0.5),
            Mutation::Set,
            &WriteOptions::new().duration(0.0),
        )
        .await
        .unwrap();

        assert_eq!(lamp.fetch(&level).await.unwrap(), Value::Number(0.5));

        // The cancelled transition never resumes.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(lamp.fetch(&level).await.unwrap(), Value::Number(0.5));
    }

    #[tokio::test]
    async fn children_and_parent() {
        let lamp = create_lamp("lamp-1");
        let scene = create_lamp("scene-1");
        let scene_dyn: Arc<dyn Endpoint> = Arc::clone(&scene) as Arc<dyn Endpoint>;

        let mut children = lamp.observe_children("scene").await.unwrap();

        lamp.add_child("scene", "evening", Arc::clone(&scene_dyn));
        scene.set_parent(&(Arc::clone(&lamp) as Arc<dyn Endpoint>));

        let event = children.recv().await.unwrap();
        assert!(event.added);
        assert_eq!(event.child, "evening");

        assert!(lamp.child("scene", "evening").is_some());
        assert_eq!(scene.parent().unwrap().endpoint_id(), "lamp-1");

        assert!(lamp.remove_child("scene", "evening"));
        assert!(!lamp.observe_children("scene").await.unwrap().try_recv().is_some());
        assert!(lamp.child("scene", "evening").is_none());
    }
}
