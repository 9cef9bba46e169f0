use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use hashbrown::HashMap;

use tokio::sync::mpsc;

use tokio_util::sync::CancellationToken;

use tracing::warn;

use filament::key::{Invoked, PropertyName};
use filament::section::Section;
use filament::uri::{self, Mutation};
use filament::value::{Map, Value};

use crate::endpoint::{Endpoint, MethodArgs, SectionMap, WriteOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::listener::{ChildEvent, ChildStream, ListenerTable, PropertyEvent, PropertyStream, Topic};
use crate::transport::{
    Method, Notification, Outcome, Request, Transport, codec_for, value_to_child_event,
    value_to_invoked,
};

// Wrapping sequence comparison: returns whether `s1` is newer than
// `s2` under u16 wraparound.
fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

// One section's last-known contents plus per-key observation
// sequences.
#[derive(Debug, Default)]
struct SectionCache {
    values: Map,
    seqs: HashMap<String, u16>,
}

// Cache mutations, applied in arrival order by the worker task.
//
// Only observation notifications and write echoes fan out to
// listeners; fetch responses and initial observe snapshots update the
// cache silently, matching the local variant where a fetch never fires
// anything.
#[derive(Debug)]
enum Update {
    // A single-property patch: a fetch response, an observation
    // notification, or a local write echo.
    Patch {
        section: Section,
        flat: String,
        value: Value,
        seq: Option<u16>,
        notify: bool,
    },
    // A whole-section replace from a section fetch or an initial
    // section snapshot.
    Replace {
        section: Section,
        values: Map,
    },
}

const fn section_index(section: Section) -> usize {
    match section {
        Section::State => 0,
        Section::Config => 1,
        Section::Metadata => 2,
    }
}

/// A local mirror of a remotely-hosted functional endpoint.
///
/// Translates typed operations into protocol requests and parses
/// responses and observation notifications back into cache updates and
/// listener events. All cache and listener mutations are serialized
/// through one worker task: transport callbacks hand their payloads
/// off and never touch shared state directly.
pub struct RemoteEndpoint {
    id: String,
    transport: Arc<dyn Transport>,
    caches: [Mutex<SectionCache>; 3],
    listeners: ListenerTable<PropertyEvent>,
    child_listeners: ListenerTable<ChildEvent>,
    updates: mpsc::UnboundedSender<Update>,
    weak_self: Weak<Self>,
}

impl RemoteEndpoint {
    /// Creates a proxy for the endpoint with the given identifier,
    /// reached through the given transport.
    ///
    /// Must be called within a tokio runtime: the proxy spawns its
    /// cache worker on creation.
    #[must_use]
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let proxy = Arc::new_cyclic(|weak| Self {
            id: id.into(),
            transport,
            caches: [
                Mutex::new(SectionCache::default()),
                Mutex::new(SectionCache::default()),
                Mutex::new(SectionCache::default()),
            ],
            listeners: ListenerTable::new(),
            child_listeners: ListenerTable::new(),
            updates: tx,
            weak_self: weak.clone(),
        });

        tokio::spawn(Self::worker(Arc::downgrade(&proxy), rx));
        proxy
    }

    // The single execution context mutating caches and fanning out to
    // listeners.
    async fn worker(proxy: Weak<Self>, mut updates: mpsc::UnboundedReceiver<Update>) {
        while let Some(update) = updates.recv().await {
            let Some(proxy) = proxy.upgrade() else {
                break;
            };
            proxy.apply_update(update);
        }
    }

    fn apply_update(&self, update: Update) {
        match update {
            Update::Patch {
                section,
                flat,
                value,
                seq,
                notify,
            } => {
                let mut cache = self.caches[section_index(section)]
                    .lock()
                    .expect("cache poisoned");

                if let Some(seq) = seq {
                    if let Some(&last) = cache.seqs.get(&flat)
                        && !sequence_greater_than(seq, last)
                    {
                        warn!("Dropping a stale notification for `{flat}` (seq {seq} <= {last})");
                        return;
                    }
                    cache.seqs.insert(flat.clone(), seq);
                }

                let prev = cache.values.insert(flat.clone(), value.clone());
                drop(cache);

                if notify && prev.as_ref() != Some(&value) {
                    self.dispatch_property(&flat, value, prev);
                }
            }
            Update::Replace { section, values } => {
                let mut cache = self.caches[section_index(section)]
                    .lock()
                    .expect("cache poisoned");
                cache.values = values;
            }
        }
    }

    fn dispatch_property(&self, flat: &str, value: Value, prev: Option<Value>) {
        let Ok(name) = PropertyName::parse(flat) else {
            return;
        };

        let event = PropertyEvent {
            endpoint: self.id.clone(),
            name: name.clone(),
            value,
            prev,
        };
        self.listeners.dispatch(&Topic::property(&name), &event);
        self.listeners.dispatch(&Topic::Section(name.section), &event);
    }

    fn queue(&self, update: Update) {
        // The worker outlives every strong reference; a failed send
        // only happens during teardown.
        let _ = self.updates.send(update);
    }

    async fn exchange(&self, request: Request) -> Result<Outcome> {
        let mut transaction = self.transport.send(request);
        transaction.outcome().await
    }

    fn decode_required(outcome: &Outcome) -> Result<Value> {
        let codec = codec_for(outcome.format)?;
        let Some(payload) = &outcome.payload else {
            return Err(Error::new(ErrorKind::Remote, "Empty response payload."));
        };
        codec.decode(payload)
    }

    // Establishes the upstream observe exchange for one property and
    // spawns its notification pump.
    async fn setup_observe(&self, name: &PropertyName) -> Result<CancellationToken> {
        let mut transaction = self
            .transport
            .send(Request::new(Method::Observe, uri::property_path(&self.id, name)));

        let outcome = transaction.outcome().await?;
        let initial = Self::decode_required(&outcome)?;
        self.queue(Update::Patch {
            section: name.section,
            flat: name.flat(),
            value: initial,
            seq: None,
            notify: false,
        });

        let Some(mut notifications) = transaction.notifications() else {
            return Err(Error::new(
                ErrorKind::Remote,
                "The transport gave no notification stream.",
            ));
        };

        let token = transaction.cancel_token();
        let updates = self.updates.clone();
        let section = name.section;
        let flat = name.flat();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(value) = decode_notification(&notification) else {
                    continue;
                };
                let update = Update::Patch {
                    section,
                    flat: flat.clone(),
                    value,
                    seq: Some(notification.seq),
                    notify: true,
                };
                if updates.send(update).is_err() {
                    break;
                }
            }
        });

        Ok(token)
    }

    async fn setup_observe_section(&self, section: Section) -> Result<CancellationToken> {
        let mut transaction = self
            .transport
            .send(Request::new(Method::Observe, uri::section_path(&self.id, section)));

        let outcome = transaction.outcome().await?;
        if let Value::Map(values) = Self::decode_required(&outcome)? {
            self.queue(Update::Replace { section, values });
        }

        let Some(mut notifications) = transaction.notifications() else {
            return Err(Error::new(
                ErrorKind::Remote,
                "The transport gave no notification stream.",
            ));
        };

        let token = transaction.cancel_token();
        let updates = self.updates.clone();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(Value::Map(entries)) = decode_notification(&notification) else {
                    continue;
                };
                for (flat, value) in entries {
                    let update = Update::Patch {
                        section,
                        flat,
                        value,
                        seq: Some(notification.seq),
                        notify: true,
                    };
                    if updates.send(update).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(token)
    }

    async fn setup_observe_children(&self, trait_id: &str) -> Result<CancellationToken> {
        let mut transaction = self.transport.send(Request::new(
            Method::Observe,
            format!("/{}/f/{trait_id}", self.id),
        ));
        transaction.outcome().await?;

        let Some(mut notifications) = transaction.notifications() else {
            return Err(Error::new(
                ErrorKind::Remote,
                "The transport gave no notification stream.",
            ));
        };

        let token = transaction.cancel_token();
        let proxy = self.weak_self.clone();
        let trait_id = trait_id.to_string();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(event) = decode_notification(&notification)
                    .as_ref()
                    .and_then(value_to_child_event)
                else {
                    continue;
                };
                let Some(proxy) = proxy.upgrade() else {
                    break;
                };
                proxy
                    .child_listeners
                    .dispatch(&Topic::Children(trait_id.clone()), &event);
            }
        });

        Ok(token)
    }
}

fn decode_notification(notification: &Notification) -> Option<Value> {
    let codec = codec_for(notification.format).ok()?;
    match codec.decode(&notification.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Dropping an undecodable notification: {e}");
            None
        }
    }
}

#[async_trait]
impl Endpoint for RemoteEndpoint {
    fn endpoint_id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, name: &PropertyName) -> Result<Value> {
        // Authoritative reads always hit the network; `cached` is the
        // cache-only accessor.
        let outcome = self
            .exchange(Request::new(Method::Get, uri::property_path(&self.id, name)))
            .await?;
        let value = Self::decode_required(&outcome)?;

        self.queue(Update::Patch {
            section: name.section,
            flat: name.flat(),
            value: value.clone(),
            seq: None,
            notify: false,
        });
        Ok(value)
    }

    fn cached(&self, name: &PropertyName) -> Option<Value> {
        self.caches[section_index(name.section)]
            .lock()
            .expect("cache poisoned")
            .values
            .get(&name.flat())
            .cloned()
    }

    async fn apply(
        &self,
        name: &PropertyName,
        value: Value,
        mutation: Mutation,
        options: &WriteOptions,
    ) -> Result<()> {
        let method = if mutation == Mutation::Set {
            Method::Put
        } else {
            Method::Post
        };

        let mut request = Request::new(method, uri::property_path(&self.id, name));
        if let Some(marker) = mutation.query_key() {
            request = request.query(marker, "");
        }
        if let Some(duration) = options.duration {
            request = request.query("d", duration.to_string());
        }
        if mutation != Mutation::Toggle {
            let codec = codec_for(request.format)?;
            request = request.payload(codec.encode(&value)?);
        }

        self.exchange(request).await?;

        // The write echo: only a plain set has a known resulting
        // value. Modifier results arrive through observation.
        if mutation == Mutation::Set && options.duration.is_none() {
            self.queue(Update::Patch {
                section: name.section,
                flat: name.flat(),
                value,
                seq: None,
                notify: true,
            });
        }
        Ok(())
    }

    async fn invoke(&self, trait_id: &str, method: &str, args: MethodArgs) -> Result<Invoked> {
        let mut request = Request::new(Method::Post, format!("/{}/f/{trait_id}", self.id))
            .query(method, "");

        if !args.is_empty() {
            let codec = codec_for(request.format)?;
            request = request.payload(codec.encode(&Value::Map(args))?);
        }

        let outcome = self.exchange(request).await?;
        Ok(value_to_invoked(Self::decode_required(&outcome)?))
    }

    async fn fetch_section(&self, section: Section) -> Result<SectionMap> {
        let outcome = self
            .exchange(Request::new(Method::Get, uri::section_path(&self.id, section)))
            .await?;

        let Value::Map(values) = Self::decode_required(&outcome)? else {
            return Err(Error::new(
                ErrorKind::Remote,
                "A section read must return a map.",
            ));
        };

        self.queue(Update::Replace {
            section,
            values: values.clone(),
        });
        Ok(values)
    }

    async fn observe(&self, name: &PropertyName) -> Result<PropertyStream> {
        let topic = Topic::property(name);
        let (stream, first) = self.listeners.register(topic.clone());

        if first {
            let upstream = self.setup_observe(name).await?;
            self.listeners.set_upstream(&topic, upstream);
        }
        Ok(stream)
    }

    async fn observe_section(&self, section: Section) -> Result<PropertyStream> {
        let topic = Topic::Section(section);
        let (stream, first) = self.listeners.register(topic.clone());

        if first {
            let upstream = self.setup_observe_section(section).await?;
            self.listeners.set_upstream(&topic, upstream);
        }
        Ok(stream)
    }

    async fn observe_children(&self, trait_id: &str) -> Result<ChildStream> {
        let topic = Topic::Children(trait_id.to_string());
        let (stream, first) = self.child_listeners.register(topic.clone());

        if first {
            let upstream = self.setup_observe_children(trait_id).await?;
            self.child_listeners.set_upstream(&topic, upstream);
        }
        Ok(stream)
    }

    fn child(&self, _trait_id: &str, _child_id: &str) -> Option<Arc<dyn Endpoint>> {
        // Remote children resolve through their own endpoint ids.
        None
    }

    fn parent(&self) -> Option<Arc<dyn Endpoint>> {
        None
    }

    async fn delete(&self) -> Result<bool> {
        let outcome = self
            .exchange(Request::new(Method::Delete, format!("/{}/", self.id)))
            .await?;

        match Self::decode_required(&outcome) {
            Ok(Value::Bool(deleted)) => Ok(deleted),
            Ok(_) | Err(_) => Ok(true),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use filament::section::Section;
    use filament::value::Value;

    use crate::endpoint::Endpoint;
    use crate::error::ErrorKind;
    use crate::handler::{LevelHandler, OnOffHandler};
    use crate::local::tests::create_lamp;
    use crate::registry::Registry;
    use crate::transport::LoopbackTransport;

    use super::{RemoteEndpoint, Update, sequence_greater_than};

    pub(crate) async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never observed: {what}");
    }

    pub(crate) fn mirrored_lamp() -> (Arc<Registry>, Arc<LoopbackTransport>, Arc<RemoteEndpoint>) {
        let registry = Registry::new("home");
        registry.host(&create_lamp("lamp-1"));

        let transport = LoopbackTransport::new(&registry);
        let proxy = RemoteEndpoint::new("lamp-1", transport.clone());

        (registry, transport, proxy)
    }

    #[tokio::test]
    async fn fetch_is_authoritative_and_caches() {
        let (_registry, _transport, proxy) = mirrored_lamp();
        let on = OnOffHandler::VALUE.name();

        assert_eq!(proxy.cached(&on), None);
        assert_eq!(proxy.fetch(&on).await.unwrap(), Value::Bool(false));

        wait_until("fetch cached", || proxy.cached(&on) == Some(Value::Bool(false))).await;
    }

    #[tokio::test]
    async fn set_updates_the_origin_and_echoes_into_the_cache() {
        let (registry, _transport, proxy) = mirrored_lamp();
        let proxy: Arc<dyn Endpoint> = proxy;
        let on = OnOffHandler::VALUE.name();

        proxy.set(&on, Value::Bool(true)).await.unwrap();

        let origin = registry.find("lamp-1").unwrap();
        assert_eq!(origin.fetch(&on).await.unwrap(), Value::Bool(true));

        wait_until("write echo cached", || proxy.cached(&on) == Some(Value::Bool(true))).await;
    }

    #[tokio::test]
    async fn failed_write_leaves_the_cache_unmodified() {
        let (_registry, _transport, proxy) = mirrored_lamp();
        let proxy: Arc<dyn Endpoint> = proxy;
        let on = OnOffHandler::VALUE.name();

        proxy.fetch(&on).await.unwrap();
        wait_until("fetch cached", || proxy.cached(&on).is_some()).await;

        // A text value is not a valid on/off state.
        let error = proxy.set(&on, Value::Text("on".into())).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidPropertyValue);

        assert_eq!(proxy.cached(&on), Some(Value::Bool(false)));
    }

    #[tokio::test]
    async fn modifiers_reach_the_origin() {
        let (registry, _transport, proxy) = mirrored_lamp();
        let proxy: Arc<dyn Endpoint> = proxy;
        let on = OnOffHandler::VALUE.name();
        let level = LevelHandler::VALUE.name();

        proxy.toggle(&on).await.unwrap();
        proxy.increment(&level, 0.25).await.unwrap();

        let origin = registry.find("lamp-1").unwrap();
        assert_eq!(origin.fetch(&on).await.unwrap(), Value::Bool(true));
        assert_eq!(origin.fetch(&level).await.unwrap(), Value::Number(0.25));
    }

    #[tokio::test]
    async fn observation_mirrors_changes() {
        let (registry, _transport, proxy) = mirrored_lamp();
        let on = OnOffHandler::VALUE.name();

        let mut stream = proxy.observe(&on).await.unwrap();

        let origin = registry.find("lamp-1").unwrap();
        origin.set(&on, Value::Bool(true)).await.unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.value, Value::Bool(true));

        wait_until("notification cached", || {
            proxy.cached(&on) == Some(Value::Bool(true))
        })
        .await;
    }

    #[tokio::test]
    async fn subscription_refcounting() {
        let (registry, transport, proxy) = mirrored_lamp();
        let on = OnOffHandler::VALUE.name();

        let first = proxy.observe(&on).await.unwrap();
        let second = proxy.observe(&on).await.unwrap();

        // Two listeners, exactly one underlying subscription.
        assert_eq!(transport.active_observations(), 1);

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.active_observations(), 1);

        drop(second);
        wait_until("subscription torn down", || {
            transport.active_observations() == 0
        })
        .await;

        // New listeners re-establish the subscription and still see
        // changes.
        let mut reborn = proxy.observe(&on).await.unwrap();
        let origin = registry.find("lamp-1").unwrap();
        origin.set(&on, Value::Bool(true)).await.unwrap();
        assert_eq!(reborn.recv().await.unwrap().value, Value::Bool(true));
    }

    #[tokio::test]
    async fn stale_sequences_never_overwrite() {
        let (_registry, _transport, proxy) = mirrored_lamp();
        let on = OnOffHandler::VALUE.name();

        proxy.apply_update(Update::Patch {
            section: Section::State,
            flat: on.flat(),
            value: Value::Bool(true),
            seq: Some(10),
            notify: true,
        });
        // An out-of-order notification with an older sequence.
        proxy.apply_update(Update::Patch {
            section: Section::State,
            flat: on.flat(),
            value: Value::Bool(false),
            seq: Some(9),
            notify: true,
        });

        assert_eq!(proxy.cached(&on), Some(Value::Bool(true)));

        // A genuinely newer one.
        proxy.apply_update(Update::Patch {
            section: Section::State,
            flat: on.flat(),
            value: Value::Bool(false),
            seq: Some(11),
            notify: true,
        });
        assert_eq!(proxy.cached(&on), Some(Value::Bool(false)));
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(1, 1));
        assert!(sequence_greater_than(0, u16::MAX));
    }

    #[tokio::test]
    async fn section_observation_patches_the_cache() {
        let (registry, _transport, proxy) = mirrored_lamp();

        let mut stream = proxy.observe_section(Section::State).await.unwrap();

        let origin = registry.find("lamp-1").unwrap();
        origin
            .set(&LevelHandler::VALUE.name(), Value::Number(0.5))
            .await
            .unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.name, LevelHandler::VALUE.name());
        assert_eq!(event.value, Value::Number(0.5));
    }

    #[tokio::test]
    async fn contract_matches_the_local_variant() {
        let (registry, _transport, proxy) = mirrored_lamp();
        let proxy: Arc<dyn Endpoint> = proxy;
        let origin = registry.find("lamp-1").unwrap();
        let on = OnOffHandler::VALUE.name();
        let level = LevelHandler::VALUE.name();

        for endpoint in [&origin, &proxy] {
            endpoint.set(&on, Value::Bool(true)).await.unwrap();
            endpoint.toggle(&on).await.unwrap();
            endpoint.set(&level, Value::Number(0.25)).await.unwrap();
            endpoint.increment(&level, 0.25).await.unwrap();

            assert_eq!(endpoint.fetch(&on).await.unwrap(), Value::Bool(false));
            assert_eq!(endpoint.fetch(&level).await.unwrap(), Value::Number(0.5));

            let state = endpoint.fetch_section(Section::State).await.unwrap();
            assert_eq!(state.get("s/onoff/v"), Some(&Value::Bool(false)));
            assert_eq!(state.get("s/level/v"), Some(&Value::Number(0.5)));

            // Identical failure taxonomy on both variants.
            let missing = filament::key::PropertyName::new(Section::State, "color", "v");
            assert_eq!(
                endpoint.fetch(&missing).await.unwrap_err().kind(),
                ErrorKind::PropertyNotFound
            );
        }
    }
}
