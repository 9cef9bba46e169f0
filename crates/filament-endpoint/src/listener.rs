use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use tokio::sync::mpsc;

use tokio_util::sync::CancellationToken;

use tracing::debug;

use filament::key::PropertyName;
use filament::section::Section;
use filament::value::Value;

/// A property change event.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEvent {
    /// The endpoint the property belongs to.
    pub endpoint: String,
    /// The property identity.
    pub name: PropertyName,
    /// The new value.
    pub value: Value,
    /// The previous value, when one was known.
    pub prev: Option<Value>,
}

/// A child-set change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    /// The trait the child belongs to.
    pub trait_id: String,
    /// The child identifier.
    pub child: String,
    /// Whether the child was added or removed.
    pub added: bool,
}

// What a listener watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Topic {
    // A single property, by flattened key.
    Property(String),
    // Every property of a section.
    Section(Section),
    // The child set of a trait.
    Children(String),
}

impl Topic {
    pub(crate) fn property(name: &PropertyName) -> Self {
        Self::Property(name.flat())
    }
}

/// A stream of events delivered to one registered listener.
///
/// Dropping the stream unregisters the listener; when it was the last
/// listener of its topic, the underlying subscription is torn down.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    _guard: ListenerGuard<E>,
}

/// A stream of [`PropertyEvent`]s.
pub type PropertyStream = EventStream<PropertyEvent>;

/// A stream of [`ChildEvent`]s.
pub type ChildStream = EventStream<ChildEvent>;

impl<E> EventStream<E> {
    /// Receives the next event.
    ///
    /// Returns [`None`] once the event source is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Receives the next event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

// Listener bookkeeping for one topic.
#[derive(Debug)]
struct TopicState<E> {
    senders: Vec<(u64, mpsc::UnboundedSender<E>)>,
    // Cancelled when the last listener goes away.
    upstream: Option<CancellationToken>,
    next_id: u64,
}

impl<E> TopicState<E> {
    const fn new() -> Self {
        Self {
            senders: Vec::new(),
            upstream: None,
            next_id: 0,
        }
    }
}

type Topics<E> = Mutex<HashMap<Topic, TopicState<E>>>;

#[derive(Debug)]
struct ListenerGuard<E> {
    topics: Arc<Topics<E>>,
    topic: Topic,
    id: u64,
}

impl<E> Drop for ListenerGuard<E> {
    fn drop(&mut self) {
        let Ok(mut topics) = self.topics.lock() else {
            return;
        };

        let Some(state) = topics.get_mut(&self.topic) else {
            return;
        };

        state.senders.retain(|(id, _)| *id != self.id);

        // Subscription lifetime equals listener-set non-emptiness.
        if state.senders.is_empty() {
            if let Some(upstream) = state.upstream.take() {
                debug!("Tearing down the subscription for {:?}", self.topic);
                upstream.cancel();
            }
            topics.remove(&self.topic);
        }
    }
}

/// Reference-counted listener registrations, keyed by topic.
///
/// The first listener of a topic reports `first = true` so the caller
/// can set up the underlying subscription; dropping the last listener
/// cancels the upstream token handed to [`ListenerTable::set_upstream`].
#[derive(Debug)]
pub(crate) struct ListenerTable<E> {
    topics: Arc<Topics<E>>,
}

impl<E: Clone> ListenerTable<E> {
    pub(crate) fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // Registers a listener, returning its stream and whether it is the
    // first for the topic.
    pub(crate) fn register(&self, topic: Topic) -> (EventStream<E>, bool) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.topics.lock().expect("listener table poisoned");
        let state = topics.entry(topic.clone()).or_insert_with(TopicState::new);

        let first = state.senders.is_empty();
        let id = state.next_id;
        state.next_id += 1;
        state.senders.push((id, tx));
        drop(topics);

        let stream = EventStream {
            rx,
            _guard: ListenerGuard {
                topics: Arc::clone(&self.topics),
                topic,
                id,
            },
        };

        (stream, first)
    }

    // Records the upstream subscription of a topic, cancelled when the
    // last listener goes away.
    pub(crate) fn set_upstream(&self, topic: &Topic, upstream: CancellationToken) {
        let mut topics = self.topics.lock().expect("listener table poisoned");
        match topics.get_mut(topic) {
            Some(state) => state.upstream = Some(upstream),
            // Every listener was dropped while the subscription was
            // being set up.
            None => upstream.cancel(),
        }
    }

    // Delivers an event to every listener of a topic.
    pub(crate) fn dispatch(&self, topic: &Topic, event: &E) {
        let topics = self.topics.lock().expect("listener table poisoned");
        if let Some(state) = topics.get(topic) {
            for (_, sender) in &state.senders {
                // A closed receiver is cleaned up by its guard.
                let _ = sender.send(event.clone());
            }
        }
    }

    pub(crate) fn has_listeners(&self, topic: &Topic) -> bool {
        self.topics
            .lock()
            .expect("listener table poisoned")
            .get(topic)
            .is_some_and(|state| !state.senders.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use filament::key::PropertyName;
    use filament::section::Section;
    use filament::value::Value;

    use super::{ListenerTable, PropertyEvent, Topic};

    fn event(value: f64) -> PropertyEvent {
        PropertyEvent {
            endpoint: "lamp-1".into(),
            name: PropertyName::new(Section::State, "level", "v"),
            value: Value::Number(value),
            prev: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_every_listener() {
        let table = ListenerTable::new();
        let topic = Topic::property(&PropertyName::new(Section::State, "level", "v"));

        let (mut first, is_first) = table.register(topic.clone());
        assert!(is_first);

        let (mut second, is_first) = table.register(topic.clone());
        assert!(!is_first);

        table.dispatch(&topic, &event(0.5));

        assert_eq!(first.recv().await, Some(event(0.5)));
        assert_eq!(second.recv().await, Some(event(0.5)));
    }

    #[tokio::test]
    async fn last_drop_cancels_upstream() {
        let table: ListenerTable<PropertyEvent> = ListenerTable::new();
        let topic = Topic::property(&PropertyName::new(Section::State, "level", "v"));
        let upstream = CancellationToken::new();

        let (first, _) = table.register(topic.clone());
        let (second, _) = table.register(topic.clone());
        table.set_upstream(&topic, upstream.clone());

        drop(first);
        assert!(!upstream.is_cancelled());
        assert!(table.has_listeners(&topic));

        drop(second);
        assert!(upstream.is_cancelled());
        assert!(!table.has_listeners(&topic));
    }

    #[tokio::test]
    async fn upstream_set_after_listeners_left() {
        let table: ListenerTable<PropertyEvent> = ListenerTable::new();
        let topic = Topic::Section(Section::State);
        let upstream = CancellationToken::new();

        let (stream, _) = table.register(topic.clone());
        drop(stream);

        table.set_upstream(&topic, upstream.clone());
        assert!(upstream.is_cancelled());
    }
}
