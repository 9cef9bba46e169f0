//! The transport and transaction abstraction.
//!
//! The object model consumes the network as a black box: a
//! [`Transport`] turns a [`Request`] into a [`Transaction`] that yields
//! at most one terminal [`Outcome`], supports cancellation, and in
//! observe mode delivers zero or more [`Notification`]s until
//! cancelled. Retransmission, ack timeouts, and security live behind
//! this seam.
//!
//! Payloads are encoded through the [`WireCodec`] seam, negotiated by
//! [`ContentFormat`]. The JSON text format is implemented in-tree; the
//! compact binary format belongs to an external collaborator.
//!
//! [`LoopbackTransport`] routes requests to endpoints hosted in a
//! [`Registry`] without touching the network: it is the adapter
//! reference implementation and the test double standing in for a real
//! transport. Method invocations that return a child reference ride as
//! a map with the reserved `@child` entry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use tokio::sync::{mpsc, oneshot};

use tokio_util::sync::CancellationToken;

use tracing::debug;

use filament::key::Invoked;
use filament::uri::{Mutation, ResourcePath, duration_from_query};
use filament::value::{Map, Value};

use crate::endpoint::{Endpoint, WriteOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::listener::ChildEvent;
use crate::registry::Registry;

// Reserved map entry carrying a child-endpoint reference.
const CHILD_ENTRY: &str = "@child";

/// The request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Replace a resource.
    Put,
    /// Mutate a resource or invoke a method.
    Post,
    /// Remove a resource.
    Delete,
    /// Subscribe to a resource.
    Observe,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Observe => "OBSERVE",
        }
        .fmt(f)
    }
}

/// The payload encoding, selected by content negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentFormat {
    /// The JSON-compatible text format.
    #[default]
    Json,
    /// The compact binary format, supplied by an external codec.
    Binary,
}

/// The wire codec seam.
pub trait WireCodec: Send + Sync {
    /// Encodes a value as payload bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Remote`] when the value cannot be
    /// represented.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Decodes payload bytes into a value.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Remote`] on malformed payloads.
    fn decode(&self, payload: &Bytes) -> Result<Value>;
}

/// The in-tree JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(&serde_json::Value::from(value.clone()))
            .map(Bytes::from)
            .map_err(|e| Error::new(ErrorKind::Remote, format!("Encode failure: {e}")))
    }

    fn decode(&self, payload: &Bytes) -> Result<Value> {
        serde_json::from_slice::<serde_json::Value>(payload)
            .map(Value::from)
            .map_err(|e| Error::new(ErrorKind::Remote, format!("Decode failure: {e}")))
    }
}

/// Returns the codec negotiated for a content format.
///
/// # Errors
///
/// Fails with [`ErrorKind::Remote`] when no codec is available for the
/// format: the compact binary codec is an external collaborator.
pub fn codec_for(format: ContentFormat) -> Result<&'static dyn WireCodec> {
    match format {
        ContentFormat::Json => Ok(&JsonCodec),
        ContentFormat::Binary => Err(Error::new(
            ErrorKind::Remote,
            "No binary codec has been negotiated.",
        )),
    }
}

/// A protocol request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The request method.
    pub method: Method,
    /// The resource path.
    pub path: String,
    /// Query-string modifiers.
    pub query: Vec<(String, String)>,
    /// The encoded payload, if any.
    pub payload: Option<Bytes>,
    /// The payload encoding.
    pub format: ContentFormat,
}

impl Request {
    /// Creates a [`Request`].
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            payload: None,
            format: ContentFormat::default(),
        }
    }

    /// Appends a query modifier.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    fn uri(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }

        let query: Vec<String> = self
            .query
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}={value}")
                }
            })
            .collect();
        format!("{}?{}", self.path, query.join("&"))
    }
}

/// A terminal response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    /// The encoded payload, if any.
    pub payload: Option<Bytes>,
    /// The payload encoding.
    pub format: ContentFormat,
}

impl Outcome {
    fn with_value(codec: &dyn WireCodec, value: &Value) -> Result<Self> {
        Ok(Self {
            payload: Some(codec.encode(value)?),
            format: ContentFormat::default(),
        })
    }
}

/// An observation notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The observation sequence number, wrapping.
    pub seq: u16,
    /// The encoded payload.
    pub payload: Bytes,
    /// The payload encoding.
    pub format: ContentFormat,
}

/// A pending protocol exchange.
///
/// Yields at most one terminal [`Outcome`]; in observe mode it also
/// delivers [`Notification`]s until cancelled. Cancelling the
/// transaction cancels the underlying exchange.
#[derive(Debug)]
pub struct Transaction {
    outcome: Option<oneshot::Receiver<Result<Outcome>>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    cancel: CancellationToken,
}

impl Transaction {
    /// Awaits the terminal outcome.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Cancelled`] when the transaction was
    /// cancelled, and with [`ErrorKind::Remote`] when the transport
    /// dropped the exchange without a response.
    pub async fn outcome(&mut self) -> Result<Outcome> {
        let Some(outcome) = self.outcome.take() else {
            return Err(Error::new(
                ErrorKind::Remote,
                "The outcome was already consumed.",
            ));
        };

        tokio::select! {
            () = self.cancel.cancelled() => {
                Err(Error::new(ErrorKind::Cancelled, "The transaction was cancelled."))
            }
            result = outcome => result.unwrap_or_else(|_| {
                Err(Error::new(
                    ErrorKind::Remote,
                    "The transport dropped the exchange without a response.",
                ))
            }),
        }
    }

    /// Takes the notification stream of an observe exchange.
    #[must_use]
    pub fn notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// Returns the cancellation token of this transaction.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the transaction.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// The transport-side half of a [`Transaction`].
#[derive(Debug)]
pub struct TransactionHandle {
    outcome: Option<oneshot::Sender<Result<Outcome>>>,
    notifications: mpsc::UnboundedSender<Notification>,
    cancel: CancellationToken,
}

impl TransactionHandle {
    /// Resolves the terminal outcome. Later calls are ignored.
    pub fn resolve(&mut self, result: Result<Outcome>) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(result);
        }
    }

    /// Delivers a notification.
    ///
    /// Returns whether the receiving side is still listening.
    pub fn notify(&self, notification: Notification) -> bool {
        self.notifications.send(notification).is_ok()
    }

    /// Returns the cancellation token of this transaction.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Creates a connected [`Transaction`]/[`TransactionHandle`] pair.
#[must_use]
pub fn transaction() -> (Transaction, TransactionHandle) {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    (
        Transaction {
            outcome: Some(outcome_rx),
            notifications: Some(notify_rx),
            cancel: cancel.clone(),
        },
        TransactionHandle {
            outcome: Some(outcome_tx),
            notifications: notify_tx,
            cancel,
        },
    )
}

/// A message transport.
pub trait Transport: Send + Sync {
    /// Issues a request, returning the pending exchange.
    fn send(&self, request: Request) -> Transaction;
}

// Wire shape of a method return.
pub(crate) fn invoked_to_value(invoked: Invoked) -> Value {
    match invoked {
        Invoked::Value(value) => value,
        Invoked::Child(path) => {
            let mut map = Map::new();
            map.insert(CHILD_ENTRY.into(), Value::Text(path));
            Value::Map(map)
        }
    }
}

pub(crate) fn value_to_invoked(value: Value) -> Invoked {
    if let Value::Map(entries) = &value
        && entries.len() == 1
        && let Some(Value::Text(path)) = entries.get(CHILD_ENTRY)
    {
        return Invoked::Child(path.clone());
    }
    Invoked::Value(value)
}

// Wire shape of a child-set change.
pub(crate) fn child_event_to_value(event: &ChildEvent) -> Value {
    let mut map = Map::new();
    map.insert("trait".into(), Value::Text(event.trait_id.clone()));
    map.insert("child".into(), Value::Text(event.child.clone()));
    map.insert("added".into(), Value::Bool(event.added));
    Value::Map(map)
}

pub(crate) fn value_to_child_event(value: &Value) -> Option<ChildEvent> {
    let Value::Map(entries) = value else {
        return None;
    };
    let Some(Value::Text(trait_id)) = entries.get("trait") else {
        return None;
    };
    let Some(Value::Text(child)) = entries.get("child") else {
        return None;
    };
    let Some(Value::Bool(added)) = entries.get("added") else {
        return None;
    };
    Some(ChildEvent {
        trait_id: trait_id.clone(),
        child: child.clone(),
        added: *added,
    })
}

/// An in-process transport routing requests to endpoints hosted in a
/// [`Registry`].
///
/// The adapter reference implementation and the test double standing in
/// for a real network transport: remote proxies built on it behave
/// exactly like proxies of genuinely remote endpoints, minus latency.
pub struct LoopbackTransport {
    registry: Weak<Registry>,
    // Live observe exchanges, visible to subscription-refcount tests.
    observations: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    /// Creates a [`LoopbackTransport`] routing into the given registry.
    #[must_use]
    pub fn new(registry: &Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::downgrade(registry),
            observations: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Returns the number of live observe exchanges.
    #[must_use]
    pub fn active_observations(&self) -> usize {
        self.observations.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, request: Request) -> Transaction {
        let (transaction, handle) = transaction();

        let registry = self.registry.clone();
        let observations = Arc::clone(&self.observations);
        tokio::spawn(serve(registry, request, handle, observations));

        transaction
    }
}

struct ObservationGuard(Arc<AtomicUsize>);

impl ObservationGuard {
    fn count(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ObservationGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_lines)]
async fn serve(
    registry: Weak<Registry>,
    request: Request,
    mut handle: TransactionHandle,
    observations: Arc<AtomicUsize>,
) {
    let Some(registry) = registry.upgrade() else {
        handle.resolve(Err(Error::new(ErrorKind::Remote, "The registry is gone.")));
        return;
    };

    let codec = match codec_for(request.format) {
        Ok(codec) => codec,
        Err(e) => {
            handle.resolve(Err(e));
            return;
        }
    };

    let path = match ResourcePath::parse(&request.uri()) {
        Ok(path) => path,
        Err(e) => {
            handle.resolve(Err(e.into()));
            return;
        }
    };

    debug!("Serving {} {}", request.method, request.path);

    let result = dispatch(&registry, codec, &request, path, &mut handle, &observations).await;
    if let Err(e) = result {
        handle.resolve(Err(e));
    }
}

// Inbound requests route to hosted endpoints only: a proxy answering
// for its own origin would loop.
fn find(registry: &Registry, endpoint: &str) -> Result<Arc<dyn Endpoint>> {
    registry.find_hosted(endpoint).ok_or_else(|| {
        Error::new(
            ErrorKind::UnknownResource,
            format!("`{endpoint}` is not hosted here"),
        )
    })
}

fn decoded_payload(codec: &dyn WireCodec, request: &Request) -> Result<Value> {
    match &request.payload {
        Some(payload) => codec.decode(payload),
        None => Ok(Value::Null),
    }
}

async fn dispatch(
    registry: &Registry,
    codec: &dyn WireCodec,
    request: &Request,
    path: ResourcePath,
    handle: &mut TransactionHandle,
    observations: &Arc<AtomicUsize>,
) -> Result<()> {
    match (path, request.method) {
        (ResourcePath::Property { endpoint, name }, Method::Get) => {
            let value = find(registry, &endpoint)?.fetch(&name).await?;
            handle.resolve(Outcome::with_value(codec, &value));
        }
        (ResourcePath::Property { endpoint, name }, Method::Put | Method::Post) => {
            let endpoint = find(registry, &endpoint)?;
            let value = decoded_payload(codec, request)?;
            let mutation = Mutation::from_query(&request.query);
            let mut options = WriteOptions::new();
            if let Some(duration) = duration_from_query(&request.query) {
                options = options.duration(duration);
            }
            endpoint.apply(&name, value, mutation, &options).await?;
            handle.resolve(Ok(Outcome::default()));
        }
        (ResourcePath::Property { endpoint, name }, Method::Observe) => {
            let endpoint = find(registry, &endpoint)?;
            let mut stream = endpoint.observe(&name).await?;
            let initial = endpoint.fetch(&name).await?;

            let _guard = ObservationGuard::count(observations);
            handle.resolve(Outcome::with_value(codec, &initial));

            let cancel = handle.cancel_token();
            let mut seq: u16 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = stream.recv() => {
                        let Some(event) = event else { break };
                        seq = seq.wrapping_add(1);
                        let payload = codec.encode(&event.value)?;
                        if !handle.notify(Notification {
                            seq,
                            payload,
                            format: request.format,
                        }) {
                            break;
                        }
                    }
                }
            }
        }
        (ResourcePath::Section { endpoint, section }, Method::Get) => {
            let map = find(registry, &endpoint)?.fetch_section(section).await?;
            handle.resolve(Outcome::with_value(codec, &Value::Map(map)));
        }
        (ResourcePath::Section { endpoint, section }, Method::Observe) => {
            let endpoint = find(registry, &endpoint)?;
            let mut stream = endpoint.observe_section(section).await?;
            let initial = endpoint.fetch_section(section).await?;

            let _guard = ObservationGuard::count(observations);
            handle.resolve(Outcome::with_value(codec, &Value::Map(initial)));

            let cancel = handle.cancel_token();
            let mut seq: u16 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = stream.recv() => {
                        let Some(event) = event else { break };
                        seq = seq.wrapping_add(1);
                        // A property-level patch: one flat entry.
                        let mut patch = Map::new();
                        patch.insert(event.name.flat(), event.value);
                        let payload = codec.encode(&Value::Map(patch))?;
                        if !handle.notify(Notification {
                            seq,
                            payload,
                            format: request.format,
                        }) {
                            break;
                        }
                    }
                }
            }
        }
        (ResourcePath::Method { endpoint, trait_id, method }, Method::Post | Method::Put) => {
            let endpoint = find(registry, &endpoint)?;
            let args = match decoded_payload(codec, request)? {
                Value::Map(entries) => entries,
                Value::Null => Map::new(),
                other => {
                    return Err(Error::new(
                        ErrorKind::InvalidMethodArguments,
                        format!("Method arguments must be a map, found `{}`", other.type_name()),
                    ));
                }
            };
            let invoked = endpoint.invoke(&trait_id, &method, args).await?;
            handle.resolve(Outcome::with_value(codec, &invoked_to_value(invoked)));
        }
        (ResourcePath::Children { endpoint, trait_id }, Method::Observe) => {
            let endpoint = find(registry, &endpoint)?;
            let mut stream = endpoint.observe_children(&trait_id).await?;

            let _guard = ObservationGuard::count(observations);
            handle.resolve(Ok(Outcome::default()));

            let cancel = handle.cancel_token();
            let mut seq: u16 = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = stream.recv() => {
                        let Some(event) = event else { break };
                        seq = seq.wrapping_add(1);
                        let payload = codec.encode(&child_event_to_value(&event))?;
                        if !handle.notify(Notification {
                            seq,
                            payload,
                            format: request.format,
                        }) {
                            break;
                        }
                    }
                }
            }
        }
        (ResourcePath::Child { endpoint, trait_id, child }, Method::Get) => {
            let endpoint = find(registry, &endpoint)?;
            if endpoint.child(&trait_id, &child).is_none() {
                return Err(Error::new(
                    ErrorKind::UnknownResource,
                    format!("`{trait_id}/{child}` is not a child of `{}`", endpoint.endpoint_id()),
                ));
            }
            handle.resolve(Ok(Outcome::default()));
        }
        (ResourcePath::Endpoint { endpoint }, Method::Get) => {
            // The endpoint root reads as its descriptive metadata.
            let map = find(registry, &endpoint)?
                .fetch_section(filament::section::Section::Metadata)
                .await?;
            handle.resolve(Outcome::with_value(codec, &Value::Map(map)));
        }
        (ResourcePath::Endpoint { endpoint }, Method::Delete) => {
            let deleted = find(registry, &endpoint)?.delete().await?;
            handle.resolve(Outcome::with_value(codec, &Value::Bool(deleted)));
        }
        (path, method) => {
            return Err(Error::new(
                ErrorKind::UnknownResource,
                format!("{method} is not supported on {path:?}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use filament::key::Invoked;
    use filament::value::{Map, Value};

    use crate::listener::ChildEvent;

    use super::{
        ContentFormat, JsonCodec, WireCodec, child_event_to_value, codec_for, invoked_to_value,
        value_to_child_event, value_to_invoked,
    };

    #[test]
    fn json_codec_round_trip() {
        let mut map = Map::new();
        map.insert("on".into(), Value::Bool(true));
        map.insert("level".into(), Value::Number(0.5));
        let value = Value::Map(map);

        let payload = JsonCodec.encode(&value).unwrap();
        assert_eq!(JsonCodec.decode(&payload).unwrap(), value);
    }

    #[test]
    fn binary_codec_is_external() {
        assert!(codec_for(ContentFormat::Json).is_ok());
        assert!(codec_for(ContentFormat::Binary).is_err());
    }

    #[test]
    fn child_reference_wire_shape() {
        let invoked = Invoked::Child("/lamp-1/f/scene/evening/".into());

        let wire = invoked_to_value(invoked.clone());
        assert_eq!(value_to_invoked(wire), invoked);

        // A plain map stays a plain value.
        let mut map = Map::new();
        map.insert("x".into(), Value::Number(1.0));
        assert_eq!(
            value_to_invoked(Value::Map(map.clone())),
            Invoked::Value(Value::Map(map))
        );
    }

    #[test]
    fn child_event_wire_shape() {
        let event = ChildEvent {
            trait_id: "scene".into(),
            child: "evening".into(),
            added: true,
        };

        assert_eq!(
            value_to_child_event(&child_event_to_value(&event)),
            Some(event)
        );
        assert_eq!(value_to_child_event(&Value::Null), None);
    }
}
