use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use filament::expr::{EvalEnv, Expression};
use filament::key::{PropertyKey, PropertyName};
use filament::section::Section;
use filament::value::Value;

use filament_endpoint::endpoint::Endpoint;
use filament_endpoint::error as endpoint_error;
use filament_endpoint::handler::TraitHandler;
use filament_endpoint::listener::PropertyEvent;
use filament_endpoint::registry::Registry;

use crate::address::PropertyAddress;

/// A pairing's persistent trap state.
///
/// Set when a propagation write fails; observable through the
/// pairing's own state section so monitors detect persistent failure
/// without polling logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trap {
    /// A pull propagation failed to write the source.
    SourceWriteFailed,
    /// A push propagation failed to write the destination.
    DestinationWriteFailed,
}

/// A pairing configuration.
///
/// Bridges two property locations, optionally transforming values per
/// direction. At least one of `push`/`pull` must be set for the
/// pairing to have any effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingConfig {
    /// The source property URI.
    pub source: PropertyAddress,
    /// The destination property URI.
    pub destination: PropertyAddress,
    /// Mirror source changes into the destination.
    #[serde(default)]
    pub push: bool,
    /// Mirror destination changes back into the source.
    #[serde(default)]
    pub pull: bool,
    /// The source-to-destination transform.
    #[serde(default)]
    pub forward: Option<Expression>,
    /// The destination-to-source transform.
    #[serde(default)]
    pub reverse: Option<Expression>,
}

/// An automation pairing: bidirectional property mirroring with
/// optional transforms.
///
/// Feedback-loop avoidance is two explicit guards, applied per
/// propagation:
///
/// 1. value-equality short-circuit: a transformed value equal to the
///    target's last-known value is not written;
/// 2. echo suppression: each direction records the value it writes,
///    and the next change event for that location carrying exactly
///    that value is consumed as the write echo.
///
/// The fire count therefore increments exactly once per
/// externally-initiated change.
pub struct Pairing {
    id: String,
    config: PairingConfig,
    count: AtomicU64,
    last_fire: Mutex<Option<DateTime<Utc>>>,
    trap: Mutex<Option<Trap>>,
    // Last value written to the destination (by push) and to the
    // source (by pull); the expected echoes.
    wrote_to_destination: Mutex<Option<Value>>,
    wrote_to_source: Mutex<Option<Value>>,
    cancel: CancellationToken,
}

impl Pairing {
    pub(crate) fn new(id: String, config: PairingConfig) -> Arc<Self> {
        if !config.push && !config.pull {
            warn!("The pairing `{id}` has neither push nor pull: it will never fire");
        }

        Arc::new(Self {
            id,
            config,
            count: AtomicU64::new(0),
            last_fire: Mutex::new(None),
            trap: Mutex::new(None),
            wrote_to_destination: Mutex::new(None),
            wrote_to_source: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the pairing identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Returns how many times this pairing has propagated a change.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Returns the last propagation time.
    #[must_use]
    pub fn last_fire(&self) -> Option<DateTime<Utc>> {
        *self.last_fire.lock().expect("last fire poisoned")
    }

    /// Returns the trap state.
    #[must_use]
    pub fn trap(&self) -> Option<Trap> {
        *self.trap.lock().expect("trap poisoned")
    }

    pub(crate) fn set_count(&self, count: u64) {
        self.count.store(count, Ordering::SeqCst);
    }

    pub(crate) fn start(self: &Arc<Self>, registry: &Arc<Registry>) {
        if self.config.push {
            tokio::spawn(run_direction(
                Arc::clone(self),
                Arc::clone(registry),
                Direction::Push,
            ));
        }
        if self.config.pull {
            tokio::spawn(run_direction(
                Arc::clone(self),
                Arc::clone(registry),
                Direction::Pull,
            ));
        }
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    async fn propagate(
        &self,
        direction: Direction,
        target: &Arc<dyn Endpoint>,
        target_name: &PropertyName,
        event: &PropertyEvent,
    ) {
        // Guard 2: consume our own write coming back around.
        {
            let mut expected_echo = match direction {
                // Push observes the source; writes to the source come
                // from the pull direction.
                Direction::Push => self.wrote_to_source.lock().expect("echo poisoned"),
                Direction::Pull => self.wrote_to_destination.lock().expect("echo poisoned"),
            };
            if expected_echo.as_ref() == Some(&event.value) {
                debug!("`{}`: consumed the write echo", self.id);
                *expected_echo = None;
                return;
            }
        }

        let transform = match direction {
            Direction::Push => &self.config.forward,
            Direction::Pull => &self.config.reverse,
        };

        let output = match transform {
            // A missing transform is the identity.
            None => Some(event.value.clone()),
            Some(expression) => {
                let mut env = EvalEnv::new()
                    .value(event.value.clone())
                    .count(self.fire_count());
                if let Some(prev) = &event.prev {
                    env = env.prev_value(prev.clone());
                }
                match expression.evaluate(&env) {
                    Ok(output) => output,
                    Err(e) => {
                        // A failing transform means "do not propagate
                        // this change", never a crash.
                        warn!("`{}`: the transform failed: {e}", self.id);
                        None
                    }
                }
            }
        };

        let Some(output) = output else {
            return;
        };

        // Guard 1: no write when the target already holds the value.
        if target.cached(target_name) == Some(output.clone()) {
            return;
        }

        {
            let mut wrote = match direction {
                Direction::Push => self.wrote_to_destination.lock().expect("echo poisoned"),
                Direction::Pull => self.wrote_to_source.lock().expect("echo poisoned"),
            };
            *wrote = Some(output.clone());
        }

        match target.set(target_name, output).await {
            Ok(()) => {
                self.count.fetch_add(1, Ordering::SeqCst);
                *self.last_fire.lock().expect("last fire poisoned") = Some(Utc::now());
                *self.trap.lock().expect("trap poisoned") = None;
            }
            Err(e) => {
                warn!("`{}`: the propagation write failed: {e}", self.id);
                *self.trap.lock().expect("trap poisoned") = Some(match direction {
                    Direction::Push => Trap::DestinationWriteFailed,
                    Direction::Pull => Trap::SourceWriteFailed,
                });
                let mut wrote = match direction {
                    Direction::Push => self.wrote_to_destination.lock().expect("echo poisoned"),
                    Direction::Pull => self.wrote_to_source.lock().expect("echo poisoned"),
                };
                *wrote = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

async fn run_direction(pairing: Arc<Pairing>, registry: Arc<Registry>, direction: Direction) {
    let (observed, target) = match direction {
        Direction::Push => (&pairing.config.source, &pairing.config.destination),
        Direction::Pull => (&pairing.config.destination, &pairing.config.source),
    };

    // Lazy resolution, cached for the subscription lifetime.
    let observed_endpoint = tokio::select! {
        () = pairing.cancel.cancelled() => return,
        resolved = observed.resolve(&registry) => match resolved {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("`{}`: {e}", pairing.id);
                return;
            }
        }
    };
    let target_endpoint = tokio::select! {
        () = pairing.cancel.cancelled() => return,
        resolved = target.resolve(&registry) => match resolved {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("`{}`: {e}", pairing.id);
                return;
            }
        }
    };

    let mut stream = match observed_endpoint.observe(&observed.name).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("`{}`: observing `{observed}` failed: {e}", pairing.id);
            return;
        }
    };

    debug!("`{}`: mirroring `{observed}` into `{target}`", pairing.id);

    loop {
        tokio::select! {
            () = pairing.cancel.cancelled() => return,
            event = stream.recv() => {
                let Some(event) = event else { return };
                pairing
                    .propagate(direction, &target_endpoint, &target.name, &event)
                    .await;
            }
        }
    }
}

/// The trait handler exposing a pairing through the property model.
///
/// Hosted by the automation manager so every pairing is itself an
/// addressable, observable endpoint: configuration in the config
/// section, execution state in the state section.
pub struct PairingHandler {
    pairing: Arc<Pairing>,
}

impl PairingHandler {
    /// The propagation count state property.
    pub const COUNT: PropertyKey<f64> = PropertyKey::new(Section::State, "pairing", "c");

    /// The last-fire-time state property, RFC 3339.
    pub const LAST: PropertyKey<String> = PropertyKey::new(Section::State, "pairing", "last");

    /// The trap state property.
    pub const TRAP: PropertyKey<String> = PropertyKey::new(Section::State, "pairing", "trap");

    pub(crate) fn new(pairing: Arc<Pairing>) -> Self {
        Self { pairing }
    }
}

impl TraitHandler for PairingHandler {
    fn trait_id(&self) -> &'static str {
        "pairing"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![
            Self::COUNT.name(),
            Self::LAST.name(),
            Self::TRAP.name(),
            PropertyName::new(Section::Config, "pairing", "source"),
            PropertyName::new(Section::Config, "pairing", "destination"),
            PropertyName::new(Section::Config, "pairing", "push"),
            PropertyName::new(Section::Config, "pairing", "pull"),
        ]
    }

    #[allow(clippy::cast_precision_loss)]
    fn get(&self, name: &PropertyName) -> endpoint_error::Result<Value> {
        if *name == Self::COUNT.name() {
            return Ok(Value::Number(self.pairing.fire_count() as f64));
        }
        if *name == Self::LAST.name() {
            return Ok(self
                .pairing
                .last_fire()
                .map_or(Value::Null, |last| Value::Text(last.to_rfc3339())));
        }
        if *name == Self::TRAP.name() {
            return Ok(match self.pairing.trap() {
                None => Value::Null,
                Some(Trap::SourceWriteFailed) => Value::Text("src write-fail".into()),
                Some(Trap::DestinationWriteFailed) => Value::Text("dst write-fail".into()),
            });
        }

        let config = self.pairing.config();
        match (name.section, name.property.as_ref()) {
            (Section::Config, "source") => Ok(Value::Text(config.source.uri())),
            (Section::Config, "destination") => Ok(Value::Text(config.destination.uri())),
            (Section::Config, "push") => Ok(Value::Bool(config.push)),
            (Section::Config, "pull") => Ok(Value::Bool(config.pull)),
            _ => Err(endpoint_error::Error::new(
                endpoint_error::ErrorKind::PropertyNotFound,
                format!("`{name}` is not a property of `pairing`"),
            )),
        }
    }

    fn set(&self, name: &PropertyName, _value: &Value) -> endpoint_error::Result<Option<Value>> {
        Err(endpoint_error::Error::new(
            endpoint_error::ErrorKind::PropertyReadOnly,
            format!("`{name}` is managed through the automation manager"),
        ))
    }
}
