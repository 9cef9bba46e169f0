use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use filament::expr::{EvalEnv, Expression};
use filament::key::{PropertyKey, PropertyName};
use filament::section::Section;
use filament::value::Value;

use filament_endpoint::error as endpoint_error;
use filament_endpoint::handler::TraitHandler;
use filament_endpoint::listener::PropertyEvent;
use filament_endpoint::registry::Registry;

use crate::action::{Action, run_actions};
use crate::address::PropertyAddress;

/// How a rule combines its condition results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMode {
    /// Every non-skipped condition must hold.
    #[default]
    All,
    /// At least one non-skipped condition must hold.
    Any,
}

/// One condition of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The observed property URI.
    pub uri: PropertyAddress,
    /// The boolean expression over the property value; absent means
    /// the value's own truth reading.
    #[serde(default)]
    pub expression: Option<Expression>,
    /// Whether the condition is skipped: neither subscribed nor
    /// counted.
    #[serde(default)]
    pub skip: bool,
}

impl Condition {
    /// Creates a [`Condition`] over the given property URI.
    #[must_use]
    pub fn new(uri: PropertyAddress) -> Self {
        Self {
            uri,
            expression: None,
            skip: false,
        }
    }

    /// Sets the condition expression.
    #[must_use]
    pub fn expression(mut self, expression: Expression) -> Self {
        self.expression = Some(expression);
        self
    }

    /// Marks the condition skipped.
    #[must_use]
    pub const fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    // A condition result at or above 0.5 holds; evaluation failures
    // read as "not satisfied".
    fn holds(&self, value: Option<&Value>, prev: Option<&Value>, count: u64) -> bool {
        let Some(value) = value else {
            return false;
        };

        match &self.expression {
            None => value.is_truthy(),
            Some(expression) => {
                let mut env = EvalEnv::new().value(value.clone()).count(count);
                if let Some(prev) = prev {
                    env = env.prev_value(prev.clone());
                }
                match expression.evaluate(&env) {
                    Ok(Some(result)) => result.is_truthy(),
                    Ok(None) => false,
                    Err(e) => {
                        warn!("The condition on `{}` failed: {e}", self.uri);
                        false
                    }
                }
            }
        }
    }
}

/// A rule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// The condition set.
    pub conditions: Vec<Condition>,
    /// How condition results combine.
    #[serde(default)]
    pub match_mode: MatchMode,
    /// The ordered action list fired on a false-to-true transition.
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// An automation rule: a condition set firing an action list.
///
/// Every non-skipped condition is independently subscribed; any
/// subscribed change re-evaluates the whole set against the latest
/// known values. Firing is edge-triggered: the action list runs only
/// when the combined result transitions from false to true, never once
/// per notification while it stays true.
pub struct Rule {
    id: String,
    config: RuleConfig,
    count: AtomicU64,
    last_fire: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl Rule {
    pub(crate) fn new(id: String, config: RuleConfig) -> Arc<Self> {
        if config.conditions.iter().all(|condition| condition.skip) {
            warn!("The rule `{id}` has no active conditions: it will never fire");
        }

        Arc::new(Self {
            id,
            config,
            count: AtomicU64::new(0),
            last_fire: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the rule identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Returns how many times this rule has fired.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Returns the last fire time.
    #[must_use]
    pub fn last_fire(&self) -> Option<DateTime<Utc>> {
        *self.last_fire.lock().expect("last fire poisoned")
    }

    pub(crate) fn set_count(&self, count: u64) {
        self.count.store(count, Ordering::SeqCst);
    }

    pub(crate) fn start(self: &Arc<Self>, registry: &Arc<Registry>) {
        tokio::spawn(run_rule(Arc::clone(self), Arc::clone(registry)));
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    fn combined(&self, latest: &[Option<Value>], prev: &[Option<Value>]) -> bool {
        let count = self.fire_count();
        let mut results = self
            .config
            .conditions
            .iter()
            .enumerate()
            .filter(|(_, condition)| !condition.skip)
            .map(|(i, condition)| condition.holds(latest[i].as_ref(), prev[i].as_ref(), count));

        match self.config.match_mode {
            MatchMode::All => results.all(|holds| holds),
            MatchMode::Any => results.any(|holds| holds),
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_rule(rule: Arc<Rule>, registry: Arc<Registry>) {
    let conditions = &rule.config.conditions;
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, PropertyEvent)>();

    let mut latest: Vec<Option<Value>> = vec![None; conditions.len()];
    let mut prev: Vec<Option<Value>> = vec![None; conditions.len()];

    for (index, condition) in conditions.iter().enumerate() {
        if condition.skip {
            continue;
        }

        let endpoint = tokio::select! {
            () = rule.cancel.cancelled() => return,
            resolved = condition.uri.resolve(&registry) => match resolved {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("`{}`: {e}", rule.id);
                    continue;
                }
            }
        };

        // Seed the cache before subscribing fires anything.
        latest[index] = match endpoint.cached(&condition.uri.name) {
            Some(value) => Some(value),
            None => endpoint.fetch(&condition.uri.name).await.ok(),
        };

        let stream = match endpoint.observe(&condition.uri.name).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("`{}`: observing `{}` failed: {e}", rule.id, condition.uri);
                continue;
            }
        };

        let tx = tx.clone();
        let cancel = rule.cancel.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    event = stream.recv() => {
                        let Some(event) = event else { return };
                        if tx.send((index, event)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
    drop(tx);

    // Level at startup is the baseline: only a fresh edge fires.
    let mut was_satisfied = rule.combined(&latest, &prev);
    debug!("`{}`: armed, initially {}", rule.id, was_satisfied);

    loop {
        let (index, event) = tokio::select! {
            () = rule.cancel.cancelled() => return,
            received = rx.recv() => {
                let Some(received) = received else { return };
                received
            }
        };

        prev[index] = latest[index].take();
        latest[index] = Some(event.value);

        let satisfied = rule.combined(&latest, &prev);
        if satisfied && !was_satisfied {
            debug!("`{}`: firing", rule.id);
            run_actions(&rule.config.actions, &registry).await;
            rule.count.fetch_add(1, Ordering::SeqCst);
            *rule.last_fire.lock().expect("last fire poisoned") = Some(Utc::now());
        }
        was_satisfied = satisfied;
    }
}

/// The trait handler exposing a rule through the property model.
pub struct RuleHandler {
    rule: Arc<Rule>,
}

impl RuleHandler {
    /// The fire count state property.
    pub const COUNT: PropertyKey<f64> = PropertyKey::new(Section::State, "rule", "c");

    /// The last-fire-time state property, RFC 3339.
    pub const LAST: PropertyKey<String> = PropertyKey::new(Section::State, "rule", "last");

    pub(crate) fn new(rule: Arc<Rule>) -> Self {
        Self { rule }
    }
}

impl TraitHandler for RuleHandler {
    fn trait_id(&self) -> &'static str {
        "rule"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![
            Self::COUNT.name(),
            Self::LAST.name(),
            PropertyName::new(Section::Config, "rule", "conditions"),
        ]
    }

    #[allow(clippy::cast_precision_loss)]
    fn get(&self, name: &PropertyName) -> endpoint_error::Result<Value> {
        if *name == Self::COUNT.name() {
            return Ok(Value::Number(self.rule.fire_count() as f64));
        }
        if *name == Self::LAST.name() {
            return Ok(self
                .rule
                .last_fire()
                .map_or(Value::Null, |last| Value::Text(last.to_rfc3339())));
        }
        if name.section == Section::Config && name.property == "conditions" {
            let uris = self
                .rule
                .config()
                .conditions
                .iter()
                .map(|condition| Value::Text(condition.uri.uri()))
                .collect();
            return Ok(Value::Array(uris));
        }
        Err(endpoint_error::Error::new(
            endpoint_error::ErrorKind::PropertyNotFound,
            format!("`{name}` is not a property of `rule`"),
        ))
    }

    fn set(&self, name: &PropertyName, _value: &Value) -> endpoint_error::Result<Option<Value>> {
        Err(endpoint_error::Error::new(
            endpoint_error::ErrorKind::PropertyReadOnly,
            format!("`{name}` is managed through the automation manager"),
        ))
    }
}
