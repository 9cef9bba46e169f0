use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use filament::expr::{EvalEnv, Expression};
use filament::key::{PropertyKey, PropertyName};
use filament::section::Section;
use filament::value::Value;

use filament_endpoint::error as endpoint_error;
use filament_endpoint::handler::TraitHandler;
use filament_endpoint::registry::Registry;

use crate::action::Action;
use crate::action::run_actions;
use crate::manager::AutomationManager;

/// A timer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// The schedule expression, yielding the next delay in seconds.
    ///
    /// Evaluated with the fire count and the clock in its environment,
    /// so schedules like `"c 0 == IF 0.001 ELSE 0.4 ENDIF"` fire fast
    /// once and slow after.
    pub schedule: Expression,
    /// The firing predicate; absent or empty means always fire.
    #[serde(default)]
    pub predicate: Option<Expression>,
    /// Recompute the schedule and rearm after firing.
    #[serde(default)]
    pub auto_reset: bool,
    /// Remove the timer from its owner after firing (when not
    /// auto-resetting).
    #[serde(default)]
    pub auto_delete: bool,
    /// Whether the timer starts enabled.
    #[serde(default)]
    pub enabled: bool,
    /// The ordered action list.
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// An automation timer: actions fired on a computed schedule, gated by
/// a predicate.
///
/// The state machine is `Idle -> Scheduled -> Evaluating -> Fired ->
/// (rearm | Idle | self-delete)`. Disabling at any point cancels the
/// pending wake and returns to `Idle` without side effects.
pub struct Timer {
    id: String,
    config: TimerConfig,
    enabled: AtomicBool,
    count: AtomicU64,
    last_fire: Mutex<Option<DateTime<Utc>>>,
    // Fresh per enable; cancelling it is `disable`.
    cancel: Mutex<CancellationToken>,
    manager: Weak<AutomationManager>,
}

impl Timer {
    pub(crate) fn new(id: String, config: TimerConfig, manager: Weak<AutomationManager>) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            enabled: AtomicBool::new(false),
            count: AtomicU64::new(0),
            last_fire: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            manager,
        })
    }

    /// Returns the timer identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TimerConfig {
        &self.config
    }

    /// Returns whether the timer is armed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns how many times this timer has fired.
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

    /// Arms the timer.
    ///
    /// Enabling an armed timer is a no-op.
    pub fn enable(self: &Arc<Self>, registry: &Arc<Registry>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel poisoned") = cancel.clone();

        tokio::spawn(run_timer(
            Arc::clone(self),
            Arc::clone(registry),
            cancel,
        ));
    }

    /// Disarms the timer, cancelling the pending wake without side
    /// effects.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            self.cancel.lock().expect("cancel poisoned").cancel();
        }
    }

    // The next delay, from the schedule expression.
    fn next_delay(&self) -> Option<Duration> {
        let env = EvalEnv::new().count(self.fire_count());
        match self.config.schedule.evaluate(&env) {
            Ok(Some(value)) => match value.as_f64() {
                Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                    Some(Duration::from_secs_f64(seconds))
                }
                _ => {
                    warn!("`{}`: the schedule yielded a non-delay: {value:?}", self.id);
                    None
                }
            },
            Ok(None) => {
                debug!("`{}`: the schedule yielded nothing, disarming", self.id);
                None
            }
            Err(e) => {
                warn!("`{}`: the schedule failed: {e}", self.id);
                None
            }
        }
    }

    fn predicate_holds(&self) -> bool {
        match &self.config.predicate {
            None => true,
            Some(predicate) if predicate.is_empty() => true,
            Some(predicate) => {
                let env = EvalEnv::new().count(self.fire_count());
                match predicate.evaluate(&env) {
                    Ok(Some(result)) => result.is_truthy(),
                    Ok(None) => false,
                    Err(e) => {
                        warn!("`{}`: the predicate failed: {e}", self.id);
                        false
                    }
                }
            }
        }
    }
}

async fn run_timer(timer: Arc<Timer>, registry: Arc<Registry>, cancel: CancellationToken) {
    loop {
        // Idle -> Scheduled.
        let Some(delay) = timer.next_delay() else {
            break;
        };
        debug!("`{}`: scheduled in {delay:?}", timer.id);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        // Scheduled -> Evaluating -> maybe Fired.
        if timer.predicate_holds() {
            run_actions(&timer.config.actions, &registry).await;
            timer.count.fetch_add(1, Ordering::SeqCst);
            *timer.last_fire.lock().expect("last fire poisoned") = Some(Utc::now());

            if !timer.config.auto_reset {
                if timer.config.auto_delete
                    && let Some(manager) = timer.manager.upgrade()
                {
                    manager.delete_timer(timer.id());
                }
                break;
            }
        }
        // A gated (predicate-false) pass reschedules.
    }

    timer.enabled.store(false, Ordering::SeqCst);
}

/// The trait handler exposing a timer through the property model.
pub struct TimerHandler {
    timer: Arc<Timer>,
}

impl TimerHandler {
    /// The fire count state property.
    pub const COUNT: PropertyKey<f64> = PropertyKey::new(Section::State, "timer", "c");

    /// The armed state property.
    pub const ENABLED: PropertyKey<bool> = PropertyKey::new(Section::State, "timer", "enabled");

    /// The last-fire-time state property, RFC 3339.
    pub const LAST: PropertyKey<String> = PropertyKey::new(Section::State, "timer", "last");

    pub(crate) fn new(timer: Arc<Timer>) -> Self {
        Self { timer }
    }
}

impl TraitHandler for TimerHandler {
    fn trait_id(&self) -> &'static str {
        "timer"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![
            Self::COUNT.name(),
            Self::ENABLED.name(),
            Self::LAST.name(),
            PropertyName::new(Section::Config, "timer", "schedule"),
        ]
    }

    #[allow(clippy::cast_precision_loss)]
    fn get(&self, name: &PropertyName) -> endpoint_error::Result<Value> {
        if *name == Self::COUNT.name() {
            return Ok(Value::Number(self.timer.fire_count() as f64));
        }
        if *name == Self::ENABLED.name() {
            return Ok(Value::Bool(self.timer.is_enabled()));
        }
        if *name == Self::LAST.name() {
            return Ok(self
                .timer
                .last_fire()
                .map_or(Value::Null, |last| Value::Text(last.to_rfc3339())));
        }
        if name.section == Section::Config && name.property == "schedule" {
            return Ok(Value::Text(self.timer.config().schedule.source().into()));
        }
        Err(endpoint_error::Error::new(
            endpoint_error::ErrorKind::PropertyNotFound,
            format!("`{name}` is not a property of `timer`"),
        ))
    }

    fn set(&self, name: &PropertyName, _value: &Value) -> endpoint_error::Result<Option<Value>> {
        Err(endpoint_error::Error::new(
            endpoint_error::ErrorKind::PropertyReadOnly,
            format!("`{name}` is managed through the automation manager"),
        ))
    }
}
