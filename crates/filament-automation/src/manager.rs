use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use tracing::{info, warn};

use filament::value::{Map, Value};

use filament_endpoint::local::LocalEndpoint;
use filament_endpoint::registry::Registry;

use crate::error::{Error, ErrorKind, Result};
use crate::pairing::{Pairing, PairingConfig, PairingHandler};
use crate::rule::{Rule, RuleConfig, RuleHandler};
use crate::timer::{Timer, TimerConfig, TimerHandler};

/// Owns the lifecycle of automation primitives.
///
/// Pairings, rules, and timers are created through the manager, keyed
/// by a generated or caller-supplied identifier, and each is hosted as
/// a local endpoint exposing its configuration and execution state
/// through the standard property model.
pub struct AutomationManager {
    registry: Arc<Registry>,
    pairings: Mutex<IndexMap<String, Arc<Pairing>>>,
    rules: Mutex<IndexMap<String, Arc<Rule>>>,
    timers: Mutex<IndexMap<String, Arc<Timer>>>,
    next_id: AtomicU64,
    weak_self: Weak<Self>,
}

impl AutomationManager {
    /// Creates an [`AutomationManager`] operating on the given
    /// registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            pairings: Mutex::new(IndexMap::new()),
            rules: Mutex::new(IndexMap::new()),
            timers: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    /// Returns the registry this manager operates on.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn allocate_id(&self, supplied: Option<&str>, prefix: &str) -> String {
        supplied.map_or_else(
            || {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{prefix}-{n}")
            },
            ToString::to_string,
        )
    }

    /// Creates and starts a pairing.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Configuration`] when the identifier is
    /// taken.
    pub fn create_pairing(
        &self,
        id: Option<&str>,
        config: PairingConfig,
    ) -> Result<Arc<Pairing>> {
        let id = self.allocate_id(id, "pairing");

        let mut pairings = self.pairings.lock().expect("pairings poisoned");
        if pairings.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("The pairing `{id}` already exists"),
            ));
        }

        info!("Creating the pairing `{id}`");
        let pairing = Pairing::new(id.clone(), config);

        let status = LocalEndpoint::builder(id.clone())
            .handler(PairingHandler::new(Arc::clone(&pairing)))
            .build();
        self.registry.host(&status);

        pairing.start(&self.registry);
        pairings.insert(id, Arc::clone(&pairing));
        Ok(pairing)
    }

    /// Creates and starts a rule.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Configuration`] when the identifier is
    /// taken.
    pub fn create_rule(&self, id: Option<&str>, config: RuleConfig) -> Result<Arc<Rule>> {
        let id = self.allocate_id(id, "rule");

        let mut rules = self.rules.lock().expect("rules poisoned");
        if rules.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("The rule `{id}` already exists"),
            ));
        }

        info!("Creating the rule `{id}`");
        let rule = Rule::new(id.clone(), config);

        let status = LocalEndpoint::builder(id.clone())
            .handler(RuleHandler::new(Arc::clone(&rule)))
            .build();
        self.registry.host(&status);

        rule.start(&self.registry);
        rules.insert(id, Arc::clone(&rule));
        Ok(rule)
    }

    /// Creates a timer, arming it when its configuration says so.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Configuration`] when the identifier is
    /// taken.
    pub fn create_timer(&self, id: Option<&str>, config: TimerConfig) -> Result<Arc<Timer>> {
        let id = self.allocate_id(id, "timer");

        let mut timers = self.timers.lock().expect("timers poisoned");
        if timers.contains_key(&id) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("The timer `{id}` already exists"),
            ));
        }

        info!("Creating the timer `{id}`");
        let enabled = config.enabled;
        let timer = Timer::new(id.clone(), config, self.weak_self.clone());

        let status = LocalEndpoint::builder(id.clone())
            .handler(TimerHandler::new(Arc::clone(&timer)))
            .build();
        self.registry.host(&status);

        // Inserted before arming: an auto-deleting timer may fire, and
        // delete itself, arbitrarily soon after `enable`.
        timers.insert(id, Arc::clone(&timer));
        drop(timers);

        if enabled {
            timer.enable(&self.registry);
        }
        Ok(timer)
    }

    /// Looks up a pairing.
    #[must_use]
    pub fn pairing(&self, id: &str) -> Option<Arc<Pairing>> {
        self.pairings.lock().expect("pairings poisoned").get(id).cloned()
    }

    /// Looks up a rule.
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.lock().expect("rules poisoned").get(id).cloned()
    }

    /// Looks up a timer.
    #[must_use]
    pub fn timer(&self, id: &str) -> Option<Arc<Timer>> {
        self.timers.lock().expect("timers poisoned").get(id).cloned()
    }

    /// Deletes a pairing, stopping its subscriptions.
    ///
    /// Returns whether it existed.
    pub fn delete_pairing(&self, id: &str) -> bool {
        let removed = self
            .pairings
            .lock()
            .expect("pairings poisoned")
            .shift_remove(id);
        if let Some(pairing) = removed {
            pairing.stop();
            self.registry.unhost(id);
            true
        } else {
            false
        }
    }

    /// Deletes a rule, stopping its subscriptions.
    ///
    /// Returns whether it existed.
    pub fn delete_rule(&self, id: &str) -> bool {
        let removed = self.rules.lock().expect("rules poisoned").shift_remove(id);
        if let Some(rule) = removed {
            rule.stop();
            self.registry.unhost(id);
            true
        } else {
            false
        }
    }

    /// Deletes a timer, cancelling any pending wake.
    ///
    /// Returns whether it existed.
    pub fn delete_timer(&self, id: &str) -> bool {
        let removed = self.timers.lock().expect("timers poisoned").shift_remove(id);
        if let Some(timer) = removed {
            timer.disable();
            self.registry.unhost(id);
            true
        } else {
            false
        }
    }

    /// Stops every primitive and unhosts their endpoints.
    ///
    /// For a graceful shutdown, call this before dropping the manager.
    pub fn shutdown(&self) {
        let pairings: Vec<String> = self
            .pairings
            .lock()
            .expect("pairings poisoned")
            .keys()
            .cloned()
            .collect();
        for id in pairings {
            self.delete_pairing(&id);
        }

        let rules: Vec<String> = self
            .rules
            .lock()
            .expect("rules poisoned")
            .keys()
            .cloned()
            .collect();
        for id in rules {
            self.delete_rule(&id);
        }

        let timers: Vec<String> = self
            .timers
            .lock()
            .expect("timers poisoned")
            .keys()
            .cloned()
            .collect();
        for id in timers {
            self.delete_timer(&id);
        }
    }

    /// Copies the persistable state of every primitive, nested by
    /// identifier.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn copy_state(&self) -> Value {
        fn entry(config: Value, count: u64) -> Map {
            let mut entry = Map::new();
            entry.insert("config".into(), config);
            entry.insert("count".into(), Value::Number(count as f64));
            entry
        }

        let mut pairings = Map::new();
        for (id, pairing) in &*self.pairings.lock().expect("pairings poisoned") {
            let config = Value::from(filament::serialize(pairing.config()));
            pairings.insert(id.clone(), Value::Map(entry(config, pairing.fire_count())));
        }

        let mut rules = Map::new();
        for (id, rule) in &*self.rules.lock().expect("rules poisoned") {
            let config = Value::from(filament::serialize(rule.config()));
            rules.insert(id.clone(), Value::Map(entry(config, rule.fire_count())));
        }

        let mut timers = Map::new();
        for (id, timer) in &*self.timers.lock().expect("timers poisoned") {
            // The armed state is runtime state: fold it back into the
            // persisted configuration.
            let mut config = timer.config().clone();
            config.enabled = timer.is_enabled();
            let config = Value::from(filament::serialize(&config));
            timers.insert(id.clone(), Value::Map(entry(config, timer.fire_count())));
        }

        let mut state = Map::new();
        state.insert("pairings".into(), Value::Map(pairings));
        state.insert("rules".into(), Value::Map(rules));
        state.insert("timers".into(), Value::Map(timers));
        Value::Map(state)
    }

    /// Restores primitives from previously copied state.
    ///
    /// # Errors
    ///
    /// Fails when the state does not have the expected shape; restored
    /// primitives created before the failure keep running.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn init_with_state(&self, state: &Value) -> Result<()> {
        let Value::Map(state) = state else {
            return Err(Error::new(
                ErrorKind::Configuration,
                "The automation state must be a map.",
            ));
        };

        fn parts(entry: &Value) -> Option<(serde_json::Value, u64)> {
            let Value::Map(entry) = entry else { return None };
            let config = serde_json::Value::from(entry.get("config")?.clone());
            let count = entry
                .get("count")
                .and_then(Value::as_f64)
                .unwrap_or_default() as u64;
            Some((config, count))
        }

        if let Some(Value::Map(pairings)) = state.get("pairings") {
            for (id, stored) in pairings {
                let Some((config, count)) = parts(stored) else {
                    warn!("Skipping a malformed pairing entry: `{id}`");
                    continue;
                };
                let config: PairingConfig = serde_json::from_value(config).map_err(|e| {
                    Error::new(ErrorKind::Configuration, format!("Pairing `{id}`: {e}"))
                })?;
                self.create_pairing(Some(id), config)?.set_count(count);
            }
        }

        if let Some(Value::Map(rules)) = state.get("rules") {
            for (id, stored) in rules {
                let Some((config, count)) = parts(stored) else {
                    warn!("Skipping a malformed rule entry: `{id}`");
                    continue;
                };
                let config: RuleConfig = serde_json::from_value(config).map_err(|e| {
                    Error::new(ErrorKind::Configuration, format!("Rule `{id}`: {e}"))
                })?;
                self.create_rule(Some(id), config)?.set_count(count);
            }
        }

        if let Some(Value::Map(timers)) = state.get("timers") {
            for (id, stored) in timers {
                let Some((config, count)) = parts(stored) else {
                    warn!("Skipping a malformed timer entry: `{id}`");
                    continue;
                };
                let config: TimerConfig = serde_json::from_value(config).map_err(|e| {
                    Error::new(ErrorKind::Configuration, format!("Timer `{id}`: {e}"))
                })?;
                self.create_timer(Some(id), config)?.set_count(count);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use filament::expr::Expression;
    use filament::value::Value;

    use filament_endpoint::endpoint::Endpoint;
    use filament_endpoint::handler::{LevelHandler, OnOffHandler};
    use filament_endpoint::local::LocalEndpoint;
    use filament_endpoint::registry::Registry;
    use filament_endpoint::remote::RemoteEndpoint;
    use filament_endpoint::transport::LoopbackTransport;

    use crate::action::{Action, SyncMode};
    use crate::address::PropertyAddress;
    use crate::pairing::{PairingConfig, Trap};
    use crate::rule::{Condition, MatchMode, RuleConfig};
    use crate::timer::TimerConfig;

    use super::AutomationManager;

    fn lamp(id: &str) -> Arc<LocalEndpoint> {
        LocalEndpoint::builder(id)
            .handler(OnOffHandler::new(false))
            .handler(LevelHandler::new(0.0))
            .build()
    }

    fn manager_with_lamps() -> Arc<AutomationManager> {
        let registry = Registry::new("home");
        registry.host(&lamp("lamp-a"));
        registry.host(&lamp("lamp-b"));
        AutomationManager::new(registry)
    }

    async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never observed: {what}");
    }

    fn level(endpoint: &str) -> PropertyAddress {
        PropertyAddress::parse(&format!("/{endpoint}/s/level/v")).unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pairing_mirrors_without_feedback() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let pairing = manager
            .create_pairing(
                Some("mirror"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("lamp-b"),
                    push: true,
                    pull: true,
                    forward: None,
                    reverse: None,
                },
            )
            .unwrap();
        settle().await;

        let source = registry.find("lamp-a").unwrap();
        let destination = registry.find("lamp-b").unwrap();
        let name = LevelHandler::VALUE.name();

        source.set(&name, Value::Number(0.4)).await.unwrap();

        wait_until("destination converged", || {
            destination.cached(&name) == Some(Value::Number(0.4))
        })
        .await;

        // Exactly one propagation per externally-initiated change: the
        // echo never re-triggers.
        settle().await;
        assert_eq!(pairing.fire_count(), 1);

        // The reverse direction mirrors too.
        destination.set(&name, Value::Number(0.9)).await.unwrap();
        wait_until("source converged", || {
            source.cached(&name) == Some(Value::Number(0.9))
        })
        .await;
        settle().await;
        assert_eq!(pairing.fire_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pairing_transforms_per_direction() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let pairing = manager
            .create_pairing(
                Some("scaled"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("lamp-b"),
                    push: true,
                    pull: true,
                    forward: Some(Expression::parse("2 *").unwrap()),
                    reverse: Some(Expression::parse("2 /").unwrap()),
                },
            )
            .unwrap();
        settle().await;

        let source = registry.find("lamp-a").unwrap();
        let destination = registry.find("lamp-b").unwrap();
        let name = LevelHandler::VALUE.name();

        source.set(&name, Value::Number(0.2)).await.unwrap();

        wait_until("destination scaled", || {
            destination.cached(&name) == Some(Value::Number(0.4))
        })
        .await;
        settle().await;
        assert_eq!(pairing.fire_count(), 1);
        assert_eq!(source.cached(&name), Some(Value::Number(0.2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_transform_result_skips_propagation() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let pairing = manager
            .create_pairing(
                Some("muted"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("lamp-b"),
                    push: true,
                    pull: false,
                    // An empty stack is the "no propagation" signal.
                    forward: Some(Expression::parse("DROP").unwrap()),
                    reverse: None,
                },
            )
            .unwrap();
        settle().await;

        let source = registry.find("lamp-a").unwrap();
        let destination = registry.find("lamp-b").unwrap();
        let name = LevelHandler::VALUE.name();

        source.set(&name, Value::Number(0.7)).await.unwrap();
        settle().await;

        assert_eq!(pairing.fire_count(), 0);
        assert_eq!(destination.fetch(&name).await.unwrap(), Value::Number(0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_write_sets_the_trap() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        // A proxy of an endpoint nobody hosts.
        let transport = LoopbackTransport::new(registry);
        registry.adopt(RemoteEndpoint::new("ghost", transport));

        let pairing = manager
            .create_pairing(
                Some("doomed"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("ghost"),
                    push: true,
                    pull: false,
                    forward: None,
                    reverse: None,
                },
            )
            .unwrap();
        settle().await;

        let source = manager.registry().find("lamp-a").unwrap();
        source
            .set(&LevelHandler::VALUE.name(), Value::Number(0.5))
            .await
            .unwrap();

        wait_until("trap set", || {
            pairing.trap() == Some(Trap::DestinationWriteFailed)
        })
        .await;
        assert_eq!(pairing.fire_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rule_fires_on_edges_only() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let rule = manager
            .create_rule(
                Some("bright"),
                RuleConfig {
                    conditions: vec![
                        Condition::new(level("lamp-a"))
                            .expression(Expression::parse("0.5 >=").unwrap()),
                    ],
                    match_mode: MatchMode::Any,
                    actions: vec![
                        Action::new("/lamp-b/s/onoff/v")
                            .body(true)
                            .sync_mode(SyncMode::SyncWait),
                    ],
                },
            )
            .unwrap();
        settle().await;

        let source = registry.find("lamp-a").unwrap();
        let target = registry.find("lamp-b").unwrap();
        let name = LevelHandler::VALUE.name();
        let on = OnOffHandler::VALUE.name();

        // False -> true: fires once.
        source.set(&name, Value::Number(0.6)).await.unwrap();
        wait_until("rule fired", || rule.fire_count() == 1).await;
        assert_eq!(target.fetch(&on).await.unwrap(), Value::Bool(true));

        // Still true: notifications do not re-fire.
        source.set(&name, Value::Number(0.7)).await.unwrap();
        source.set(&name, Value::Number(0.8)).await.unwrap();
        settle().await;
        assert_eq!(rule.fire_count(), 1);

        // Falling edge, then a fresh rising edge: fires again.
        source.set(&name, Value::Number(0.2)).await.unwrap();
        settle().await;
        source.set(&name, Value::Number(0.9)).await.unwrap();
        wait_until("rule fired again", || rule.fire_count() == 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn match_mode_all_needs_every_condition() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let rule = manager
            .create_rule(
                Some("both"),
                RuleConfig {
                    conditions: vec![
                        Condition::new(level("lamp-a"))
                            .expression(Expression::parse("0.5 >=").unwrap()),
                        Condition::new(
                            PropertyAddress::parse("/lamp-b/s/onoff/v").unwrap(),
                        ),
                    ],
                    match_mode: MatchMode::All,
                    actions: Vec::new(),
                },
            )
            .unwrap();
        settle().await;

        let a = registry.find("lamp-a").unwrap();
        let b = registry.find("lamp-b").unwrap();

        a.set(&LevelHandler::VALUE.name(), Value::Number(0.8))
            .await
            .unwrap();
        settle().await;
        // Only one of two conditions holds.
        assert_eq!(rule.fire_count(), 0);

        b.set(&OnOffHandler::VALUE.name(), Value::Bool(true))
            .await
            .unwrap();
        wait_until("rule fired", || rule.fire_count() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skipped_conditions_are_not_counted() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        let rule = manager
            .create_rule(
                Some("skippy"),
                RuleConfig {
                    conditions: vec![
                        Condition::new(level("lamp-a"))
                            .expression(Expression::parse("0.5 >=").unwrap()),
                        // Never satisfied, but skipped.
                        Condition::new(
                            PropertyAddress::parse("/lamp-b/s/onoff/v").unwrap(),
                        )
                        .skip(),
                    ],
                    match_mode: MatchMode::All,
                    actions: Vec::new(),
                },
            )
            .unwrap();
        settle().await;

        let a = registry.find("lamp-a").unwrap();
        a.set(&LevelHandler::VALUE.name(), Value::Number(0.8))
            .await
            .unwrap();

        wait_until("rule fired despite the skipped condition", || {
            rule.fire_count() == 1
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_schedule_expression_drives_delays() {
        let manager = manager_with_lamps();

        let timer = manager
            .create_timer(
                Some("blinker"),
                TimerConfig {
                    schedule: Expression::parse("c 0 == IF 0.001 ELSE 0.4 ENDIF").unwrap(),
                    predicate: None,
                    auto_reset: true,
                    auto_delete: false,
                    enabled: true,
                    actions: vec![
                        Action::new("/lamp-a/s/onoff/v?tog").sync_mode(SyncMode::SyncWait),
                    ],
                },
            )
            .unwrap();

        wait_until("three fires", || timer.fire_count() >= 3).await;

        timer.disable();
        let frozen = timer.fire_count();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.fire_count(), frozen);
        assert!(!timer.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_predicate_gates_firing() {
        let manager = manager_with_lamps();

        let timer = manager
            .create_timer(
                Some("gated"),
                TimerConfig {
                    schedule: Expression::parse("0.1").unwrap(),
                    // Never at or above the truth threshold.
                    predicate: Some(Expression::parse("0").unwrap()),
                    auto_reset: true,
                    auto_delete: false,
                    enabled: true,
                    actions: Vec::new(),
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.fire_count(), 0);
        // Still armed: a gated pass reschedules.
        assert!(timer.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_auto_delete_removes_itself() {
        let manager = manager_with_lamps();

        manager
            .create_timer(
                Some("once"),
                TimerConfig {
                    schedule: Expression::parse("0.001").unwrap(),
                    predicate: None,
                    auto_reset: false,
                    auto_delete: true,
                    enabled: true,
                    actions: Vec::new(),
                },
            )
            .unwrap();

        wait_until("timer deleted itself", || manager.timer("once").is_none()).await;
        assert!(manager.registry().find("once").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn primitives_are_endpoints() {
        let manager = manager_with_lamps();
        let registry = manager.registry();

        manager
            .create_pairing(
                Some("mirror"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("lamp-b"),
                    push: true,
                    pull: false,
                    forward: None,
                    reverse: None,
                },
            )
            .unwrap();

        // The pairing is addressable through the same property model.
        let endpoint = registry.find("mirror").unwrap();
        assert_eq!(
            endpoint
                .fetch(&filament::key::PropertyName::new(
                    filament::section::Section::Config,
                    "pairing",
                    "source",
                ))
                .await
                .unwrap(),
            Value::Text("/lamp-a/s/level/v".into())
        );
        assert_eq!(
            endpoint
                .fetch(&crate::pairing::PairingHandler::COUNT.name())
                .await
                .unwrap(),
            Value::Number(0.0)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_survives_a_restart() {
        let manager = manager_with_lamps();

        manager
            .create_pairing(
                Some("mirror"),
                PairingConfig {
                    source: level("lamp-a"),
                    destination: level("lamp-b"),
                    push: true,
                    pull: false,
                    forward: Some(Expression::parse("2 *").unwrap()),
                    reverse: None,
                },
            )
            .unwrap();
        manager.pairing("mirror").unwrap().set_count(3);

        manager
            .create_timer(
                Some("blinker"),
                TimerConfig {
                    schedule: Expression::parse("3600").unwrap(),
                    predicate: None,
                    auto_reset: true,
                    auto_delete: false,
                    enabled: true,
                    actions: Vec::new(),
                },
            )
            .unwrap();

        let state = manager.copy_state();
        manager.shutdown();

        // A fresh process over an identical registry.
        let restored = manager_with_lamps();
        restored.init_with_state(&state).unwrap();

        let pairing = restored.pairing("mirror").unwrap();
        assert_eq!(pairing.fire_count(), 3);
        assert_eq!(
            pairing.config().forward.as_ref().map(|expr| expr.source()),
            Some("2 *")
        );

        // The timer came back armed.
        assert!(restored.timer("blinker").unwrap().is_enabled());
    }
}
