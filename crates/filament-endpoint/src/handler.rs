use std::sync::Mutex;

use filament::key::{Invoked, PropertyKey, PropertyName};
use filament::section::Section;
use filament::value::Value;

use crate::endpoint::MethodArgs;
use crate::error::{Error, ErrorKind, Result};

/// A trait implementation composed into a local endpoint.
///
/// Handlers supply the getters and setters for the properties of one
/// trait and are registered into an endpoint's dispatch table at
/// construction. They are synchronous and must not block: anything
/// slow belongs behind the endpoint's asynchronous surface.
pub trait TraitHandler: Send + Sync {
    /// Returns the trait identifier.
    fn trait_id(&self) -> &'static str;

    /// Returns every property this handler exposes.
    fn properties(&self) -> Vec<PropertyName>;

    /// Reads a property.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::PropertyNotFound`] when the property is
    /// not exposed by this trait.
    fn get(&self, name: &PropertyName) -> Result<Value>;

    /// Writes a property.
    ///
    /// Returns the new value when the write changed internal state;
    /// the endpoint owns change fan-out, so an unchanged write returns
    /// [`None`] and triggers no notification.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::PropertyNotFound`],
    /// [`ErrorKind::PropertyReadOnly`], or
    /// [`ErrorKind::InvalidPropertyValue`].
    fn set(&self, name: &PropertyName, value: &Value) -> Result<Option<Value>>;

    /// Invokes a named method.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::MethodNotFound`] unless the handler
    /// exposes the method.
    fn invoke(&self, method: &str, args: &MethodArgs) -> Result<Invoked> {
        let _ = args;
        Err(Error::new(
            ErrorKind::MethodNotFound,
            format!("`{method}` is not a method of `{}`", self.trait_id()),
        ))
    }
}

fn not_found(trait_id: &str, name: &PropertyName) -> Error {
    Error::new(
        ErrorKind::PropertyNotFound,
        format!("`{name}` is not a property of `{trait_id}`"),
    )
}

/// The on/off trait: a single boolean state property.
#[derive(Debug, Default)]
pub struct OnOffHandler {
    on: Mutex<bool>,
}

impl OnOffHandler {
    /// The on/off state property.
    pub const VALUE: PropertyKey<bool> = PropertyKey::new(Section::State, "onoff", "v");

    /// Creates an [`OnOffHandler`] starting in the given state.
    #[must_use]
    pub const fn new(on: bool) -> Self {
        Self { on: Mutex::new(on) }
    }
}

impl TraitHandler for OnOffHandler {
    fn trait_id(&self) -> &'static str {
        "onoff"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![Self::VALUE.name()]
    }

    fn get(&self, name: &PropertyName) -> Result<Value> {
        if *name != Self::VALUE.name() {
            return Err(not_found(self.trait_id(), name));
        }
        Ok(Value::Bool(*self.on.lock().expect("onoff poisoned")))
    }

    fn set(&self, name: &PropertyName, value: &Value) -> Result<Option<Value>> {
        if *name != Self::VALUE.name() {
            return Err(not_found(self.trait_id(), name));
        }

        let on = Self::VALUE.coerce(value)?;
        let mut current = self.on.lock().expect("onoff poisoned");
        if *current == on {
            return Ok(None);
        }
        *current = on;
        Ok(Some(Value::Bool(on)))
    }

    fn invoke(&self, method: &str, _args: &MethodArgs) -> Result<Invoked> {
        if method != "toggle" {
            return Err(Error::new(
                ErrorKind::MethodNotFound,
                format!("`{method}` is not a method of `onoff`"),
            ));
        }

        let mut current = self.on.lock().expect("onoff poisoned");
        *current = !*current;
        Ok(Invoked::Value(Value::Bool(*current)))
    }
}

/// The level trait: a single numeric state property clamped to
/// `0.0..=1.0`.
#[derive(Debug, Default)]
pub struct LevelHandler {
    level: Mutex<f64>,
}

impl LevelHandler {
    /// The level state property.
    pub const VALUE: PropertyKey<f64> = PropertyKey::new(Section::State, "level", "v");

    /// Creates a [`LevelHandler`] starting at the given level.
    #[must_use]
    pub const fn new(level: f64) -> Self {
        Self {
            level: Mutex::new(level),
        }
    }
}

impl TraitHandler for LevelHandler {
    fn trait_id(&self) -> &'static str {
        "level"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![Self::VALUE.name()]
    }

    fn get(&self, name: &PropertyName) -> Result<Value> {
        if *name != Self::VALUE.name() {
            return Err(not_found(self.trait_id(), name));
        }
        Ok(Value::Number(*self.level.lock().expect("level poisoned")))
    }

    fn set(&self, name: &PropertyName, value: &Value) -> Result<Option<Value>> {
        if *name != Self::VALUE.name() {
            return Err(not_found(self.trait_id(), name));
        }

        let level = Self::VALUE.coerce(value)?.clamp(0.0, 1.0);
        let mut current = self.level.lock().expect("level poisoned");
        if (*current - level).abs() < f64::EPSILON {
            return Ok(None);
        }
        *current = level;
        Ok(Some(Value::Number(level)))
    }
}

/// The base identity trait: an immutable unique id in the metadata
/// section and a writable human name in the configuration section.
#[derive(Debug)]
pub struct IdentityHandler {
    uid: String,
    name: Mutex<String>,
}

impl IdentityHandler {
    /// The unique-id metadata property. Read-only.
    pub const UID: PropertyKey<String> = PropertyKey::new(Section::Metadata, "base", "uid");

    /// The human-name configuration property.
    pub const NAME: PropertyKey<String> = PropertyKey::new(Section::Config, "base", "name");

    /// Creates an [`IdentityHandler`].
    #[must_use]
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: Mutex::new(name.into()),
        }
    }
}

impl TraitHandler for IdentityHandler {
    fn trait_id(&self) -> &'static str {
        "base"
    }

    fn properties(&self) -> Vec<PropertyName> {
        vec![Self::UID.name(), Self::NAME.name()]
    }

    fn get(&self, name: &PropertyName) -> Result<Value> {
        if *name == Self::UID.name() {
            Ok(Value::Text(self.uid.clone()))
        } else if *name == Self::NAME.name() {
            Ok(Value::Text(self.name.lock().expect("name poisoned").clone()))
        } else {
            Err(not_found(self.trait_id(), name))
        }
    }

    fn set(&self, name: &PropertyName, value: &Value) -> Result<Option<Value>> {
        if *name == Self::UID.name() {
            return Err(Error::new(
                ErrorKind::PropertyReadOnly,
                "The unique id never changes.",
            ));
        }
        if *name != Self::NAME.name() {
            return Err(not_found(self.trait_id(), name));
        }

        let text = Self::NAME.coerce(value)?;
        let mut current = self.name.lock().expect("name poisoned");
        if *current == text {
            return Ok(None);
        }
        *current = text.clone();
        Ok(Some(Value::Text(text)))
    }
}

#[cfg(test)]
mod tests {
    use filament::key::Invoked;
    use filament::value::Value;

    use crate::error::ErrorKind;

    use super::{IdentityHandler, LevelHandler, OnOffHandler, TraitHandler};

    #[test]
    fn onoff_set_reports_changes() {
        let handler = OnOffHandler::new(false);
        let name = OnOffHandler::VALUE.name();

        assert_eq!(
            handler.set(&name, &Value::Bool(true)).unwrap(),
            Some(Value::Bool(true))
        );
        // Same value, no change.
        assert_eq!(handler.set(&name, &Value::Bool(true)).unwrap(), None);
        assert_eq!(handler.get(&name).unwrap(), Value::Bool(true));
    }

    #[test]
    fn onoff_toggle_method() {
        let handler = OnOffHandler::new(false);

        assert_eq!(
            handler.invoke("toggle", &crate::endpoint::MethodArgs::new()).unwrap(),
            Invoked::Value(Value::Bool(true))
        );
        assert_eq!(
            handler
                .invoke("missing", &crate::endpoint::MethodArgs::new())
                .unwrap_err()
                .kind(),
            ErrorKind::MethodNotFound
        );
    }

    #[test]
    fn level_clamps() {
        let handler = LevelHandler::new(0.0);
        let name = LevelHandler::VALUE.name();

        assert_eq!(
            handler.set(&name, &Value::Number(2.0)).unwrap(),
            Some(Value::Number(1.0))
        );
        assert_eq!(
            handler.set(&name, &Value::Text("x".into())).unwrap_err().kind(),
            ErrorKind::InvalidPropertyValue
        );
    }

    #[test]
    fn identity_sections() {
        let handler = IdentityHandler::new("A1B2", "Desk lamp");

        assert_eq!(
            handler.get(&IdentityHandler::UID.name()).unwrap(),
            Value::Text("A1B2".into())
        );
        assert_eq!(
            handler
                .set(&IdentityHandler::UID.name(), &Value::Text("X".into()))
                .unwrap_err()
                .kind(),
            ErrorKind::PropertyReadOnly
        );
        assert_eq!(
            handler
                .set(&IdentityHandler::NAME.name(), &Value::Text("Shelf lamp".into()))
                .unwrap(),
            Some(Value::Text("Shelf lamp".into()))
        );
    }
}
