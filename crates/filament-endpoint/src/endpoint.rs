use std::sync::Arc;

use async_trait::async_trait;

use filament::key::{Invoked, MethodKey, PropertyKey, PropertyName};
use filament::section::Section;
use filament::uri::Mutation;
use filament::value::{Map, PropertyValue, Value};

use crate::error::{Error, ErrorKind, Result};
use crate::listener::{ChildStream, PropertyStream};

/// A whole section as a flat map from `section/trait/property` keys to
/// values.
pub type SectionMap = Map;

/// Named method arguments.
pub type MethodArgs = Map;

/// Options riding along a property write.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WriteOptions {
    /// Smooth-transition duration in seconds.
    ///
    /// Zero cancels an in-flight transition and jumps to the target.
    pub duration: Option<f64>,
}

impl WriteOptions {
    /// Creates empty [`WriteOptions`].
    #[must_use]
    pub const fn new() -> Self {
        Self { duration: None }
    }

    /// Sets the transition duration, in seconds.
    #[must_use]
    pub const fn duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }
}

/// The capability interface of a functional endpoint.
///
/// Implemented identically by the local runtime, the remote proxy, and
/// groups: callers cannot distinguish the variants except by latency
/// and failure modes. Every operation settles asynchronously and never
/// blocks the caller's thread.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Returns the endpoint identifier.
    fn endpoint_id(&self) -> &str;

    /// Fetches the authoritative value of a property.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::PropertyNotFound`] for unsupported
    /// properties, [`ErrorKind::PropertyReadOnly`] for write-only ones,
    /// and [`ErrorKind::Remote`] for transport failures.
    ///
    /// [`ErrorKind::PropertyNotFound`]: crate::error::ErrorKind::PropertyNotFound
    /// [`ErrorKind::PropertyReadOnly`]: crate::error::ErrorKind::PropertyReadOnly
    /// [`ErrorKind::Remote`]: crate::error::ErrorKind::Remote
    async fn fetch(&self, name: &PropertyName) -> Result<Value>;

    /// Returns the last-known value of a property without touching the
    /// network.
    fn cached(&self, name: &PropertyName) -> Option<Value>;

    /// Applies a mutation to a property.
    ///
    /// All mutations share one request shape; `mutation` is the
    /// discriminator and `options` may carry a transition-duration
    /// hint.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::fetch`], plus
    /// [`ErrorKind::InvalidPropertyValue`] when the value does not fit
    /// the property or mutation.
    ///
    /// [`ErrorKind::InvalidPropertyValue`]: crate::error::ErrorKind::InvalidPropertyValue
    async fn apply(
        &self,
        name: &PropertyName,
        value: Value,
        mutation: Mutation,
        options: &WriteOptions,
    ) -> Result<()>;

    /// Invokes a named method of a trait.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::MethodNotFound`] or
    /// [`ErrorKind::InvalidMethodArguments`].
    ///
    /// [`ErrorKind::MethodNotFound`]: crate::error::ErrorKind::MethodNotFound
    /// [`ErrorKind::InvalidMethodArguments`]: crate::error::ErrorKind::InvalidMethodArguments
    async fn invoke(&self, trait_id: &str, method: &str, args: MethodArgs) -> Result<Invoked>;

    /// Fetches an entire section as a flat map.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Remote`] for transport failures.
    ///
    /// [`ErrorKind::Remote`]: crate::error::ErrorKind::Remote
    async fn fetch_section(&self, section: Section) -> Result<SectionMap>;

    /// Registers a property-change listener.
    ///
    /// The first listener of a property sets up the underlying
    /// subscription; dropping the last one tears it down.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Remote`] when the subscription cannot be
    /// established.
    ///
    /// [`ErrorKind::Remote`]: crate::error::ErrorKind::Remote
    async fn observe(&self, name: &PropertyName) -> Result<PropertyStream>;

    /// Registers a section-change listener.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::observe`].
    async fn observe_section(&self, section: Section) -> Result<PropertyStream>;

    /// Registers a child-set listener for a trait.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::observe`].
    async fn observe_children(&self, trait_id: &str) -> Result<ChildStream>;

    /// Looks up a child endpoint.
    fn child(&self, trait_id: &str, child_id: &str) -> Option<Arc<dyn Endpoint>>;

    /// Returns the parent endpoint, when one is known.
    ///
    /// The back-reference is lookup-only; it never keeps the parent
    /// alive.
    fn parent(&self) -> Option<Arc<dyn Endpoint>>;

    /// Removes the endpoint.
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Remote`] for transport failures.
    ///
    /// [`ErrorKind::Remote`]: crate::error::ErrorKind::Remote
    async fn delete(&self) -> Result<bool>;
}

impl dyn Endpoint {
    /// Fetches a property and coerces it through its typed key.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::fetch`], plus
    /// [`ErrorKind::InvalidPropertyValue`] on coercion failures.
    ///
    /// [`ErrorKind::InvalidPropertyValue`]: crate::error::ErrorKind::InvalidPropertyValue
    pub async fn fetch_typed<T: PropertyValue>(&self, key: &PropertyKey<T>) -> Result<T> {
        let value = self.fetch(&key.name()).await?;
        key.coerce(&value).map_err(Error::from)
    }

    /// Sets a property through its typed key.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn set_typed<T: PropertyValue>(&self, key: &PropertyKey<T>, value: T) -> Result<()> {
        self.apply(
            &key.name(),
            value.inverse(),
            Mutation::Set,
            &WriteOptions::new(),
        )
        .await
    }

    /// Sets a property.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn set(&self, name: &PropertyName, value: Value) -> Result<()> {
        self.apply(name, value, Mutation::Set, &WriteOptions::new())
            .await
    }

    /// Adds a numeric delta to a property.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn increment(&self, name: &PropertyName, delta: f64) -> Result<()> {
        self.apply(
            name,
            Value::Number(delta),
            Mutation::Increment,
            &WriteOptions::new(),
        )
        .await
    }

    /// Flips a boolean property.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn toggle(&self, name: &PropertyName) -> Result<()> {
        self.apply(name, Value::Null, Mutation::Toggle, &WriteOptions::new())
            .await
    }

    /// Inserts an element into an array property.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn insert(&self, name: &PropertyName, value: Value) -> Result<()> {
        self.apply(name, value, Mutation::Insert, &WriteOptions::new())
            .await
    }

    /// Removes an element from an array property.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::apply`].
    pub async fn remove(&self, name: &PropertyName, value: Value) -> Result<()> {
        self.apply(name, value, Mutation::Remove, &WriteOptions::new())
            .await
    }

    /// Invokes a method and coerces the result through its typed key.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::invoke`], plus
    /// [`ErrorKind::InvalidMethodArguments`] on return coercion
    /// failures.
    ///
    /// [`ErrorKind::InvalidMethodArguments`]: crate::error::ErrorKind::InvalidMethodArguments
    pub async fn invoke_typed<T: PropertyValue>(
        &self,
        key: &MethodKey<T>,
        args: MethodArgs,
    ) -> Result<T> {
        let invoked = self.invoke(key.trait_id(), key.method(), args).await?;
        key.coerce(&invoked)
            .map_err(|e| Error::new(ErrorKind::InvalidMethodArguments, e.to_string()))
    }
}

/// Lowers a mutation onto a current value, producing the value to
/// store.
///
/// Shared by the local runtime and the group aggregate so both lower
/// increments, toggles, and array edits identically.
///
/// # Errors
///
/// Fails with [`ErrorKind::InvalidPropertyValue`] when the current
/// value or the operand does not fit the mutation.
pub(crate) fn lower_mutation(
    current: Option<&Value>,
    value: Value,
    mutation: Mutation,
) -> Result<Value> {
    match mutation {
        Mutation::Set => Ok(value),
        Mutation::Increment => {
            let delta = value.as_f64().ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidPropertyValue,
                    "An increment needs a numeric delta.",
                )
            })?;
            let base = current.and_then(Value::as_f64).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidPropertyValue,
                    "Only numeric properties can be incremented.",
                )
            })?;
            Ok(Value::Number(base + delta))
        }
        Mutation::Toggle => match current {
            Some(Value::Bool(b)) => Ok(Value::Bool(!*b)),
            Some(Value::Number(n)) if *n == 0.0 || *n == 1.0 => Ok(Value::Number(1.0 - *n)),
            _ => Err(Error::new(
                ErrorKind::InvalidPropertyValue,
                "Only boolean properties can be toggled.",
            )),
        },
        Mutation::Insert => match current {
            Some(Value::Array(values)) => {
                let mut values = values.clone();
                if !values.contains(&value) {
                    values.push(value);
                }
                Ok(Value::Array(values))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidPropertyValue,
                "Only array properties accept insertions.",
            )),
        },
        Mutation::Remove => match current {
            Some(Value::Array(values)) => {
                let mut values = values.clone();
                values.retain(|element| element != &value);
                Ok(Value::Array(values))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidPropertyValue,
                "Only array properties accept removals.",
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use filament::uri::Mutation;
    use filament::value::Value;

    use super::lower_mutation;

    #[test]
    fn lowers_increment_and_toggle() {
        assert_eq!(
            lower_mutation(Some(&Value::Number(2.0)), Value::Number(0.5), Mutation::Increment),
            Ok(Value::Number(2.5))
        );
        assert_eq!(
            lower_mutation(Some(&Value::Bool(true)), Value::Null, Mutation::Toggle),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            lower_mutation(Some(&Value::Number(0.0)), Value::Null, Mutation::Toggle),
            Ok(Value::Number(1.0))
        );

        assert!(
            lower_mutation(Some(&Value::Text("on".into())), Value::Null, Mutation::Toggle).is_err()
        );
        assert!(
            lower_mutation(Some(&Value::Number(1.0)), Value::Text("x".into()), Mutation::Increment)
                .is_err()
        );
    }

    #[test]
    fn lowers_array_edits() {
        let current = Value::Array(vec![Value::Number(1.0)]);

        assert_eq!(
            lower_mutation(Some(&current), Value::Number(2.0), Mutation::Insert),
            Ok(Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]))
        );
        // Inserting a present element is idempotent.
        assert_eq!(
            lower_mutation(Some(&current), Value::Number(1.0), Mutation::Insert),
            Ok(current.clone())
        );
        assert_eq!(
            lower_mutation(Some(&current), Value::Number(1.0), Mutation::Remove),
            Ok(Value::Array(Vec::new()))
        );
    }
}
