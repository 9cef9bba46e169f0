use std::borrow::Cow;
use std::marker::PhantomData;

use serde::Serialize;

use crate::error::{AddressError, CoercionError};
use crate::section::Section;
use crate::value::{PropertyValue, Value};

/// The identity of a property: its section, trait, and property
/// identifiers.
///
/// This is the type-erased form shared by caches, events, and wire
/// addressing. The flattened rendering is `section/trait/property`,
/// e.g. `s/onoff/v`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyName {
    /// The section the property lives in.
    pub section: Section,
    /// The trait identifier.
    pub trait_id: Cow<'static, str>,
    /// The property identifier.
    pub property: Cow<'static, str>,
}

impl PropertyName {
    /// Creates a [`PropertyName`].
    #[inline]
    pub fn new(
        section: Section,
        trait_id: impl Into<Cow<'static, str>>,
        property: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            section,
            trait_id: trait_id.into(),
            property: property.into(),
        }
    }

    /// Returns the flattened `section/trait/property` key string.
    #[must_use]
    pub fn flat(&self) -> String {
        format!(
            "{}/{}/{}",
            self.section.component(),
            self.trait_id,
            self.property
        )
    }

    /// Parses a flattened `section/trait/property` key string.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] when the string does not carry
    /// exactly three non-empty components.
    pub fn parse(flat: &str) -> Result<Self, AddressError> {
        let mut components = flat.split('/');

        let (Some(section), Some(trait_id), Some(property), None) = (
            components.next(),
            components.next(),
            components.next(),
            components.next(),
        ) else {
            return Err(AddressError::new(format!(
                "`{flat}` is not a `section/trait/property` key"
            )));
        };

        if trait_id.is_empty() || property.is_empty() {
            return Err(AddressError::new(format!(
                "`{flat}` carries an empty component"
            )));
        }

        Ok(Self {
            section: Section::from_component(section)?,
            trait_id: trait_id.to_string().into(),
            property: property.to_string().into(),
        })
    }
}

impl std::fmt::Display for PropertyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.section.component(),
            self.trait_id,
            self.property
        )
    }
}

impl Serialize for PropertyName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.flat())
    }
}

#[cfg(feature = "deserialize")]
impl<'de> serde::Deserialize<'de> for PropertyName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let flat = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&flat).map_err(serde::de::Error::custom)
    }
}

/// A typed, `'static` property key.
///
/// Defined once at trait-definition time and never mutated. Two keys
/// are equal when their `(section, trait, property)` triples are equal,
/// regardless of allocation site; the declared value type does not take
/// part in identity.
#[derive(Debug)]
pub struct PropertyKey<T: PropertyValue> {
    section: Section,
    trait_id: &'static str,
    property: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: PropertyValue> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: PropertyValue> Copy for PropertyKey<T> {}

impl<T: PropertyValue> PartialEq for PropertyKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.section == other.section
            && self.trait_id == other.trait_id
            && self.property == other.property
    }
}

impl<T: PropertyValue> Eq for PropertyKey<T> {}

impl<T: PropertyValue> std::hash::Hash for PropertyKey<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.section.hash(state);
        self.trait_id.hash(state);
        self.property.hash(state);
    }
}

impl<T: PropertyValue> PropertyKey<T> {
    /// Creates a [`PropertyKey`].
    #[must_use]
    pub const fn new(section: Section, trait_id: &'static str, property: &'static str) -> Self {
        Self {
            section,
            trait_id,
            property,
            _value: PhantomData,
        }
    }

    /// Returns the section this key belongs to.
    #[must_use]
    pub const fn section(&self) -> Section {
        self.section
    }

    /// Returns the trait identifier.
    #[must_use]
    pub const fn trait_id(&self) -> &'static str {
        self.trait_id
    }

    /// Returns the property identifier.
    #[must_use]
    pub const fn property(&self) -> &'static str {
        self.property
    }

    /// Checks whether this key belongs to the given section.
    #[must_use]
    pub fn is_in_section(&self, section: Section) -> bool {
        self.section == section
    }

    /// Returns the type-erased [`PropertyName`] of this key.
    #[must_use]
    pub fn name(&self) -> PropertyName {
        PropertyName {
            section: self.section,
            trait_id: Cow::Borrowed(self.trait_id),
            property: Cow::Borrowed(self.property),
        }
    }

    /// Coerces a wire value into this key's declared type.
    ///
    /// # Errors
    ///
    /// Returns a [`CoercionError`] when the wire value does not
    /// represent the declared type.
    pub fn coerce(&self, value: &Value) -> Result<T, CoercionError> {
        T::coerce(value)
    }

    /// Converts a typed value back into its wire representation.
    #[must_use]
    pub fn inverse(&self, value: T) -> Value {
        value.inverse()
    }
}

/// What a method invocation returned.
///
/// Methods may return a plain value or a reference to a created or
/// updated child endpoint, so the return is a sum type rather than a
/// bare value.
#[derive(Debug, Clone, PartialEq)]
pub enum Invoked {
    /// A plain return value.
    Value(Value),
    /// The path of a created or updated child endpoint.
    Child(String),
}

/// A typed, `'static` method key.
///
/// Methods are addressed under the `f` segment with a query-string
/// separator (`/{endpoint}/f/{trait}?{method}`), which distinguishes
/// invocation from property paths.
#[derive(Debug)]
pub struct MethodKey<T: PropertyValue> {
    trait_id: &'static str,
    method: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: PropertyValue> Clone for MethodKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: PropertyValue> Copy for MethodKey<T> {}

impl<T: PropertyValue> PartialEq for MethodKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.trait_id == other.trait_id && self.method == other.method
    }
}

impl<T: PropertyValue> Eq for MethodKey<T> {}

impl<T: PropertyValue> MethodKey<T> {
    /// Creates a [`MethodKey`].
    #[must_use]
    pub const fn new(trait_id: &'static str, method: &'static str) -> Self {
        Self {
            trait_id,
            method,
            _value: PhantomData,
        }
    }

    /// Returns the trait identifier.
    #[must_use]
    pub const fn trait_id(&self) -> &'static str {
        self.trait_id
    }

    /// Returns the method identifier.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.method
    }

    /// Coerces an invocation result into this key's declared return
    /// type.
    ///
    /// # Errors
    ///
    /// Returns a [`CoercionError`] when the invocation returned a child
    /// reference or a value of the wrong type.
    pub fn coerce(&self, invoked: &Invoked) -> Result<T, CoercionError> {
        match invoked {
            Invoked::Value(value) => T::coerce(value),
            Invoked::Child(_) => Err(CoercionError::new(T::type_name(), "Child")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::section::Section;
    use crate::value::Value;

    use super::{Invoked, MethodKey, PropertyKey, PropertyName};

    const LEVEL: PropertyKey<f64> = PropertyKey::new(Section::State, "level", "v");
    const TOGGLE: MethodKey<Value> = MethodKey::new("onoff", "toggle");

    #[test]
    fn key_identity() {
        // Same triple, different allocation site.
        let other: PropertyKey<f64> = PropertyKey::new(Section::State, "level", "v");
        assert_eq!(LEVEL, other);

        let config: PropertyKey<f64> = PropertyKey::new(Section::Config, "level", "v");
        assert_ne!(LEVEL, config);

        assert!(LEVEL.is_in_section(Section::State));
        assert!(!LEVEL.is_in_section(Section::Metadata));
    }

    #[test]
    fn flat_round_trip() {
        let name = LEVEL.name();

        assert_eq!(name.flat(), "s/level/v");
        assert_eq!(PropertyName::parse("s/level/v"), Ok(name));

        assert!(PropertyName::parse("s/level").is_err());
        assert!(PropertyName::parse("x/level/v").is_err());
        assert!(PropertyName::parse("s//v").is_err());
    }

    #[test]
    fn typed_coercion() {
        assert_eq!(LEVEL.coerce(&Value::Number(0.5)), Ok(0.5));
        assert!(LEVEL.coerce(&Value::Text("0.5".into())).is_err());
        assert_eq!(LEVEL.inverse(0.5), Value::Number(0.5));
    }

    #[test]
    fn method_return() {
        assert_eq!(
            TOGGLE.coerce(&Invoked::Value(Value::Bool(true))),
            Ok(Value::Bool(true))
        );
        assert!(TOGGLE.coerce(&Invoked::Child("/lamp/f/scene/1/".into())).is_err());
    }
}
