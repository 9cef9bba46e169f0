use std::borrow::Cow;

use log::error;

/// A typed-value coercion failure.
///
/// Produced when a wire value cannot be converted into the Rust type
/// declared by a property key. Coercion never truncates or nulls a
/// mismatched value silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError {
    /// The type the key declares.
    pub expected: &'static str,
    /// The type of the wire value that was found.
    pub found: &'static str,
}

impl CoercionError {
    /// Creates a [`CoercionError`] from the expected and found type names.
    #[inline]
    pub fn new(expected: &'static str, found: &'static str) -> Self {
        error!("Coercion failure: expected `{expected}`, found `{found}`");
        Self { expected, found }
    }
}

impl std::fmt::Display for CoercionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected `{}`, found `{}`", self.expected, self.found)
    }
}

impl std::error::Error for CoercionError {}

/// An endpoint or property addressing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError {
    description: Cow<'static, str>,
}

impl AddressError {
    /// Creates an [`AddressError`] with the given description.
    #[inline]
    pub fn new(description: impl Into<Cow<'static, str>>) -> Self {
        let description = description.into();
        error!("{}", description.as_ref());
        Self { description }
    }
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address: {}", self.description)
    }
}

impl std::error::Error for AddressError {}

#[cfg(test)]
mod tests {
    use super::{AddressError, CoercionError};

    #[test]
    fn coercion_error() {
        let error = CoercionError::new("f64", "Text");

        assert_eq!(error.to_string(), "expected `f64`, found `Text`");
    }

    #[test]
    fn address_error() {
        let error = AddressError::new("Empty path.");

        assert_eq!(error.to_string(), "Address: Empty path.");
    }
}
