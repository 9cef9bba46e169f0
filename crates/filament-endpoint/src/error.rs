use std::borrow::Cow;

use tracing::error;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The endpoint does not expose the addressed property.
    PropertyNotFound,
    /// The property cannot be written.
    PropertyReadOnly,
    /// The value does not fit the property.
    InvalidPropertyValue,
    /// The endpoint does not expose the invoked method.
    MethodNotFound,
    /// The method arguments do not fit the method.
    InvalidMethodArguments,
    /// The member violates a group association rule.
    UnacceptableMember,
    /// A transport or protocol-level failure.
    Remote,
    /// The addressed resource does not exist.
    UnknownResource,
    /// The operation was cancelled before completing.
    Cancelled,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::PropertyNotFound => "Property Not Found",
            Self::PropertyReadOnly => "Property Read-Only",
            Self::InvalidPropertyValue => "Invalid Property Value",
            Self::MethodNotFound => "Method Not Found",
            Self::InvalidMethodArguments => "Invalid Method Arguments",
            Self::UnacceptableMember => "Unacceptable Member",
            Self::Remote => "Remote",
            Self::UnknownResource => "Unknown Resource",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// Endpoint error.
#[derive(Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.format(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.format(f)
    }
}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        let description = description.into();
        error!("{}", description.as_ref());
        Self { kind, description }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn format(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl From<filament::error::CoercionError> for Error {
    fn from(e: filament::error::CoercionError) -> Self {
        Self::new(ErrorKind::InvalidPropertyValue, e.to_string())
    }
}

impl From<filament::error::AddressError> for Error {
    fn from(e: filament::error::AddressError) -> Self {
        Self::new(ErrorKind::UnknownResource, e.to_string())
    }
}

impl std::error::Error for Error {}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn endpoint_error() {
        let error = Error::new(ErrorKind::PropertyNotFound, "`s/onoff/v` is not exposed.");

        assert_eq!(
            error.to_string(),
            "Property Not Found: `s/onoff/v` is not exposed."
        );
        assert_eq!(error.kind(), ErrorKind::PropertyNotFound);
    }
}
