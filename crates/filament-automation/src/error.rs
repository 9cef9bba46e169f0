use std::borrow::Cow;

use tracing::error;

/// All possible error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An automation expression failed to parse or evaluate.
    Evaluation,
    /// A source, destination, condition, or action URI did not resolve
    /// to an endpoint and property.
    Resolve,
    /// A property write issued by a primitive failed.
    Write,
    /// A primitive configuration is invalid.
    Configuration,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::Evaluation => "Evaluation",
            Self::Resolve => "Resolve",
            Self::Write => "Write",
            Self::Configuration => "Configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// Automation error.
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

impl From<filament::error::AddressError> for Error {
    fn from(e: filament::error::AddressError) -> Self {
        Self::new(ErrorKind::Resolve, e.to_string())
    }
}

impl From<filament::expr::EvalError> for Error {
    fn from(e: filament::expr::EvalError) -> Self {
        Self::new(ErrorKind::Evaluation, e.to_string())
    }
}

impl From<filament_endpoint::error::Error> for Error {
    fn from(e: filament_endpoint::error::Error) -> Self {
        Self::new(ErrorKind::Write, e.to_string())
    }
}

impl std::error::Error for Error {}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
