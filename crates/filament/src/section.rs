use serde::Serialize;

use crate::error::AddressError;

/// A property section.
///
/// Sections partition the properties of a functional endpoint by
/// visibility and persistence rules: `Metadata` is never persisted as
/// operational state, `State` may be transitioned or incremented, and
/// `Config` never fans out across groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub enum Section {
    /// Live, operational state.
    State,
    /// Configuration.
    Config,
    /// Descriptive metadata.
    Metadata,
}

impl Section {
    /// All sections, in canonical order.
    pub const ALL: [Self; 3] = [Self::State, Self::Config, Self::Metadata];

    /// Returns the path component identifying this section.
    #[must_use]
    pub const fn component(self) -> &'static str {
        match self {
            Self::State => "s",
            Self::Config => "c",
            Self::Metadata => "m",
        }
    }

    /// Parses a section from its path component.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] when the component does not identify
    /// a section.
    pub fn from_component(component: &str) -> Result<Self, AddressError> {
        match component {
            "s" => Ok(Self::State),
            "c" => Ok(Self::Config),
            "m" => Ok(Self::Metadata),
            _ => Err(AddressError::new(format!(
                "`{component}` is not a section component"
            ))),
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => "State",
            Self::Config => "Config",
            Self::Metadata => "Metadata",
        }
        .fmt(f)
    }
}
