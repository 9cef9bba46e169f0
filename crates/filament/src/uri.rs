//! Path-based resource addressing.
//!
//! Maps endpoint/section/property addressing to hierarchical paths and
//! back:
//!
//! - property: `/{endpoint}/{section}/{trait}/{property}`
//! - method: `/{endpoint}/f/{trait}?{method}`
//! - child: `/{endpoint}/f/{trait}/{child}/`
//! - group: `/g/{group}/`
//!
//! Query-string modifiers encode the mutation discriminators (`inc`,
//! `tog`, `ins`, `rem`) and the transition-duration hint (`d=<seconds>`).

use serde::Serialize;

use crate::error::AddressError;
use crate::key::PropertyName;
use crate::section::Section;

// Path segment introducing methods and children.
const FUNC_SEGMENT: &str = "f";

// Path segment introducing groups.
const GROUP_SEGMENT: &str = "g";

// Query key carrying the transition-duration hint, in seconds.
const DURATION_KEY: &str = "d";

/// A property mutation discriminator.
///
/// All mutations share one request shape; the discriminator rides as a
/// query-string marker rather than a distinct endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub enum Mutation {
    /// Replace the value.
    #[default]
    Set,
    /// Add a numeric delta to the value.
    Increment,
    /// Flip a boolean value.
    Toggle,
    /// Insert an element into an array value.
    Insert,
    /// Remove an element from an array value.
    Remove,
}

impl Mutation {
    /// Returns the query-string marker for this mutation, if any.
    ///
    /// [`Mutation::Set`] is the unmarked default.
    #[must_use]
    pub const fn query_key(self) -> Option<&'static str> {
        match self {
            Self::Set => None,
            Self::Increment => Some("inc"),
            Self::Toggle => Some("tog"),
            Self::Insert => Some("ins"),
            Self::Remove => Some("rem"),
        }
    }

    /// Reads the mutation discriminator out of a parsed query.
    #[must_use]
    pub fn from_query(query: &[(String, String)]) -> Self {
        for (key, _) in query {
            match key.as_str() {
                "inc" => return Self::Increment,
                "tog" => return Self::Toggle,
                "ins" => return Self::Insert,
                "rem" => return Self::Remove,
                _ => {}
            }
        }
        Self::Set
    }
}

/// Reads the transition-duration hint out of a parsed query, in seconds.
#[must_use]
pub fn duration_from_query(query: &[(String, String)]) -> Option<f64> {
    query
        .iter()
        .find(|(key, _)| key == DURATION_KEY)
        .and_then(|(_, value)| value.parse().ok())
}

/// Parses a query string into its key/value pairs.
///
/// Bare keys parse with an empty value.
#[must_use]
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// A parsed resource path.
///
/// Group resources address like endpoints whose identifier carries the
/// `g/` prefix: `/g/kitchen/s/onoff/v` is the `s/onoff/v` property of
/// the endpoint `g/kitchen`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourcePath {
    /// An endpoint root.
    Endpoint {
        /// The endpoint identifier.
        endpoint: String,
    },
    /// A whole section of an endpoint.
    Section {
        /// The endpoint identifier.
        endpoint: String,
        /// The section.
        section: Section,
    },
    /// A single property.
    Property {
        /// The endpoint identifier.
        endpoint: String,
        /// The property identity.
        name: PropertyName,
    },
    /// A method invocation target.
    Method {
        /// The endpoint identifier.
        endpoint: String,
        /// The trait identifier.
        trait_id: String,
        /// The method identifier, from the query separator.
        method: String,
    },
    /// The child listing of a trait.
    Children {
        /// The endpoint identifier.
        endpoint: String,
        /// The trait identifier.
        trait_id: String,
    },
    /// A child endpoint.
    Child {
        /// The endpoint identifier.
        endpoint: String,
        /// The trait identifier.
        trait_id: String,
        /// The child identifier.
        child: String,
    },
}

impl ResourcePath {
    /// Parses a resource URI, query included.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] when the URI does not address a
    /// known resource shape.
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };

        let segments: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        // A group identifier spans two segments.
        let (endpoint, rest) = match segments.as_slice() {
            [] => return Err(AddressError::new("Empty path.")),
            [GROUP_SEGMENT] => {
                return Err(AddressError::new(format!(
                    "`{uri}` addresses the group namespace without a group"
                )));
            }
            [GROUP_SEGMENT, group, rest @ ..] => (format!("{GROUP_SEGMENT}/{group}"), rest),
            [endpoint, rest @ ..] => ((*endpoint).to_string(), rest),
        };

        match rest {
            [] => Ok(Self::Endpoint { endpoint }),
            [FUNC_SEGMENT, trait_id] => {
                // The method name is the query up to the first `&`;
                // without one, the path addresses the child listing.
                let method = query
                    .and_then(|query| query.split('&').next())
                    .filter(|method| !method.is_empty());
                match method {
                    Some(method) => Ok(Self::Method {
                        endpoint,
                        trait_id: (*trait_id).to_string(),
                        method: method.to_string(),
                    }),
                    None => Ok(Self::Children {
                        endpoint,
                        trait_id: (*trait_id).to_string(),
                    }),
                }
            }
            [FUNC_SEGMENT, trait_id, child] => Ok(Self::Child {
                endpoint,
                trait_id: (*trait_id).to_string(),
                child: (*child).to_string(),
            }),
            [section] => Ok(Self::Section {
                endpoint,
                section: Section::from_component(section)?,
            }),
            [section, trait_id, property] => Ok(Self::Property {
                endpoint,
                name: PropertyName::new(
                    Section::from_component(section)?,
                    (*trait_id).to_string(),
                    (*property).to_string(),
                ),
            }),
            _ => Err(AddressError::new(format!(
                "`{uri}` does not address a known resource"
            ))),
        }
    }
}

/// Formats the path of a property.
#[must_use]
pub fn property_path(endpoint: &str, name: &PropertyName) -> String {
    format!("/{endpoint}/{}", name.flat())
}

/// Formats the path of a whole section.
#[must_use]
pub fn section_path(endpoint: &str, section: Section) -> String {
    format!("/{endpoint}/{}/", section.component())
}

/// Formats a method-invocation URI, query separator included.
#[must_use]
pub fn method_uri(endpoint: &str, trait_id: &str, method: &str) -> String {
    format!("/{endpoint}/{FUNC_SEGMENT}/{trait_id}?{method}")
}

/// Formats the path of a child endpoint.
#[must_use]
pub fn child_path(endpoint: &str, trait_id: &str, child: &str) -> String {
    format!("/{endpoint}/{FUNC_SEGMENT}/{trait_id}/{child}/")
}

/// Formats the path of a group.
#[must_use]
pub fn group_path(group: &str) -> String {
    format!("/{GROUP_SEGMENT}/{group}/")
}

#[cfg(test)]
mod tests {
    use crate::key::PropertyName;
    use crate::section::Section;

    use super::{
        Mutation, ResourcePath, child_path, duration_from_query, group_path, method_uri,
        parse_query, property_path, section_path,
    };

    #[test]
    fn property_round_trip() {
        let name = PropertyName::new(Section::State, "onoff", "v");
        let path = property_path("lamp-1", &name);

        assert_eq!(path, "/lamp-1/s/onoff/v");
        assert_eq!(
            ResourcePath::parse(&path),
            Ok(ResourcePath::Property {
                endpoint: "lamp-1".into(),
                name,
            })
        );
    }

    #[test]
    fn section_endpoint_group() {
        assert_eq!(
            ResourcePath::parse(&section_path("lamp-1", Section::Config)),
            Ok(ResourcePath::Section {
                endpoint: "lamp-1".into(),
                section: Section::Config,
            })
        );

        assert_eq!(
            ResourcePath::parse("/lamp-1/"),
            Ok(ResourcePath::Endpoint {
                endpoint: "lamp-1".into(),
            })
        );

        assert_eq!(
            ResourcePath::parse(&group_path("kitchen")),
            Ok(ResourcePath::Endpoint {
                endpoint: "g/kitchen".into(),
            })
        );

        // Group resources address like endpoints with a `g/` id.
        assert_eq!(
            ResourcePath::parse("/g/kitchen/s/onoff/v"),
            Ok(ResourcePath::Property {
                endpoint: "g/kitchen".into(),
                name: PropertyName::new(Section::State, "onoff", "v"),
            })
        );
    }

    #[test]
    fn method_and_child() {
        assert_eq!(
            ResourcePath::parse(&method_uri("lamp-1", "scene", "save")),
            Ok(ResourcePath::Method {
                endpoint: "lamp-1".into(),
                trait_id: "scene".into(),
                method: "save".into(),
            })
        );

        // A trait path without a method query addresses the child
        // listing.
        assert_eq!(
            ResourcePath::parse("/lamp-1/f/scene"),
            Ok(ResourcePath::Children {
                endpoint: "lamp-1".into(),
                trait_id: "scene".into(),
            })
        );

        assert_eq!(
            ResourcePath::parse(&child_path("lamp-1", "scene", "evening")),
            Ok(ResourcePath::Child {
                endpoint: "lamp-1".into(),
                trait_id: "scene".into(),
                child: "evening".into(),
            })
        );
    }

    #[test]
    fn malformed_paths() {
        assert!(ResourcePath::parse("/").is_err());
        assert!(ResourcePath::parse("/g/").is_err());
        assert!(ResourcePath::parse("/lamp-1/x").is_err());
        assert!(ResourcePath::parse("/lamp-1/s/onoff/v/extra").is_err());
    }

    #[test]
    fn query_modifiers() {
        let query = parse_query("inc&d=0.5");

        assert_eq!(Mutation::from_query(&query), Mutation::Increment);
        assert_eq!(duration_from_query(&query), Some(0.5));

        assert_eq!(Mutation::from_query(&parse_query("d=2")), Mutation::Set);
        assert_eq!(Mutation::from_query(&parse_query("tog")), Mutation::Toggle);
        assert_eq!(duration_from_query(&parse_query("tog")), None);
    }

    #[test]
    fn mutation_markers() {
        assert_eq!(Mutation::Set.query_key(), None);
        assert_eq!(Mutation::Increment.query_key(), Some("inc"));
        assert_eq!(Mutation::Remove.query_key(), Some("rem"));
    }
}
