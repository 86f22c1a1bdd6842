//! Attribute name matching for metadata queries.
//!
//! Attributes are spelled `namespace::name`. A matcher is built from a
//! comma or space separated list and may contain `ns::*` to cover a whole
//! namespace, or `*` to cover everything.

use std::collections::BTreeSet;

/// The symlink flag attribute, the only name the cache layer inspects.
pub const ATTR_STANDARD_IS_SYMLINK: &str = "standard::is-symlink";

/// A predicate over attribute names.
///
/// The caches use one property of this type: `subtract(request, stored)`
/// is `None` exactly when the stored matcher covers every attribute the
/// request could match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMatcher {
    all: bool,
    namespaces: BTreeSet<String>,
    attributes: BTreeSet<String>,
}

impl AttributeMatcher {
    /// Parse a matcher from an attribute list such as
    /// `"standard::name,standard::size"` or `"standard::*"`.
    pub fn new(attributes: &str) -> Self {
        let mut matcher = AttributeMatcher::default();

        for part in attributes
            .split([',', ' '])
            .map(str::trim)
            .filter(|part| !part.is_empty())
        {
            if part == "*" {
                matcher.all = true;
            } else if let Some(namespace) = part.strip_suffix("::*") {
                matcher.namespaces.insert(namespace.to_owned());
            } else {
                matcher.attributes.insert(part.to_owned());
            }
        }

        matcher
    }

    /// A matcher that covers every attribute.
    pub fn unrestricted() -> Self {
        AttributeMatcher {
            all: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.namespaces.is_empty() && self.attributes.is_empty()
    }

    /// Whether this matcher would match the given attribute name.
    pub fn matches(&self, attribute: &str) -> bool {
        if self.all {
            return true;
        }

        if let Some((namespace, _)) = attribute.split_once("::") {
            if self.namespaces.contains(namespace) {
                return true;
            }
        }

        self.attributes.contains(attribute)
    }

    /// Everything `self` matches that `other` does not, or `None` when
    /// `other` covers `self` completely.
    pub fn subtract(&self, other: &AttributeMatcher) -> Option<AttributeMatcher> {
        if other.all {
            return None;
        }

        let mut left = AttributeMatcher {
            all: self.all,
            ..Default::default()
        };

        for namespace in &self.namespaces {
            if !other.namespaces.contains(namespace) {
                left.namespaces.insert(namespace.clone());
            }
        }

        for attribute in &self.attributes {
            if !other.matches(attribute) {
                left.attributes.insert(attribute.clone());
            }
        }

        if left.is_empty() {
            None
        } else {
            Some(left)
        }
    }

    /// Whether `self` covers everything `request` could match.
    pub fn covers(&self, request: &AttributeMatcher) -> bool {
        request.subtract(self).is_none()
    }
}
