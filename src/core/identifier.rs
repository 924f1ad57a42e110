//! # Identifier
//!
//! Hierarchical resource names used as the primary key for packet types,
//! endpoints, registries and applications.
//!
//! An identifier is a namespace plus a non-empty path, written canonically as
//! `namespace:seg1/seg2`. The namespace must match `^(\.[^/:.]|[\w-])+$` and
//! every segment must match `^[^/:]+$`, which makes the canonical key
//! unambiguous: two identifiers are equal exactly when their keys are.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtocolError, Result};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    namespace: String,
    path: Vec<String>,
}

impl Identifier {
    /// Create a validated identifier.
    pub fn new<N, I, S>(namespace: N, path: I) -> Result<Self>
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let namespace = namespace.into();
        let path: Vec<String> = path.into_iter().map(Into::into).collect();
        validate(&namespace, &path)?;
        Ok(Self { namespace, path })
    }

    /// Build an identifier from literals known at compile time.
    ///
    /// # Panics
    /// Panics if the namespace or path is invalid.
    pub fn from_static(namespace: &'static str, path: &[&'static str]) -> Self {
        match Self::new(namespace, path.iter().copied()) {
            Ok(id) => id,
            Err(e) => panic!("invalid static identifier {namespace}:{path:?}: {e}"),
        }
    }

    /// Parse a canonical `namespace:seg/seg` key.
    pub fn from_key(key: &str) -> Result<Self> {
        let (namespace, path) = key.split_once(':').ok_or_else(|| {
            ProtocolError::InvalidIdentifier(format!("no separator found in {key}"))
        })?;
        if path.contains(':') {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "multiple separators found in {key}"
            )));
        }
        if namespace.is_empty() || path.is_empty() {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "namespace and path cannot be empty in {key}"
            )));
        }
        Self::new(namespace, path.split('/'))
    }

    /// Reverse-DNS namespace for a host name: `app.example.com` becomes
    /// `com.example.app`.
    pub fn namespace_from_host(host: &str) -> String {
        host.split('.').rev().collect::<Vec<_>>().join(".")
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        // path is never empty
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Canonical key, `namespace:seg1/seg2/...`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.path.join("/"))
    }

    /// Append segments, sharing this identifier's namespace.
    ///
    /// `name` may contain `/` to append several segments at once.
    pub fn join(&self, name: &str) -> Result<Self> {
        let path = self
            .path
            .iter()
            .cloned()
            .chain(name.split('/').map(str::to_owned));
        Self::new(self.namespace.clone(), path)
    }

    pub fn is_namespace_equal(&self, other: &Identifier) -> bool {
        self.namespace == other.namespace
    }

    /// True when `self` lives at or below `other`: same namespace and
    /// `other.path` is a prefix of `self.path`.
    pub fn is_subpath_of(&self, other: &Identifier) -> bool {
        self.namespace == other.namespace && self.path.starts_with(&other.path)
    }
}

fn validate(namespace: &str, path: &[String]) -> Result<()> {
    if namespace.is_empty() {
        return Err(ProtocolError::InvalidIdentifier(
            "namespace cannot be empty".into(),
        ));
    }
    if !is_valid_namespace(namespace) {
        return Err(ProtocolError::InvalidIdentifier(format!(
            "namespace must match ^(\\.[^/:.]|[\\w-])+$ but got {namespace}"
        )));
    }
    if path.is_empty() {
        return Err(ProtocolError::InvalidIdentifier(
            "path must have at least one name".into(),
        ));
    }
    if let Some(bad) = path.iter().find(|name| !is_valid_name(name)) {
        return Err(ProtocolError::InvalidIdentifier(format!(
            "name must match ^[^/:]+$ but got {bad:?}"
        )));
    }
    Ok(())
}

// ^(\.[^/:.]|[\w-])+$ with ASCII word characters
fn is_valid_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => match chars.next() {
                Some(next) if !matches!(next, '/' | ':' | '.') => {}
                _ => return false,
            },
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {}
            _ => return false,
        }
    }
    true
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', ':'])
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path.join("/"))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

impl FromStr for Identifier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_key(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Identifier::from_key(&key).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let id = Identifier::new("com.example", ["app", "settings"]).unwrap();
        assert_eq!(id.key(), "com.example:app/settings");
        assert_eq!(id.to_string(), id.key());
        assert_eq!(id.name(), "settings");
    }

    #[test]
    fn test_from_key_roundtrip() {
        let id = Identifier::from_key("core:packet/server_meta").unwrap();
        assert_eq!(id.namespace(), "core");
        assert_eq!(id.path(), ["packet", "server_meta"]);
        assert_eq!(Identifier::from_key(&id.key()).unwrap(), id);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(Identifier::from_key("missing-separator").is_err());
        assert!(Identifier::from_key("a:b:c").is_err());
        assert!(Identifier::from_key(":path").is_err());
        assert!(Identifier::from_key("ns:").is_err());
        assert!(Identifier::from_key("ns:a//b").is_err());
    }

    #[test]
    fn test_namespace_rules() {
        assert!(Identifier::new("com.example-app_1", ["x"]).is_ok());
        assert!(Identifier::new(".hidden", ["x"]).is_ok());
        assert!(Identifier::new("a..b", ["x"]).is_err());
        assert!(Identifier::new("trailing.", ["x"]).is_err());
        assert!(Identifier::new("has space", ["x"]).is_err());
        assert!(Identifier::new("slash/ns", ["x"]).is_err());
        assert!(Identifier::new("", ["x"]).is_err());
    }

    #[test]
    fn test_path_rules() {
        assert!(Identifier::new("ns", Vec::<String>::new()).is_err());
        assert!(Identifier::new("ns", ["a/b"]).is_err());
        assert!(Identifier::new("ns", ["a:b"]).is_err());
        assert!(Identifier::new("ns", ["with space", "ünïcode"]).is_ok());
    }

    #[test]
    fn test_join_and_subpath() {
        let app = Identifier::from_key("com.example:app").unwrap();
        let registry = app.join("settings/theme").unwrap();
        assert_eq!(registry.key(), "com.example:app/settings/theme");
        assert!(registry.is_subpath_of(&app));
        assert!(app.is_subpath_of(&app));
        assert!(!app.is_subpath_of(&registry));

        let other = Identifier::from_key("com.other:app/settings").unwrap();
        assert!(!other.is_subpath_of(&app));
        assert!(!other.is_namespace_equal(&app));
        assert!(app.join("bad:name").is_err());
    }

    #[test]
    fn test_namespace_from_host() {
        assert_eq!(
            Identifier::namespace_from_host("app.example.com"),
            "com.example.app"
        );
        assert_eq!(Identifier::namespace_from_host("localhost"), "localhost");
    }

    #[test]
    fn test_serde_as_key_string() {
        let id = Identifier::from_key("ext:registry/get").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ext:registry/get\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Identifier>("\"nope\"").is_err());
    }

    #[test]
    #[should_panic]
    fn test_from_static_panics_on_invalid() {
        let _ = Identifier::from_static("bad ns", &["x"]);
    }
}
