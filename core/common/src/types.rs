//! Common types used throughout catalogsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Name of an independently synchronized entity kind ("products", "contractors", ...).
///
/// Watermarks and identity mappings are partitioned by scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityScope(String);

impl EntityScope {
    /// Create a new scope.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains characters other than
    ///   lowercase ASCII letters, digits, `_` and `-`
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity scope cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid entity scope: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a record in the relational source, in canonical text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonicalize a column value into a source id.
    ///
    /// Integers and strings are accepted; reals are accepted only when they
    /// carry no fractional part (some drivers widen integer keys).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self(i.to_string()))
                } else if let Some(u) = n.as_u64() {
                    Some(Self(u.to_string()))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Self((f as i64).to_string()))
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the destination platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(u64);

impl DestinationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Parse an id echoed by a remote API. Zero means "not assigned".
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }?;
        (id != 0).then_some(Self(id))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application-level key used to reassociate a remote response item with
/// the source row that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NaturalKey {
    Sku(String),
    Username(String),
    Slug(String),
}

impl NaturalKey {
    /// Payload field the destination stores this key under.
    pub fn field_name(&self) -> &'static str {
        match self {
            NaturalKey::Sku(_) => "sku",
            NaturalKey::Username(_) => "username",
            NaturalKey::Slug(_) => "slug",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            NaturalKey::Sku(v) | NaturalKey::Username(v) | NaturalKey::Slug(v) => v,
        }
    }

    /// Whether the destination accepts this key in update payloads.
    ///
    /// WordPress usernames cannot be changed once the account exists.
    pub fn writable_on_update(&self) -> bool {
        !matches!(self, NaturalKey::Username(_))
    }

    /// Rebuild a key of the same kind from an echoed field value.
    pub fn with_value(&self, value: impl Into<String>) -> Self {
        match self {
            NaturalKey::Sku(_) => NaturalKey::Sku(value.into()),
            NaturalKey::Username(_) => NaturalKey::Username(value.into()),
            NaturalKey::Slug(_) => NaturalKey::Slug(value.into()),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field_name(), self.value())
    }
}

/// Which kind of watermark a change-detection strategy produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkKind {
    Timestamp,
    Version,
}

impl fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkKind::Timestamp => write!(f, "timestamp"),
            WatermarkKind::Version => write!(f, "version"),
        }
    }
}

/// Boundary of the last successful synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Watermark {
    /// Point in time on the source clock (history mode).
    Timestamp(DateTime<Utc>),
    /// Value of the source's global change counter (version-counter mode).
    Version(i64),
}

impl Watermark {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            Watermark::Timestamp(_) => WatermarkKind::Timestamp,
            Watermark::Version(_) => WatermarkKind::Version,
        }
    }

    /// Compare two watermarks of the same kind. Mixed kinds are unordered.
    pub fn compare(&self, other: &Watermark) -> Option<Ordering> {
        match (self, other) {
            (Watermark::Timestamp(a), Watermark::Timestamp(b)) => Some(a.cmp(b)),
            (Watermark::Version(a), Watermark::Version(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Watermark::Version(v) => write!(f, "v{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_entity_scope_validation() {
        assert!(EntityScope::new("products").is_ok());
        assert!(EntityScope::new("").is_err());
        assert!(EntityScope::new("Products").is_err());
        assert!(EntityScope::new("a b").is_err());
    }

    #[test]
    fn test_source_id_from_value() {
        assert_eq!(SourceId::from_value(&json!(42)), Some(SourceId::new("42")));
        assert_eq!(SourceId::from_value(&json!(42.0)), Some(SourceId::new("42")));
        assert_eq!(SourceId::from_value(&json!("A-1")), Some(SourceId::new("A-1")));
        assert_eq!(SourceId::from_value(&json!(1.5)), None);
        assert_eq!(SourceId::from_value(&json!(null)), None);
        assert_eq!(SourceId::from_value(&json!("")), None);
    }

    #[test]
    fn test_destination_id_zero_is_unassigned() {
        assert_eq!(DestinationId::from_value(&json!(0)), None);
        assert_eq!(DestinationId::from_value(&json!(17)), Some(DestinationId::new(17)));
        assert_eq!(DestinationId::from_value(&json!("17")), Some(DestinationId::new(17)));
    }

    #[test]
    fn test_natural_key_fields() {
        let key = NaturalKey::Username("jankow12".to_string());
        assert_eq!(key.field_name(), "username");
        assert!(!key.writable_on_update());
        assert!(NaturalKey::Sku("12".to_string()).writable_on_update());
        assert_eq!(key.with_value("other"), NaturalKey::Username("other".to_string()));
    }

    #[test]
    fn test_watermark_ordering() {
        let early = Watermark::Timestamp(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let late = Watermark::Timestamp(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(early.compare(&late), Some(Ordering::Less));
        assert_eq!(Watermark::Version(3).compare(&Watermark::Version(3)), Some(Ordering::Equal));
        assert_eq!(early.compare(&Watermark::Version(1)), None);
    }

    #[test]
    fn test_watermark_serialization() {
        let json = serde_json::to_value(Watermark::Version(7)).unwrap();
        assert_eq!(json, json!({"kind": "version", "value": 7}));
        let back: Watermark = serde_json::from_value(json).unwrap();
        assert_eq!(back, Watermark::Version(7));
    }
}
