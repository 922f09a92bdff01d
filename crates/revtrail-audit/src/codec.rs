//! Diff codec.
//!
//! Turns a change map (`attribute -> (old, new)`) into the durable payload
//! stored on an audit record, and reads payloads back, including ones
//! written by older formats.
//!
//! ## Payload formats
//!
//! | Format | Shape | Notes |
//! |--------|-------|-------|
//! | `Structured` | `{"format": 1, "changes": {"name": {"old": "John", "new": "Joe"}}}` | Written by [`encode`]. |
//! | `Legacy` | `{"name": ["John", "Joe"], "age": 31}` | Pairs or bare new values. |
//! | `Fallback` | anything else | Kept verbatim under [`FALLBACK_KEY`]. |

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::error::AuditError;

/// Attribute name to value, as handed over by the host persistence layer.
pub type Attributes = Map<String, Value>;

/// Attribute name to change, ordered by attribute name.
pub type Changes = BTreeMap<String, Change>;

/// Version tag written into structured payloads.
pub const FORMAT_VERSION: u64 = 1;

/// Key under which an unparseable payload is surfaced.
pub const FALLBACK_KEY: &str = "payload";

/// One attribute's change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Old and new value. `old` is `null` on create, `new` is `null` on destroy.
    Pair { old: Value, new: Value },
    /// Legacy single-value entry: only the new value was stored.
    NewOnly(Value),
}

impl Change {
    pub fn pair(old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Self::Pair {
            old: old.into(),
            new: new.into(),
        }
    }

    /// Change for an attribute set by a create.
    pub fn created(new: impl Into<Value>) -> Self {
        Self::pair(Value::Null, new)
    }

    /// Change for an attribute removed by a destroy.
    pub fn destroyed(old: impl Into<Value>) -> Self {
        Self::pair(old, Value::Null)
    }

    /// The old value, or `None` when the record never stored one.
    pub fn old_value(&self) -> Option<&Value> {
        match self {
            Self::Pair { old, .. } => Some(old),
            Self::NewOnly(_) => None,
        }
    }

    pub fn new_value(&self) -> &Value {
        match self {
            Self::Pair { new, .. } => new,
            Self::NewOnly(new) => new,
        }
    }

    /// Replace every non-null value with `marker`.
    pub fn redacted(&self, marker: &str) -> Self {
        let mask = |value: &Value| {
            if value.is_null() {
                Value::Null
            } else {
                Value::String(marker.to_string())
            }
        };
        match self {
            Self::Pair { old, new } => Self::Pair {
                old: mask(old),
                new: mask(new),
            },
            Self::NewOnly(new) => Self::NewOnly(mask(new)),
        }
    }
}

/// Which decoder produced a [`Decoded`] change map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffFormat {
    Structured,
    Legacy,
    Fallback,
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub changes: Changes,
    pub format: DiffFormat,
}

impl Decoded {
    /// The payload could not be read as a change map.
    pub fn is_fallback(&self) -> bool {
        self.format == DiffFormat::Fallback
    }
}

/// Encode a change map into the structured payload format.
pub fn encode(changes: &Changes) -> Result<String, AuditError> {
    let mut entries = Map::new();
    for (attribute, change) in changes {
        let entry = match change {
            Change::Pair { old, new } => json!({ "old": old, "new": new }),
            Change::NewOnly(new) => json!({ "new": new }),
        };
        entries.insert(attribute.clone(), entry);
    }

    let envelope = json!({
        "format": FORMAT_VERSION,
        "changes": entries,
    });
    Ok(serde_json::to_string(&envelope)?)
}

type Decoder = fn(&str) -> Option<Changes>;

/// Decoders in priority order. A payload none of them accepts falls through
/// to the string fallback.
const DECODERS: [(DiffFormat, Decoder); 2] = [
    (DiffFormat::Structured, decode_structured),
    (DiffFormat::Legacy, decode_legacy),
];

/// Decode a stored payload.
///
/// Never fails: tries structured, then legacy, and finally degrades to a
/// single [`FALLBACK_KEY`] entry holding the raw payload as a string.
pub fn decode(payload: &str) -> Decoded {
    for (format, decoder) in DECODERS {
        if let Some(changes) = decoder(payload) {
            return Decoded { changes, format };
        }
    }

    tracing::warn!(
        payload_len = payload.len(),
        "Audit payload is not a change map, falling back to raw string"
    );

    let mut changes = Changes::new();
    changes.insert(
        FALLBACK_KEY.to_string(),
        Change::NewOnly(Value::String(payload.to_string())),
    );
    Decoded {
        changes,
        format: DiffFormat::Fallback,
    }
}

fn decode_structured(payload: &str) -> Option<Changes> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let envelope = value.as_object()?;
    if envelope.get("format")?.as_u64()? != FORMAT_VERSION {
        return None;
    }

    let mut changes = Changes::new();
    for (attribute, entry) in envelope.get("changes")?.as_object()? {
        let entry = entry.as_object()?;
        let new = entry.get("new")?.clone();
        let change = match entry.get("old") {
            Some(old) => Change::Pair {
                old: old.clone(),
                new,
            },
            None => Change::NewOnly(new),
        };
        changes.insert(attribute.clone(), change);
    }
    Some(changes)
}

fn decode_legacy(payload: &str) -> Option<Changes> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let Value::Object(entries) = value else {
        return None;
    };

    let changes = entries
        .into_iter()
        .map(|(attribute, value)| {
            let change = match value {
                Value::Array(mut pair) if pair.len() == 2 => {
                    let new = pair.pop().unwrap_or(Value::Null);
                    let old = pair.pop().unwrap_or(Value::Null);
                    Change::Pair { old, new }
                }
                other => Change::NewOnly(other),
            };
            (attribute, change)
        })
        .collect();
    Some(changes)
}

/// Compute the change map between two attribute maps.
///
/// Attributes present on one side only diff against `null`; attributes with
/// equal values are omitted.
pub fn diff_attributes(before: &Attributes, after: &Attributes) -> Changes {
    let mut changes = Changes::new();

    for (key, before_val) in before {
        match after.get(key) {
            Some(after_val) if before_val != after_val => {
                changes.insert(key.clone(), Change::pair(before_val.clone(), after_val.clone()));
            }
            None if !before_val.is_null() => {
                changes.insert(key.clone(), Change::destroyed(before_val.clone()));
            }
            _ => {} // No change
        }
    }

    for (key, after_val) in after {
        if !before.contains_key(key) && !after_val.is_null() {
            changes.insert(key.clone(), Change::created(after_val.clone()));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Changes {
        let mut changes = Changes::new();
        changes.insert("name".into(), Change::pair("John", "Joe"));
        changes.insert("age".into(), Change::pair(30, 31));
        changes.insert("score".into(), Change::pair(1.5, json!(null)));
        changes.insert("active".into(), Change::created(true));
        changes.insert(
            "address".into(),
            Change::pair(json!({"city": "Oslo", "zip": ["0150"]}), json!({"city": "Bergen"})),
        );
        changes.insert("tags".into(), Change::NewOnly(json!(["a", "b", "c"])));
        changes
    }

    #[test]
    fn test_round_trips_structured_payload() {
        let changes = sample();
        let payload = encode(&changes).unwrap();
        let decoded = decode(&payload);

        assert_eq!(decoded.format, DiffFormat::Structured);
        assert_eq!(decoded.changes, changes);
    }

    #[test]
    fn test_empty_changes_round_trip() {
        let payload = encode(&Changes::new()).unwrap();
        let decoded = decode(&payload);
        assert_eq!(decoded.format, DiffFormat::Structured);
        assert!(decoded.changes.is_empty());
    }

    #[test]
    fn test_decodes_legacy_single_values_as_new_only() {
        let decoded = decode(r#"{"name": "Joe", "age": 31, "email": null}"#);

        assert_eq!(decoded.format, DiffFormat::Legacy);
        assert_eq!(decoded.changes["name"], Change::NewOnly(json!("Joe")));
        assert_eq!(decoded.changes["age"].old_value(), None);
        assert_eq!(decoded.changes["age"].new_value(), &json!(31));
        assert_eq!(decoded.changes["email"], Change::NewOnly(Value::Null));
    }

    #[test]
    fn test_decodes_legacy_pairs() {
        let decoded = decode(r#"{"name": ["John", "Joe"], "tags": ["x"]}"#);

        assert_eq!(decoded.format, DiffFormat::Legacy);
        assert_eq!(decoded.changes["name"], Change::pair("John", "Joe"));
        assert_eq!(decoded.changes["tags"], Change::NewOnly(json!(["x"])));
    }

    #[test]
    fn test_non_json_payload_falls_back_to_string() {
        let payload = "---\nname:\n- John\n- Joe\n";
        let decoded = decode(payload);

        assert!(decoded.is_fallback());
        assert_eq!(decoded.changes.len(), 1);
        assert_eq!(decoded.changes[FALLBACK_KEY], Change::NewOnly(json!(payload)));
    }

    #[test]
    fn test_json_that_is_not_an_object_falls_back() {
        let decoded = decode("[1, 2, 3]");
        assert!(decoded.is_fallback());
        assert_eq!(decoded.changes[FALLBACK_KEY].new_value(), &json!("[1, 2, 3]"));
    }

    #[test]
    fn test_redaction_keeps_nulls() {
        let change = Change::created("123-45-6789").redacted("[REDACTED]");
        assert_eq!(change, Change::pair(Value::Null, "[REDACTED]"));
    }

    #[test]
    fn test_diff_attributes_reports_changed_added_removed() {
        let before = json!({"name": "John", "age": 30, "nickname": "JJ"});
        let after = json!({"name": "Joe", "age": 30, "email": "joe@example.com"});

        let changes = diff_attributes(
            before.as_object().unwrap(),
            after.as_object().unwrap(),
        );

        assert_eq!(changes.len(), 3);
        assert_eq!(changes["name"], Change::pair("John", "Joe"));
        assert_eq!(changes["nickname"], Change::destroyed("JJ"));
        assert_eq!(changes["email"], Change::created("joe@example.com"));
        assert!(!changes.contains_key("age"));
    }

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let attrs = json!({"name": "John"});
        let attrs = attrs.as_object().unwrap();
        assert!(diff_attributes(attrs, attrs).is_empty());
    }
}
