//! Context codec: turns the named attributes of a flow instance into one
//! persisted string and back.
//!
//! Blobs are written as a tagged union:
//!
//! ```json
//! {"version":2,"attrs":{"lesson":{"reference":{"kind":"Lesson","id":"l1"}},"tries":{"literal":2}}}
//! ```
//!
//! Older blobs used a flat object where `<attr>_<EntityType>_id` keys held the
//! id of a referenced entity and every other key was a literal. Those still
//! decode so long-lived instances survive republishes.
use std::{collections::BTreeMap, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{trace, warn};

use crate::{
    entity::{EntityRef, EntityResolver, EntityType},
    error::{FlowError, FlowResult},
};

pub const BLOB_VERSION: u64 = 2;

static LEGACY_REF_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)_([A-Za-z]+)_id$").expect("static regex"));

/// One value stored in a flow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextValue {
    Literal(Value),
    Reference(EntityRef),
}

impl ContextValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ContextValue::Literal(value.into())
    }

    pub fn reference(kind: EntityType, id: impl Into<String>) -> Self {
        ContextValue::Reference(EntityRef::new(kind, id))
    }

    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            ContextValue::Reference(r) => Some(r),
            ContextValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ContextValue::Literal(v) => Some(v),
            ContextValue::Reference(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Value::as_str)
    }
}

impl From<EntityRef> for ContextValue {
    fn from(value: EntityRef) -> Self {
        ContextValue::Reference(value)
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Literal(value.into())
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Literal(value.into())
    }
}

pub type Attrs = BTreeMap<String, ContextValue>;

#[derive(Serialize, Deserialize)]
struct Blob {
    version: u64,
    attrs: Attrs,
}

#[derive(Debug, Clone)]
pub struct ContextCodec {
    resolver: Arc<dyn EntityResolver>,
}

impl ContextCodec {
    pub fn new(resolver: Arc<dyn EntityResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<dyn EntityResolver> {
        &self.resolver
    }

    pub fn encode(&self, attrs: &Attrs) -> FlowResult<String> {
        let blob = Blob {
            version: BLOB_VERSION,
            attrs: attrs.clone(),
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Decodes a blob and checks that every reference still resolves.
    pub fn decode(&self, blob: &str) -> FlowResult<Attrs> {
        if blob.trim().is_empty() {
            return Ok(Attrs::new());
        }
        let raw: Value = serde_json::from_str(blob)?;
        let attrs = match raw {
            Value::Object(obj) if is_tagged(&obj) => {
                serde_json::from_value::<Blob>(Value::Object(obj))?.attrs
            }
            Value::Object(obj) => decode_legacy(obj),
            other => {
                return Err(FlowError::Serialization(format!(
                    "context blob must be an object, got {other}"
                )));
            }
        };

        for value in attrs.values() {
            if let ContextValue::Reference(r) = value {
                if !self.resolver.exists(r) {
                    return Err(FlowError::UnresolvedReference(r.clone()));
                }
            }
        }
        trace!(count = attrs.len(), "decoded context");
        Ok(attrs)
    }
}

/// Tagged blobs carry exactly `version` and `attrs`; anything else is a flat
/// legacy map, whatever keys it happens to use.
fn is_tagged(obj: &Map<String, Value>) -> bool {
    obj.len() == 2
        && obj.get("version").and_then(Value::as_u64) == Some(BLOB_VERSION)
        && obj.get("attrs").is_some_and(Value::is_object)
}

fn decode_legacy(obj: Map<String, Value>) -> Attrs {
    let mut attrs = Attrs::new();
    for (key, value) in obj {
        let Some(caps) = LEGACY_REF_KEY.captures(&key) else {
            attrs.insert(key, ContextValue::Literal(value));
            continue;
        };
        let kind = caps[2].parse::<EntityType>();
        let id = match &value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        match (kind, id) {
            (Ok(kind), Some(id)) => {
                let name = caps[1].to_string();
                attrs.insert(name, ContextValue::Reference(EntityRef::new(kind, id)));
            }
            (Err(e), _) => {
                warn!(key = %key, "legacy context key kept as literal: {e}");
                attrs.insert(key, ContextValue::Literal(value));
            }
            (Ok(_), None) => {
                warn!(key = %key, "legacy reference id is not a scalar, kept as literal");
                attrs.insert(key, ContextValue::Literal(value));
            }
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::InMemoryEntityStore;
    use serde_json::json;

    fn codec() -> (Arc<InMemoryEntityStore>, ContextCodec) {
        let store = Arc::new(InMemoryEntityStore::new());
        store.insert(EntityRef::new(EntityType::Lesson, "l1"), json!({"title": "Fractions"}));
        store.insert(EntityRef::new(EntityType::Thread, "t9"), json!({}));
        let codec = ContextCodec::new(store.clone());
        (store, codec)
    }

    #[test]
    fn literals_and_references_survive_encoding() {
        let (_, codec) = codec();
        let mut attrs = Attrs::new();
        attrs.insert("lesson".into(), ContextValue::reference(EntityType::Lesson, "l1"));
        attrs.insert("tries".into(), ContextValue::literal(3));
        attrs.insert("meta".into(), ContextValue::literal(json!({"a": [1, null, "x"]})));
        // literal values that merely look like legacy reference keys stay literals
        attrs.insert("old_Thread_id".into(), ContextValue::literal("t9"));

        let blob = codec.encode(&attrs).unwrap();
        assert_eq!(codec.decode(&blob).unwrap(), attrs);
    }

    #[test]
    fn empty_blob_decodes_to_empty_map() {
        let (_, codec) = codec();
        assert!(codec.decode("").unwrap().is_empty());
        assert!(codec.decode("{}").unwrap().is_empty());
    }

    #[test]
    fn legacy_flat_blob_is_understood() {
        let (_, codec) = codec();
        let blob = r#"{"lesson_Lesson_id":"l1","thread_Thread_id":"t9","mode":"quiz","odd_Widget_id":"w"}"#;
        let attrs = codec.decode(blob).unwrap();
        assert_eq!(
            attrs.get("lesson"),
            Some(&ContextValue::reference(EntityType::Lesson, "l1"))
        );
        assert_eq!(
            attrs.get("thread"),
            Some(&ContextValue::reference(EntityType::Thread, "t9"))
        );
        assert_eq!(attrs.get("mode").and_then(ContextValue::as_str), Some("quiz"));
        assert_eq!(attrs.get("odd_Widget_id").and_then(ContextValue::as_str), Some("w"));
    }

    #[test]
    fn legacy_blob_with_version_and_attrs_keys_stays_legacy() {
        let (_, codec) = codec();
        let blob = r#"{"version":2,"attrs":{"x":1},"lesson_Lesson_id":"l1"}"#;
        let attrs = codec.decode(blob).unwrap();
        assert_eq!(attrs.get("version"), Some(&ContextValue::literal(2)));
        assert_eq!(attrs.get("attrs"), Some(&ContextValue::literal(json!({"x": 1}))));
        assert_eq!(
            attrs.get("lesson"),
            Some(&ContextValue::reference(EntityType::Lesson, "l1"))
        );
    }

    #[test]
    fn deleted_entity_is_an_unresolved_reference() {
        let (store, codec) = codec();
        let lesson = EntityRef::new(EntityType::Lesson, "l1");
        let mut attrs = Attrs::new();
        attrs.insert("lesson".into(), lesson.clone().into());
        let blob = codec.encode(&attrs).unwrap();

        store.remove(&lesson);
        assert_eq!(codec.decode(&blob), Err(FlowError::UnresolvedReference(lesson)));
    }

    #[test]
    fn non_object_blob_is_rejected() {
        let (_, codec) = codec();
        assert!(matches!(codec.decode("[1,2]"), Err(FlowError::Serialization(_))));
    }
}
