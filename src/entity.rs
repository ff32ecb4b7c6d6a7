use std::{fmt, str::FromStr};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of domain types a flow context may reference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum EntityType {
    Course,
    Unit,
    Lesson,
    Thread,
    Response,
    ErrorModel,
    Faq,
    Update,
    Student,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Course,
        EntityType::Unit,
        EntityType::Lesson,
        EntityType::Thread,
        EntityType::Response,
        EntityType::ErrorModel,
        EntityType::Faq,
        EntityType::Update,
        EntityType::Student,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Course => "Course",
            EntityType::Unit => "Unit",
            EntityType::Lesson => "Lesson",
            EntityType::Thread => "Thread",
            EntityType::Response => "Response",
            EntityType::ErrorModel => "ErrorModel",
            EntityType::Faq => "Faq",
            EntityType::Update => "Update",
            EntityType::Student => "Student",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown entity type `{s}`"))
    }
}

/// A typed pointer to a domain record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityType, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = String;

    /// Parses `Kind:id`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected `Kind:id`, got `{s}`"))?;
        Ok(EntityRef::new(kind.parse()?, id))
    }
}

/// A fetched domain record. The payload is opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub reference: EntityRef,
    pub data: Value,
}

impl Entity {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Looks up domain records by reference. Constructed at startup and handed to
/// the context codec and the behaviors.
pub trait EntityResolver: Send + Sync + fmt::Debug {
    fn fetch(&self, reference: &EntityRef) -> Option<Entity>;

    /// All entities of `kind` whose `parent` field equals `parent.id`.
    fn children(&self, kind: EntityType, parent: &EntityRef) -> Vec<Entity>;

    fn exists(&self, reference: &EntityRef) -> bool {
        self.fetch(reference).is_some()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: DashMap<EntityRef, Value>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: EntityRef, data: Value) {
        self.entities.insert(reference, data);
    }

    pub fn remove(&self, reference: &EntityRef) -> Option<Value> {
        self.entities.remove(reference).map(|(_, v)| v)
    }

    pub fn update(&self, reference: &EntityRef, f: impl FnOnce(&mut Value)) -> bool {
        match self.entities.get_mut(reference) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityResolver for InMemoryEntityStore {
    fn fetch(&self, reference: &EntityRef) -> Option<Entity> {
        self.entities.get(reference).map(|data| Entity {
            reference: reference.clone(),
            data: data.value().clone(),
        })
    }

    fn children(&self, kind: EntityType, parent: &EntityRef) -> Vec<Entity> {
        let mut out: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.key().kind == kind)
            .filter(|e| e.value().get("parent").and_then(Value::as_str) == Some(parent.id.as_str()))
            .map(|e| Entity {
                reference: e.key().clone(),
                data: e.value().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.reference.cmp(&b.reference));
        out
    }
}
