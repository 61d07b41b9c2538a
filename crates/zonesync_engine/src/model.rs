//! Local object graph: entity descriptions, objects and predicates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Attribute annotation naming the service role of an attribute.
pub const USER_INFO_SYNC_TYPE: &str = "syncType";

/// Entity annotation listing the scopes an entity participates in.
pub const USER_INFO_SYNC_SCOPES: &str = "syncScopes";

/// Relationship annotation marking a to-many relationship as synchronized.
pub const USER_INFO_SYNC_ENABLED: &str = "syncEnabled";

/// Attribute annotation marking a binary attribute as an uploaded asset.
pub const USER_INFO_ASSET: &str = "asset";

/// Free-form annotations attached to entities, attributes and relationships.
pub type UserInfo = BTreeMap<String, String>;

/// Identifier of an object in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalObjectId(Uuid);

impl LocalObjectId {
    /// Creates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An attribute value of a local object.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// No value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary value.
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
}

impl AttributeValue {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Floating point.
    Double,
    /// UTF-8 text.
    Text,
    /// Binary.
    Bytes,
    /// Timestamp in milliseconds.
    Timestamp,
}

/// Description of an entity attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescription {
    /// Attribute name.
    pub name: String,
    /// Declared type.
    pub kind: AttributeKind,
    /// Annotations.
    pub user_info: UserInfo,
}

impl AttributeDescription {
    /// Returns true if the attribute is uploaded as an asset file.
    pub fn is_asset(&self) -> bool {
        self.kind == AttributeKind::Bytes && flag(&self.user_info, USER_INFO_ASSET)
    }
}

/// Description of a relationship between entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescription {
    /// Relationship name.
    pub name: String,
    /// Destination entity name.
    pub destination: String,
    /// Whether the relationship holds many objects.
    pub to_many: bool,
    /// Annotations.
    pub user_info: UserInfo,
}

impl RelationshipDescription {
    /// Returns true if changes to this relationship are synchronized.
    ///
    /// To-one relationships always are; to-many relationships only when
    /// annotated with `syncEnabled`.
    pub fn is_sync_enabled(&self) -> bool {
        !self.to_many || flag(&self.user_info, USER_INFO_SYNC_ENABLED)
    }
}

fn flag(user_info: &UserInfo, key: &str) -> bool {
    user_info
        .get(key)
        .is_some_and(|value| matches!(value.trim(), "true" | "1" | "yes"))
}

/// Description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescription {
    /// Entity name, equal to the remote record type.
    pub name: String,
    /// Attributes by name.
    pub attributes: BTreeMap<String, AttributeDescription>,
    /// Relationships by name.
    pub relationships: BTreeMap<String, RelationshipDescription>,
    /// Annotations.
    pub user_info: UserInfo,
}

impl EntityDescription {
    /// Creates an entity with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            user_info: UserInfo::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.with_annotated_attribute(name, kind, UserInfo::new())
    }

    /// Adds an attribute carrying annotations.
    pub fn with_annotated_attribute(
        mut self,
        name: impl Into<String>,
        kind: AttributeKind,
        user_info: UserInfo,
    ) -> Self {
        let name = name.into();
        self.attributes.insert(
            name.clone(),
            AttributeDescription {
                name,
                kind,
                user_info,
            },
        );
        self
    }

    /// Adds a to-one relationship.
    pub fn with_to_one(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.insert_relationship(name.into(), destination.into(), false, UserInfo::new());
        self
    }

    /// Adds a to-many relationship.
    pub fn with_to_many(
        mut self,
        name: impl Into<String>,
        destination: impl Into<String>,
        sync_enabled: bool,
    ) -> Self {
        let mut user_info = UserInfo::new();
        if sync_enabled {
            user_info.insert(USER_INFO_SYNC_ENABLED.into(), "true".into());
        }
        self.insert_relationship(name.into(), destination.into(), true, user_info);
        self
    }

    /// Adds an entity annotation.
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    fn insert_relationship(
        &mut self,
        name: String,
        destination: String,
        to_many: bool,
        user_info: UserInfo,
    ) {
        self.relationships.insert(
            name.clone(),
            RelationshipDescription {
                name,
                destination,
                to_many,
                user_info,
            },
        );
    }

    /// Gets an attribute description.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.get(name)
    }

    /// Gets a relationship description.
    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescription> {
        self.relationships.get(name)
    }
}

/// The set of entity types of a local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectModel {
    entities: BTreeMap<String, EntityDescription>,
}

impl ObjectModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity.
    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Gets an entity by name.
    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    /// Iterates over all entities.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescription> {
        self.entities.values()
    }
}

/// An entity instance in the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject {
    /// Local identifier.
    pub id: LocalObjectId,
    /// Entity name.
    pub entity: String,
    /// Attribute values by name. Absent means null.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Related objects by relationship name.
    pub relationships: BTreeMap<String, BTreeSet<LocalObjectId>>,
}

impl LocalObject {
    /// Creates an object with a fresh identifier.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            id: LocalObjectId::new(),
            entity: entity.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Gets an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).filter(|value| !value.is_null())
    }

    /// Sets an attribute value. Setting `Null` removes it.
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        let name = name.into();
        if value.is_null() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    /// Sets an attribute value, builder style.
    pub fn with(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.set(name, value);
        self
    }

    /// Gets a text attribute.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(AttributeValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Gets a binary attribute.
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name) {
            Some(AttributeValue::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Gets a boolean attribute; null reads as false.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(AttributeValue::Bool(true)))
    }

    /// Related objects of a relationship.
    pub fn related(&self, name: &str) -> impl Iterator<Item = LocalObjectId> + '_ {
        self.relationships
            .get(name)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    /// Replaces the related objects of a relationship.
    pub fn set_related(&mut self, name: impl Into<String>, ids: BTreeSet<LocalObjectId>) {
        let name = name.into();
        if ids.is_empty() {
            self.relationships.remove(&name);
        } else {
            self.relationships.insert(name, ids);
        }
    }

    /// Adds a related object to a relationship.
    pub fn relate(&mut self, name: impl Into<String>, id: LocalObjectId) {
        self.relationships.entry(name.into()).or_default().insert(id);
    }
}

/// A minimal equality predicate over attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every object.
    All,
    /// Matches objects whose attribute equals the value.
    Equals {
        /// Attribute name.
        attribute: String,
        /// Expected value. `Null` matches absent attributes.
        value: AttributeValue,
    },
    /// Matches objects satisfying all predicates.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Creates an equality predicate.
    pub fn equals(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Predicate::Equals {
            attribute: attribute.into(),
            value,
        }
    }

    /// Returns true if the object satisfies the predicate.
    pub fn matches(&self, object: &LocalObject) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Equals { attribute, value } => match object.get(attribute) {
                Some(actual) => actual == value,
                None => value.is_null(),
            },
            Predicate::And(predicates) => predicates.iter().all(|p| p.matches(object)),
        }
    }
}
