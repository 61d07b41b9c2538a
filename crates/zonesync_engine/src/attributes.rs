//! Service attribute discovery.
//!
//! Every synchronized entity carries four attributes the engine manages:
//! record name, owner name, encoded system fields and a deletion tombstone.
//! Their names are resolved per entity type by an ordered list of strategies;
//! the first strategy that yields a name wins.

use crate::config::DefaultAttributeNames;
use crate::model::{EntityDescription, USER_INFO_SYNC_SCOPES, USER_INFO_SYNC_TYPE};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;
use zonesync_protocol::DatabaseScope;

/// A service role an attribute can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    /// Remote record name.
    RecordName,
    /// Remote owner name.
    OwnerName,
    /// Encoded remote system fields.
    RecordData,
    /// Deletion tombstone flag.
    MarkedForDeletion,
}

impl ServiceRole {
    /// All roles, in resolution order.
    pub const ALL: [ServiceRole; 4] = [
        ServiceRole::RecordName,
        ServiceRole::OwnerName,
        ServiceRole::RecordData,
        ServiceRole::MarkedForDeletion,
    ];

    /// Annotation value naming this role.
    pub fn annotation(&self) -> &'static str {
        match self {
            ServiceRole::RecordName => "recordName",
            ServiceRole::OwnerName => "ownerName",
            ServiceRole::RecordData => "recordData",
            ServiceRole::MarkedForDeletion => "markedForDeletion",
        }
    }

    fn default_name<'a>(&self, defaults: &'a DefaultAttributeNames) -> &'a str {
        match self {
            ServiceRole::RecordName => &defaults.record_name,
            ServiceRole::OwnerName => &defaults.owner_name,
            ServiceRole::RecordData => &defaults.record_data,
            ServiceRole::MarkedForDeletion => &defaults.marked_for_deletion,
        }
    }

    fn strategies(&self) -> &'static [Strategy] {
        match self {
            ServiceRole::MarkedForDeletion => &[
                Strategy::Annotation,
                Strategy::ConventionalDefault,
                Strategy::UndeclaredDefault,
            ],
            _ => &[Strategy::Annotation, Strategy::ConventionalDefault],
        }
    }
}

/// Outcome of resolving one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The attribute playing the role.
    Resolved(String),
    /// No strategy produced a name.
    Unresolvable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// An attribute annotated with the role.
    Annotation,
    /// The configured default name, if the entity declares it.
    ConventionalDefault,
    /// The configured default name even if undeclared.
    UndeclaredDefault,
}

impl Strategy {
    fn apply(
        &self,
        role: ServiceRole,
        entity: &EntityDescription,
        defaults: &DefaultAttributeNames,
    ) -> Resolution {
        let name = match self {
            Strategy::Annotation => entity
                .attributes
                .values()
                .find(|attribute| {
                    attribute
                        .user_info
                        .get(USER_INFO_SYNC_TYPE)
                        .is_some_and(|value| value == role.annotation())
                })
                .map(|attribute| attribute.name.clone()),
            Strategy::ConventionalDefault => {
                let name = role.default_name(defaults);
                entity.attribute(name).map(|_| name.to_string())
            }
            Strategy::UndeclaredDefault => Some(role.default_name(defaults).to_string()),
        };
        name.map_or(Resolution::Unresolvable, Resolution::Resolved)
    }
}

/// Resolved service attribute names of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributeNames {
    /// Entity name.
    pub entity: String,
    /// Scopes the entity participates in.
    pub scopes: BTreeSet<DatabaseScope>,
    /// Record name attribute.
    pub record_name: String,
    /// Owner name attribute.
    pub owner_name: String,
    /// System fields attribute.
    pub record_data: String,
    /// Tombstone attribute.
    pub marked_for_deletion: String,
}

impl ServiceAttributeNames {
    /// Returns true if `name` is one of the service attributes.
    pub fn contains(&self, name: &str) -> bool {
        name == self.record_name
            || name == self.owner_name
            || name == self.record_data
            || name == self.marked_for_deletion
    }

    /// Returns true if records of this entity may live in `scope`.
    pub fn participates_in(&self, scope: DatabaseScope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// Resolves and caches service attribute names per entity type.
pub struct AttributeResolver {
    defaults: DefaultAttributeNames,
    cache: Mutex<HashMap<String, Option<Arc<ServiceAttributeNames>>>>,
}

impl AttributeResolver {
    /// Creates a resolver with the given conventional names.
    pub fn new(defaults: DefaultAttributeNames) -> Self {
        Self {
            defaults,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a single role, trying strategies in order.
    pub fn resolve_role(&self, entity: &EntityDescription, role: ServiceRole) -> Resolution {
        role.strategies()
            .iter()
            .map(|strategy| strategy.apply(role, entity, &self.defaults))
            .find(|resolution| matches!(resolution, Resolution::Resolved(_)))
            .unwrap_or(Resolution::Unresolvable)
    }

    /// Resolves all roles of an entity without caching.
    ///
    /// Returns `None` if any role is unresolvable.
    pub fn discover(&self, entity: &EntityDescription) -> Option<ServiceAttributeNames> {
        let mut names = Vec::with_capacity(ServiceRole::ALL.len());
        for role in ServiceRole::ALL {
            match self.resolve_role(entity, role) {
                Resolution::Resolved(name) => names.push(name),
                Resolution::Unresolvable => return None,
            }
        }
        let [record_name, owner_name, record_data, marked_for_deletion]: [String; 4] =
            names.try_into().ok()?;

        Some(ServiceAttributeNames {
            entity: entity.name.clone(),
            scopes: parse_scopes(entity),
            record_name,
            owner_name,
            record_data,
            marked_for_deletion,
        })
    }

    /// Returns the cached names of an entity, resolving them on first use.
    ///
    /// Excluded entities are logged once.
    pub fn service_attributes(
        &self,
        entity: &EntityDescription,
    ) -> Option<Arc<ServiceAttributeNames>> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&entity.name) {
            return cached.clone();
        }
        let resolved = self.discover(entity).map(Arc::new);
        if resolved.is_none() {
            warn!(
                entity = %entity.name,
                "entity has no resolvable service attributes, excluded from sync"
            );
        }
        cache.insert(entity.name.clone(), resolved.clone());
        resolved
    }
}

fn parse_scopes(entity: &EntityDescription) -> BTreeSet<DatabaseScope> {
    let mut scopes = BTreeSet::new();
    if let Some(declared) = entity.user_info.get(USER_INFO_SYNC_SCOPES) {
        for name in declared.split(',').filter(|name| !name.trim().is_empty()) {
            match DatabaseScope::parse(name) {
                Some(scope) => {
                    scopes.insert(scope);
                }
                None => warn!(entity = %entity.name, scope = name, "unknown sync scope ignored"),
            }
        }
    }
    if scopes.is_empty() {
        scopes.insert(DatabaseScope::Private);
    }
    scopes
}
