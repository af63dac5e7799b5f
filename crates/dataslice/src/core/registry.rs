//! Schema registry for explicit dependency injection.
//!
//! The [`SchemaRegistry`] maps entity types to their descriptors. It is
//! constructed explicitly and passed by reference to graph building and run
//! validation, so tests build a fresh registry per case.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{Result, SliceError};

use super::schema::{EntityDescriptor, EntityType};

/// Non-fatal problem found while validating a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaWarning {
    /// A relation names a field the entity does not declare.
    UndeclaredRelationField { entity: EntityType, field: String },
    /// A relation targets an entity that is not registered yet.
    UnregisteredTarget {
        entity: EntityType,
        field: String,
        target: EntityType,
    },
    /// The primary key field is not declared.
    UndeclaredPrimaryKey { entity: EntityType, field: String },
}

impl fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaWarning::UndeclaredRelationField { entity, field } => {
                write!(f, "{entity}.{field} is a relation but not a declared field")
            }
            SchemaWarning::UnregisteredTarget {
                entity,
                field,
                target,
            } => write!(f, "{entity}.{field} targets {target}, which is not registered yet"),
            SchemaWarning::UndeclaredPrimaryKey { entity, field } => {
                write!(f, "{entity} primary key '{field}' is not a declared field")
            }
        }
    }
}

/// Registry of entity descriptors, kept in registration order.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entries: Vec<EntityDescriptor>,
    index: HashMap<EntityType, usize>,
}

impl SchemaRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// Fails with [`SliceError::DuplicateEntity`] if the entity type is already
    /// registered. Validation problems are logged and returned as warnings.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<Vec<SchemaWarning>> {
        if self.index.contains_key(&descriptor.entity) {
            return Err(SliceError::DuplicateEntity(descriptor.entity));
        }

        let descriptor = descriptor.normalized();
        let warnings = self.validate(&descriptor);
        for w in &warnings {
            warn!("Schema warning: {}", w);
        }

        debug!(
            "Registered {} ({} fields, {} relations)",
            descriptor.entity,
            descriptor.fields.len(),
            descriptor.relations.len()
        );
        self.index
            .insert(descriptor.entity.clone(), self.entries.len());
        self.entries.push(descriptor);
        Ok(warnings)
    }

    /// Register several descriptors in order, collecting warnings.
    pub fn register_all<I>(&mut self, descriptors: I) -> Result<Vec<SchemaWarning>>
    where
        I: IntoIterator<Item = EntityDescriptor>,
    {
        let mut warnings = Vec::new();
        for d in descriptors {
            warnings.extend(self.register(d)?);
        }
        Ok(warnings)
    }

    /// Check a descriptor against the current registry contents.
    pub fn validate(&self, descriptor: &EntityDescriptor) -> Vec<SchemaWarning> {
        let mut warnings = Vec::new();

        if !descriptor.has_field(&descriptor.primary_key) {
            warnings.push(SchemaWarning::UndeclaredPrimaryKey {
                entity: descriptor.entity.clone(),
                field: descriptor.primary_key.clone(),
            });
        }

        for relation in &descriptor.relations {
            if !descriptor.has_field(&relation.field) {
                warnings.push(SchemaWarning::UndeclaredRelationField {
                    entity: descriptor.entity.clone(),
                    field: relation.field.clone(),
                });
            }
            // Self-references resolve to the descriptor being registered.
            if relation.target != descriptor.entity && !self.contains(&relation.target) {
                warnings.push(SchemaWarning::UnregisteredTarget {
                    entity: descriptor.entity.clone(),
                    field: relation.field.clone(),
                    target: relation.target.clone(),
                });
            }
        }

        warnings
    }

    pub fn lookup(&self, entity: &EntityType) -> Option<&EntityDescriptor> {
        self.index.get(entity).map(|&i| &self.entries[i])
    }

    /// Like [`lookup`](Self::lookup) but fails with `UnregisteredEntity`.
    pub fn get(&self, entity: &EntityType) -> Result<&EntityDescriptor> {
        self.lookup(entity)
            .ok_or_else(|| SliceError::UnregisteredEntity(entity.clone()))
    }

    pub fn contains(&self, entity: &EntityType) -> bool {
        self.index.contains_key(entity)
    }

    /// Registration index, used as the ordering tie-break.
    pub fn position(&self, entity: &EntityType) -> Option<usize> {
        self.index.get(entity).copied()
    }

    /// Unregister everything.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
