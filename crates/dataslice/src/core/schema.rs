//! Entity descriptors: fields, foreign-key relations and output naming.
//!
//! These types are the strongly-typed replacement for runtime model
//! introspection. A descriptor is declared once per entity type, either in
//! code through [`EntityDescriptor::builder`] or in YAML configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SliceError;

/// Stable identifier of an entity type (analogous to a model or table name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical kind of a field, used for SQL casts and id generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    BigInt,
    Text,
    Boolean,
    Decimal,
    Float,
    Date,
    Timestamp,
    Uuid,
    Json,
    /// Any other SQL type, spelled as the target database expects it.
    Other(String),
}

impl FieldKind {
    /// PostgreSQL type name used when casting text values.
    pub fn sql_type(&self) -> &str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::BigInt => "bigint",
            FieldKind::Text => "text",
            FieldKind::Boolean => "boolean",
            FieldKind::Decimal => "numeric",
            FieldKind::Float => "double precision",
            FieldKind::Date => "date",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Uuid => "uuid",
            FieldKind::Json => "jsonb",
            FieldKind::Other(t) => t,
        }
    }

    /// Whether values of this kind can be generated from an integer sequence.
    pub fn is_integer(&self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::BigInt)
    }
}

/// A single field of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
}

/// Foreign-key relation: `field` on the owning entity references `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub field: String,
    pub target: EntityType,
}

/// A reference to one column of one entity, written `Entity.field`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ColumnRef {
    pub entity: EntityType,
    pub field: String,
}

impl ColumnRef {
    pub fn new(entity: impl Into<EntityType>, field: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

impl FromStr for ColumnRef {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((entity, field)) if !entity.is_empty() && !field.is_empty() => {
                Ok(ColumnRef::new(entity, field))
            }
            _ => Err(SliceError::InvalidExclusion(format!(
                "{s} (expected Entity.field)"
            ))),
        }
    }
}

impl TryFrom<String> for ColumnRef {
    type Error = SliceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ColumnRef> for String {
    fn from(c: ColumnRef) -> Self {
        c.to_string()
    }
}

/// Descriptor for one registered entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type identifier.
    #[serde(rename = "name")]
    pub entity: EntityType,

    /// Fields in declaration order.
    pub fields: Vec<FieldDescriptor>,

    /// Foreign-key relations in declaration order.
    #[serde(default)]
    pub relations: Vec<Relation>,

    /// File stem / table name (default: lowercased entity name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,

    /// Primary key field (default: "id").
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Relational schema (default: "public").
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl EntityDescriptor {
    /// Start building a descriptor for `entity`.
    pub fn builder(entity: impl Into<EntityType>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder::new(entity.into())
    }

    /// Name of the file (without extension) or table holding this entity.
    pub fn output_name(&self) -> &str {
        self.output_name
            .as_deref()
            .unwrap_or_else(|| self.entity.as_str())
    }

    /// Fill in derived defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.output_name.is_none() {
            self.output_name = Some(self.entity.as_str().to_lowercase());
        }
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Nullability of a field; undeclared fields are treated as nullable.
    pub fn is_nullable(&self, name: &str) -> bool {
        self.field(name).map(|f| f.nullable).unwrap_or(true)
    }

    pub fn primary_key_field(&self) -> Option<&FieldDescriptor> {
        self.field(&self.primary_key)
    }

    /// Relation declared on `field`, if any.
    pub fn relation(&self, field: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.field == field)
    }

    /// Field names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether any relation points back at this entity.
    pub fn is_self_referencing(&self) -> bool {
        self.relations.iter().any(|r| r.target == self.entity)
    }
}

/// Builder for [`EntityDescriptor`].
#[derive(Debug, Clone)]
pub struct EntityDescriptorBuilder {
    descriptor: EntityDescriptor,
}

impl EntityDescriptorBuilder {
    fn new(entity: EntityType) -> Self {
        Self {
            descriptor: EntityDescriptor {
                entity,
                fields: Vec::new(),
                relations: Vec::new(),
                output_name: None,
                primary_key: default_primary_key(),
                schema: default_schema(),
            },
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            nullable: false,
        });
        self
    }

    pub fn nullable_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
            nullable: true,
        });
        self
    }

    /// Declare a non-nullable bigint foreign key.
    pub fn foreign_key(self, name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.relation_field(name.into(), target.into(), false)
    }

    /// Declare a nullable bigint foreign key.
    pub fn nullable_foreign_key(
        self,
        name: impl Into<String>,
        target: impl Into<EntityType>,
    ) -> Self {
        self.relation_field(name.into(), target.into(), true)
    }

    /// Declare a relation on a field added separately (or not at all).
    pub fn relation(mut self, field: impl Into<String>, target: impl Into<EntityType>) -> Self {
        self.descriptor.relations.push(Relation {
            field: field.into(),
            target: target.into(),
        });
        self
    }

    fn relation_field(mut self, name: String, target: EntityType, nullable: bool) -> Self {
        self.descriptor.fields.push(FieldDescriptor {
            name: name.clone(),
            kind: FieldKind::BigInt,
            nullable,
        });
        self.descriptor.relations.push(Relation {
            field: name,
            target,
        });
        self
    }

    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.output_name = Some(name.into());
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.descriptor.primary_key = name.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.descriptor.schema = schema.into();
        self
    }

    pub fn build(self) -> EntityDescriptor {
        self.descriptor.normalized()
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> EntityDescriptor {
        EntityDescriptor::builder("Shop")
            .field("id", FieldKind::BigInt)
            .foreign_key("tenant_id", "Tenant")
            .nullable_field("name", FieldKind::Text)
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let d = shop();
        assert_eq!(d.output_name(), "shop");
        assert_eq!(d.primary_key, "id");
        assert_eq!(d.schema, "public");
        assert_eq!(d.column_names(), vec!["id", "tenant_id", "name"]);
        assert_eq!(d.relation("tenant_id").unwrap().target.as_str(), "Tenant");
        assert!(!d.is_nullable("tenant_id"));
        assert!(d.is_nullable("name"));
        assert!(!d.is_self_referencing());
    }

    #[test]
    fn test_column_ref_parse() {
        let c: ColumnRef = "Author.favorite_book".parse().unwrap();
        assert_eq!(c.entity.as_str(), "Author");
        assert_eq!(c.field, "favorite_book");
        assert_eq!(c.to_string(), "Author.favorite_book");

        assert!("Author".parse::<ColumnRef>().is_err());
        assert!(".field".parse::<ColumnRef>().is_err());
    }

    #[test]
    fn test_descriptor_from_yaml() {
        let yaml = r#"
name: Book
fields:
  - { name: id, kind: big_int }
  - { name: author_id, kind: big_int }
  - { name: title, kind: text, nullable: true }
relations:
  - { field: author_id, target: Author }
"#;
        let d: EntityDescriptor = serde_yaml::from_str(yaml).unwrap();
        let d = d.normalized();
        assert_eq!(d.output_name(), "book");
        assert_eq!(d.relations.len(), 1);
        assert!(d.primary_key_field().unwrap().kind.is_integer());
    }

    #[test]
    fn test_field_kind_sql_type() {
        assert_eq!(FieldKind::BigInt.sql_type(), "bigint");
        assert_eq!(FieldKind::Other("geometry".into()).sql_type(), "geometry");
        assert!(!FieldKind::Uuid.is_integer());
    }
}
