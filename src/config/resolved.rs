//! Resolved entity model: config validated and flattened for runtime use.

use crate::config::FieldKind;
use crate::query::OrderBy;
use std::collections::HashMap;

/// How many related records a relation yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// Storage shape of a relation.
#[derive(Clone, Debug, PartialEq)]
pub enum RelationKind {
    /// We hold `foreign_key` pointing at the target's primary key.
    BelongsTo { foreign_key: String },
    /// Target holds `foreign_key` pointing at our primary key; at most one row.
    HasOne { foreign_key: String },
    /// Target holds `foreign_key` pointing at our primary key.
    HasMany { foreign_key: String },
    /// Association rows in `pivot_table` link our key to the target key.
    BelongsToMany {
        pivot_table: String,
        pivot_key: String,
        related_pivot_key: String,
        pivot_fields: Vec<String>,
    },
}

#[derive(Clone, Debug)]
pub struct RelationDescriptor {
    pub name: String,
    /// Entity name of the related type.
    pub target: String,
    pub kind: RelationKind,
}

impl RelationDescriptor {
    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            RelationKind::BelongsTo { .. } | RelationKind::HasOne { .. } => Cardinality::ToOne,
            RelationKind::HasMany { .. } | RelationKind::BelongsToMany { .. } => Cardinality::ToMany,
        }
    }

    /// Only association-table relations accept attach, detach and sync.
    pub fn is_mutable(&self) -> bool {
        matches!(self.kind, RelationKind::BelongsToMany { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub primary_key: String,
    pub fields: Vec<FieldInfo>,
    pub relations: Vec<RelationDescriptor>,
    /// Explicitly declared field for `from`/`to` range filters.
    pub temporal_field: Option<String>,
    pub timestamps: bool,
    pub default_order: Vec<OrderBy>,
    pub handler: Option<String>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.relations.iter().map(|r| r.name.clone()).collect()
    }

    pub fn first_date_field(&self) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.kind.is_date_like())
    }
}

/// All registered entities. Immutable after startup.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    pub entities: Vec<EntityDescriptor>,
    pub by_name: HashMap<String, usize>,
}

impl EntityRegistry {
    pub fn get(&self, name: &str) -> Option<&EntityDescriptor> {
        self.by_name.get(name).and_then(|&i| self.entities.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter()
    }
}
