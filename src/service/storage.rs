//! Storage seam: the composable query plus CRUD and pivot operations an engine provides.

use crate::config::{EntityDescriptor, EntityRegistry, FieldInfo, FieldKind, RelationDescriptor, RelationKind};
use crate::error::AppError;
use crate::query::{grammar, Operator, QueryBuilder, WhereClause};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One entity row as a JSON object.
pub type Record = Map<String, Value>;

/// Numeric primary key, as accepted on the route surface.
pub type EntityId = i64;

/// Outcome of a sync, by related id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncChanges {
    pub attached: Vec<EntityId>,
    pub detached: Vec<EntityId>,
    pub updated: Vec<EntityId>,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Query: QueryBuilder + Send + 'static;

    fn registry(&self) -> &EntityRegistry;

    /// Fresh query over every row of `entity`.
    fn query(&self, entity: &EntityDescriptor) -> Self::Query;

    /// Query over the rows `owner` reaches through `relation` (the relation's to-many accessor).
    fn related_query(
        &self,
        owner_entity: &EntityDescriptor,
        owner: &Record,
        relation: &RelationDescriptor,
    ) -> Result<Self::Query, AppError>;

    async fn fetch_all(&self, query: Self::Query) -> Result<Vec<Record>, AppError>;

    async fn fetch_first(&self, mut query: Self::Query) -> Result<Option<Record>, AppError> {
        query.take(1);
        Ok(self.fetch_all(query).await?.into_iter().next())
    }

    /// Narrow `query` to the row whose primary key is `id`.
    async fn find(
        &self,
        entity: &EntityDescriptor,
        mut query: Self::Query,
        id: EntityId,
    ) -> Result<Option<Record>, AppError> {
        query.where_clause(&WhereClause::eq(entity.primary_key.as_str(), id));
        self.fetch_first(query).await
    }

    async fn insert(&self, entity: &EntityDescriptor, values: Record) -> Result<Record, AppError>;

    /// `None` when no row has `id`.
    async fn update(&self, entity: &EntityDescriptor, id: EntityId, values: Record) -> Result<Option<Record>, AppError>;

    /// Returns the removed row, `None` when no row has `id`.
    async fn delete(&self, entity: &EntityDescriptor, id: EntityId) -> Result<Option<Record>, AppError>;

    /// Related ids currently linked to `owner_id` through a pivot relation.
    async fn related_ids(
        &self,
        entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
    ) -> Result<Vec<EntityId>, AppError>;

    /// Link `related_id`. An existing link gets the supplied attributes merged over its own.
    async fn attach(
        &self,
        entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
        attributes: &PivotAttributes,
    ) -> Result<(), AppError>;

    /// Returns whether a link was removed.
    async fn detach(
        &self,
        entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
    ) -> Result<bool, AppError>;

    /// Make `related_ids` the linked set. Without `detaching`, links outside the set are kept.
    async fn sync(
        &self,
        entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_ids: &[EntityId],
        attributes: &PivotAttributes,
        detaching: bool,
    ) -> Result<SyncChanges, AppError> {
        let current = self.related_ids(entity, owner_id, relation).await?;
        let mut changes = SyncChanges::default();
        if detaching {
            for id in current.iter().filter(|id| !related_ids.contains(id)) {
                if self.detach(entity, owner_id, relation, *id).await? {
                    changes.detached.push(*id);
                }
            }
        }
        for id in related_ids {
            self.attach(entity, owner_id, relation, *id, attributes).await?;
            if !current.contains(id) {
                changes.attached.push(*id);
            } else if !attributes.is_empty() {
                changes.updated.push(*id);
            }
        }
        Ok(changes)
    }
}

/// Restriction of a target entity's rows to those one owner record reaches.
#[derive(Clone, Debug, PartialEq)]
pub enum RelationScope {
    /// Target rows whose `column` equals `value`.
    Column { column: String, value: Value },
    /// Target rows linked to `owner` through a pivot table.
    Pivot {
        table: String,
        pivot_key: String,
        related_pivot_key: String,
        pivot_fields: Vec<String>,
        owner: Value,
    },
}

impl RelationScope {
    /// Scope for `relation` seen from `owner`. A missing key value scopes to nothing.
    pub fn for_relation(owner_entity: &EntityDescriptor, owner: &Record, relation: &RelationDescriptor, target: &EntityDescriptor) -> Self {
        let key = |name: &str| owner.get(name).cloned().unwrap_or(Value::Null);
        match &relation.kind {
            RelationKind::BelongsTo { foreign_key } => RelationScope::Column {
                column: target.primary_key.clone(),
                value: key(foreign_key),
            },
            RelationKind::HasOne { foreign_key } | RelationKind::HasMany { foreign_key } => RelationScope::Column {
                column: foreign_key.clone(),
                value: key(&owner_entity.primary_key),
            },
            RelationKind::BelongsToMany {
                pivot_table,
                pivot_key,
                related_pivot_key,
                pivot_fields,
            } => RelationScope::Pivot {
                table: pivot_table.clone(),
                pivot_key: pivot_key.clone(),
                related_pivot_key: related_pivot_key.clone(),
                pivot_fields: pivot_fields.clone(),
                owner: key(&owner_entity.primary_key),
            },
        }
    }
}

/// Extra columns written onto a pivot row. Values are scalars; keys are identifiers
/// distinct from the pivot's own key columns and, when the relation declares
/// `pivot_fields`, one of those.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PivotAttributes(BTreeMap<String, Value>);

impl PivotAttributes {
    pub fn new() -> Self {
        PivotAttributes::default()
    }

    /// Validate a request body against `relation`. A missing or empty body is no attributes.
    pub fn from_body(body: &Value, relation: &RelationDescriptor) -> Result<Self, AppError> {
        let RelationKind::BelongsToMany {
            pivot_key,
            related_pivot_key,
            pivot_fields,
            ..
        } = &relation.kind
        else {
            return Err(AppError::BadRequest(format!(
                "relation '{}' has no pivot table",
                relation.name
            )));
        };
        let map = match body {
            Value::Null => return Ok(PivotAttributes::new()),
            Value::Object(m) => m,
            _ => return Err(AppError::Validation("pivot attributes must be a JSON object".into())),
        };
        let mut out = BTreeMap::new();
        for (key, value) in map {
            if !is_identifier(key) {
                return Err(AppError::Validation(format!("invalid pivot attribute name '{}'", key)));
            }
            if key == pivot_key || key == related_pivot_key {
                return Err(AppError::Validation(format!("pivot attribute '{}' is a key column", key)));
            }
            if !pivot_fields.is_empty() && !pivot_fields.contains(key) {
                return Err(AppError::Validation(format!(
                    "'{}' is not a pivot field of '{}'",
                    key, relation.name
                )));
            }
            if value.is_array() || value.is_object() {
                return Err(AppError::Validation(format!("pivot attribute '{}' must be a scalar", key)));
            }
            out.insert(key.clone(), value.clone());
        }
        Ok(PivotAttributes(out))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overwrite the supplied keys on `row`, leaving the rest untouched.
    pub fn merge_into(&self, row: &mut Record) {
        for (k, v) in &self.0 {
            row.insert(k.clone(), v.clone());
        }
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Convert a query-string value to the JSON value a field of this kind holds.
/// Pattern operators always compare text.
pub fn coerce_value(field: &FieldInfo, raw: &str, op: Operator) -> Result<Value, AppError> {
    if op.is_pattern() {
        return Ok(Value::String(raw.to_string()));
    }
    if raw.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    let invalid = || AppError::QueryParse(format!("invalid value '{}' for field '{}'", raw, field.name));
    Ok(match field.kind {
        FieldKind::Integer => Value::from(raw.parse::<i64>().map_err(|_| invalid())?),
        FieldKind::Float => {
            let f = raw.parse::<f64>().map_err(|_| invalid())?;
            serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(invalid)?
        }
        FieldKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(invalid()),
        },
        FieldKind::Timestamp => Value::String(normalize_timestamp(raw)?),
        FieldKind::Date | FieldKind::Text => Value::String(raw.to_string()),
        FieldKind::Json => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    })
}

/// RFC 3339 in UTC with a `Z` suffix, the canonical text form of stored timestamps.
pub fn normalize_timestamp(raw: &str) -> Result<String, AppError> {
    Ok(grammar::parse_timestamp(raw)?.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Primary key value of a record as an id.
pub fn record_id(entity: &EntityDescriptor, record: &Record) -> Option<EntityId> {
    record.get(&entity.primary_key).and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roles() -> RelationDescriptor {
        RelationDescriptor {
            name: "roles".into(),
            target: "role".into(),
            kind: RelationKind::BelongsToMany {
                pivot_table: "role_user".into(),
                pivot_key: "user_id".into(),
                related_pivot_key: "role_id".into(),
                pivot_fields: vec![],
            },
        }
    }

    #[test]
    fn pivot_attributes_accept_scalars() {
        let attrs = PivotAttributes::from_body(&json!({"granted_by": "admin", "level": 2}), &roles()).unwrap();
        assert_eq!(attrs.get("level"), Some(&json!(2)));
        assert!(PivotAttributes::from_body(&Value::Null, &roles()).unwrap().is_empty());
    }

    #[test]
    fn pivot_attributes_reject_bad_shapes() {
        assert!(PivotAttributes::from_body(&json!([1]), &roles()).is_err());
        assert!(PivotAttributes::from_body(&json!({"nested": {"a": 1}}), &roles()).is_err());
        assert!(PivotAttributes::from_body(&json!({"role_id": 4}), &roles()).is_err());
        assert!(PivotAttributes::from_body(&json!({"bad key": 1}), &roles()).is_err());
    }

    #[test]
    fn pivot_attributes_respect_declared_fields() {
        let mut rel = roles();
        if let RelationKind::BelongsToMany { pivot_fields, .. } = &mut rel.kind {
            pivot_fields.push("level".into());
        }
        assert!(PivotAttributes::from_body(&json!({"level": 1}), &rel).is_ok());
        assert!(PivotAttributes::from_body(&json!({"note": "x"}), &rel).is_err());
    }

    #[test]
    fn merge_overwrites_only_supplied_keys() {
        let mut attrs = PivotAttributes::new();
        attrs.insert("level", json!(3));
        let mut row = json!({"user_id": 1, "role_id": 2, "level": 1, "note": "keep"})
            .as_object()
            .unwrap()
            .clone();
        attrs.merge_into(&mut row);
        assert_eq!(row["level"], json!(3));
        assert_eq!(row["note"], json!("keep"));
    }

    #[test]
    fn coerces_by_field_kind() {
        let age = FieldInfo { name: "age".into(), kind: FieldKind::Integer };
        assert_eq!(coerce_value(&age, "18", Operator::Gt).unwrap(), json!(18));
        assert!(coerce_value(&age, "abc", Operator::Eq).is_err());
        assert_eq!(coerce_value(&age, "1%", Operator::Like).unwrap(), json!("1%"));
        let at = FieldInfo { name: "created_at".into(), kind: FieldKind::Timestamp };
        assert_eq!(coerce_value(&at, "2024-01-02", Operator::Ge).unwrap(), json!("2024-01-02T00:00:00Z"));
    }
}
