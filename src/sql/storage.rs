//! PostgreSQL storage engine: executes the SQL builder's statements with sqlx.

use crate::config::{EntityDescriptor, EntityRegistry, RelationDescriptor, RelationKind};
use crate::error::AppError;
use crate::service::{EntityId, PivotAttributes, Record, RelationScope, Storage};
use crate::sql::{
    delete, insert, pivot_delete, pivot_exists, pivot_insert, pivot_related_ids, pivot_update, update, PgBindValue,
    PivotKeys, QueryBuf, SqlQuery,
};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
    max_limit: u64,
}

impl PgStorage {
    pub fn new(pool: PgPool, registry: EntityRegistry, max_limit: u64) -> Self {
        PgStorage {
            pool,
            registry: Arc::new(registry),
            max_limit,
        }
    }

    async fn query_many(&self, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let rows = bind_all(sqlx::query(&q.sql), &q.params).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn query_optional(&self, q: &QueryBuf) -> Result<Option<Record>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let row = bind_all(sqlx::query(&q.sql), &q.params).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| row_to_record(&r)))
    }
}

fn bind_all<'q>(mut query: Query<'q, Postgres, PgArguments>, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    for p in params {
        query = query.bind(PgBindValue::from_json(p));
    }
    query
}

fn pivot_keys(relation: &RelationDescriptor) -> Result<PivotKeys<'_>, AppError> {
    match &relation.kind {
        RelationKind::BelongsToMany {
            pivot_table,
            pivot_key,
            related_pivot_key,
            ..
        } => Ok(PivotKeys {
            table: pivot_table,
            pivot_key,
            related_pivot_key,
        }),
        _ => Err(AppError::BadRequest(format!("relation '{}' has no pivot table", relation.name))),
    }
}

#[async_trait]
impl Storage for PgStorage {
    type Query = SqlQuery;

    fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn query(&self, entity: &EntityDescriptor) -> SqlQuery {
        SqlQuery::new(self.registry.clone(), entity, self.max_limit)
    }

    fn related_query(
        &self,
        owner_entity: &EntityDescriptor,
        owner: &Record,
        relation: &RelationDescriptor,
    ) -> Result<SqlQuery, AppError> {
        let target = self.registry.get(&relation.target).ok_or_else(|| AppError::RelationNotFound {
            entity: owner_entity.name.clone(),
            relation: relation.name.clone(),
        })?;
        let scope = RelationScope::for_relation(owner_entity, owner, relation, target);
        Ok(self.query(target).scoped(scope))
    }

    async fn fetch_all(&self, query: SqlQuery) -> Result<Vec<Record>, AppError> {
        let q = query.to_sql()?;
        self.query_many(&q).await
    }

    async fn insert(&self, entity: &EntityDescriptor, values: Record) -> Result<Record, AppError> {
        let q = insert(entity, &values);
        self.query_optional(&q)
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))
    }

    async fn update(&self, entity: &EntityDescriptor, id: EntityId, values: Record) -> Result<Option<Record>, AppError> {
        self.query_optional(&update(entity, id, &values)).await
    }

    async fn delete(&self, entity: &EntityDescriptor, id: EntityId) -> Result<Option<Record>, AppError> {
        self.query_optional(&delete(entity, id)).await
    }

    async fn related_ids(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
    ) -> Result<Vec<EntityId>, AppError> {
        let keys = pivot_keys(relation)?;
        let rows = self.query_many(&pivot_related_ids(&keys, owner_id)).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get(keys.related_pivot_key).and_then(Value::as_i64))
            .collect())
    }

    async fn attach(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
        attributes: &PivotAttributes,
    ) -> Result<(), AppError> {
        let keys = pivot_keys(relation)?;
        let mut tx = self.pool.begin().await?;
        let exists = pivot_exists(&keys, owner_id, related_id);
        tracing::debug!(sql = %exists.sql, params = ?exists.params, "query (tx)");
        let found = bind_all(sqlx::query(&exists.sql), &exists.params)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        let write = match (found, attributes.is_empty()) {
            (true, true) => None,
            (true, false) => Some(pivot_update(&keys, owner_id, related_id, attributes)),
            (false, _) => Some(pivot_insert(&keys, owner_id, related_id, attributes)),
        };
        if let Some(q) = write {
            tracing::debug!(sql = %q.sql, params = ?q.params, "query (tx)");
            bind_all(sqlx::query(&q.sql), &q.params).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn detach(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
    ) -> Result<bool, AppError> {
        let keys = pivot_keys(relation)?;
        let q = pivot_delete(&keys, owner_id, related_id);
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let done = bind_all(sqlx::query(&q.sql), &q.params).execute(&self.pool).await?;
        Ok(done.rows_affected() > 0)
    }
}

fn row_to_record(row: &PgRow) -> Record {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = Record::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return j;
    }
    Value::Null
}
