//! Per-entity handler capability and its generic storage-backed implementation.

use crate::config::{Cardinality, EntityDescriptor};
use crate::error::AppError;
use crate::query::{ParsedQuery, QueryBuilder, QueryTranslator, SelectField, WhereClause};
use crate::relation::RelationResolver;
use crate::response::Payload;
use crate::service::{record_id, EntityId, PivotAttributes, Record, RequestValidator, Storage, SyncChanges};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Operation set one resource exposes to the dispatcher.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Entity name this handler serves.
    fn entity(&self) -> &str;

    async fn list(&self, query: &ParsedQuery) -> Result<Vec<Record>, AppError>;

    async fn fetch_one(&self, id: EntityId, query: &ParsedQuery) -> Result<Option<Record>, AppError>;

    /// Load `relation` (possibly dotted) of record `id` and apply `query` to the related set.
    /// With `relation_id`, the set is narrowed to that member (`Null` when absent).
    async fn fetch_relation(
        &self,
        id: EntityId,
        relation: &str,
        relation_id: Option<EntityId>,
        query: &ParsedQuery,
    ) -> Result<Payload, AppError>;

    async fn create(&self, body: &Value) -> Result<Record, AppError>;

    async fn update(&self, id: EntityId, body: &Value) -> Result<Record, AppError>;

    async fn delete(&self, id: EntityId) -> Result<Record, AppError>;

    async fn attach(&self, id: EntityId, relation: &str, related_id: EntityId, body: &Value) -> Result<(), AppError>;

    async fn detach(&self, id: EntityId, relation: &str, related_id: EntityId) -> Result<(), AppError>;

    async fn sync(
        &self,
        id: EntityId,
        relation: &str,
        related_ids: &[EntityId],
        body: &Value,
        detaching: bool,
    ) -> Result<SyncChanges, AppError>;
}

/// Handler for any registered entity, backed by a storage engine.
pub struct EntityHandler<S: Storage> {
    storage: Arc<S>,
    entity: String,
}

impl<S: Storage> EntityHandler<S> {
    pub fn new(storage: Arc<S>, entity: impl Into<String>) -> Self {
        EntityHandler {
            storage,
            entity: entity.into(),
        }
    }

    fn descriptor(&self) -> Result<&EntityDescriptor, AppError> {
        self.storage
            .registry()
            .get(&self.entity)
            .ok_or_else(|| AppError::HandlerNotFound(self.entity.clone()))
    }

    async fn require(&self, entity: &EntityDescriptor, id: EntityId) -> Result<Record, AppError> {
        let query = self.storage.query(entity);
        self.storage
            .find(entity, query, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, id)))
    }

    /// Shared first steps of attach/detach/sync: the owner exists and the relation is a pivot relation.
    async fn mutable_relation<'a>(
        &self,
        entity: &'a EntityDescriptor,
        id: EntityId,
        relation: &str,
    ) -> Result<&'a crate::config::RelationDescriptor, AppError> {
        self.require(entity, id).await?;
        let rel = entity.relation(relation).ok_or_else(|| AppError::RelationNotFound {
            entity: entity.name.clone(),
            relation: relation.to_string(),
        })?;
        if !rel.is_mutable() {
            return Err(AppError::BadRequest(format!(
                "relation '{}' of {} cannot be attached or detached",
                relation, entity.name
            )));
        }
        Ok(rel)
    }

    async fn require_related(&self, target: &str, related_id: EntityId) -> Result<(), AppError> {
        let target = self
            .storage
            .registry()
            .get(target)
            .ok_or_else(|| AppError::NotFound(target.to_string()))?;
        self.require(target, related_id).await.map(|_| ())
    }
}

#[async_trait]
impl<S: Storage> Handler for EntityHandler<S> {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn list(&self, query: &ParsedQuery) -> Result<Vec<Record>, AppError> {
        let entity = self.descriptor()?;
        let mut q = self.storage.query(entity);
        QueryTranslator::apply(entity, query, &mut q);
        self.storage.fetch_all(q).await
    }

    async fn fetch_one(&self, id: EntityId, query: &ParsedQuery) -> Result<Option<Record>, AppError> {
        let entity = self.descriptor()?;
        let mut q = self.storage.query(entity);
        QueryTranslator::apply_relations_and_selection(entity, query, &mut q);
        self.storage.find(entity, q, id).await
    }

    async fn fetch_relation(
        &self,
        id: EntityId,
        relation: &str,
        relation_id: Option<EntityId>,
        query: &ParsedQuery,
    ) -> Result<Payload, AppError> {
        let entity = self.descriptor()?;
        let hops = RelationResolver::new(self.storage.registry()).traverse(entity, relation)?;
        let Some((last, intermediate)) = hops.split_last() else {
            return Ok(Payload::Null);
        };

        let mut owner = self.require(entity, id).await?;
        for hop in intermediate {
            let q = self.storage.related_query(hop.owner, &owner, hop.relation)?;
            match self.storage.fetch_first(q).await? {
                Some(next) => owner = next,
                None => return Ok(Payload::Null),
            }
        }

        let target = last.target;
        let mut q = self.storage.related_query(last.owner, &owner, last.relation)?;
        match relation_id {
            Some(related_id) => {
                let mut query = query.clone();
                if !query.select.is_empty() && !query.select.iter().any(|s| s.covers(&target.primary_key)) {
                    query.select.push(SelectField::field(target.primary_key.clone()));
                }
                q.where_clause(&WhereClause::eq(target.primary_key.as_str(), related_id));
                QueryTranslator::apply(target, &query, &mut q);
                let rows = self.storage.fetch_all(q).await?;
                Ok(RelationResolver::narrow(rows, &target.primary_key, related_id).into())
            }
            None => {
                QueryTranslator::apply(target, query, &mut q);
                match last.relation.cardinality() {
                    Cardinality::ToOne => Ok(self.storage.fetch_first(q).await?.into()),
                    Cardinality::ToMany => Ok(Payload::Many(self.storage.fetch_all(q).await?)),
                }
            }
        }
    }

    async fn create(&self, body: &Value) -> Result<Record, AppError> {
        let entity = self.descriptor()?;
        let values = RequestValidator::validate(entity, body)?;
        let created = self.storage.insert(entity, values).await?;
        tracing::debug!(entity = %entity.name, id = ?record_id(entity, &created), "created");
        Ok(created)
    }

    async fn update(&self, id: EntityId, body: &Value) -> Result<Record, AppError> {
        let entity = self.descriptor()?;
        let values = RequestValidator::validate_partial(entity, body)?;
        self.storage
            .update(entity, id, values)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, id)))
    }

    async fn delete(&self, id: EntityId) -> Result<Record, AppError> {
        let entity = self.descriptor()?;
        self.storage
            .delete(entity, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, id)))
    }

    async fn attach(&self, id: EntityId, relation: &str, related_id: EntityId, body: &Value) -> Result<(), AppError> {
        let entity = self.descriptor()?;
        let rel = self.mutable_relation(entity, id, relation).await?;
        let attributes = PivotAttributes::from_body(body, rel)?;
        self.require_related(&rel.target, related_id).await?;
        self.storage.attach(entity, id, rel, related_id, &attributes).await
    }

    async fn detach(&self, id: EntityId, relation: &str, related_id: EntityId) -> Result<(), AppError> {
        let entity = self.descriptor()?;
        let rel = self.mutable_relation(entity, id, relation).await?;
        let removed = self.storage.detach(entity, id, rel, related_id).await?;
        if !removed {
            tracing::debug!(entity = %entity.name, id, relation, related_id, "detach: no link");
        }
        Ok(())
    }

    async fn sync(
        &self,
        id: EntityId,
        relation: &str,
        related_ids: &[EntityId],
        body: &Value,
        detaching: bool,
    ) -> Result<SyncChanges, AppError> {
        let entity = self.descriptor()?;
        let rel = self.mutable_relation(entity, id, relation).await?;
        let attributes = PivotAttributes::from_body(body, rel)?;
        for related_id in related_ids {
            self.require_related(&rel.target, *related_id).await?;
        }
        let changes = self
            .storage
            .sync(entity, id, rel, related_ids, &attributes, detaching)
            .await?;
        tracing::debug!(
            entity = %entity.name,
            id,
            relation,
            attached = ?changes.attached,
            detached = ?changes.detached,
            "synced"
        );
        Ok(changes)
    }
}
