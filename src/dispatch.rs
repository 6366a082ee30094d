//! Resource dispatcher: method + path segments to one handler operation, result to envelope.

use crate::case::{handler_identifier, pluralize};
use crate::config::{EntityDescriptor, EntityRegistry, RestConfig};
use crate::error::{AppError, ConfigError};
use crate::query::{ParsedQuery, QueryParams};
use crate::relation::RelationResolver;
use crate::response::{Payload, ResponseEnvelope};
use crate::service::{record_id, EntityHandler, EntityId, Handler, Storage};
use axum::http::{Method, StatusCode};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    List,
    FetchOne,
    /// `narrowed` when a related id is given.
    FetchRelation { narrowed: bool },
    Create,
    Update,
    Delete,
    Attach,
    Detach,
    Sync,
}

impl Operation {
    /// The dispatch table over (method, id?, relation?, relationId?).
    pub fn resolve(method: &Method, id: bool, relation: bool, relation_id: bool) -> Result<Operation, AppError> {
        let op = match (method.as_str(), id, relation, relation_id) {
            ("GET", false, false, false) => Operation::List,
            ("GET", true, false, false) => Operation::FetchOne,
            ("GET", true, true, narrowed) => Operation::FetchRelation { narrowed },
            ("POST", false, false, false) => Operation::Create,
            ("POST", true, true, true) => Operation::Attach,
            ("PUT" | "PATCH", true, false, false) => Operation::Update,
            ("PUT" | "PATCH", true, true, true) => Operation::Sync,
            ("DELETE", true, false, false) => Operation::Delete,
            ("DELETE", true, true, true) => Operation::Detach,
            _ => {
                return Err(AppError::UnsupportedOperation(format!(
                    "{} with id={} relation={} relation_id={}",
                    method, id, relation, relation_id
                )))
            }
        };
        Ok(op)
    }

    pub fn is_write(self) -> bool {
        !matches!(
            self,
            Operation::List | Operation::FetchOne | Operation::FetchRelation { .. }
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::List => "list",
            Operation::FetchOne => "fetch-one",
            Operation::FetchRelation { .. } => "fetch-relation",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Attach => "attach",
            Operation::Detach => "detach",
            Operation::Sync => "sync",
        };
        f.write_str(s)
    }
}

/// A request as the transport hands it over.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    pub method: Method,
    pub resource: String,
    pub id: Option<EntityId>,
    pub relation: Option<String>,
    pub relation_id: Option<EntityId>,
    pub params: QueryParams,
    pub body: Value,
}

impl IncomingRequest {
    pub fn new(method: Method, resource: impl Into<String>) -> Self {
        IncomingRequest {
            method,
            resource: resource.into(),
            id: None,
            relation: None,
            relation_id: None,
            params: QueryParams::default(),
            body: Value::Null,
        }
    }

    pub fn id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn relation(mut self, relation: impl Into<String>, relation_id: Option<EntityId>) -> Self {
        self.relation = Some(relation.into());
        self.relation_id = relation_id;
        self
    }

    pub fn params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// A request after routing and query parsing; nothing here touches storage yet.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub operation: Operation,
    pub entity: String,
    pub id: Option<EntityId>,
    pub relation: Option<String>,
    pub relation_id: Option<EntityId>,
    pub body: Value,
    pub query: ParsedQuery,
    /// Return the full filtered collection after a mutation instead of the affected record.
    pub return_all: bool,
    pub sync_without_detaching: bool,
}

/// Handler identifier -> handler. Lookups fail closed with `HandlerNotFound`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, identifier: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(identifier.into(), handler);
    }

    pub fn resolve(&self, identifier: &str) -> Result<Arc<dyn Handler>, AppError> {
        self.handlers
            .get(identifier)
            .cloned()
            .ok_or_else(|| AppError::HandlerNotFound(identifier.to_string()))
    }

    /// One `EntityHandler` per registered entity, keyed by its declared `handler` name or
    /// by the identifier its plural resource name resolves to.
    pub fn from_storage<S: Storage>(storage: Arc<S>, plural: bool) -> Self {
        let mut registry = HandlerRegistry::new();
        for entity in storage.registry().iter() {
            let identifier = entity
                .handler
                .clone()
                .unwrap_or_else(|| handler_identifier(&pluralize(&entity.name), plural));
            registry.register(identifier, Arc::new(EntityHandler::new(storage.clone(), entity.name.clone())));
        }
        registry
    }
}

pub struct Dispatcher {
    config: Arc<RestConfig>,
    entities: Arc<EntityRegistry>,
    handlers: HandlerRegistry,
    resource_re: Regex,
}

impl Dispatcher {
    pub fn new(config: RestConfig, entities: EntityRegistry, handlers: HandlerRegistry) -> Result<Self, ConfigError> {
        let resource_re = Regex::new(&config.resource_pattern)
            .map_err(|e| ConfigError::Validation(format!("resource_pattern: {}", e)))?;
        Ok(Dispatcher {
            config: Arc::new(config),
            entities: Arc::new(entities),
            handlers,
            resource_re,
        })
    }

    /// Dispatcher with a generic handler for every entity the storage knows.
    pub fn for_storage<S: Storage>(config: RestConfig, storage: Arc<S>) -> Result<Self, ConfigError> {
        let entities = storage.registry().clone();
        let handlers = HandlerRegistry::from_storage(storage, config.handler_plural);
        Self::new(config, entities, handlers)
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Run one request. Every failure comes back as an error envelope.
    pub async fn dispatch(&self, req: IncomingRequest) -> ResponseEnvelope {
        let operation = Operation::resolve(&req.method, req.id.is_some(), req.relation.is_some(), req.relation_id.is_some());
        let write = match &operation {
            Ok(op) => op.is_write(),
            Err(_) => req.method != Method::GET,
        };
        let resource = req.resource.clone();
        match self.run(req, operation).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "dispatch failed");
                ResponseEnvelope::from_error(&e, write)
            }
        }
    }

    async fn run(
        &self,
        req: IncomingRequest,
        operation: Result<Operation, AppError>,
    ) -> Result<ResponseEnvelope, AppError> {
        if !self.resource_re.is_match(&req.resource) {
            return Err(AppError::HandlerNotFound(req.resource));
        }
        let identifier = handler_identifier(&req.resource, self.config.handler_plural);
        let handler = self.handlers.resolve(&identifier)?;
        let operation = operation?;
        let entity = self
            .entities
            .get(handler.entity())
            .ok_or_else(|| AppError::HandlerNotFound(identifier.clone()))?;

        let prepared = self.prepare(entity, operation, req)?;
        tracing::debug!(
            resource = %identifier,
            operation = %prepared.operation,
            id = ?prepared.id,
            relation = ?prepared.relation,
            "dispatch"
        );
        self.execute(entity, handler.as_ref(), prepared).await
    }

    /// Parse the query string against the entity the operation reads: the relation's
    /// terminal entity for fetch-relation, the resource entity otherwise.
    fn prepare(&self, entity: &EntityDescriptor, operation: Operation, req: IncomingRequest) -> Result<DispatchRequest, AppError> {
        let kw = &self.config.keywords;
        let query_entity = match (&operation, &req.relation) {
            (Operation::FetchRelation { .. }, Some(path)) => RelationResolver::new(&self.entities).terminal(entity, path)?,
            _ => entity,
        };
        let query = ParsedQuery::parse(query_entity, &req.params, &self.config)?;
        Ok(DispatchRequest {
            operation,
            entity: entity.name.clone(),
            id: req.id,
            relation: req.relation,
            relation_id: req.relation_id,
            return_all: req.params.flag(&kw.all),
            sync_without_detaching: req.params.flag(&kw.sync_without_detaching),
            body: req.body,
            query,
        })
    }

    async fn execute(
        &self,
        entity: &EntityDescriptor,
        handler: &dyn Handler,
        req: DispatchRequest,
    ) -> Result<ResponseEnvelope, AppError> {
        let id = || req.id.ok_or_else(|| AppError::BadRequest("missing id".into()));
        let related = || {
            req.relation
                .as_deref()
                .zip(req.relation_id)
                .ok_or_else(|| AppError::BadRequest("missing relation id".into()))
        };

        match req.operation {
            Operation::List => Ok(ResponseEnvelope::success(Payload::Many(handler.list(&req.query).await?))),
            Operation::FetchOne => {
                let id = id()?;
                let record = handler
                    .fetch_one(id, &req.query)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, id)))?;
                Ok(ResponseEnvelope::success(Payload::One(record)))
            }
            Operation::FetchRelation { narrowed } => {
                let relation = req.relation.as_deref().unwrap_or_default();
                let payload = handler.fetch_relation(id()?, relation, req.relation_id, &req.query).await?;
                let status = if narrowed && payload == Payload::Null {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::OK
                };
                Ok(ResponseEnvelope::success(payload).with_status(status))
            }
            Operation::Create => {
                let created = handler.create(&req.body).await?;
                let envelope = match record_id(entity, &created) {
                    Some(new_id) => self.reread(entity, handler, &req, new_id, None).await?,
                    None => ResponseEnvelope::success(Payload::One(created)),
                };
                Ok(envelope.with_status(StatusCode::CREATED))
            }
            Operation::Update => {
                let id = id()?;
                handler.update(id, &req.body).await?;
                self.reread(entity, handler, &req, id, None).await
            }
            Operation::Delete => {
                let deleted = handler.delete(id()?).await?;
                if req.return_all {
                    Ok(ResponseEnvelope::success(Payload::Many(handler.list(&req.query).await?)))
                } else {
                    Ok(ResponseEnvelope::success(Payload::One(deleted)))
                }
            }
            Operation::Attach => {
                let (id, (relation, related_id)) = (id()?, related()?);
                handler.attach(id, relation, related_id, &req.body).await?;
                self.reread(entity, handler, &req, id, Some(relation)).await
            }
            Operation::Detach => {
                let (id, (relation, related_id)) = (id()?, related()?);
                handler.detach(id, relation, related_id).await?;
                self.reread(entity, handler, &req, id, Some(relation)).await
            }
            Operation::Sync => {
                let (id, (relation, related_id)) = (id()?, related()?);
                handler
                    .sync(id, relation, &[related_id], &req.body, !req.sync_without_detaching)
                    .await?;
                self.reread(entity, handler, &req, id, Some(relation)).await
            }
        }
    }

    /// Post-mutation read: the full filtered collection when `return_all`, else the
    /// affected record (with the mutated relation loaded for relation mutations).
    async fn reread(
        &self,
        entity: &EntityDescriptor,
        handler: &dyn Handler,
        req: &DispatchRequest,
        id: EntityId,
        relation: Option<&str>,
    ) -> Result<ResponseEnvelope, AppError> {
        if req.return_all {
            return Ok(ResponseEnvelope::success(Payload::Many(handler.list(&req.query).await?)));
        }
        let mut query = req.query.relations_and_selection();
        if let Some(relation) = relation {
            query.relations.push(relation);
            query.ensure_relation_keys(entity);
        }
        Ok(ResponseEnvelope::success(Payload::from(handler.fetch_one(id, &query).await?)))
    }
}
