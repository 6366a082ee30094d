//! Builds parameterized SELECT, INSERT, UPDATE, DELETE and pivot statements from entity descriptors.

use crate::config::{Cardinality, EntityDescriptor, EntityRegistry, FieldKind, RelationKind};
use crate::error::AppError;
use crate::query::grammar::{self, CallArg, Function};
use crate::query::{Direction, Operator, OrderBy, QueryBuilder, SelectExpr, SelectField, WhereClause};
use crate::relation::{EagerNode, RelationResolver};
use crate::service::{coerce_value, EntityId, PivotAttributes, Record, RelationScope};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;

const MAIN_ALIAS: &str = "main";
const PIVOT_ALIAS: &str = "pv";

/// Quote identifier for PostgreSQL (safe: only from config).
pub(crate) fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn column(alias: &str, name: &str) -> String {
    format!("{}.{}", alias, quoted(name))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf::default()
    }

    fn push_param(&mut self, v: Value) -> usize {
        self.params.push(v);
        self.params.len()
    }

    /// `$n`, cast to the field's column type when it has one.
    fn placeholder(&mut self, v: Value, kind: Option<FieldKind>) -> String {
        let n = self.push_param(v);
        match kind.and_then(FieldKind::pg_cast) {
            Some(cast) => format!("${}::{}", n, cast),
            None => format!("${}", n),
        }
    }
}

/// Column list of every declared field under `alias`.
fn field_columns(entity: &EntityDescriptor, alias: &str) -> Vec<String> {
    entity.fields.iter().map(|f| column(alias, &f.name)).collect()
}

fn returning_list(entity: &EntityDescriptor) -> String {
    entity
        .fields
        .iter()
        .map(|f| quoted(&f.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `json_build_object` of the pivot key columns plus declared pivot fields.
fn pivot_object(alias: &str, pivot_key: &str, related_pivot_key: &str, pivot_fields: &[String]) -> String {
    let parts: Vec<String> = [pivot_key, related_pivot_key]
        .into_iter()
        .chain(pivot_fields.iter().map(String::as_str))
        .map(|c| format!("'{}', {}", c.replace('\'', "''"), column(alias, c)))
        .collect();
    format!("json_build_object({})", parts.join(", "))
}

/// Correlated subquery loading one relation (and its nested relations) as JSON:
/// `row_to_json` for to-one, `json_agg` for to-many.
fn include_subquery(node: &EagerNode<'_>, parent_alias: &str, parent_pk: &str, depth: usize) -> String {
    let target = node.target;
    let alias = format!("r{}", depth);
    let sub = format!("s{}", depth);
    let mut cols = field_columns(target, &alias);
    for child in &node.children {
        cols.push(format!(
            "{} AS {}",
            include_subquery(child, &alias, &target.primary_key, depth + 1),
            quoted(&child.relation.name)
        ));
    }

    let table = format!("{} {}", quoted(&target.table), alias);
    let (from, cond) = match &node.relation.kind {
        RelationKind::BelongsTo { foreign_key } => (
            table,
            format!("{} = {}", column(&alias, &target.primary_key), column(parent_alias, foreign_key)),
        ),
        RelationKind::HasOne { foreign_key } | RelationKind::HasMany { foreign_key } => (
            table,
            format!("{} = {}", column(&alias, foreign_key), column(parent_alias, parent_pk)),
        ),
        RelationKind::BelongsToMany {
            pivot_table,
            pivot_key,
            related_pivot_key,
            pivot_fields,
        } => {
            let pivot = format!("p{}", depth);
            cols.push(format!(
                "{} AS {}",
                pivot_object(&pivot, pivot_key, related_pivot_key, pivot_fields),
                quoted("pivot")
            ));
            (
                format!(
                    "{} JOIN {} {} ON {} = {}",
                    table,
                    quoted(pivot_table),
                    pivot,
                    column(&pivot, related_pivot_key),
                    column(&alias, &target.primary_key)
                ),
                format!("{} = {}", column(&pivot, pivot_key), column(parent_alias, parent_pk)),
            )
        }
    };

    let inner = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        cols.join(", "),
        from,
        cond,
        column(&alias, &target.primary_key)
    );
    match node.relation.cardinality() {
        Cardinality::ToOne => format!("(SELECT row_to_json({sub}) FROM ({inner} LIMIT 1) {sub})"),
        Cardinality::ToMany => format!(
            "(SELECT COALESCE(json_agg(row_to_json({sub})), '[]'::json) FROM ({inner}) {sub})"
        ),
    }
}

/// Composable SELECT over one entity; SQL is produced (and validated) by `to_sql`.
#[derive(Clone, Debug)]
pub struct SqlQuery {
    registry: Arc<EntityRegistry>,
    entity: String,
    max_limit: u64,
    scope: Option<RelationScope>,
    with: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    order: Vec<OrderBy>,
    ranges: Vec<(String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    select: Vec<SelectField>,
    wheres: Vec<WhereClause>,
    distinct: bool,
}

struct Selection {
    columns: Vec<String>,
    /// 1-based positions of non-aggregate columns.
    plain: Vec<usize>,
    aggregating: bool,
}

impl SqlQuery {
    pub fn new(registry: Arc<EntityRegistry>, entity: &EntityDescriptor, max_limit: u64) -> Self {
        SqlQuery {
            registry,
            entity: entity.name.clone(),
            max_limit,
            scope: None,
            with: Vec::new(),
            limit: None,
            offset: None,
            order: Vec::new(),
            ranges: Vec::new(),
            select: Vec::new(),
            wheres: Vec::new(),
            distinct: false,
        }
    }

    pub fn scoped(mut self, scope: RelationScope) -> Self {
        self.scope = Some(scope);
        self
    }

    fn selection(&self, entity: &EntityDescriptor, q: &mut QueryBuf) -> Result<Selection, AppError> {
        let items = if self.select.is_empty() {
            vec![SelectField {
                expr: SelectExpr::Wildcard,
                alias: None,
            }]
        } else {
            self.select.clone()
        };

        let mut out = Selection {
            columns: Vec::new(),
            plain: Vec::new(),
            aggregating: false,
        };
        for item in &items {
            match &item.expr {
                SelectExpr::Wildcard => {
                    for f in &entity.fields {
                        out.columns.push(format!("{} AS {}", column(MAIN_ALIAS, &f.name), quoted(&f.name)));
                        out.plain.push(out.columns.len());
                    }
                }
                SelectExpr::Field(name) => {
                    if !entity.has_field(name) {
                        return Err(unknown_field(entity, name));
                    }
                    out.columns.push(format!(
                        "{} AS {}",
                        column(MAIN_ALIAS, name),
                        quoted(item.output_name())
                    ));
                    out.plain.push(out.columns.len());
                }
                SelectExpr::Raw(raw) => {
                    let (expr, aggregate) = raw_expression_sql(entity, raw, q)?;
                    out.columns.push(format!("{} AS {}", expr, quoted(item.output_name())));
                    if aggregate {
                        out.aggregating = true;
                    } else {
                        out.plain.push(out.columns.len());
                    }
                }
            }
        }
        Ok(out)
    }

    fn order_term(&self, entity: &EntityDescriptor, o: &OrderBy) -> Result<String, AppError> {
        if entity.has_field(&o.field) {
            return Ok(format!("{} {}", column(MAIN_ALIAS, &o.field), o.direction.as_sql()));
        }
        if self.select.iter().any(|s| s.alias.as_deref() == Some(o.field.as_str())) {
            return Ok(format!("{} {}", quoted(&o.field), o.direction.as_sql()));
        }
        Err(unknown_field(entity, &o.field))
    }

    fn where_sql(&self, entity: &EntityDescriptor, clause: &WhereClause, q: &mut QueryBuf) -> Result<String, AppError> {
        let field = entity
            .field(&clause.field)
            .ok_or_else(|| unknown_field(entity, &clause.field))?;
        let col = column(MAIN_ALIAS, &field.name);
        let value = coerce_value(field, &clause.value, clause.op)?;
        Ok(match (clause.op, value.is_null()) {
            (Operator::Eq, true) => format!("{} IS NULL", col),
            (Operator::Ne, true) => format!("{} IS NOT NULL", col),
            (op, _) if op.is_pattern() => {
                let ph = q.placeholder(value, None);
                format!("{}::text {} {}", col, op.as_sql(), ph)
            }
            (op, _) => {
                let ph = q.placeholder(value, Some(field.kind));
                format!("{} {} {}", col, op.as_sql(), ph)
            }
        })
    }

    /// SELECT [DISTINCT] cols FROM table main [JOIN pivot] WHERE ... [GROUP BY] ORDER BY ... LIMIT/OFFSET.
    pub fn to_sql(&self) -> Result<QueryBuf, AppError> {
        let entity = self
            .registry
            .get(&self.entity)
            .ok_or_else(|| AppError::HandlerNotFound(self.entity.clone()))?;
        let mut q = QueryBuf::new();
        let selection = self.selection(entity, &mut q)?;
        let mut columns = selection.columns;

        // aggregated rows carry no per-row relation or pivot data
        let tree = RelationResolver::new(&self.registry).eager_tree(entity, &self.with)?;
        for node in tree.iter().filter(|_| !selection.aggregating) {
            columns.push(format!(
                "{} AS {}",
                include_subquery(node, MAIN_ALIAS, &entity.primary_key, 0),
                quoted(&node.relation.name)
            ));
        }

        let mut from = format!("{} {}", quoted(&entity.table), MAIN_ALIAS);
        let mut conds = Vec::new();
        match &self.scope {
            Some(RelationScope::Column { column: col, value }) => {
                let kind = entity.field(col).map(|f| f.kind);
                let ph = q.placeholder(value.clone(), kind);
                conds.push(format!("{} = {}", column(MAIN_ALIAS, col), ph));
            }
            Some(RelationScope::Pivot {
                table,
                pivot_key,
                related_pivot_key,
                pivot_fields,
                owner,
            }) => {
                from.push_str(&format!(
                    " JOIN {} {} ON {} = {}",
                    quoted(table),
                    PIVOT_ALIAS,
                    column(PIVOT_ALIAS, related_pivot_key),
                    column(MAIN_ALIAS, &entity.primary_key)
                ));
                let ph = q.placeholder(owner.clone(), Some(FieldKind::Integer));
                conds.push(format!("{} = {}", column(PIVOT_ALIAS, pivot_key), ph));
                if !selection.aggregating {
                    columns.push(format!(
                        "{} AS {}",
                        pivot_object(PIVOT_ALIAS, pivot_key, related_pivot_key, pivot_fields),
                        quoted("pivot")
                    ));
                }
            }
            None => {}
        }

        for (name, from_ts, to_ts) in &self.ranges {
            let field = entity.field(name).ok_or_else(|| unknown_field(entity, name))?;
            let col = column(MAIN_ALIAS, name);
            for (bound, op) in [(from_ts, ">="), (to_ts, "<=")] {
                if let Some(ts) = bound {
                    let v = Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true));
                    let ph = q.placeholder(v, Some(field.kind));
                    conds.push(format!("{} {} {}", col, op, ph));
                }
            }
        }

        for clause in &self.wheres {
            let cond = self.where_sql(entity, clause, &mut q)?;
            conds.push(cond);
        }

        let mut order_terms = Vec::new();
        for o in &self.order {
            order_terms.push(self.order_term(entity, o)?);
        }
        if order_terms.is_empty() && !selection.aggregating {
            let defaults = if entity.default_order.is_empty() {
                vec![OrderBy::new(entity.primary_key.clone(), Direction::Asc)]
            } else {
                entity.default_order.clone()
            };
            for o in defaults {
                // DISTINCT only orders by selected columns.
                if self.distinct && !self.select.is_empty() && !self.select.iter().any(|s| s.covers(&o.field)) {
                    continue;
                }
                order_terms.push(self.order_term(entity, &o)?);
            }
        }

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            columns.join(", "),
            from
        );
        if !conds.is_empty() {
            sql.push_str(&format!(" WHERE {}", conds.join(" AND ")));
        }
        if selection.aggregating && !selection.plain.is_empty() {
            let positions: Vec<String> = selection.plain.iter().map(|p| p.to_string()).collect();
            sql.push_str(&format!(" GROUP BY {}", positions.join(", ")));
        }
        if !order_terms.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_terms.join(", ")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit.min(self.max_limit)));
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        q.sql = sql;
        Ok(q)
    }
}

fn unknown_field(entity: &EntityDescriptor, name: &str) -> AppError {
    AppError::QueryParse(format!("unknown field '{}' on {}", name, entity.name))
}

/// SQL for a whitelisted function call; arguments must be declared fields or string literals.
fn raw_expression_sql(entity: &EntityDescriptor, raw: &str, q: &mut QueryBuf) -> Result<(String, bool), AppError> {
    let call = grammar::parse_call(raw).ok_or_else(|| AppError::QueryParse(format!("invalid expression '{}'", raw)))?;
    let function = call.function()?;
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(match arg {
            CallArg::Star => "*".to_string(),
            CallArg::Ident(name) => {
                if !entity.has_field(name) {
                    return Err(unknown_field(entity, name));
                }
                column(MAIN_ALIAS, name)
            }
            CallArg::Literal(s) => {
                let n = q.push_param(Value::String(s.clone()));
                format!("${}::text", n)
            }
        });
    }
    let expr = format!("{}({})", call.name, args.join(", "));
    // numeric results would not decode; report them as double precision
    let expr = match function {
        Function::Sum | Function::Avg => format!("({})::double precision", expr),
        _ => expr,
    };
    Ok((expr, function.is_aggregate()))
}

impl QueryBuilder for SqlQuery {
    fn with(&mut self, relations: &[String]) {
        for r in relations {
            if !self.with.contains(r) {
                self.with.push(r.clone());
            }
        }
    }

    fn take(&mut self, limit: u64) {
        self.limit = Some(limit.min(self.max_limit));
    }

    fn skip(&mut self, offset: u64) {
        self.offset = Some(offset);
    }

    fn order_by(&mut self, field: &str, direction: Direction) {
        self.order.push(OrderBy::new(field, direction));
    }

    fn where_range(&mut self, field: &str, from: Option<&DateTime<Utc>>, to: Option<&DateTime<Utc>>) {
        self.ranges.push((field.to_string(), from.copied(), to.copied()));
    }

    fn select(&mut self, fields: &[SelectField]) {
        self.select = fields.to_vec();
    }

    fn where_clause(&mut self, clause: &WhereClause) {
        self.wheres.push(clause.clone());
    }

    fn distinct(&mut self) {
        self.distinct = true;
    }
}

/// INSERT the given (validated) values; timestamps default to NOW().
pub fn insert(entity: &EntityDescriptor, values: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for f in &entity.fields {
        if let Some(v) = values.get(&f.name) {
            placeholders.push(q.placeholder(v.clone(), Some(f.kind)));
            cols.push(quoted(&f.name));
        } else if entity.timestamps && (f.name == "created_at" || f.name == "updated_at") {
            placeholders.push("NOW()".to_string());
            cols.push(quoted(&f.name));
        }
    }
    let table = quoted(&entity.table);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning_list(entity))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            returning_list(entity)
        )
    };
    q
}

/// UPDATE by id: SET only declared fields present in `values`, plus `updated_at`.
/// With nothing to set this is a plain SELECT of the row.
pub fn update(entity: &EntityDescriptor, id: EntityId, values: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let table = quoted(&entity.table);
    let pk = quoted(&entity.primary_key);
    let mut sets = Vec::new();
    for f in &entity.fields {
        if f.name == entity.primary_key {
            continue;
        }
        if let Some(v) = values.get(&f.name) {
            let ph = q.placeholder(v.clone(), Some(f.kind));
            sets.push(format!("{} = {}", quoted(&f.name), ph));
        }
    }
    if entity.timestamps && !sets.is_empty() {
        sets.push(format!("{} = NOW()", quoted("updated_at")));
    }
    let id_ph = q.placeholder(Value::from(id), Some(FieldKind::Integer));
    q.sql = if sets.is_empty() {
        format!("SELECT {} FROM {} WHERE {} = {}", returning_list(entity), table, pk, id_ph)
    } else {
        format!(
            "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
            table,
            sets.join(", "),
            pk,
            id_ph,
            returning_list(entity)
        )
    };
    q
}

/// DELETE by id.
pub fn delete(entity: &EntityDescriptor, id: EntityId) -> QueryBuf {
    let mut q = QueryBuf::new();
    let id_ph = q.placeholder(Value::from(id), Some(FieldKind::Integer));
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {} RETURNING {}",
        quoted(&entity.table),
        quoted(&entity.primary_key),
        id_ph,
        returning_list(entity)
    );
    q
}

/// Key columns of a pivot relation.
pub struct PivotKeys<'a> {
    pub table: &'a str,
    pub pivot_key: &'a str,
    pub related_pivot_key: &'a str,
}

fn pivot_match(keys: &PivotKeys<'_>, owner_id: EntityId, related_id: EntityId, q: &mut QueryBuf) -> String {
    let owner = q.placeholder(Value::from(owner_id), Some(FieldKind::Integer));
    let related = q.placeholder(Value::from(related_id), Some(FieldKind::Integer));
    format!(
        "{} = {} AND {} = {}",
        quoted(keys.pivot_key),
        owner,
        quoted(keys.related_pivot_key),
        related
    )
}

pub fn pivot_related_ids(keys: &PivotKeys<'_>, owner_id: EntityId) -> QueryBuf {
    let mut q = QueryBuf::new();
    let owner = q.placeholder(Value::from(owner_id), Some(FieldKind::Integer));
    q.sql = format!(
        "SELECT {rk} FROM {} WHERE {} = {} ORDER BY {rk}",
        quoted(keys.table),
        quoted(keys.pivot_key),
        owner,
        rk = quoted(keys.related_pivot_key)
    );
    q
}

pub fn pivot_exists(keys: &PivotKeys<'_>, owner_id: EntityId, related_id: EntityId) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cond = pivot_match(keys, owner_id, related_id, &mut q);
    q.sql = format!("SELECT 1 AS {} FROM {} WHERE {}", quoted("found"), quoted(keys.table), cond);
    q
}

pub fn pivot_insert(keys: &PivotKeys<'_>, owner_id: EntityId, related_id: EntityId, attributes: &PivotAttributes) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = vec![quoted(keys.pivot_key), quoted(keys.related_pivot_key)];
    let mut placeholders = vec![
        q.placeholder(Value::from(owner_id), Some(FieldKind::Integer)),
        q.placeholder(Value::from(related_id), Some(FieldKind::Integer)),
    ];
    for (k, v) in attributes.iter() {
        cols.push(quoted(k));
        placeholders.push(q.placeholder(v.clone(), None));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted(keys.table),
        cols.join(", "),
        placeholders.join(", ")
    );
    q
}

/// UPDATE the supplied attributes of an existing link. Caller checks `attributes` is non-empty.
pub fn pivot_update(keys: &PivotKeys<'_>, owner_id: EntityId, related_id: EntityId, attributes: &PivotAttributes) -> QueryBuf {
    let mut q = QueryBuf::new();
    let sets: Vec<String> = attributes
        .iter()
        .map(|(k, v)| format!("{} = {}", quoted(k), q.placeholder(v.clone(), None)))
        .collect();
    let cond = pivot_match(keys, owner_id, related_id, &mut q);
    q.sql = format!("UPDATE {} SET {} WHERE {}", quoted(keys.table), sets.join(", "), cond);
    q
}

pub fn pivot_delete(keys: &PivotKeys<'_>, owner_id: EntityId, related_id: EntityId) -> QueryBuf {
    let mut q = QueryBuf::new();
    let cond = pivot_match(keys, owner_id, related_id, &mut q);
    q.sql = format!("DELETE FROM {} WHERE {}", quoted(keys.table), cond);
    q
}
