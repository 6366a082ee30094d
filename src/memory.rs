//! In-process storage engine. Same query semantics as the SQL engine over tables held in memory.

use crate::config::{Cardinality, EntityDescriptor, EntityRegistry, RelationDescriptor, RelationKind};
use crate::error::AppError;
use crate::query::grammar::{self, Call, CallArg, Function};
use crate::query::{Direction, Operator, OrderBy, QueryBuilder, SelectExpr, SelectField, WhereClause};
use crate::relation::{EagerNode, RelationResolver};
use crate::service::{coerce_value, EntityId, PivotAttributes, Record, RelationScope, Storage};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Table {
    rows: Vec<Record>,
    last_id: EntityId,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    /// Pivot table name -> link rows (key columns plus attributes).
    pivots: HashMap<String, Vec<Record>>,
}

pub struct MemoryStorage {
    registry: Arc<EntityRegistry>,
    max_limit: u64,
    state: RwLock<State>,
}

impl MemoryStorage {
    pub fn new(registry: EntityRegistry, max_limit: u64) -> Self {
        MemoryStorage {
            registry: Arc::new(registry),
            max_limit,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entity(&self, name: &str) -> Result<&EntityDescriptor, AppError> {
        self.registry
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("entity {}", name)))
    }

    /// Insert rows as given (no body validation). Missing ids and timestamps are filled in.
    pub fn seed(&self, entity: &str, rows: impl IntoIterator<Item = Value>) -> Result<Vec<Record>, AppError> {
        let entity = self.entity(entity)?;
        let mut state = self.write();
        rows.into_iter()
            .map(|row| match row {
                Value::Object(values) => insert_row(&mut state, entity, values),
                _ => Err(AppError::Validation("seed rows must be JSON objects".into())),
            })
            .collect()
    }

    pub fn seed_pivot(&self, table: &str, rows: impl IntoIterator<Item = Value>) -> Result<(), AppError> {
        let mut state = self.write();
        let links = state.pivots.entry(table.to_string()).or_default();
        for row in rows {
            match row {
                Value::Object(link) => links.push(link),
                _ => return Err(AppError::Validation("pivot rows must be JSON objects".into())),
            }
        }
        Ok(())
    }

    /// Current link rows of a pivot table.
    pub fn pivot_rows(&self, table: &str) -> Vec<Record> {
        self.read().pivots.get(table).cloned().unwrap_or_default()
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn insert_row(state: &mut State, entity: &EntityDescriptor, values: Record) -> Result<Record, AppError> {
    let table = state.tables.entry(entity.table.clone()).or_default();
    let pk = &entity.primary_key;
    let id = match values.get(pk).and_then(Value::as_i64) {
        Some(id) => {
            if table.rows.iter().any(|r| r.get(pk).and_then(Value::as_i64) == Some(id)) {
                return Err(AppError::Validation(format!("duplicate {} {} on {}", pk, id, entity.name)));
            }
            id
        }
        None => table.last_id + 1,
    };
    table.last_id = table.last_id.max(id);

    let mut row = Record::new();
    for f in &entity.fields {
        let v = values.get(&f.name).cloned().unwrap_or(Value::Null);
        row.insert(f.name.clone(), v);
    }
    row.insert(pk.clone(), Value::from(id));
    if entity.timestamps {
        for name in ["created_at", "updated_at"] {
            if row.get(name).map_or(true, Value::is_null) {
                row.insert(name.to_string(), now());
            }
        }
    }
    table.rows.push(row.clone());
    Ok(row)
}

fn pivot_columns(relation: &RelationDescriptor) -> Result<(&str, &str, &str), AppError> {
    match &relation.kind {
        RelationKind::BelongsToMany {
            pivot_table,
            pivot_key,
            related_pivot_key,
            ..
        } => Ok((pivot_table, pivot_key, related_pivot_key)),
        _ => Err(AppError::BadRequest(format!("relation '{}' has no pivot table", relation.name))),
    }
}

fn links_to(link: &Record, pivot_key: &str, owner_id: EntityId, related_pivot_key: &str, related_id: EntityId) -> bool {
    link.get(pivot_key).and_then(Value::as_i64) == Some(owner_id)
        && link.get(related_pivot_key).and_then(Value::as_i64) == Some(related_id)
}

/// Composable query evaluated against a snapshot of the tables.
#[derive(Clone, Debug)]
pub struct MemoryQuery {
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

impl QueryBuilder for MemoryQuery {
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

enum Column {
    Field { name: String, out: String },
    Call { call: Call, function: Function, out: String },
}

/// Validated projection. `None` columns keep whole rows.
struct Projection {
    columns: Option<Vec<Column>>,
    aggregating: bool,
}

impl Projection {
    fn new(entity: &EntityDescriptor, select: &[SelectField]) -> Result<Self, AppError> {
        if select.is_empty() {
            return Ok(Projection {
                columns: None,
                aggregating: false,
            });
        }
        let mut columns = Vec::new();
        let mut aggregating = false;
        for item in select {
            match &item.expr {
                SelectExpr::Wildcard => {
                    for f in &entity.fields {
                        columns.push(Column::Field {
                            name: f.name.clone(),
                            out: f.name.clone(),
                        });
                    }
                }
                SelectExpr::Field(name) => {
                    if !entity.has_field(name) {
                        return Err(unknown_field(entity, name));
                    }
                    columns.push(Column::Field {
                        name: name.clone(),
                        out: item.output_name().to_string(),
                    });
                }
                SelectExpr::Raw(raw) => {
                    let call = grammar::parse_call(raw)
                        .ok_or_else(|| AppError::QueryParse(format!("invalid expression '{}'", raw)))?;
                    let function = call.function()?;
                    for arg in &call.args {
                        if let CallArg::Ident(name) = arg {
                            if !entity.has_field(name) {
                                return Err(unknown_field(entity, name));
                            }
                        }
                    }
                    aggregating |= function.is_aggregate();
                    columns.push(Column::Call {
                        call,
                        function,
                        out: item.output_name().to_string(),
                    });
                }
            }
        }
        Ok(Projection {
            columns: Some(columns),
            aggregating,
        })
    }

    /// One output record per row; loaded relations and pivot data carry over.
    fn project(&self, row: &Record, carried: &[String]) -> Record {
        let Some(columns) = &self.columns else {
            return row.clone();
        };
        let mut out = Record::new();
        for c in columns {
            match c {
                Column::Field { name, out: key } => {
                    out.insert(key.clone(), row.get(name).cloned().unwrap_or(Value::Null));
                }
                Column::Call { call, function, out: key } => {
                    out.insert(key.clone(), scalar(*function, call, row));
                }
            }
        }
        for key in carried {
            if let Some(v) = row.get(key) {
                out.insert(key.clone(), v.clone());
            }
        }
        out
    }

    /// Group rows by the non-aggregate columns (first-seen order) and fold each group.
    fn aggregate(&self, rows: &[Record]) -> Vec<Record> {
        let Some(columns) = &self.columns else {
            return Vec::new();
        };
        let key_of = |row: &Record| -> Vec<Value> {
            columns
                .iter()
                .filter_map(|c| match c {
                    Column::Field { name, .. } => Some(row.get(name).cloned().unwrap_or(Value::Null)),
                    Column::Call { call, function, .. } if !function.is_aggregate() => {
                        Some(scalar(*function, call, row))
                    }
                    Column::Call { .. } => None,
                })
                .collect()
        };

        let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
        for row in rows {
            let key = key_of(row);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        let has_plain = columns.iter().any(|c| match c {
            Column::Field { .. } => true,
            Column::Call { function, .. } => !function.is_aggregate(),
        });
        if groups.is_empty() && !has_plain {
            groups.push((Vec::new(), Vec::new()));
        }

        groups
            .into_iter()
            .map(|(_, members)| {
                let mut out = Record::new();
                for c in columns {
                    match c {
                        Column::Field { name, out: key } => {
                            let v = members.first().and_then(|r| r.get(name)).cloned().unwrap_or(Value::Null);
                            out.insert(key.clone(), v);
                        }
                        Column::Call { call, function, out: key } => {
                            let v = if function.is_aggregate() {
                                aggregate(*function, call, &members)
                            } else {
                                members.first().map(|r| scalar(*function, call, r)).unwrap_or(Value::Null)
                            };
                            out.insert(key.clone(), v);
                        }
                    }
                }
                out
            })
            .collect()
    }
}

fn unknown_field(entity: &EntityDescriptor, name: &str) -> AppError {
    AppError::QueryParse(format!("unknown field '{}' on {}", name, entity.name))
}

fn arg_value(arg: &CallArg, row: &Record) -> Value {
    match arg {
        CallArg::Ident(name) => row.get(name).cloned().unwrap_or(Value::Null),
        CallArg::Literal(s) => Value::String(s.clone()),
        CallArg::Star => Value::Null,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn scalar(function: Function, call: &Call, row: &Record) -> Value {
    let args: Vec<Value> = call.args.iter().map(|a| arg_value(a, row)).collect();
    let first = args.first().cloned().unwrap_or(Value::Null);
    match function {
        Function::Lower | Function::Upper | Function::Length if first.is_null() => Value::Null,
        Function::Lower => Value::String(text(&first).to_lowercase()),
        Function::Upper => Value::String(text(&first).to_uppercase()),
        Function::Length => Value::from(text(&first).chars().count() as i64),
        Function::Concat => Value::String(args.iter().map(text).collect()),
        Function::Coalesce => args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null),
        // aggregates over a single row
        _ => aggregate(function, call, &[row]),
    }
}

fn aggregate(function: Function, call: &Call, rows: &[&Record]) -> Value {
    let arg = call.args.first();
    let values: Vec<Value> = match arg {
        Some(CallArg::Star) | None => Vec::new(),
        Some(a) => rows.iter().map(|r| arg_value(a, r)).filter(|v| !v.is_null()).collect(),
    };
    match function {
        Function::Count => match arg {
            Some(CallArg::Star) => Value::from(rows.len() as i64),
            _ => Value::from(values.len() as i64),
        },
        Function::Sum | Function::Avg => {
            let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if nums.is_empty() {
                return Value::Null;
            }
            let sum: f64 = nums.iter().sum();
            let result = if function == Function::Sum { sum } else { sum / nums.len() as f64 };
            serde_json::Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null)
        }
        Function::Min | Function::Max => {
            let pick = values.into_iter().reduce(|best, v| {
                let ord = compare_values(&v, &best).unwrap_or(Ordering::Equal);
                let better = if function == Function::Min { ord == Ordering::Less } else { ord == Ordering::Greater };
                if better {
                    v
                } else {
                    best
                }
            });
            pick.unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn as_datetime(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (as_datetime(a), as_datetime(b)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b).map_or(a == b, |o| o == Ordering::Equal)
}

/// Nulls sort last ascending and first descending.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// SQL `LIKE`: `%` any run, `_` one character, `\` escapes.
fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    match like_regex(pattern, case_insensitive) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "unusable LIKE pattern");
            false
        }
    }
}

fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut chars = pattern.chars();
    let mut buf = [0u8; 4];
    while let Some(c) = chars.next() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            '\\' => source.push_str(&regex::escape(chars.next().unwrap_or('\\').encode_utf8(&mut buf))),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
}

fn matches(row_value: Option<&Value>, op: Operator, value: &Value) -> bool {
    let rv = row_value.unwrap_or(&Value::Null);
    match op {
        Operator::Eq if value.is_null() => rv.is_null(),
        Operator::Ne if value.is_null() => !rv.is_null(),
        _ if rv.is_null() => false,
        Operator::Eq => values_equal(rv, value),
        Operator::Ne => !values_equal(rv, value),
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => match compare_values(rv, value) {
            Some(o) => match op {
                Operator::Lt => o == Ordering::Less,
                Operator::Le => o != Ordering::Greater,
                Operator::Gt => o == Ordering::Greater,
                _ => o != Ordering::Less,
            },
            None => false,
        },
        Operator::Like | Operator::ILike | Operator::NotLike => {
            let pattern = value.as_str().unwrap_or_default();
            let hit = like_match(&text(rv), pattern, op == Operator::ILike);
            hit != (op == Operator::NotLike)
        }
    }
}

fn in_range(v: Option<&Value>, from: Option<&DateTime<Utc>>, to: Option<&DateTime<Utc>>) -> bool {
    let Some(ts) = v.and_then(Value::as_str).and_then(|s| grammar::parse_timestamp(s).ok()) else {
        return false;
    };
    from.map_or(true, |f| ts >= *f) && to.map_or(true, |t| ts <= *t)
}

/// Key columns plus declared pivot fields, as the SQL engine's `json_build_object`.
fn pivot_object(link: &Record, pivot_key: &str, related_pivot_key: &str, pivot_fields: &[String]) -> Value {
    let mut out = Record::new();
    for key in [pivot_key, related_pivot_key].into_iter().chain(pivot_fields.iter().map(String::as_str)) {
        out.insert(key.to_string(), link.get(key).cloned().unwrap_or(Value::Null));
    }
    Value::Object(out)
}

/// Rows of `entity` within `scope`; pivot-scoped rows carry their link under `pivot`.
fn scoped_rows(state: &State, entity: &EntityDescriptor, scope: Option<&RelationScope>) -> Vec<Record> {
    let rows: &[Record] = state.tables.get(&entity.table).map(|t| t.rows.as_slice()).unwrap_or(&[]);
    match scope {
        None => rows.to_vec(),
        Some(RelationScope::Column { column, value }) => rows
            .iter()
            .filter(|r| matches(r.get(column), Operator::Eq, value) && !value.is_null())
            .cloned()
            .collect(),
        Some(RelationScope::Pivot {
            table,
            pivot_key,
            related_pivot_key,
            pivot_fields,
            owner,
        }) => {
            let links = state.pivots.get(table).map(Vec::as_slice).unwrap_or(&[]);
            links
                .iter()
                .filter(|l| l.get(pivot_key).map_or(false, |v| values_equal(v, owner)))
                .filter_map(|l| {
                    let related = l.get(related_pivot_key)?;
                    let row = rows
                        .iter()
                        .find(|r| r.get(&entity.primary_key).map_or(false, |pk| values_equal(pk, related)))?;
                    let mut row = row.clone();
                    row.insert("pivot".into(), pivot_object(l, pivot_key, related_pivot_key, pivot_fields));
                    Some(row)
                })
                .collect()
        }
    }
}

fn sort_rows(rows: &mut [Record], order: &[OrderBy]) {
    rows.sort_by(|a, b| {
        for o in order {
            let ord = sort_order(
                a.get(&o.field).unwrap_or(&Value::Null),
                b.get(&o.field).unwrap_or(&Value::Null),
            );
            let ord = if o.direction == Direction::Desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn default_order(entity: &EntityDescriptor) -> Vec<OrderBy> {
    if entity.default_order.is_empty() {
        vec![OrderBy::new(entity.primary_key.clone(), Direction::Asc)]
    } else {
        entity.default_order.clone()
    }
}

fn load_relations(state: &State, owner_entity: &EntityDescriptor, rows: &mut [Record], tree: &[EagerNode<'_>]) {
    for row in rows.iter_mut() {
        for node in tree {
            let scope = RelationScope::for_relation(owner_entity, row, node.relation, node.target);
            let mut related = scoped_rows(state, node.target, Some(&scope));
            sort_rows(&mut related, &[OrderBy::new(node.target.primary_key.clone(), Direction::Asc)]);
            if !node.children.is_empty() {
                load_relations(state, node.target, &mut related, &node.children);
            }
            let value = match node.relation.cardinality() {
                Cardinality::ToOne => related.into_iter().next().map(Value::Object).unwrap_or(Value::Null),
                Cardinality::ToMany => Value::Array(related.into_iter().map(Value::Object).collect()),
            };
            row.insert(node.relation.name.clone(), value);
        }
    }
}

impl MemoryQuery {
    fn new(entity: &EntityDescriptor, max_limit: u64) -> Self {
        MemoryQuery {
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

    /// Validate every directive, then filter, eager load, order, project, dedupe and page.
    fn run(&self, registry: &EntityRegistry, state: &State) -> Result<Vec<Record>, AppError> {
        let entity = registry
            .get(&self.entity)
            .ok_or_else(|| AppError::HandlerNotFound(self.entity.clone()))?;
        let tree = RelationResolver::new(registry).eager_tree(entity, &self.with)?;
        let projection = Projection::new(entity, &self.select)?;

        let mut filters = Vec::with_capacity(self.wheres.len());
        for clause in &self.wheres {
            let field = entity
                .field(&clause.field)
                .ok_or_else(|| unknown_field(entity, &clause.field))?;
            filters.push((field.name.as_str(), clause.op, coerce_value(field, &clause.value, clause.op)?));
        }
        for (name, _, _) in &self.ranges {
            if !entity.has_field(name) {
                return Err(unknown_field(entity, name));
            }
        }
        let order = if self.order.is_empty() {
            if projection.aggregating {
                Vec::new()
            } else {
                default_order(entity)
            }
        } else {
            self.order.clone()
        };
        for o in &order {
            let aliased = self.select.iter().any(|s| s.output_name() == o.field);
            if !entity.has_field(&o.field) && !aliased {
                return Err(unknown_field(entity, &o.field));
            }
        }

        let mut rows = scoped_rows(state, entity, self.scope.as_ref());
        rows.retain(|r| {
            self.ranges
                .iter()
                .all(|(name, from, to)| in_range(r.get(name), from.as_ref(), to.as_ref()))
                && filters.iter().all(|(name, op, v)| matches(r.get(*name), *op, v))
        });
        load_relations(state, entity, &mut rows, &tree);

        let mut out = if projection.aggregating {
            let mut grouped = projection.aggregate(&rows);
            sort_rows(&mut grouped, &order);
            grouped
        } else {
            let mut carried: Vec<String> = tree.iter().map(|n| n.relation.name.clone()).collect();
            carried.push("pivot".into());
            // source rows first, so fields left out of the selection still order
            if order.iter().all(|o| entity.has_field(&o.field)) {
                sort_rows(&mut rows, &order);
                rows.iter().map(|r| projection.project(r, &carried)).collect()
            } else {
                let mut projected: Vec<Record> = rows.iter().map(|r| projection.project(r, &carried)).collect();
                sort_rows(&mut projected, &order);
                projected
            }
        };

        if self.distinct {
            let mut seen: Vec<Record> = Vec::new();
            out.retain(|r| {
                if seen.contains(r) {
                    false
                } else {
                    seen.push(r.clone());
                    true
                }
            });
        }

        let offset = self.offset.unwrap_or(0) as usize;
        let limit = self.limit.map(|l| l.min(self.max_limit) as usize).unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Query = MemoryQuery;

    fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn query(&self, entity: &EntityDescriptor) -> MemoryQuery {
        MemoryQuery::new(entity, self.max_limit)
    }

    fn related_query(
        &self,
        owner_entity: &EntityDescriptor,
        owner: &Record,
        relation: &RelationDescriptor,
    ) -> Result<MemoryQuery, AppError> {
        let target = self.registry.get(&relation.target).ok_or_else(|| AppError::RelationNotFound {
            entity: owner_entity.name.clone(),
            relation: relation.name.clone(),
        })?;
        let mut query = self.query(target);
        query.scope = Some(RelationScope::for_relation(owner_entity, owner, relation, target));
        Ok(query)
    }

    async fn fetch_all(&self, query: MemoryQuery) -> Result<Vec<Record>, AppError> {
        let state = self.read();
        query.run(&self.registry, &state)
    }

    async fn insert(&self, entity: &EntityDescriptor, values: Record) -> Result<Record, AppError> {
        let mut state = self.write();
        insert_row(&mut state, entity, values)
    }

    async fn update(&self, entity: &EntityDescriptor, id: EntityId, values: Record) -> Result<Option<Record>, AppError> {
        let mut state = self.write();
        let Some(table) = state.tables.get_mut(&entity.table) else {
            return Ok(None);
        };
        let pk = &entity.primary_key;
        let Some(row) = table.rows.iter_mut().find(|r| r.get(pk).and_then(Value::as_i64) == Some(id)) else {
            return Ok(None);
        };
        let touched = !values.is_empty();
        for (k, v) in values {
            if k != *pk {
                row.insert(k, v);
            }
        }
        if entity.timestamps && touched {
            row.insert("updated_at".into(), now());
        }
        Ok(Some(row.clone()))
    }

    async fn delete(&self, entity: &EntityDescriptor, id: EntityId) -> Result<Option<Record>, AppError> {
        let mut state = self.write();
        let Some(table) = state.tables.get_mut(&entity.table) else {
            return Ok(None);
        };
        let pk = &entity.primary_key;
        let idx = table.rows.iter().position(|r| r.get(pk).and_then(Value::as_i64) == Some(id));
        Ok(idx.map(|i| table.rows.remove(i)))
    }

    async fn related_ids(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
    ) -> Result<Vec<EntityId>, AppError> {
        let (table, pivot_key, related_pivot_key) = pivot_columns(relation)?;
        let state = self.read();
        let mut ids: Vec<EntityId> = state
            .pivots
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter(|l| l.get(pivot_key).and_then(Value::as_i64) == Some(owner_id))
            .filter_map(|l| l.get(related_pivot_key).and_then(Value::as_i64))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn attach(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
        attributes: &PivotAttributes,
    ) -> Result<(), AppError> {
        let (table, pivot_key, related_pivot_key) = pivot_columns(relation)?;
        let mut state = self.write();
        let links = state.pivots.entry(table.to_string()).or_default();
        match links
            .iter_mut()
            .find(|l| links_to(l, pivot_key, owner_id, related_pivot_key, related_id))
        {
            Some(link) => attributes.merge_into(link),
            None => {
                let mut link = Record::new();
                link.insert(pivot_key.to_string(), Value::from(owner_id));
                link.insert(related_pivot_key.to_string(), Value::from(related_id));
                attributes.merge_into(&mut link);
                links.push(link);
            }
        }
        Ok(())
    }

    async fn detach(
        &self,
        _entity: &EntityDescriptor,
        owner_id: EntityId,
        relation: &RelationDescriptor,
        related_id: EntityId,
    ) -> Result<bool, AppError> {
        let (table, pivot_key, related_pivot_key) = pivot_columns(relation)?;
        let mut state = self.write();
        let Some(links) = state.pivots.get_mut(table) else {
            return Ok(false);
        };
        let before = links.len();
        links.retain(|l| !links_to(l, pivot_key, owner_id, related_pivot_key, related_id));
        Ok(links.len() < before)
    }
}
