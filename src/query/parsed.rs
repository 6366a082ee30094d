//! Normalized, typed directives of one request's query string.

use crate::config::{EntityDescriptor, RelationKind, RestConfig};
use crate::error::AppError;
use crate::query::grammar;
use crate::query::QueryParams;
use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// `asc` / `desc`, case-insensitive.
    pub fn from_token(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Direction::Asc),
            "desc" => Some(Direction::Desc),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        OrderBy {
            field: field.into(),
            direction,
        }
    }

    /// `name` -> ascending, `-name` -> descending.
    pub fn parse_signed(s: &str) -> Self {
        match s.trim().strip_prefix('-') {
            Some(field) => OrderBy::new(field, Direction::Desc),
            None => OrderBy::new(s.trim(), Direction::Asc),
        }
    }
}

/// Relations requested for eager loading.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RelationsToLoad {
    #[default]
    None,
    /// Every relation the entity declares.
    All,
    /// Ordered, duplicate-free relation paths (possibly dotted).
    Paths(Vec<String>),
}

impl RelationsToLoad {
    pub fn is_empty(&self) -> bool {
        match self {
            RelationsToLoad::None => true,
            RelationsToLoad::All => false,
            RelationsToLoad::Paths(p) => p.is_empty(),
        }
    }

    /// Add one path, keeping order and uniqueness. `All` already covers it.
    pub fn push(&mut self, path: &str) {
        match self {
            RelationsToLoad::All => {}
            RelationsToLoad::None => *self = RelationsToLoad::Paths(vec![path.to_string()]),
            RelationsToLoad::Paths(p) => {
                if !p.iter().any(|x| x == path) {
                    p.push(path.to_string());
                }
            }
        }
    }

    /// Concrete paths against an entity; `All` expands to its declared relations.
    pub fn paths(&self, entity: &EntityDescriptor) -> Vec<String> {
        match self {
            RelationsToLoad::None => Vec::new(),
            RelationsToLoad::All => entity.relation_names(),
            RelationsToLoad::Paths(p) => p.clone(),
        }
    }
}

/// Resolved pagination. `offset` is already the winner of the page/offset tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub limit: Option<u64>,
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TemporalRange {
    pub field: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectExpr {
    /// Literal field reference.
    Field(String),
    /// Every field (`*`).
    Wildcard,
    /// Function-call expression passed through to storage untouched.
    Raw(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectField {
    pub expr: SelectExpr,
    pub alias: Option<String>,
}

impl SelectField {
    pub fn field(name: impl Into<String>) -> Self {
        SelectField {
            expr: SelectExpr::Field(name.into()),
            alias: None,
        }
    }

    /// Key under which the value appears in the result record.
    pub fn output_name(&self) -> &str {
        match (&self.alias, &self.expr) {
            (Some(a), _) => a,
            (None, SelectExpr::Field(f)) => f,
            (None, SelectExpr::Raw(r)) => r,
            (None, SelectExpr::Wildcard) => "*",
        }
    }

    /// Whether this selection yields `field` under its own name.
    pub fn covers(&self, field: &str) -> bool {
        match &self.expr {
            SelectExpr::Wildcard => true,
            SelectExpr::Field(f) => f == field && self.alias.as_deref().map_or(true, |a| a == field),
            SelectExpr::Raw(_) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    ILike,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Operator::Eq,
            "!=" | "<>" | "ne" => Operator::Ne,
            "<" | "lt" => Operator::Lt,
            "<=" | "le" | "lte" => Operator::Le,
            ">" | "gt" => Operator::Gt,
            ">=" | "ge" | "gte" => Operator::Ge,
            "like" => Operator::Like,
            "not like" => Operator::NotLike,
            "ilike" => Operator::ILike,
            _ => return None,
        })
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::ILike => "ILIKE",
        }
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike | Operator::ILike)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WhereClause {
    pub field: String,
    pub op: Operator,
    pub value: String,
}

impl WhereClause {
    pub fn eq(field: impl Into<String>, value: impl ToString) -> Self {
        WhereClause {
            field: field.into(),
            op: Operator::Eq,
            value: value.to_string(),
        }
    }
}

/// Every directive of one request, built once and never mutated by the translator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedQuery {
    pub relations: RelationsToLoad,
    pub pagination: Option<Pagination>,
    pub order_by: Vec<OrderBy>,
    pub temporal: Option<TemporalRange>,
    pub select: Vec<SelectField>,
    pub wheres: Vec<WhereClause>,
    pub distinct: bool,
}

impl ParsedQuery {
    /// Interpret `params` for `entity`. Lenient about relation names (checked at load time),
    /// strict about syntax.
    pub fn parse(entity: &EntityDescriptor, params: &QueryParams, config: &RestConfig) -> Result<Self, AppError> {
        let kw = &config.keywords;

        let relations = match params.filled(&kw.with) {
            Some(v) => grammar::parse_relations(v, &kw.with_all),
            None => RelationsToLoad::None,
        };

        let pagination = grammar::parse_pagination(
            params.filled(&kw.limit),
            params.filled(&kw.offset),
            params.filled(&kw.page),
            config.max_limit,
        )?;

        let order_by = match params.filled(&kw.order_by) {
            Some(v) => grammar::parse_order(v, params.filled(&kw.order))?,
            None => Vec::new(),
        };

        let from = params.filled(&kw.from).map(grammar::parse_timestamp).transpose()?;
        let to = params.filled(&kw.to).map(grammar::parse_timestamp).transpose()?;
        let temporal = if from.is_some() || to.is_some() {
            temporal_field(entity, config).map(|field| TemporalRange { field, from, to })
        } else {
            None
        };

        let select = match params.filled(&kw.select) {
            Some(v) => grammar::parse_select(v)?,
            None => Vec::new(),
        };

        let mut wheres = Vec::new();
        for raw in params.all(&kw.where_) {
            wheres.push(grammar::parse_where(raw)?);
        }

        let mut parsed = ParsedQuery {
            relations,
            pagination,
            order_by,
            temporal,
            select,
            wheres,
            distinct: params.flag(&kw.distinct),
        };
        parsed.ensure_relation_keys(entity);
        Ok(parsed)
    }

    /// Relations cannot be loaded without the primary key (and, for belongs_to, the
    /// foreign key) in the selection. Idempotent.
    pub fn ensure_relation_keys(&mut self, entity: &EntityDescriptor) {
        if self.select.is_empty() || self.relations.is_empty() {
            return;
        }
        let mut required = vec![entity.primary_key.clone()];
        for path in self.relations.paths(entity) {
            let first = path.split('.').next().unwrap_or_default();
            if let Some(RelationKind::BelongsTo { foreign_key }) = entity.relation(first).map(|r| &r.kind) {
                required.push(foreign_key.clone());
            }
        }
        for field in required {
            if !self.select.iter().any(|s| s.covers(&field)) {
                self.select.push(SelectField::field(field));
            }
        }
    }

    /// Selection as storage should apply it: the explicit list, or every declared field.
    pub fn resolved_selection(&self, entity: &EntityDescriptor) -> Vec<SelectField> {
        if self.select.is_empty() {
            entity.fields.iter().map(|f| SelectField::field(f.name.clone())).collect()
        } else {
            self.select.clone()
        }
    }

    /// Keep only eager loading and field selection (single-record reads).
    pub fn relations_and_selection(&self) -> ParsedQuery {
        ParsedQuery {
            relations: self.relations.clone(),
            select: self.select.clone(),
            ..ParsedQuery::default()
        }
    }
}

/// Declared temporal field, else the configured timestamp field when timestamps are on,
/// else the first date-like field, else none (range filtering is skipped).
pub fn temporal_field(entity: &EntityDescriptor, config: &RestConfig) -> Option<String> {
    if let Some(f) = &entity.temporal_field {
        return Some(f.clone());
    }
    if entity.timestamps {
        return Some(config.default_temporal_field.clone());
    }
    entity.first_date_field().map(|f| f.name.clone())
}
