//! Raw config types: request keywords, CORS, and entity registration as read from JSON.

use serde::{Deserialize, Serialize};

/// Process-level configuration handed to the dispatcher and translator at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Path prefix of every API call, e.g. `api` for `/api/users`.
    pub route_prefix: String,
    /// Pattern the `{resource}` segment must match (plural names by default).
    pub resource_pattern: String,
    /// Whether handler identifiers are plural (`Users`) or singular (`User`).
    pub handler_plural: bool,
    /// Temporal field for entities with timestamps and no explicit temporal field.
    pub default_temporal_field: String,
    /// Upper bound applied to any requested limit.
    pub max_limit: u64,
    pub body_limit_bytes: usize,
    pub keywords: Keywords,
    pub cors: CorsConfig,
}

impl Default for RestConfig {
    fn default() -> Self {
        RestConfig {
            route_prefix: "api".into(),
            resource_pattern: "^[a-zA-Z0-9_]+$".into(),
            handler_plural: true,
            default_temporal_field: "created_at".into(),
            max_limit: 1000,
            body_limit_bytes: 1024 * 1024,
            keywords: Keywords::default(),
            cors: CorsConfig::default(),
        }
    }
}

/// Query-string keyword names. Every name is configurable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Keywords {
    pub with: String,
    /// Values of `with` meaning "every declared relation".
    pub with_all: Vec<String>,
    pub limit: String,
    pub offset: String,
    pub page: String,
    pub order_by: String,
    /// Direction list applied by position to `order_by` entries.
    pub order: String,
    pub from: String,
    pub to: String,
    pub select: String,
    #[serde(rename = "where")]
    pub where_: String,
    pub distinct: String,
    pub all: String,
    pub sync_without_detaching: String,
}

impl Default for Keywords {
    fn default() -> Self {
        Keywords {
            with: "with".into(),
            with_all: vec!["*".into(), "all".into()],
            limit: "limit".into(),
            offset: "offset".into(),
            page: "page".into(),
            order_by: "orderby".into(),
            order: "order".into(),
            from: "from".into(),
            to: "to".into(),
            select: "select".into(),
            where_: "where".into(),
            distinct: "distinct".into(),
            all: "all".into(),
            sync_without_detaching: "sync_without_detaching".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origins: String,
    pub allow_methods: Vec<String>,
    pub allow_headers: String,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            enabled: false,
            allow_origins: "*".into(),
            allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_headers: "Content-Type, Authorization".into(),
            allow_credentials: false,
        }
    }
}

/// Declared kind of an entity field. Drives value coercion and body checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    Bool,
    Timestamp,
    Date,
    Json,
}

impl FieldKind {
    pub fn is_date_like(self) -> bool {
        matches!(self, FieldKind::Timestamp | FieldKind::Date)
    }

    /// PostgreSQL cast used when binding a parameter to a column of this kind.
    pub fn pg_cast(self) -> Option<&'static str> {
        match self {
            FieldKind::Integer => Some("bigint"),
            FieldKind::Float => Some("double precision"),
            FieldKind::Bool => Some("boolean"),
            FieldKind::Timestamp => Some("timestamptz"),
            FieldKind::Date => Some("date"),
            FieldKind::Json => Some("jsonb"),
            FieldKind::Text => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKindConfig {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationConfig {
    pub name: String,
    /// Name of the related entity.
    pub target: String,
    pub kind: RelationKindConfig,
    /// Foreign key column: on this entity for belongs_to, on the target for has_one/has_many.
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub pivot_table: Option<String>,
    /// Pivot column referencing this entity (belongs_to_many).
    #[serde(default)]
    pub pivot_key: Option<String>,
    /// Pivot column referencing the target (belongs_to_many).
    #[serde(default)]
    pub related_pivot_key: Option<String>,
    /// Extra pivot columns returned with related rows.
    #[serde(default)]
    pub pivot_fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Entity name, e.g. `user`. Resource `users` resolves to it.
    pub name: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
    #[serde(default)]
    pub temporal_field: Option<String>,
    #[serde(default)]
    pub timestamps: bool,
    /// Entries like `name` or `-created_at`.
    #[serde(default)]
    pub default_order: Vec<String>,
    /// Handler identifier override; defaults to the transformed entity name.
    #[serde(default)]
    pub handler: Option<String>,
}

fn default_primary_key() -> String {
    "id".into()
}
