//! Load config from JSON files and the environment, and resolve entity declarations.

use crate::config::resolved::{EntityDescriptor, EntityRegistry, FieldInfo, RelationDescriptor, RelationKind};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use crate::query::OrderBy;
use std::collections::HashMap;
use std::path::Path;

/// Env var naming a JSON file with a (partial) `RestConfig`.
pub const CONFIG_PATH_ENV: &str = "RESTGATE_CONFIG";

/// Build the entity registry from declarations (validates first).
pub fn resolve(configs: &[EntityConfig]) -> Result<EntityRegistry, ConfigError> {
    validate(configs)?;

    let mut entities = Vec::with_capacity(configs.len());
    let mut by_name = HashMap::new();

    for e in configs {
        let mut fields: Vec<FieldInfo> = e
            .fields
            .iter()
            .map(|f| FieldInfo {
                name: f.name.clone(),
                kind: f.kind,
            })
            .collect();
        if e.timestamps {
            for name in ["created_at", "updated_at"] {
                if !fields.iter().any(|f| f.name == name) {
                    fields.push(FieldInfo {
                        name: name.to_string(),
                        kind: FieldKind::Timestamp,
                    });
                }
            }
        }

        let relations = e.relations.iter().map(|r| resolve_relation(&e.name, r)).collect();
        let default_order = e.default_order.iter().map(|s| OrderBy::parse_signed(s)).collect();

        by_name.insert(e.name.clone(), entities.len());
        entities.push(EntityDescriptor {
            name: e.name.clone(),
            table: e.table.clone(),
            primary_key: e.primary_key.clone(),
            fields,
            relations,
            temporal_field: e.temporal_field.clone(),
            timestamps: e.timestamps,
            default_order,
            handler: e.handler.clone(),
        });
    }

    Ok(EntityRegistry { entities, by_name })
}

fn resolve_relation(owner: &str, r: &RelationConfig) -> RelationDescriptor {
    let kind = match r.kind {
        RelationKindConfig::BelongsTo => RelationKind::BelongsTo {
            foreign_key: r.foreign_key.clone().unwrap_or_else(|| format!("{}_id", r.name)),
        },
        RelationKindConfig::HasOne => RelationKind::HasOne {
            foreign_key: r.foreign_key.clone().unwrap_or_else(|| format!("{}_id", owner)),
        },
        RelationKindConfig::HasMany => RelationKind::HasMany {
            foreign_key: r.foreign_key.clone().unwrap_or_else(|| format!("{}_id", owner)),
        },
        RelationKindConfig::BelongsToMany => RelationKind::BelongsToMany {
            pivot_table: r.pivot_table.clone().unwrap_or_default(),
            pivot_key: r.pivot_key.clone().unwrap_or_else(|| format!("{}_id", owner)),
            related_pivot_key: r
                .related_pivot_key
                .clone()
                .unwrap_or_else(|| format!("{}_id", r.target)),
            pivot_fields: r.pivot_fields.clone(),
        },
    };
    RelationDescriptor {
        name: r.name.clone(),
        target: r.target.clone(),
        kind,
    }
}

impl RestConfig {
    /// Load `.env`, then the JSON file named by `RESTGATE_CONFIG` (defaults when unset),
    /// then the `RESTGATE_ROUTE_PREFIX` and `RESTGATE_CORS` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_path(&path)?,
            Err(_) => RestConfig::default(),
        };
        if let Ok(prefix) = std::env::var("RESTGATE_ROUTE_PREFIX") {
            config.route_prefix = prefix;
        }
        if let Ok(cors) = std::env::var("RESTGATE_CORS") {
            config.cors.enabled = cors.eq_ignore_ascii_case("true") || cors == "1";
        }
        tracing::debug!(prefix = %config.route_prefix, cors = config.cors.enabled, "rest config loaded");
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Load(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Load(e.to_string()))
    }
}

/// Read a JSON array of entity declarations and resolve it.
pub fn load_entities_from_path(path: impl AsRef<Path>) -> Result<EntityRegistry, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Load(e.to_string()))?;
    let configs: Vec<EntityConfig> = serde_json::from_str(&raw).map_err(|e| ConfigError::Load(e.to_string()))?;
    resolve(&configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cardinality;
    use crate::query::Direction;
    use serde_json::json;

    fn configs() -> Vec<EntityConfig> {
        serde_json::from_value(json!([
            {
                "name": "user",
                "table": "users",
                "fields": [{"name": "id", "type": "integer"}, {"name": "name", "type": "text"}],
                "timestamps": true,
                "default_order": ["-created_at"],
                "relations": [
                    {"name": "posts", "target": "post", "kind": "has_many"},
                    {"name": "roles", "target": "role", "kind": "belongs_to_many", "pivot_table": "role_user"}
                ]
            },
            {
                "name": "post",
                "table": "posts",
                "fields": [{"name": "id", "type": "integer"}, {"name": "user_id", "type": "integer"}],
                "relations": [{"name": "user", "target": "user", "kind": "belongs_to"}]
            },
            {"name": "role", "table": "roles", "fields": [{"name": "id", "type": "integer"}]}
        ]))
        .unwrap()
    }

    #[test]
    fn resolves_relations_with_default_keys() {
        let registry = resolve(&configs()).unwrap();
        let user = registry.get("user").unwrap();
        assert!(user.has_field("created_at"));
        assert_eq!(user.default_order[0].direction, Direction::Desc);

        let posts = user.relation("posts").unwrap();
        assert_eq!(posts.cardinality(), Cardinality::ToMany);
        assert_eq!(posts.kind, RelationKind::HasMany { foreign_key: "user_id".into() });

        let roles = user.relation("roles").unwrap();
        assert!(roles.is_mutable());
        match &roles.kind {
            RelationKind::BelongsToMany { pivot_key, related_pivot_key, .. } => {
                assert_eq!(pivot_key, "user_id");
                assert_eq!(related_pivot_key, "role_id");
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let author = registry.get("post").unwrap().relation("user").unwrap();
        assert_eq!(author.cardinality(), Cardinality::ToOne);
    }

    #[test]
    fn rejects_unknown_relation_target() {
        let mut cfg = configs();
        cfg[2].relations.push(RelationConfig {
            name: "groups".into(),
            target: "group".into(),
            kind: RelationKindConfig::HasMany,
            foreign_key: None,
            pivot_table: None,
            pivot_key: None,
            related_pivot_key: None,
            pivot_fields: vec![],
        });
        assert!(matches!(resolve(&cfg), Err(ConfigError::MissingReference { .. })));
    }

    #[test]
    fn rejects_missing_primary_key() {
        let mut cfg = configs();
        cfg[2].primary_key = "uuid".into();
        assert!(matches!(resolve(&cfg), Err(ConfigError::InvalidPrimaryKey { .. })));
    }

    #[test]
    fn rejects_pivotless_many_to_many() {
        let mut cfg = configs();
        cfg[0].relations[1].pivot_table = None;
        assert!(matches!(resolve(&cfg), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn partial_rest_config_keeps_defaults() {
        let cfg: RestConfig = serde_json::from_value(json!({
            "route_prefix": "v1",
            "keywords": {"where": "filter"}
        }))
        .unwrap();
        assert_eq!(cfg.route_prefix, "v1");
        assert_eq!(cfg.keywords.where_, "filter");
        assert_eq!(cfg.keywords.with, "with");
        assert!(!cfg.cors.enabled);
    }
}
