//! Config validation: referential integrity of entity declarations.

use crate::config::{EntityConfig, RelationKindConfig};
use crate::error::ConfigError;
use std::collections::HashSet;

const TIMESTAMP_FIELDS: [&str; 2] = ["created_at", "updated_at"];

pub fn validate(entities: &[EntityConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for e in entities {
        if !names.insert(e.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                kind: "entity",
                name: e.name.clone(),
            });
        }
    }

    for e in entities {
        let mut fields: HashSet<&str> = e.fields.iter().map(|f| f.name.as_str()).collect();
        if e.timestamps {
            fields.extend(TIMESTAMP_FIELDS);
        }
        if !fields.contains(e.primary_key.as_str()) {
            return Err(ConfigError::InvalidPrimaryKey {
                entity: e.name.clone(),
                field: e.primary_key.clone(),
            });
        }
        if let Some(tf) = &e.temporal_field {
            if !fields.contains(tf.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "temporal field",
                    id: format!("{}.{}", e.name, tf),
                });
            }
        }
        for entry in &e.default_order {
            let field = entry.trim_start_matches('-');
            if !fields.contains(field) {
                return Err(ConfigError::MissingReference {
                    kind: "default order field",
                    id: format!("{}.{}", e.name, field),
                });
            }
        }

        let mut relation_names = HashSet::new();
        for r in &e.relations {
            if !relation_names.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    kind: "relation",
                    name: format!("{}.{}", e.name, r.name),
                });
            }
            if !names.contains(r.target.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "relation target",
                    id: r.target.clone(),
                });
            }
            if r.kind == RelationKindConfig::BelongsToMany && r.pivot_table.is_none() {
                return Err(ConfigError::Validation(format!(
                    "relation {}.{} is belongs_to_many but declares no pivot_table",
                    e.name, r.name
                )));
            }
            if r.kind == RelationKindConfig::BelongsTo {
                let fk = r
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{}_id", r.name));
                if !fields.contains(fk.as_str()) {
                    return Err(ConfigError::MissingReference {
                        kind: "foreign key field",
                        id: format!("{}.{}", e.name, fk),
                    });
                }
            }
        }
    }

    Ok(())
}
