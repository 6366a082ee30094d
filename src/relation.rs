//! Relation resolution: dotted relation paths to validated hops over declared relations.

use crate::config::{Cardinality, EntityDescriptor, EntityRegistry, RelationDescriptor};
use crate::error::AppError;
use serde_json::{Map, Value};

/// A relation path split into hop names, e.g. `author.country` -> [author, country].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationPath {
    pub raw: String,
    pub segments: Vec<String>,
}

impl RelationPath {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let segments: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
        if segments.iter().any(String::is_empty) {
            return Err(AppError::InvalidRelationChain {
                path: raw.to_string(),
                reason: "empty relation name".into(),
            });
        }
        Ok(RelationPath {
            raw: raw.to_string(),
            segments,
        })
    }
}

/// One validated step: `owner --relation--> target`.
#[derive(Clone, Copy, Debug)]
pub struct RelationHop<'a> {
    pub owner: &'a EntityDescriptor,
    pub relation: &'a RelationDescriptor,
    pub target: &'a EntityDescriptor,
}

/// Nested eager-load request for one relation, with its own nested relations.
#[derive(Clone, Debug)]
pub struct EagerNode<'a> {
    pub relation: &'a RelationDescriptor,
    pub target: &'a EntityDescriptor,
    pub children: Vec<EagerNode<'a>>,
}

pub struct RelationResolver<'a> {
    registry: &'a EntityRegistry,
}

impl<'a> RelationResolver<'a> {
    pub fn new(registry: &'a EntityRegistry) -> Self {
        RelationResolver { registry }
    }

    fn hop(&self, owner: &'a EntityDescriptor, name: &str) -> Result<RelationHop<'a>, AppError> {
        let relation = owner.relation(name).ok_or_else(|| AppError::RelationNotFound {
            entity: owner.name.clone(),
            relation: name.to_string(),
        })?;
        let target = self.registry.get(&relation.target).ok_or_else(|| AppError::RelationNotFound {
            entity: owner.name.clone(),
            relation: name.to_string(),
        })?;
        Ok(RelationHop { owner, relation, target })
    }

    /// Hops for walking a path from one record. Every hop but the last must be to-one,
    /// since the walk follows a single related record at each intermediate step.
    pub fn traverse(&self, entity: &'a EntityDescriptor, path: &str) -> Result<Vec<RelationHop<'a>>, AppError> {
        let path = RelationPath::parse(path)?;
        let mut hops = Vec::with_capacity(path.segments.len());
        let mut current = entity;
        for (i, name) in path.segments.iter().enumerate() {
            let hop = self.hop(current, name)?;
            let last = i + 1 == path.segments.len();
            if !last && hop.relation.cardinality() == Cardinality::ToMany {
                return Err(AppError::InvalidRelationChain {
                    path: path.raw.clone(),
                    reason: format!("intermediate relation '{}' is to-many", name),
                });
            }
            current = hop.target;
            hops.push(hop);
        }
        Ok(hops)
    }

    /// Entity type at the end of a traversal path.
    pub fn terminal(&self, entity: &'a EntityDescriptor, path: &str) -> Result<&'a EntityDescriptor, AppError> {
        let hops = self.traverse(entity, path)?;
        Ok(hops.last().map(|h| h.target).unwrap_or(entity))
    }

    /// Merge eager-load paths into a tree. Any hop may be to-many here: nested loads
    /// attach collections at each level.
    pub fn eager_tree(&self, entity: &'a EntityDescriptor, paths: &[String]) -> Result<Vec<EagerNode<'a>>, AppError> {
        let mut roots: Vec<EagerNode<'a>> = Vec::new();
        for raw in paths {
            let path = RelationPath::parse(raw)?;
            let mut level = &mut roots;
            let mut owner = entity;
            for name in &path.segments {
                let hop = self.hop(owner, name)?;
                let idx = match level.iter().position(|n| n.relation.name == *name) {
                    Some(i) => i,
                    None => {
                        level.push(EagerNode {
                            relation: hop.relation,
                            target: hop.target,
                            children: Vec::new(),
                        });
                        level.len() - 1
                    }
                };
                owner = hop.target;
                level = &mut level[idx].children;
            }
        }
        Ok(roots)
    }

    /// Narrow a loaded relation set to the member whose primary key equals `related_id`.
    /// Absence is a valid empty result, not an error.
    pub fn narrow(records: Vec<Map<String, Value>>, primary_key: &str, related_id: i64) -> Option<Map<String, Value>> {
        records
            .into_iter()
            .find(|r| r.get(primary_key).and_then(Value::as_i64) == Some(related_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, EntityConfig};
    use serde_json::json;

    fn registry() -> EntityRegistry {
        let cfg: Vec<EntityConfig> = serde_json::from_value(json!([
            {
                "name": "post", "table": "posts",
                "fields": [{"name": "id", "type": "integer"}, {"name": "author_id", "type": "integer"}],
                "relations": [
                    {"name": "author", "target": "user", "kind": "belongs_to"},
                    {"name": "comments", "target": "comment", "kind": "has_many"}
                ]
            },
            {
                "name": "user", "table": "users",
                "fields": [{"name": "id", "type": "integer"}, {"name": "country_id", "type": "integer"}],
                "relations": [
                    {"name": "country", "target": "country", "kind": "belongs_to"},
                    {"name": "posts", "target": "post", "kind": "has_many", "foreign_key": "author_id"}
                ]
            },
            {"name": "country", "table": "countries", "fields": [{"name": "id", "type": "integer"}]},
            {"name": "comment", "table": "comments", "fields": [{"name": "id", "type": "integer"}, {"name": "post_id", "type": "integer"}]}
        ]))
        .unwrap();
        resolve(&cfg).unwrap()
    }

    #[test]
    fn chained_to_one_path_resolves_terminal() {
        let reg = registry();
        let resolver = RelationResolver::new(&reg);
        let post = reg.get("post").unwrap();
        let hops = resolver.traverse(post, "author.country").unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].target.name, "user");
        assert_eq!(resolver.terminal(post, "author.country").unwrap().name, "country");
    }

    #[test]
    fn to_many_intermediate_hop_is_invalid() {
        let reg = registry();
        let resolver = RelationResolver::new(&reg);
        let user = reg.get("user").unwrap();
        assert!(matches!(
            resolver.traverse(user, "posts.comments"),
            Err(AppError::InvalidRelationChain { .. })
        ));
        // The final hop may be to-many.
        assert!(resolver.traverse(reg.get("post").unwrap(), "author.posts").is_ok());
    }

    #[test]
    fn unknown_relation_is_not_found() {
        let reg = registry();
        let resolver = RelationResolver::new(&reg);
        assert!(matches!(
            resolver.traverse(reg.get("user").unwrap(), "author"),
            Err(AppError::RelationNotFound { .. })
        ));
        assert!(matches!(
            resolver.traverse(reg.get("user").unwrap(), "country..x"),
            Err(AppError::InvalidRelationChain { .. })
        ));
    }

    #[test]
    fn eager_tree_merges_shared_prefixes() {
        let reg = registry();
        let resolver = RelationResolver::new(&reg);
        let user = reg.get("user").unwrap();
        let tree = resolver
            .eager_tree(user, &["posts.comments".into(), "posts.author".into(), "country".into()])
            .unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].relation.name, "posts");
        let children: Vec<&str> = tree[0].children.iter().map(|c| c.relation.name.as_str()).collect();
        assert_eq!(children, vec!["comments", "author"]);
    }

    #[test]
    fn narrow_returns_member_or_none() {
        let rows: Vec<Map<String, Value>> = vec![
            json!({"id": 1}).as_object().unwrap().clone(),
            json!({"id": 3}).as_object().unwrap().clone(),
        ];
        assert!(RelationResolver::narrow(rows.clone(), "id", 3).is_some());
        assert!(RelationResolver::narrow(rows, "id", 9).is_none());
    }
}
