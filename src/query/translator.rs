//! Applies a `ParsedQuery` to a storage query in a fixed order.

use crate::config::EntityDescriptor;
use crate::query::{Direction, ParsedQuery, SelectField, WhereClause};
use chrono::{DateTime, Utc};

/// Composable query capability the storage engine exposes for one entity type.
pub trait QueryBuilder {
    /// Eager-load these relation paths (dotted for nested loads).
    fn with(&mut self, relations: &[String]);
    fn take(&mut self, limit: u64);
    fn skip(&mut self, offset: u64);
    fn order_by(&mut self, field: &str, direction: Direction);
    /// Inclusive range on `field`; either bound may be absent.
    fn where_range(&mut self, field: &str, from: Option<&DateTime<Utc>>, to: Option<&DateTime<Utc>>);
    fn select(&mut self, fields: &[SelectField]);
    fn where_clause(&mut self, clause: &WhereClause);
    fn distinct(&mut self);
}

pub struct QueryTranslator;

impl QueryTranslator {
    /// Apply every directive: relations, pagination, ordering, temporal range,
    /// selection, where clauses, distinct. Steps never reorder; absent ones are skipped.
    pub fn apply<Q: QueryBuilder + ?Sized>(entity: &EntityDescriptor, parsed: &ParsedQuery, query: &mut Q) {
        Self::apply_relations(entity, parsed, query);

        if let Some(p) = &parsed.pagination {
            if let Some(limit) = p.limit {
                query.take(limit);
            }
            query.skip(p.offset);
        }

        for o in &parsed.order_by {
            query.order_by(&o.field, o.direction);
        }

        if let Some(range) = &parsed.temporal {
            query.where_range(&range.field, range.from.as_ref(), range.to.as_ref());
        }

        Self::apply_selection(parsed, query);

        for clause in &parsed.wheres {
            query.where_clause(clause);
        }

        if parsed.distinct {
            query.distinct();
        }
    }

    /// Only relations and selection; used for single-record reads.
    pub fn apply_relations_and_selection<Q: QueryBuilder + ?Sized>(
        entity: &EntityDescriptor,
        parsed: &ParsedQuery,
        query: &mut Q,
    ) {
        Self::apply_relations(entity, parsed, query);
        Self::apply_selection(parsed, query);
    }

    fn apply_relations<Q: QueryBuilder + ?Sized>(entity: &EntityDescriptor, parsed: &ParsedQuery, query: &mut Q) {
        let paths = parsed.relations.paths(entity);
        if !paths.is_empty() {
            query.with(&paths);
        }
    }

    fn apply_selection<Q: QueryBuilder + ?Sized>(parsed: &ParsedQuery, query: &mut Q) {
        if !parsed.select.is_empty() {
            query.select(&parsed.select);
        }
    }
}
