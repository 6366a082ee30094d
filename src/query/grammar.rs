//! Query parameter grammar: turns raw keyword values into typed directives.

use crate::error::AppError;
use crate::query::{Direction, Operator, OrderBy, Pagination, RelationsToLoad, SelectExpr, SelectField, WhereClause};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// `name(args)` with args `*`, identifiers or quoted strings, plus an optional `as alias`.
const RAW_EXPRESSION: &str = r#"(?i)^([a-z_][a-z0-9_]*\(\s*(?:\*|(?:[a-z_][a-z0-9_.]*|"[^"]*"|'[^']*')(?:\s*,\s*(?:[a-z_][a-z0-9_.]*|"[^"]*"|'[^']*'))*)?\s*\))(?:\s+as\s+([a-z_][a-z0-9_]*))?$"#;

fn raw_expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(RAW_EXPRESSION).expect("raw expression pattern is valid"))
}

/// `posts;author.country` -> ordered unique paths; any of `with_all` -> every relation.
pub fn parse_relations(value: &str, with_all: &[String]) -> RelationsToLoad {
    if with_all.iter().any(|w| w == value.trim()) {
        return RelationsToLoad::All;
    }
    let mut out = RelationsToLoad::None;
    for path in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        out.push(path);
    }
    out
}

fn parse_count(keyword: &str, value: &str) -> Result<u64, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::QueryParse(format!("{} must be a non-negative integer, got '{}'", keyword, value)))
}

/// Resolve limit and offset. Offset comes from exactly one source, in this order:
/// `page` (as `limit * (page - 1)`), then explicit `offset`, then the `limit=n,offset`
/// shorthand, else 0. `page` wins over `offset` when both are given.
pub fn parse_pagination(
    limit: Option<&str>,
    offset: Option<&str>,
    page: Option<&str>,
    max_limit: u64,
) -> Result<Option<Pagination>, AppError> {
    if limit.is_none() && offset.is_none() && page.is_none() {
        return Ok(None);
    }

    let (limit, inline_offset) = match limit {
        Some(raw) => match raw.split_once(',') {
            Some((l, o)) => (Some(parse_count("limit", l)?), Some(parse_count("offset", o)?)),
            None => (Some(parse_count("limit", raw)?), None),
        },
        None => (None, None),
    };
    let limit = limit.map(|l| l.min(max_limit));

    let offset = if let Some(page) = page {
        let page = parse_count("page", page)?;
        limit.unwrap_or(0).saturating_mul(page.saturating_sub(1))
    } else if let Some(offset) = offset {
        parse_count("offset", offset)?
    } else {
        inline_offset.unwrap_or(0)
    };

    Ok(Some(Pagination { limit, offset }))
}

/// `orderby=name,-created_at` plus optional `order=desc,asc`.
/// Per entry: a leading `-` wins, then an inline `asc`/`desc` token following the
/// field, then the positional `order` list, else ascending.
pub fn parse_order(order_by: &str, order: Option<&str>) -> Result<Vec<OrderBy>, AppError> {
    struct Entry {
        field: String,
        direction: Option<Direction>,
        signed: bool,
        inline: bool,
    }

    let mut entries: Vec<Entry> = Vec::new();
    for token in order_by.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some(dir) = Direction::from_token(token) {
            match entries.last_mut() {
                Some(last) if !last.inline => {
                    if !last.signed {
                        last.direction = Some(dir);
                    }
                    last.inline = true;
                    continue;
                }
                _ => {
                    return Err(AppError::QueryParse(format!(
                        "order direction '{}' has no field",
                        token
                    )))
                }
            }
        }
        let (field, signed) = match token.strip_prefix('-') {
            Some(f) => (f.trim(), true),
            None => (token, false),
        };
        if field.is_empty() {
            return Err(AppError::QueryParse("empty field in orderby".into()));
        }
        entries.push(Entry {
            field: field.to_string(),
            direction: signed.then_some(Direction::Desc),
            signed,
            inline: false,
        });
    }

    let listed: Vec<Direction> = match order {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                Direction::from_token(t)
                    .ok_or_else(|| AppError::QueryParse(format!("invalid order direction '{}'", t)))
            })
            .collect::<Result<_, _>>()?,
        None => Vec::new(),
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let direction = e.direction.or_else(|| listed.get(i).copied()).unwrap_or(Direction::Asc);
            OrderBy::new(e.field, direction)
        })
        .collect())
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AppError> {
    let v = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(v, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(v, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(AppError::QueryParse(format!("invalid timestamp '{}'", value)))
}

/// Split on `;` and top-level `,`; separators inside parentheses or quotes belong to
/// the expression. Unbalanced quotes or parentheses are a parse error.
fn split_select(value: &str) -> Result<Vec<String>, AppError> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;

    for c in value.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(AppError::QueryParse(format!("unbalanced parenthesis in '{}'", value)));
                    }
                    current.push(c);
                }
                ';' | ',' if depth == 0 => {
                    items.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err(AppError::QueryParse(format!("unbalanced quote in '{}'", value)));
    }
    if depth != 0 {
        return Err(AppError::QueryParse(format!("unbalanced parenthesis in '{}'", value)));
    }
    items.push(current);
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Position of the first `=` outside quotes and parentheses.
fn alias_separator(item: &str) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in item.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, '=') if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// `id,name;total=count(*)` -> `[id, name, count(*) AS total]`.
pub fn parse_select(value: &str) -> Result<Vec<SelectField>, AppError> {
    split_select(value)?
        .into_iter()
        .map(|item| parse_select_item(&item))
        .collect()
}

fn parse_select_item(item: &str) -> Result<SelectField, AppError> {
    let (alias, source) = match alias_separator(item) {
        Some(i) => {
            let alias = item[..i].trim();
            let source = item[i + 1..].trim();
            if alias.is_empty() || source.is_empty() {
                return Err(AppError::QueryParse(format!("invalid select alias '{}'", item)));
            }
            (Some(alias.to_string()), source)
        }
        None => (None, item.trim()),
    };

    if source == "*" {
        return Ok(SelectField {
            expr: SelectExpr::Wildcard,
            alias: None,
        });
    }

    if let Some(caps) = raw_expression().captures(source) {
        let inline_alias = caps.get(2).map(|m| m.as_str().to_string());
        return Ok(SelectField {
            expr: SelectExpr::Raw(caps[1].to_string()),
            alias: alias.or(inline_alias),
        });
    }

    Ok(SelectField {
        expr: SelectExpr::Field(source.to_string()),
        alias,
    })
}

/// One argument of a raw function-call expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallArg {
    Star,
    Ident(String),
    Literal(String),
}

/// Decomposed raw expression: lowercased function name and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub name: String,
    pub args: Vec<CallArg>,
}

/// Functions a raw select expression may call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Lower,
    Upper,
    Length,
    Concat,
    Coalesce,
}

impl Function {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "count" => Function::Count,
            "sum" => Function::Sum,
            "avg" => Function::Avg,
            "min" => Function::Min,
            "max" => Function::Max,
            "lower" => Function::Lower,
            "upper" => Function::Upper,
            "length" => Function::Length,
            "concat" => Function::Concat,
            "coalesce" => Function::Coalesce,
            _ => return None,
        })
    }

    /// Aggregates collapse the rows of a group into one value.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Function::Count | Function::Sum | Function::Avg | Function::Min | Function::Max
        )
    }
}

impl Call {
    /// The called function, checked for arity. Only `count` takes `*`.
    pub fn function(&self) -> Result<Function, AppError> {
        let f = Function::parse(&self.name)
            .ok_or_else(|| AppError::QueryParse(format!("unsupported function '{}'", self.name)))?;
        let star = self.args.iter().any(|a| *a == CallArg::Star);
        let arity_ok = match f {
            Function::Concat | Function::Coalesce => !self.args.is_empty(),
            _ => self.args.len() == 1,
        };
        if !arity_ok || (star && f != Function::Count) {
            return Err(AppError::QueryParse(format!(
                "invalid arguments for '{}'",
                self.name
            )));
        }
        Ok(f)
    }
}

/// Break a raw expression (as produced by `parse_select`) into name and arguments.
pub fn parse_call(expr: &str) -> Option<Call> {
    let caps = raw_expression().captures(expr.trim())?;
    let call = caps.get(1)?.as_str();
    let open = call.find('(')?;
    let name = call[..open].trim().to_ascii_lowercase();
    let inner = call[open + 1..call.len() - 1].trim();

    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pieces = Vec::new();
    for c in inner.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => pieces.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    if !inner.is_empty() {
        pieces.push(current);
    }
    for piece in pieces {
        let piece = piece.trim();
        let arg = if piece == "*" {
            CallArg::Star
        } else if piece.len() >= 2 && (piece.starts_with('\'') || piece.starts_with('"')) {
            CallArg::Literal(piece[1..piece.len() - 1].to_string())
        } else {
            CallArg::Ident(piece.to_string())
        };
        args.push(arg);
    }
    Some(Call { name, args })
}

/// `field,op,value` or `field,value` (equality). The value may itself contain commas.
pub fn parse_where(raw: &str) -> Result<WhereClause, AppError> {
    let parts: Vec<&str> = raw.splitn(3, ',').collect();
    let clause = match parts.as_slice() {
        [field, op, value] => {
            let op = Operator::parse(op)
                .ok_or_else(|| AppError::QueryParse(format!("unknown operator '{}' in where '{}'", op.trim(), raw)))?;
            WhereClause {
                field: field.trim().to_string(),
                op,
                value: value.trim().to_string(),
            }
        }
        [field, value] => WhereClause::eq(field.trim(), value.trim()),
        _ => {
            return Err(AppError::QueryParse(format!(
                "where clause '{}' needs a field and a value",
                raw
            )))
        }
    };
    if clause.field.is_empty() {
        return Err(AppError::QueryParse(format!("where clause '{}' has no field", raw)));
    }
    Ok(clause)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderby_signed_entries() {
        let order = parse_order("name,-created_at", None).unwrap();
        assert_eq!(
            order,
            vec![OrderBy::new("name", Direction::Asc), OrderBy::new("created_at", Direction::Desc)]
        );
    }

    #[test]
    fn orderby_inline_direction_suffix() {
        let order = parse_order("name,desc,age", None).unwrap();
        assert_eq!(
            order,
            vec![OrderBy::new("name", Direction::Desc), OrderBy::new("age", Direction::Asc)]
        );
    }

    #[test]
    fn leading_minus_overrides_direction_list() {
        let order = parse_order("-name,age", Some("asc,desc")).unwrap();
        assert_eq!(
            order,
            vec![OrderBy::new("name", Direction::Desc), OrderBy::new("age", Direction::Desc)]
        );
    }

    #[test]
    fn dangling_direction_is_rejected() {
        assert!(matches!(parse_order("desc", None), Err(AppError::QueryParse(_))));
        assert!(matches!(parse_order("name", Some("up")), Err(AppError::QueryParse(_))));
    }

    #[test]
    fn offset_precedence_page_then_offset_then_zero() {
        let p = parse_pagination(Some("10"), Some("3"), Some("3"), 1000).unwrap().unwrap();
        assert_eq!(p, Pagination { limit: Some(10), offset: 20 });

        let p = parse_pagination(Some("10"), Some("3"), None, 1000).unwrap().unwrap();
        assert_eq!(p.offset, 3);

        let p = parse_pagination(Some("10"), None, None, 1000).unwrap().unwrap();
        assert_eq!(p.offset, 0);

        assert_eq!(parse_pagination(None, None, None, 1000).unwrap(), None);
    }

    #[test]
    fn offset_is_never_applied_twice() {
        for (limit, offset, page) in [
            (Some("5"), Some("7"), Some("2")),
            (Some("5,9"), Some("7"), None),
            (Some("5,9"), None, Some("2")),
            (Some("5,9"), None, None),
            (None, Some("7"), None),
            (None, None, Some("4")),
        ] {
            let p = parse_pagination(limit, offset, page, 1000).unwrap().unwrap();
            let expected = match (page, offset) {
                (Some(page), _) => p.limit.unwrap_or(0) * (page.parse::<u64>().unwrap() - 1),
                (None, Some(o)) => o.parse().unwrap(),
                (None, None) => 9,
            };
            assert_eq!(p.offset, expected, "limit={:?} offset={:?} page={:?}", limit, offset, page);
        }
    }

    #[test]
    fn limit_is_capped_and_validated() {
        let p = parse_pagination(Some("5000"), None, None, 1000).unwrap().unwrap();
        assert_eq!(p.limit, Some(1000));
        assert!(matches!(parse_pagination(Some("ten"), None, None, 1000), Err(AppError::QueryParse(_))));
        assert!(matches!(parse_pagination(None, Some("-1"), None, 1000), Err(AppError::QueryParse(_))));
    }

    #[test]
    fn page_zero_behaves_like_first_page() {
        let p = parse_pagination(Some("10"), None, Some("0"), 1000).unwrap().unwrap();
        assert_eq!(p.offset, 0);
    }

    #[test]
    fn select_alias_and_aggregate() {
        let fields = parse_select("id,name;total=count(*)").unwrap();
        assert_eq!(
            fields,
            vec![
                SelectField::field("id"),
                SelectField::field("name"),
                SelectField {
                    expr: SelectExpr::Raw("count(*)".into()),
                    alias: Some("total".into()),
                },
            ]
        );
    }

    #[test]
    fn select_plain_alias_rewrites_field() {
        let fields = parse_select("label=name").unwrap();
        assert_eq!(
            fields,
            vec![SelectField {
                expr: SelectExpr::Field("name".into()),
                alias: Some("label".into()),
            }]
        );
    }

    #[test]
    fn select_function_with_arguments_and_inline_alias() {
        let fields = parse_select(r#"concat(first_name, " ", last_name) as full;max(age)"#).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].expr, SelectExpr::Raw(r#"concat(first_name, " ", last_name)"#.into()));
        assert_eq!(fields[0].alias.as_deref(), Some("full"));
        assert_eq!(fields[1].expr, SelectExpr::Raw("max(age)".into()));
    }

    #[test]
    fn select_non_matching_expression_is_literal_field() {
        let fields = parse_select("weird-name").unwrap();
        assert_eq!(fields, vec![SelectField::field("weird-name")]);
        let fields = parse_select("count(*) drop").unwrap();
        assert_eq!(fields, vec![SelectField::field("count(*) drop")]);
    }

    #[test]
    fn select_unbalanced_quote_is_error() {
        assert!(matches!(parse_select(r#"concat(name, ")"#), Err(AppError::QueryParse(_))));
        assert!(matches!(parse_select("count(*"), Err(AppError::QueryParse(_))));
    }

    #[test]
    fn raw_call_decomposes_into_arguments() {
        let call = parse_call("CONCAT(name, ', ', email)").unwrap();
        assert_eq!(call.name, "concat");
        assert_eq!(
            call.args,
            vec![
                CallArg::Ident("name".into()),
                CallArg::Literal(", ".into()),
                CallArg::Ident("email".into())
            ]
        );
        assert_eq!(parse_call("count(*)").unwrap().args, vec![CallArg::Star]);
        assert!(parse_call("now()").unwrap().args.is_empty());
        assert!(parse_call("name").is_none());
    }

    #[test]
    fn raw_call_functions_are_whitelisted() {
        assert_eq!(parse_call("COUNT(*)").unwrap().function().unwrap(), Function::Count);
        assert!(parse_call("sum(*)").unwrap().function().is_err());
        assert!(parse_call("pg_sleep('1')").unwrap().function().is_err());
        assert!(parse_call("lower(a, b)").unwrap().function().is_err());
        assert!(Function::Max.is_aggregate());
        assert!(!Function::Lower.is_aggregate());
    }

    #[test]
    fn where_triple_and_pair() {
        assert_eq!(
            parse_where("age,>,18").unwrap(),
            WhereClause {
                field: "age".into(),
                op: Operator::Gt,
                value: "18".into(),
            }
        );
        assert_eq!(parse_where("name,bob").unwrap(), WhereClause::eq("name", "bob"));
        assert_eq!(parse_where("email,like,%a,b%").unwrap().value, "%a,b%");
    }

    #[test]
    fn where_without_field_is_error() {
        assert!(matches!(parse_where("18"), Err(AppError::QueryParse(_))));
        assert!(matches!(parse_where(",=,3"), Err(AppError::QueryParse(_))));
        assert!(matches!(parse_where("age,~,3"), Err(AppError::QueryParse(_))));
    }

    #[test]
    fn relations_wildcard_and_paths() {
        let all = vec!["*".to_string(), "all".to_string()];
        assert_eq!(parse_relations("*", &all), RelationsToLoad::All);
        assert_eq!(parse_relations("all", &all), RelationsToLoad::All);
        assert_eq!(
            parse_relations("posts; author.country;posts", &all),
            RelationsToLoad::Paths(vec!["posts".into(), "author.country".into()])
        );
    }

    #[test]
    fn timestamps_accept_common_forms() {
        assert!(parse_timestamp("2024-01-02").is_ok());
        assert!(parse_timestamp("2024-01-02 10:00:00").is_ok());
        assert!(parse_timestamp("2024-01-02T10:00:00+02:00").is_ok());
        assert!(matches!(parse_timestamp("yesterday"), Err(AppError::QueryParse(_))));
    }
}
