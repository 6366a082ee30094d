//! Identifier transforms for handler resolution: singular/plural inflection and PascalCase.

/// Words whose plural is not formed by a suffix rule.
const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("man", "men"),
    ("woman", "women"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("foot", "feet"),
    ("tooth", "teeth"),
];

/// Words with identical singular and plural.
const UNCOUNTABLE: &[&str] = &["data", "media", "news", "series", "species", "information", "equipment"];

/// Convert snake_case or kebab-case to PascalCase.
/// e.g. "blog_post" -> "BlogPost", "user" -> "User"
pub fn to_pascal_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = true;
    for c in s.chars() {
        if c == '_' || c == '-' {
            capitalize_next = true;
        } else if capitalize_next {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Singular form of the last word of an identifier.
/// e.g. "users" -> "user", "categories" -> "category", "blog_posts" -> "blog_post"
pub fn singularize(s: &str) -> String {
    let (head, word) = split_last_word(s);
    let lower = word.to_ascii_lowercase();
    if UNCOUNTABLE.contains(&lower.as_str()) {
        return s.to_string();
    }
    if let Some((singular, _)) = IRREGULAR.iter().find(|(_, p)| *p == lower) {
        return format!("{}{}", head, match_case(word, singular));
    }
    if IRREGULAR.iter().any(|(sg, _)| *sg == lower) {
        return s.to_string();
    }
    let stem = if let Some(stem) = lower.strip_suffix("ies") {
        if stem.is_empty() {
            word.to_string()
        } else {
            format!("{}y", &word[..stem.len()])
        }
    } else if ["sses", "xes", "zes", "ches", "shes"].iter().any(|suf| lower.ends_with(suf)) {
        word[..word.len() - 2].to_string()
    } else if lower.ends_with("ss") || lower.ends_with("us") || lower.ends_with("is") {
        word.to_string()
    } else if let Some(stem) = lower.strip_suffix('s') {
        word[..stem.len()].to_string()
    } else {
        word.to_string()
    };
    format!("{}{}", head, stem)
}

/// Plural form of the last word of an identifier.
/// e.g. "user" -> "users", "category" -> "categories", "box" -> "boxes"
pub fn pluralize(s: &str) -> String {
    let (head, word) = split_last_word(s);
    let lower = word.to_ascii_lowercase();
    if UNCOUNTABLE.contains(&lower.as_str()) {
        return s.to_string();
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(sg, _)| *sg == lower) {
        return format!("{}{}", head, match_case(word, plural));
    }
    if IRREGULAR.iter().any(|(_, p)| *p == lower) {
        return s.to_string();
    }
    let plural = if lower.ends_with('y')
        && lower.len() > 1
        && !matches!(lower.as_bytes()[lower.len() - 2], b'a' | b'e' | b'i' | b'o' | b'u')
    {
        format!("{}ies", &word[..word.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|suf| lower.ends_with(suf)) {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    };
    format!("{}{}", head, plural)
}

/// Handler identifier for a URL resource name: singularize, optionally pluralize again, PascalCase.
/// e.g. ("blog_posts", plural = true) -> "BlogPosts", ("users", plural = false) -> "User"
pub fn handler_identifier(resource: &str, plural: bool) -> String {
    let singular = singularize(resource);
    let name = if plural { pluralize(&singular) } else { singular };
    to_pascal_case(&name)
}

fn split_last_word(s: &str) -> (&str, &str) {
    match s.rfind(|c| c == '_' || c == '-') {
        Some(i) => s.split_at(i + 1),
        None => ("", s),
    }
}

fn match_case(original: &str, replacement: &str) -> String {
    if original.chars().next().map(char::is_uppercase).unwrap_or(false) {
        to_pascal_case(replacement)
    } else {
        replacement.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singularizes_common_suffixes() {
        assert_eq!(singularize("users"), "user");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("addresses"), "address");
        assert_eq!(singularize("status"), "status");
        assert_eq!(singularize("people"), "person");
        assert_eq!(singularize("blog_posts"), "blog_post");
        assert_eq!(singularize("user"), "user");
    }

    #[test]
    fn pluralizes_common_suffixes() {
        assert_eq!(pluralize("user"), "users");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("person"), "people");
        assert_eq!(pluralize("news"), "news");
    }

    #[test]
    fn non_ascii_words_keep_char_boundaries() {
        // 'İ' lowercases to two chars, which must not shift the byte offsets used for slicing
        assert_eq!(singularize("İİs"), "İİ");
        assert_eq!(singularize("İies"), "İy");
        assert_eq!(singularize("İxes"), "İx");
        assert_eq!(pluralize("İİ"), "İİs");
        assert_eq!(pluralize("İy"), "İies");
        assert_eq!(handler_identifier("İİs", true), "İİs");
    }

    #[test]
    fn builds_handler_identifiers() {
        assert_eq!(handler_identifier("users", true), "Users");
        assert_eq!(handler_identifier("users", false), "User");
        assert_eq!(handler_identifier("blog_posts", true), "BlogPosts");
        assert_eq!(handler_identifier("categories", false), "Category");
    }
}
