//! Raw query-string values as received from the transport. Keys may repeat.

/// Ordered, multi-valued query-string map.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        QueryParams { pairs }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        QueryParams {
            pairs: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Last non-blank value for `key`. Blank values count as absent.
    pub fn filled(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.trim())
    }

    /// Every non-blank value of `key` and of its array form `key[]`, in request order.
    pub fn all(&self, key: &str) -> Vec<&str> {
        let array_key = format!("{}[]", key);
        self.pairs
            .iter()
            .filter(|(k, v)| (k == key || *k == array_key) && !v.trim().is_empty())
            .map(|(_, v)| v.trim())
            .collect()
    }

    /// Boolean flag: filled and one of `true`, `1`, `yes`, `on`.
    pub fn flag(&self, key: &str) -> bool {
        self.filled(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(false)
    }
}
