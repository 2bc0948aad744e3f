//! Header multimap and canonical header casing.
//!
//! # Design Decisions
//! - Names are stored as received; lookup is ASCII case-insensitive
//! - Insertion order is preserved, both across names and per name
//! - Canonical casing is a static table applied only at emission; names
//!   missing from the table pass through untouched

/// Known header names and their canonical wire casing.
static CANONICAL_NAMES: &[(&str, &str)] = &[
    ("server", "Server"),
    ("connection", "Connection"),
    ("content-type", "Content-Type"),
    ("content-length", "Content-Length"),
    ("content-disposition", "Content-Disposition"),
    ("last-modified", "Last-Modified"),
    ("transfer-encoding", "Transfer-Encoding"),
];

/// Rewrite a header name to its canonical form if it is a known one.
pub fn canonical_name(name: &str) -> &str {
    CANONICAL_NAMES
        .iter()
        .find(|(lower, _)| name.eq_ignore_ascii_case(lower))
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// An ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` joined with `", "`, or an empty string.
    pub fn get_line(&self, name: &str) -> String {
        self.get_all(name).collect::<Vec<_>>().join(", ")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, keeping any existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Headers {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}
