use std::fmt;

/// Ordered HTTP header fields.
///
/// Names are matched case-insensitively, but keep their original casing for iteration and
/// serialization. Direct lookup returns the last field with a name.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing all existing fields with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// Add a field, keeping existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Value of the last field named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Values of all fields named `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields
            .iter()
            .any(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Remove all fields named `name`, returns true if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.fields.len() != before
    }

    /// Iterate over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns true if the comma-separated tokens of `name` contain `token`, case-insensitively.
    pub(crate) fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let fields = iter
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self { fields }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(fields: [(K, V); N]) -> Self {
        fields.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let headers = Headers::from([("Content-Type", "text/plain"), ("X-Foo", "bar")]);

        for name in ["content-type", "CONTENT-TYPE", "Content-Type", "cOnTeNt-TyPe"] {
            assert!(headers.contains(name));
            assert_eq!(headers.get(name), Some("text/plain"));
        }

        assert!(!headers.contains("content"));
        assert_eq!(headers.get("x-bar"), None);
    }

    #[test]
    fn duplicates_last_wins_and_all_kept() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.get("Set-Cookie"), Some("b=2"));
        assert_eq!(headers.get_all("SET-COOKIE").collect::<Vec<_>>(), ["a=1", "b=2"]);

        headers.insert("SET-COOKIE", "c=3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.iter().next(), Some(("SET-COOKIE", "c=3")));
    }

    #[test]
    fn iteration_keeps_order_and_casing() {
        let headers = Headers::from([("b-Header", "1"), ("A-header", "2")]);
        let fields: Vec<_> = headers.iter().collect();

        assert_eq!(fields, [("b-Header", "1"), ("A-header", "2")]);
    }

    #[test]
    fn token_lists_match() {
        let headers = Headers::from([("Connection", "keep-alive, Upgrade")]);

        assert!(headers.has_token("connection", "upgrade"));
        assert!(!headers.has_token("connection", "close"));
    }
}
