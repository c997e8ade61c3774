use serde::{Deserialize, Serialize};

/// Paginated envelope used by the backend's list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: usize,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// A list response. Some endpoints page their results, others return a bare
/// array; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Plain(Vec<T>),
    Paged(Page<T>),
}

impl<T> Listing<T> {
    pub fn items(&self) -> &[T] {
        match self {
            Listing::Plain(items) => items,
            Listing::Paged(page) => &page.results,
        }
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Listing::Plain(items) => items,
            Listing::Paged(page) => page.results,
        }
    }

    /// Total number of matching records on the server, which may exceed
    /// the number of items in this page.
    pub fn total_count(&self) -> usize {
        match self {
            Listing::Plain(items) => items.len(),
            Listing::Paged(page) => page.count.max(page.results.len()),
        }
    }

    pub fn has_next(&self) -> bool {
        matches!(self, Listing::Paged(Page { next: Some(_), .. }))
    }
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Listing::Plain(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Item {
        id: i64,
    }

    #[test]
    fn test_plain_array() {
        let listing: Listing<Item> = serde_json::from_str(r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(listing.items().len(), 2);
        assert_eq!(listing.total_count(), 2);
        assert!(!listing.has_next());
    }

    #[test]
    fn test_empty_array() {
        let listing: Listing<Item> = serde_json::from_str("[]").unwrap();
        assert!(listing.items().is_empty());
    }

    #[test]
    fn test_paged_envelope() {
        let json = r#"{"count": 42, "next": "http://x/api/products/?page=2", "previous": null, "results": [{"id": 7}]}"#;
        let listing: Listing<Item> = serde_json::from_str(json).unwrap();
        assert_eq!(listing.total_count(), 42);
        assert!(listing.has_next());
        assert_eq!(listing.into_items(), vec![Item { id: 7 }]);
    }
}
