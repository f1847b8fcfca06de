use std::fmt;

use serde::{Serialize, Serializer};

use crate::store::Frame;

pub const DEFAULT_NAMESPACE: &str = "public";

/// A qualified table (`namespace.name`) plus the last snapshot read from it.
#[derive(Debug, Clone)]
pub struct CollectionRef {
    namespace: String,
    name: String,
    cached_schema: Option<Vec<String>>,
    cached_data: Option<Frame>,
}

impl CollectionRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cached_schema: None,
            cached_data: None,
        }
    }

    /// Parses `"namespace.name"` or a bare `"name"`.
    ///
    /// Bare names land in `default_namespace`. Blank input is not a table and yields `None`.
    pub fn parse(raw: &str, default_namespace: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let mut parts = raw.split('.');
        let first = parts.next()?;
        let last = parts.last();
        let (namespace, name) = match last {
            Some(name) => (first, name),
            None => (default_namespace, first),
        };
        if namespace.is_empty() || name.is_empty() {
            return None;
        }

        Some(Self::new(namespace, name))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns seen by the last read, if any.
    pub fn columns(&self) -> Option<&[String]> {
        self.cached_schema.as_deref()
    }

    pub fn data(&self) -> Option<&Frame> {
        self.cached_data.as_ref()
    }

    /// Replaces the cached snapshot with `frame`; without `with_data` only the schema is kept.
    pub fn cache(&mut self, frame: Frame, with_data: bool) {
        self.cached_schema = Some(frame.columns().to_vec());
        self.cached_data = with_data.then_some(frame);
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns()
            .is_some_and(|columns| columns.iter().any(|known| known == column))
    }
}

impl PartialEq for CollectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for CollectionRef {}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl Serialize for CollectionRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gets_default_namespace() {
        let table = CollectionRef::parse("segmenter", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(table.namespace(), "public");
        assert_eq!(table.name(), "segmenter");
        assert_eq!(table.to_string(), "public.segmenter");
    }

    #[test]
    fn qualified_name_keeps_its_namespace() {
        let table = CollectionRef::parse("marts.test_segment", DEFAULT_NAMESPACE).unwrap();
        assert_eq!(table, CollectionRef::new("marts", "test_segment"));
    }

    #[test]
    fn extra_parts_use_first_and_last() {
        let table = CollectionRef::parse("db.marts.seg", "public").unwrap();
        assert_eq!(table.to_string(), "db.seg");
    }

    #[test]
    fn blank_names_are_absent_not_errors() {
        assert!(CollectionRef::parse("", "public").is_none());
        assert!(CollectionRef::parse("   ", "public").is_none());
        assert!(CollectionRef::parse(".seg", "public").is_none());
    }

    #[test]
    fn cache_tracks_schema_and_optional_data() {
        let mut table = CollectionRef::new("main", "seg");
        assert!(table.columns().is_none());

        table.cache(Frame::empty(vec!["id".into()]), false);
        assert!(table.has_column("id"));
        assert!(table.data().is_none());

        table.cache(Frame::empty(vec!["id".into(), "x".into()]), true);
        assert_eq!(table.columns().map(<[String]>::len), Some(2));
        assert!(table.data().is_some());
    }

    #[test]
    fn serializes_as_qualified_text() {
        let table = CollectionRef::new("main", "seg");
        assert_eq!(serde_json::to_value(&table).unwrap(), "main.seg");
    }
}
