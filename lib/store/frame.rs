use serde::Serialize;
use serde_json::{Map, Value};

/// Human-readable rendering appended to audit messages.
pub trait Describe {
    fn describe(&self) -> String;
}

/// Tabular value with named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Map<String, Value>>) -> Self {
        Self { columns, rows }
    }

    /// Schema-only frame.
    pub fn empty(columns: Vec<String>) -> Self {
        Self::new(columns, Vec::new())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    /// Row `index` as a [`Record`], keeping only known columns.
    pub fn record(&self, index: usize) -> Option<Record> {
        self.rows.get(index).map(|row| {
            let mut record = Record::new();
            for column in &self.columns {
                record.insert(column, row.get(column).cloned().unwrap_or(Value::Null));
            }
            record
        })
    }
}

impl Describe for Frame {
    fn describe(&self) -> String {
        let mut out = format!(
            "<Frame> {} rows x {} columns",
            self.rows.len(),
            self.columns.len()
        );
        let width = self
            .columns
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max("column".len());
        out.push_str(&format!("\n #  {:<width$}  non-null", "column"));
        for (index, column) in self.columns.iter().enumerate() {
            let non_null = self
                .rows
                .iter()
                .filter(|row| row.get(column).is_some_and(|value| !value.is_null()))
                .count();
            out.push_str(&format!("\n {index:<2} {column:<width$}  {non_null}"));
        }
        out
    }
}

/// A single row: ordered by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Describe for Record {
    fn describe(&self) -> String {
        let width = self.0.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::from("<Record>");
        for (key, value) in &self.0 {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("\n{key:<width$}  {rendered}"));
        }
        out
    }
}
