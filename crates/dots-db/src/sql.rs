//! SQL text for schema, insert, update and range-scan statements.
//!
//! Statements are assembled from the configured table and column lists.
//! Values are always bound as parameters; only identifiers are spliced into
//! the text, and they come from configuration, never from record data.

use serde::Deserialize;

/// SQL flavour of the backing store, derived from the data-source scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `MySQL` / `MariaDB`. Positional `?` placeholders.
    MySql,
    /// `PostgreSQL`. Numbered `$n` placeholders.
    Postgres,
    /// `SQLite`. Positional `?` placeholders.
    Sqlite,
}

impl Dialect {
    /// Detect the dialect from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split_once(':').map(|(scheme, _)| scheme)?;
        match scheme {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_owned(),
        }
    }

    fn placeholders(self, first: usize, count: usize) -> Vec<String> {
        (0..count)
            .map(|offset| self.placeholder(first.saturating_add(offset)))
            .collect()
    }
}

/// A column of the configured table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type used by schema construction, e.g. `BIGINT`.
    pub sql_type: String,
}

impl Column {
    /// Create a column definition.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// Columns of the `dots` table, in the order records are read and written.
pub fn dots_columns() -> Vec<Column> {
    vec![
        Column::new("Id", "BIGINT"),
        Column::new("ParentId", "BIGINT"),
        Column::new("Name", "VARCHAR(255)"),
        Column::new("Value", "VARCHAR(20000)"),
    ]
}

fn names(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CREATE TABLE <table> (<name type>, ...)`
pub fn create_table(table: &str, columns: &[Column]) -> String {
    let defs = columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {table} ({defs})")
}

/// `DROP TABLE <table>`
pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE {table}")
}

/// `INSERT INTO <table> (<cols>) VALUES (<params>)`
pub fn insert(dialect: Dialect, table: &str, columns: &[Column]) -> String {
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names(columns),
        dialect.placeholders(1, columns.len()).join(", ")
    )
}

/// `UPDATE <table> SET c = ?, ... WHERE <key> >= ? AND <key> < ?`
///
/// Column values bind first, then the lower and upper key bounds.
pub fn update_range(dialect: Dialect, table: &str, columns: &[Column], key: &str) -> String {
    let sets = columns
        .iter()
        .zip(dialect.placeholders(1, columns.len()))
        .map(|(c, p)| format!("{} = {p}", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let lower = dialect.placeholder(columns.len().saturating_add(1));
    let upper = dialect.placeholder(columns.len().saturating_add(2));
    format!("UPDATE {table} SET {sets} WHERE {key} >= {lower} AND {key} < {upper}")
}

/// `SELECT <cols> FROM <table> WHERE <key> >= ? AND <key> < ? ORDER BY <key>`
pub fn select_range(dialect: Dialect, table: &str, columns: &[Column], key: &str) -> String {
    format!(
        "SELECT {} FROM {table} WHERE {key} >= {} AND {key} < {} ORDER BY {key}",
        names(columns),
        dialect.placeholder(1),
        dialect.placeholder(2)
    )
}
