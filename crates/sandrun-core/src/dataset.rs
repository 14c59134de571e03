//! Tabular datasets: typed CSV loading and SQLite snapshot materialization.

use std::path::Path;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::Value;

use crate::errors::DatasetError;

/// Table name a materialized snapshot stores the dataset under.
pub const SNAPSHOT_TABLE: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Type a raw CSV field. Empty fields are null.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Null;
        }
        match trimmed {
            "true" | "True" | "TRUE" => return Cell::Bool(true),
            "false" | "False" | "FALSE" => return Cell::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Cell::Int(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if f.is_finite() => Cell::Float(f),
            _ => Cell::Text(raw.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Int(i) => Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(SqlValue::Null),
            Cell::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Cell::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Cell::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn from_csv_path(path: &Path) -> Result<Self, DatasetError> {
        let reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        Self::from_csv_reader(reader)
    }

    pub fn from_csv_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, DatasetError> {
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
            return Err(DatasetError::MissingHeader);
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(Cell::infer).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// SQLite affinity for a column, from the cells it actually holds.
    fn column_affinity(&self, index: usize) -> &'static str {
        let mut affinity = "INTEGER";
        let mut seen = false;
        for cell in self.rows.iter().filter_map(|r| r.get(index)) {
            match cell {
                Cell::Null => continue,
                Cell::Int(_) | Cell::Bool(_) => {}
                Cell::Float(_) => affinity = "REAL",
                Cell::Text(_) => return "TEXT",
            }
            seen = true;
        }
        if seen {
            affinity
        } else {
            "TEXT"
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Persist `csv_path` as table `data` in the SQLite file `db_path`, replacing
/// any previous table of that name.
pub fn csv_to_sqlite(csv_path: &Path, db_path: &Path) -> Result<usize, DatasetError> {
    let table = Table::from_csv_path(csv_path)?;
    let mut conn = Connection::open(db_path)?;
    write_table(&mut conn, &table)?;
    Ok(table.len())
}

pub fn write_table(conn: &mut Connection, table: &Table) -> Result<(), DatasetError> {
    let column_defs: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{} {}", quote_identifier(name), table.column_affinity(i)))
        .collect();
    let placeholders = vec!["?"; table.columns.len()].join(", ");

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({defs});",
        table = SNAPSHOT_TABLE,
        defs = column_defs.join(", ")
    ))?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} VALUES ({})",
            SNAPSHOT_TABLE, placeholders
        ))?;
        for row in &table.rows {
            stmt.execute(rusqlite::params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_cell_inference() {
        assert_eq!(Cell::infer(""), Cell::Null);
        assert_eq!(Cell::infer("  "), Cell::Null);
        assert_eq!(Cell::infer("42"), Cell::Int(42));
        assert_eq!(Cell::infer("-3.5"), Cell::Float(-3.5));
        assert_eq!(Cell::infer("True"), Cell::Bool(true));
        assert_eq!(Cell::infer("Paris"), Cell::Text("Paris".to_string()));
        assert_eq!(Cell::infer("NaN"), Cell::Text("NaN".to_string()));
    }

    #[test]
    fn test_load_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cities.csv");
        fs::write(&path, "city,population,area\nParis,2148000,105.4\nLyon,,47.87\n").unwrap();

        let table = Table::from_csv_path(&path).unwrap();
        assert_eq!(table.columns, vec!["city", "population", "area"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][1], Cell::Int(2148000));
        assert_eq!(table.rows[1][1], Cell::Null);
        assert_eq!(table.column_index("area"), Some(2));
        assert_eq!(table.rows[1][2].to_json(), serde_json::json!(47.87));
    }

    #[test]
    fn test_ragged_csv_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,b\n1,2,3\n").unwrap();
        assert!(matches!(Table::from_csv_path(&path), Err(DatasetError::Csv(_))));
    }

    #[test]
    fn test_csv_to_sqlite_roundtrip_types() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("sales.csv");
        let db_path = dir.path().join("sales.db");
        fs::write(&csv_path, "region,units,price\nnorth,10,2.5\nsouth,4,\n").unwrap();

        assert_eq!(csv_to_sqlite(&csv_path, &db_path).unwrap(), 2);
        // Replacing is idempotent.
        assert_eq!(csv_to_sqlite(&csv_path, &db_path).unwrap(), 2);

        let conn = Connection::open(&db_path).unwrap();
        let total: i64 = conn
            .query_row("SELECT sum(units) FROM data", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 14);
        let declared: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('data') WHERE name = 'price'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(declared, "REAL");
        let count: i64 = conn
            .query_row("SELECT count(*) FROM data", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
