//! Record table types.
//!
//! A table is an ordered list of rows; every row is an ordered mapping of
//! named string fields plus two control columns owned by the engine:
//! `processed` (a real bool, parsed once at load) and `status`.
//!
//! Tables are read and written as CSV with a header line, or as JSON Lines.
//! Only CSV keeps the header of a table with no rows.

use crate::models::{Result, StagehandError};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Control column: row reached a terminal outcome.
pub const PROCESSED_COLUMN: &str = "processed";

/// Control column: last outcome recorded for the row.
pub const STATUS_COLUMN: &str = "status";

/// One record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    /// Payload fields owned by the calling stage
    pub fields: IndexMap<String, String>,
    /// Terminal outcome reached; never reprocessed once set
    pub processed: bool,
    /// Stage-specific outcome token (empty until attempted)
    pub status: String,
}

impl Row {
    /// Build a row from `(name, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        }
    }

    /// Payload field value, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Payload field value with surrounding whitespace removed; empty when absent.
    pub fn get_trimmed(&self, name: &str) -> &str {
        self.get(name).map(str::trim).unwrap_or_default()
    }

    fn from_json(object: Map<String, Value>, line: usize) -> Result<Self> {
        let mut row = Row::default();
        for (key, value) in object {
            match key.as_str() {
                PROCESSED_COLUMN => {
                    row.processed = parse_processed(&value).ok_or_else(|| {
                        StagehandError::ParseError(format!(
                            "Line {line}: '{PROCESSED_COLUMN}' is not a boolean: {value}"
                        ))
                    })?;
                }
                STATUS_COLUMN => row.status = value_to_string(value),
                _ => {
                    row.fields.insert(key, value_to_string(value));
                }
            }
        }
        Ok(row)
    }

    fn to_json(&self, columns: &[String]) -> Value {
        let mut object = Map::with_capacity(columns.len());
        for column in columns {
            let value = match column.as_str() {
                PROCESSED_COLUMN => Value::Bool(self.processed),
                name => Value::String(self.cell(name).to_string()),
            };
            object.insert(column.clone(), value);
        }
        Value::Object(object)
    }

    /// Text form of one column, control columns included.
    fn cell(&self, column: &str) -> &str {
        match column {
            PROCESSED_COLUMN if self.processed => "True",
            PROCESSED_COLUMN => "False",
            STATUS_COLUMN => &self.status,
            name => self.get(name).unwrap_or_default(),
        }
    }
}

/// Parse a resumed `processed` cell. Accepts JSON booleans and the legacy
/// string spellings written by older snapshots.
fn parse_processed(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Null => Some(false),
        Value::Number(n) => n.as_u64().and_then(|n| match n {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        Value::String(s) => parse_processed_text(s),
        _ => None,
    }
}

fn parse_processed_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" | "" => Some(false),
        _ => None,
    }
}

fn csv_error(e: csv::Error) -> StagehandError {
    StagehandError::ParseError(format!("CSV: {e}"))
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Ordered table of records with a column header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Build a table from rows; the header is the ordered union of their fields.
    pub fn new(rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.fields.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Parse JSON Lines: one object per non-blank line.
    pub fn from_jsonl(content: &str) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut rows = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|e| {
                StagehandError::ParseError(format!("Line {}: {}", line_num + 1, e))
            })?;
            let Value::Object(object) = value else {
                return Err(StagehandError::ParseError(format!(
                    "Line {}: expected a JSON object",
                    line_num + 1
                )));
            };
            for key in object.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
            rows.push(Row::from_json(object, line_num + 1)?);
        }

        Ok(Self { columns, rows })
    }

    /// Parse CSV with a header line. Every cell is kept as text; the header
    /// survives even when no rows follow it.
    pub fn from_csv(content: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(content.as_bytes());
        let columns: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let mut row = Row::default();
            for (column, value) in columns.iter().zip(record.iter()) {
                match column.as_str() {
                    PROCESSED_COLUMN => {
                        row.processed = parse_processed_text(value).ok_or_else(|| {
                            StagehandError::ParseError(format!(
                                "Line {line}: '{PROCESSED_COLUMN}' is not a boolean: {value}"
                            ))
                        })?;
                    }
                    STATUS_COLUMN => row.status = value.to_string(),
                    _ => {
                        row.fields.insert(column.clone(), value.to_string());
                    }
                }
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// Serialize as CSV: header line, then one record per row.
    pub fn to_csv(&self) -> Result<String> {
        if self.columns.is_empty() {
            return Ok(String::new());
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns).map_err(csv_error)?;
        for row in &self.rows {
            writer
                .write_record(self.columns.iter().map(|c| row.cell(c)))
                .map_err(csv_error)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| StagehandError::Internal(format!("Flushing CSV: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| StagehandError::Internal(format!("CSV is not UTF-8: {e}")))
    }

    /// Serialize as JSON Lines with keys in column order.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for row in &self.rows {
            let line = serde_json::to_string(&row.to_json(&self.columns))
                .map_err(|e| StagehandError::Internal(format!("Serializing row: {e}")))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx)
    }

    pub fn row_mut(&mut self, idx: usize) -> Option<&mut Row> {
        self.rows.get_mut(idx)
    }

    /// Add the engine's control columns when the table does not carry them.
    pub fn ensure_control_columns(&mut self) {
        for column in [STATUS_COLUMN, PROCESSED_COLUMN] {
            if !self.has_column(column) {
                self.columns.push(column.to_string());
            }
        }
    }

    /// Set a payload field, registering the column if it is new.
    pub fn set_field(&mut self, idx: usize, name: &str, value: impl Into<String>) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
        if let Some(row) = self.rows.get_mut(idx) {
            row.fields.insert(name.to_string(), value.into());
        }
    }

    /// Number of rows already marked processed.
    pub fn processed_count(&self) -> usize {
        self.rows.iter().filter(|r| r.processed).count()
    }

    /// Whether every row in `start..end` is processed.
    pub fn all_processed(&self, start: usize, end: usize) -> bool {
        self.rows[start..end.min(self.rows.len())]
            .iter()
            .all(|r| r.processed)
    }

    /// Drop rows whose status equals `status`; returns how many were removed.
    pub fn remove_status(&mut self, status: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| r.status != status);
        before - self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_roundtrip_keeps_column_order() {
        let input = concat!(
            r#"{"Name":"Ada","Company":"Analytical","Email":"ada@example.com"}"#,
            "\n\n",
            r#"{"Name":"Grace","Email":"grace@example.com","Company":"Navy"}"#,
            "\n"
        );
        let mut table = Table::from_jsonl(input).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.columns(), &["Name", "Company", "Email"]);

        table.ensure_control_columns();
        let out = table.to_jsonl().unwrap();
        let first = out.lines().next().unwrap();
        assert_eq!(
            first,
            r#"{"Name":"Ada","Company":"Analytical","Email":"ada@example.com","status":"","processed":false}"#
        );
    }

    #[test]
    fn test_processed_parsed_once_from_legacy_strings() {
        let input = concat!(
            r#"{"Email":"a@x.io","processed":"True","status":"Valid"}"#,
            "\n",
            r#"{"Email":"b@x.io","processed":"False","status":""}"#,
            "\n",
            r#"{"Email":"c@x.io","processed":true}"#,
            "\n",
            r#"{"Email":"d@x.io","processed":""}"#,
            "\n"
        );
        let table = Table::from_jsonl(input).unwrap();
        let flags: Vec<bool> = table.rows().iter().map(|r| r.processed).collect();
        assert_eq!(flags, vec![true, false, true, false]);
        assert_eq!(table.row(0).unwrap().status, "Valid");
        assert_eq!(table.processed_count(), 2);
    }

    #[test]
    fn test_bad_processed_value_is_rejected() {
        let err = Table::from_jsonl(r#"{"processed":"maybe"}"#).unwrap_err();
        assert!(matches!(err, StagehandError::ParseError(_)));
    }

    #[test]
    fn test_non_string_values_become_strings() {
        let table = Table::from_jsonl(r#"{"Id":7,"Note":null,"Ok":true}"#).unwrap();
        let row = table.row(0).unwrap();
        assert_eq!(row.get("Id"), Some("7"));
        assert_eq!(row.get("Note"), Some(""));
        assert_eq!(row.get("Ok"), Some("true"));
    }

    #[test]
    fn test_remove_status_and_window_check() {
        let mut table = Table::new(vec![
            Row::from_pairs([("Email", "a")]),
            Row::from_pairs([("Email", "b")]),
            Row::from_pairs([("Email", "c")]),
        ]);
        table.row_mut(0).unwrap().processed = true;
        table.row_mut(1).unwrap().processed = true;
        table.row_mut(1).unwrap().status = "no_result".into();

        assert!(table.all_processed(0, 2));
        assert!(!table.all_processed(0, 3));

        assert_eq!(table.remove_status("no_result"), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.row(1).unwrap().get("Email"), Some("c"));
    }

    #[test]
    fn test_set_field_registers_column() {
        let mut table = Table::new(vec![Row::from_pairs([("Name", "x")])]);
        table.set_field(0, "Title", "Home");
        assert!(table.has_column("Title"));
        assert_eq!(table.row(0).unwrap().get("Title"), Some("Home"));
    }

    #[test]
    fn test_csv_roundtrip_keeps_header_and_text() {
        let input = "Name,Email,Note\nAda,ada@example.com,\"says \"\"hi\"\", twice\"\nGrace,,007\n";
        let mut table = Table::from_csv(input).unwrap();
        assert_eq!(table.columns(), &["Name", "Email", "Note"]);
        assert_eq!(table.row(0).unwrap().get("Note"), Some("says \"hi\", twice"));
        assert_eq!(table.row(1).unwrap().get("Email"), Some(""));
        assert_eq!(table.row(1).unwrap().get("Note"), Some("007"));

        table.ensure_control_columns();
        table.row_mut(0).unwrap().processed = true;
        table.row_mut(0).unwrap().status = "Valid".into();
        let out = table.to_csv().unwrap();
        assert!(out.starts_with("Name,Email,Note,status,processed\n"));
        assert_eq!(Table::from_csv(&out).unwrap(), table);
    }

    #[test]
    fn test_header_only_csv_keeps_columns() {
        let mut table = Table::from_csv("Name,Email\n").unwrap();
        assert!(table.is_empty());
        assert!(table.has_column("Email"));

        table.ensure_control_columns();
        assert_eq!(table.to_csv().unwrap(), "Name,Email,status,processed\n");
    }

    #[test]
    fn test_csv_processed_spellings() {
        let input = "Email,processed\na,True\nb,False\nc,\nd,1\n";
        let table = Table::from_csv(input).unwrap();
        let flags: Vec<bool> = table.rows().iter().map(|r| r.processed).collect();
        assert_eq!(flags, vec![true, false, false, true]);
        assert!(matches!(
            Table::from_csv("Email,processed\na,maybe\n"),
            Err(StagehandError::ParseError(_))
        ));
    }

    #[test]
    fn test_ragged_csv_is_rejected() {
        assert!(matches!(
            Table::from_csv("Name,Email\nAda\n"),
            Err(StagehandError::ParseError(_))
        ));
    }
}
