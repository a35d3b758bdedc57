//! Checkpointed table storage for resumable stages.
//!
//! - The output snapshot, when present, is the authoritative input on restart
//! - Saves are full overwrites, atomic via write-then-rename
//! - The engine saves after every row, so a crash loses at most the in-flight row
//! - The file extension picks the encoding: `.jsonl`/`.ndjson` are JSON Lines,
//!   anything else is CSV

use super::write_atomic;
use crate::models::{Result, StagehandError, Table};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk table encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    JsonLines,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("jsonl" | "ndjson") => Self::JsonLines,
            _ => Self::Csv,
        }
    }

    pub fn parse(self, content: &str) -> Result<Table> {
        match self {
            Self::Csv => Table::from_csv(content),
            Self::JsonLines => Table::from_jsonl(content),
        }
    }

    pub fn render(self, table: &Table) -> Result<String> {
        match self {
            Self::Csv => table.to_csv(),
            Self::JsonLines => table.to_jsonl(),
        }
    }
}

/// Where a table was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Fresh run from the caller's input
    Input,
    /// Resumed from an existing output snapshot
    Snapshot,
}

/// Loads and persists one stage's record table.
#[derive(Debug, Clone)]
pub struct TableStore {
    /// Caller-supplied input table
    input_path: PathBuf,
    /// Checkpointed output snapshot
    output_path: PathBuf,
}

impl TableStore {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
        }
    }

    /// Check if an output snapshot exists.
    pub fn has_snapshot(&self) -> bool {
        self.output_path.exists()
    }

    /// Load the table, preferring the snapshot, and check required columns.
    pub fn load(&self, required_columns: &[String]) -> Result<(Table, LoadSource)> {
        let (path, source) = if self.has_snapshot() {
            info!(path = %self.output_path.display(), "Output snapshot exists, resuming from it");
            (&self.output_path, LoadSource::Snapshot)
        } else if self.input_path.exists() {
            info!(path = %self.input_path.display(), "No snapshot found, reading input");
            (&self.input_path, LoadSource::Input)
        } else {
            return Err(StagehandError::NotFound {
                input: self.input_path.display().to_string(),
                output: self.output_path.display().to_string(),
            });
        };

        let content = fs::read_to_string(path).map_err(|e| {
            StagehandError::io(format!("reading table {}", path.display()), e)
        })?;
        let format = TableFormat::from_path(path);
        let mut table = format.parse(&content)?;

        // A file with neither header nor rows has nothing to check and nothing to do
        let blank = table.columns().is_empty() && table.is_empty();
        if !blank {
            for column in required_columns {
                if !table.has_column(column) {
                    return Err(StagehandError::MissingColumn {
                        column: column.clone(),
                        path: path.display().to_string(),
                    });
                }
            }
        }

        table.ensure_control_columns();
        info!(
            rows = table.len(),
            processed = table.processed_count(),
            format = ?format,
            "Table loaded"
        );
        Ok((table, source))
    }

    /// Overwrite the snapshot with the full table (atomic write).
    pub fn save(&self, table: &Table) -> Result<()> {
        if let Some(dir) = self.output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| StagehandError::io("creating output directory", e))?;
        }

        let content = TableFormat::from_path(&self.output_path).render(table)?;
        write_atomic(&self.output_path, content.as_bytes()).map_err(|e| {
            StagehandError::io(format!("writing snapshot {}", self.output_path.display()), e)
        })?;

        debug!(path = %self.output_path.display(), rows = table.len(), "Snapshot saved");
        Ok(())
    }
}
