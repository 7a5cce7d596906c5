//! A node's local tabular dataset.
//!
//! Rows are indexed by their position in file order; that index is what every
//! later round refers back to. Two input shapes are accepted: `;`-delimited text
//! with a header row, or a JSON array of flat objects.

use std::path::Path;

use crate::error::DatasetError;
use crate::types::{LocalRecord, RecordFields};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalDataset {
    records: Vec<LocalRecord>,
}

impl LocalDataset {
    /// Assigns indices 0.. in the given order.
    pub fn from_rows(rows: impl IntoIterator<Item = RecordFields>) -> Self {
        Self {
            records: rows
                .into_iter()
                .enumerate()
                .map(|(index, fields)| LocalRecord { index, fields })
                .collect(),
        }
    }

    /// Header row plus data rows separated by `delimiter`, with RFC 4180 quoting.
    /// Values are trimmed; blank lines are skipped.
    pub fn from_delimited(text: &str, delimiter: u8) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(text.trim_start_matches('\u{feff}').as_bytes());
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.iter().all(String::is_empty) {
            return Err(DatasetError::MissingHeader);
        }
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            if record.len() != columns.len() {
                return Err(DatasetError::ColumnCount {
                    line: record.position().map(|p| p.line() as usize).unwrap_or(0),
                    expected: columns.len(),
                    found: record.len(),
                });
            }
            rows.push(
                columns
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_string))
                    .collect::<RecordFields>(),
            );
        }
        Ok(Self::from_rows(rows))
    }

    /// JSON array of objects; non-string scalars are stringified, nulls become empty.
    pub fn from_json(text: &str) -> Result<Self, DatasetError> {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(text)?;
        Ok(Self::from_rows(rows.into_iter().map(|row| {
            row.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect::<RecordFields>()
        })))
    }

    /// Picks the format by extension: `.json` or `;`-delimited otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_delimited(&text, b';'),
        }
    }

    pub fn records(&self) -> &[LocalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
