//! Delimited-text reader for feed tables.
//!
//! Rows are exposed by column name, and the coercion helpers here implement
//! the numeric policy shared by every loader: absent or empty values fall
//! back to a default, anything present but malformed is an error.

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use std::sync::Arc;

const UTF8_BOM: &str = "\u{feff}";

/// Column name to position lookup shared by all rows of one table.
#[derive(Debug)]
struct Header {
    table: String,
    columns: HashMap<String, usize>,
}

/// Streams the rows of one table file.
pub struct RowReader<'a> {
    header: Arc<Header>,
    records: csv::StringRecordsIntoIter<&'a [u8]>,
}

impl<'a> RowReader<'a> {
    /// `table` is only used to label errors (usually the file name).
    pub fn new(table: &str, bytes: &'a [u8]) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .with_context(|| format!("{table}: failed to read header row"))?;
        let columns = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim_start_matches(UTF8_BOM).trim().to_string(), i))
            .collect();

        Ok(Self {
            header: Arc::new(Header {
                table: table.to_string(),
                columns,
            }),
            records: reader.into_records(),
        })
    }

    pub fn has_column(&self, field: &str) -> bool {
        self.header.columns.contains_key(field)
    }
}

impl Iterator for RowReader<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let table = &self.header.table;
        Some(
            record
                .with_context(|| format!("{table}: malformed row"))
                .map(|record| Row {
                    header: Arc::clone(&self.header),
                    record,
                }),
        )
    }
}

/// One record of a table, addressed by column name.
#[derive(Debug)]
pub struct Row {
    header: Arc<Header>,
    record: StringRecord,
}

impl Row {
    /// Raw value of `field`; `None` when the column does not exist or the row is short.
    pub fn get(&self, field: &str) -> Option<&str> {
        let idx = *self.header.columns.get(field)?;
        self.record.get(idx)
    }

    /// Value of `field`, treating an empty cell like a missing one.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !v.is_empty())
    }

    /// Text value of `field`, empty when absent.
    pub fn text(&self, field: &str) -> String {
        self.get(field).unwrap_or_default().to_string()
    }

    /// Like [`Row::text`] but with a fallback used only when the column is missing entirely.
    pub fn text_or(&self, field: &str, fallback: &str) -> String {
        self.get(field).unwrap_or(fallback).to_string()
    }

    /// Line number of this record in the source file, header included.
    pub fn line(&self) -> u64 {
        self.record.position().map(|p| p.line()).unwrap_or_default()
    }

    /// Required integer column: absent or empty reads as 0.
    pub fn int_or_zero(&self, field: &str) -> Result<i64> {
        Ok(self.nullable_int(field)?.unwrap_or(0))
    }

    /// Required float column: absent or empty reads as 0.0.
    pub fn float_or_zero(&self, field: &str) -> Result<f64> {
        Ok(self.nullable_float(field)?.unwrap_or(0.0))
    }

    /// Optional flag column (direction, accessibility, pickup/drop-off type).
    /// Parsed only when present; otherwise 0.
    pub fn flag_or_zero(&self, field: &str) -> Result<i32> {
        match self.value(field) {
            Some(raw) => self.parse(field, raw),
            None => Ok(0),
        }
    }

    pub fn nullable_int(&self, field: &str) -> Result<Option<i64>> {
        self.value(field).map(|raw| self.parse(field, raw)).transpose()
    }

    pub fn nullable_float(&self, field: &str) -> Result<Option<f64>> {
        self.value(field).map(|raw| self.parse(field, raw)).transpose()
    }

    fn parse<T: std::str::FromStr>(&self, field: &str, raw: &str) -> Result<T> {
        match raw.parse() {
            Ok(value) => Ok(value),
            Err(_) => bail!(
                "{}: line {}: field '{}' has non-numeric value '{}'",
                self.header.table,
                self.line(),
                field,
                raw
            ),
        }
    }
}
