//! Reader for the portal's "Download as CSV" export.
//!
//! The export carries two title rows before the header row. Price columns are
//! labelled `Price on <DD Mon, YYYY>`; an optional `MSP (...)` column holds the
//! minimum support price.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use cropprice_core::{PriceExtract, ReadFailure};
use thiserror::Error;

/// Zero-based index of the header row; earlier rows are export boilerplate.
pub const HEADER_ROW: usize = 2;
pub const PRICE_COLUMN_PREFIX: &str = "Price on";
pub const MSP_MARKER: &str = "MSP";
pub const PRICE_DATE_FORMAT: &str = "%d %b, %Y";

#[derive(Debug, Error)]
pub enum TableError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("export has no header row")]
    MissingHeader,
}

/// Raw export contents: header labels and data rows, all as trimmed text.
#[derive(Debug, Clone, Default)]
pub struct ExportedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ExportedTable {
    pub fn from_path(path: &Path) -> Result<Self, TableError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut records = reader.records();

        for _ in 0..HEADER_ROW {
            match records.next() {
                Some(record) => {
                    record?;
                }
                None => return Err(TableError::MissingHeader),
            }
        }

        let headers = match records.next() {
            Some(record) => record?.iter().map(str::to_string).collect::<Vec<_>>(),
            None => return Err(TableError::MissingHeader),
        };

        let mut rows = Vec::new();
        for record in records {
            rows.push(record?.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    pub fn column_index(&self, predicate: impl Fn(&str) -> bool) -> Option<usize> {
        self.headers.iter().position(|h| predicate(h))
    }

    /// Numeric cells of a column; short rows and non-numeric cells are skipped.
    pub fn numeric_values(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows
            .iter()
            .filter_map(move |row| row.get(index))
            .filter_map(|cell| parse_price(cell))
    }

    pub fn column_max(&self, index: usize) -> Option<f64> {
        self.numeric_values(index).reduce(f64::max)
    }
}

/// `None` for blanks and placeholders such as `NaN` or `-`.
pub fn parse_price(cell: &str) -> Option<f64> {
    let cleaned = cell.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Date part of a `Price on <date>` header.
pub fn parse_price_column_date(column: &str) -> Result<NaiveDate, ReadFailure> {
    let date_str = column.replacen(PRICE_COLUMN_PREFIX, "", 1);
    let date_str = date_str.trim();
    NaiveDate::parse_from_str(date_str, PRICE_DATE_FORMAT)
        .map_err(|err| ReadFailure::UnparseableDate(format!("'{date_str}': {err}")))
}

/// Derive the latest price figures from a loaded table.
///
/// The first `Price on` column is taken as the latest date. This relies on the
/// portal listing dates newest first.
pub fn extract_latest_price(table: &ExportedTable) -> Result<PriceExtract, ReadFailure> {
    let price_idx = table
        .column_index(|h| h.starts_with(PRICE_COLUMN_PREFIX))
        .ok_or(ReadFailure::NoPriceColumns)?;
    let price_column = table.headers[price_idx].clone();
    let price_date = parse_price_column_date(&price_column)?;
    let max_price = table.column_max(price_idx).ok_or(ReadFailure::NoPriceValue)?;

    let model_price = table
        .column_index(|h| h.contains(MSP_MARKER))
        .and_then(|idx| table.column_max(idx));

    Ok(PriceExtract {
        max_price,
        model_price,
        price_date,
        price_column,
    })
}

pub fn read_export(path: &Path) -> Result<PriceExtract, ReadFailure> {
    let table =
        ExportedTable::from_path(path).map_err(|err| ReadFailure::Unreadable(err.to_string()))?;
    extract_latest_price(&table)
}
