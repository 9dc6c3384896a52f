//! Core domain model for the crop price sync job.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cropprice-core";

/// State every record is filed under; the portal filter is pinned to it.
pub const STATE: &str = "Karnataka";

/// A commodity as labelled on the portal plus its id in the price table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commodity {
    pub name: String,
    pub id: i32,
}

impl Commodity {
    pub fn new(name: impl Into<String>, id: i32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// District label exactly as the portal shows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct District(String);

impl District {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for District {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for District {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Values pulled out of one exported price table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceExtract {
    pub max_price: f64,
    pub model_price: Option<f64>,
    pub price_date: NaiveDate,
    pub price_column: String,
}

/// One row of `public.tb_mst_crop_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub district: String,
    pub market: String,
    pub crop_name: String,
    pub variety_name: String,
    pub grade: String,
    pub min_price: Option<f64>,
    pub max_price: f64,
    pub model_price: Option<f64>,
    pub price_date: NaiveDate,
    pub crop_id: i32,
    pub state: String,
}

impl PriceRecord {
    /// Market, variety and grade are not exposed by the export and stay empty;
    /// min price is never populated.
    pub fn from_extract(commodity: &Commodity, district: &District, extract: &PriceExtract) -> Self {
        Self {
            district: district.as_str().to_string(),
            market: String::new(),
            crop_name: commodity.name.clone(),
            variety_name: String::new(),
            grade: String::new(),
            min_price: None,
            max_price: extract.max_price,
            model_price: extract.model_price,
            price_date: extract.price_date,
            crop_id: commodity.id,
            state: STATE.to_string(),
        }
    }
}

/// Why an exported file could not be turned into a [`PriceExtract`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReadFailure {
    #[error("export file not downloaded")]
    NotDownloaded,
    #[error("unreadable export: {0}")]
    Unreadable(String),
    #[error("no price columns")]
    NoPriceColumns,
    #[error("unparseable price date: {0}")]
    UnparseableDate(String),
    #[error("no price value")]
    NoPriceValue,
}

/// Result of one commodity/district pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PairResult {
    Saved(PriceRecord),
    NoData,
    ReadError(ReadFailure),
    WriteError(String),
    Failed(String),
}

impl PairResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PairResult::Saved(_))
    }

    pub fn message(&self, commodity: &Commodity, district: &District) -> String {
        let crop = &commodity.name;
        match self {
            PairResult::Saved(_) => format!("{crop} - Inserted for {district}"),
            PairResult::NoData => format!("{crop} - No data for {district}"),
            PairResult::ReadError(failure) => match failure {
                ReadFailure::NotDownloaded => format!("{crop} - CSV not downloaded for {district}"),
                ReadFailure::Unreadable(reason) => {
                    format!("{crop} - Error reading CSV for {district}: {reason}")
                }
                ReadFailure::NoPriceColumns => format!("{crop} - No price columns for {district}"),
                ReadFailure::UnparseableDate(reason) => {
                    format!("{crop} - Error parsing date for {district}: {reason}")
                }
                ReadFailure::NoPriceValue => format!("{crop} - No price value for {district}"),
            },
            PairResult::WriteError(reason) | PairResult::Failed(reason) => {
                format!("ERROR {crop} {district}: {reason}")
            }
        }
    }

    pub fn into_outcome(self, commodity: &Commodity, district: &District) -> PairOutcome {
        PairOutcome {
            commodity: commodity.name.clone(),
            district: district.as_str().to_string(),
            success: self.is_success(),
            message: self.message(commodity, district),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub commodity: String,
    pub district: String,
    pub success: bool,
    pub message: String,
}

/// Ordered outcome log for one job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<PairOutcome>,
}

impl RunLog {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: PairOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn any_saved(&self) -> bool {
        self.outcomes.iter().any(|o| o.success)
    }

    pub fn saved_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|o| o.message.as_str())
    }
}
