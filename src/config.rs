//! Run configuration: feed variant selection and environment settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://gtfs.db?mode=rwc";
pub const DEFAULT_REGULAR_URL: &str = "https://rrgtfsfeeds.s3.amazonaws.com/gtfs_subway.zip";
pub const DEFAULT_SUPPLEMENTED_URL: &str =
    "https://rrgtfsfeeds.s3.amazonaws.com/gtfs_supplemented.zip";

/// Maximum stop-time rows read per stop when resolving the routes serving a station.
pub const DEFAULT_STOP_TIME_LIMIT: usize = 1000;
pub const DEFAULT_SHAPES_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_STOP_TIMES_BATCH_SIZE: usize = 50_000;

/// Discriminator scoping every persisted document to one feed variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Regular,
    Supplemented,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Regular => "regular",
            DataType::Supplemented => "supplemented",
        }
    }

    pub fn is_supplemented(&self) -> bool {
        matches!(self, DataType::Supplemented)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a single ingest run.
///
/// Everything except the data type comes from the environment (a `.env` file
/// is honoured by the binary before this is built).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_type: DataType,
    pub database_url: String,
    pub regular_url: String,
    pub supplemented_url: String,
    pub stop_time_limit: usize,
    pub shapes_batch_size: usize,
    pub stop_times_batch_size: usize,
}

impl Config {
    /// Defaults only, no environment lookups.
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            regular_url: DEFAULT_REGULAR_URL.to_string(),
            supplemented_url: DEFAULT_SUPPLEMENTED_URL.to_string(),
            stop_time_limit: DEFAULT_STOP_TIME_LIMIT,
            shapes_batch_size: DEFAULT_SHAPES_BATCH_SIZE,
            stop_times_batch_size: DEFAULT_STOP_TIMES_BATCH_SIZE,
        }
    }

    pub fn from_env(data_type: DataType) -> Result<Self> {
        Self::from_lookup(data_type, |key| std::env::var(key).ok())
    }

    fn from_lookup(data_type: DataType, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new(data_type);

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(url) = lookup("GTFS_REGULAR_URL") {
            config.regular_url = url;
        }
        if let Some(url) = lookup("GTFS_SUPPLEMENTED_URL") {
            config.supplemented_url = url;
        }
        if let Some(limit) = parse_var(&lookup, "STATION_STOP_TIME_LIMIT")? {
            config.stop_time_limit = limit;
        }
        if let Some(size) = parse_var(&lookup, "SHAPES_BATCH_SIZE")? {
            config.shapes_batch_size = size;
        }
        if let Some(size) = parse_var(&lookup, "STOP_TIMES_BATCH_SIZE")? {
            config.stop_times_batch_size = size;
        }

        anyhow::ensure!(
            config.shapes_batch_size > 0 && config.stop_times_batch_size > 0,
            "batch sizes must be greater than zero"
        );

        Ok(config)
    }

    /// Feed endpoint for the configured variant.
    pub fn source_url(&self) -> &str {
        match self.data_type {
            DataType::Regular => &self.regular_url,
            DataType::Supplemented => &self.supplemented_url,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: '{raw}'"))?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}
