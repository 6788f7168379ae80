//! Run statistics for one ingest.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::DataType;
use crate::loaders::TableLoad;
use crate::stations::StationReport;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub data_type: DataType,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    // keyed by table file name
    pub tables: BTreeMap<String, TableLoad>,

    // stations
    pub stations: u64,
    pub orphaned_stops: usize,
    pub unknown_trips: usize,
    pub unknown_routes: usize,
    pub capped_member_stops: usize,
}

impl RunSummary {
    pub fn start(data_type: DataType, source: &str) -> Self {
        Self {
            data_type,
            source: source.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            tables: BTreeMap::new(),
            stations: 0,
            orphaned_stops: 0,
            unknown_trips: 0,
            unknown_routes: 0,
            capped_member_stops: 0,
        }
    }

    pub fn record_table(&mut self, file: &str, load: TableLoad) {
        debug!(table = file, rows = load.rows, inserted = load.inserted, "Table loaded");
        self.tables.insert(file.to_string(), load);
    }

    pub fn record_stations(&mut self, report: &StationReport, written: u64) {
        self.stations = written;
        self.orphaned_stops = report.orphaned_stops;
        self.unknown_trips = report.unknown_trips;
        self.unknown_routes = report.unknown_routes;
        self.capped_member_stops = report.capped_member_stops;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Seconds between start and finish, or until now while the run is going.
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn inserted(&self, file: &str) -> u64 {
        self.tables.get(file).map(|load| load.inserted).unwrap_or(0)
    }
}

/// Logs the summary as pretty-printed JSON.
pub fn print_json(summary: &RunSummary) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
