//! Run coordinator.
//!
//! Loads every table of one feed variant in dependency order, hands the
//! route, stop and trip maps straight to the station aggregator once the
//! stop times are committed, and finishes with the metadata record.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::archive::FeedArchive;
use crate::config::{Config, DataType};
use crate::fetch::{HttpClient, fetch_source};
use crate::loaders::{LoadContext, TableRecord, load_batched, load_keyed, load_table};
use crate::model::{
    Agency, CalendarEntry, FeedMetadata, Route, ShapePoint, Stop, StopTime, Transfer, Trip,
};
use crate::stations::{aggregate_stations, write_stations};
use crate::store::{DocumentStore, Filter, IndexSpec, collections, to_document};
use crate::summary::RunSummary;

/// Indexes every run relies on, per collection.
fn required_indexes() -> Vec<(&'static str, IndexSpec)> {
    vec![
        (collections::STOPS, IndexSpec::unique(&["data_type", "stop_id"])),
        (collections::ROUTES, IndexSpec::unique(&["data_type", "route_id"])),
        (collections::TRIPS, IndexSpec::unique(&["data_type", "trip_id"])),
        (
            collections::STOP_TIMES,
            IndexSpec::new(&["trip_id", "stop_sequence"]),
        ),
        (collections::STOP_TIMES, IndexSpec::new(&["stop_id"])),
        (collections::CALENDAR, IndexSpec::unique(&["data_type", "service_id"])),
        (
            collections::SHAPES,
            IndexSpec::new(&["shape_id", "shape_pt_sequence"]),
        ),
        (
            collections::PROCESSED_STATIONS,
            IndexSpec::unique(&["data_type", "id"]),
        ),
        (collections::METADATA, IndexSpec::unique(&["data_type"])),
    ]
}

pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    config: Config,
}

impl Pipeline {
    pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates any missing index; existing ones are kept as they are.
    #[tracing::instrument(skip_all)]
    pub async fn ensure_indexes(&self) -> Result<()> {
        for (collection, index) in required_indexes() {
            self.store
                .ensure_index(collection, &index)
                .await
                .with_context(|| format!("creating index {} on {collection}", index.name))?;
        }
        info!("Indexes ready");
        Ok(())
    }

    /// Fetches the configured feed and runs it through the pipeline.
    pub async fn ingest<C: HttpClient>(&self, client: &C) -> Result<RunSummary> {
        let source = self.config.source_url().to_string();
        info!(source = %source, data_type = %self.config.data_type, "Fetching feed");

        let bytes = fetch_source(client, &source).await?;
        let archive = FeedArchive::from_bytes(&bytes)
            .with_context(|| format!("reading feed archive from {source}"))?;

        self.run(&archive, &source).await
    }

    /// Replaces every collection of the configured data type with the
    /// contents of `archive`, then rebuilds stations and metadata.
    #[tracing::instrument(skip_all, fields(data_type = %self.config.data_type, source = %source))]
    pub async fn run(&self, archive: &FeedArchive, source: &str) -> Result<RunSummary> {
        let data_type = self.config.data_type;
        let store = self.store.as_ref();
        let ctx = LoadContext::new(store, data_type);
        let mut summary = RunSummary::start(data_type, source);

        info!("Starting feed processing");

        summary.record_table(Agency::FILE, load_table::<Agency>(&ctx, archive).await?);

        let (routes, load) = load_keyed::<Route>(&ctx, archive).await?;
        summary.record_table(Route::FILE, load);

        let (stops, load) = load_keyed::<Stop>(&ctx, archive).await?;
        summary.record_table(Stop::FILE, load);

        let (_, load) = load_keyed::<CalendarEntry>(&ctx, archive).await?;
        summary.record_table(CalendarEntry::FILE, load);

        let load = load_batched::<ShapePoint>(&ctx, archive, self.config.shapes_batch_size).await?;
        summary.record_table(ShapePoint::FILE, load);

        let (trips, load) = load_keyed::<Trip>(&ctx, archive).await?;
        summary.record_table(Trip::FILE, load);

        let load =
            load_batched::<StopTime>(&ctx, archive, self.config.stop_times_batch_size).await?;
        summary.record_table(StopTime::FILE, load);

        summary.record_table(Transfer::FILE, load_table::<Transfer>(&ctx, archive).await?);

        // stop times are committed at this point, the aggregator reads them back
        let report = aggregate_stations(
            store,
            data_type,
            &stops,
            &routes,
            &trips,
            self.config.stop_time_limit,
        )
        .await?;
        let written = write_stations(store, data_type, &report.stations, ctx.processed_at).await?;
        summary.record_stations(&report, written);

        self.write_metadata(data_type, source).await?;

        summary.finish();
        info!(
            elapsed_secs = summary.elapsed_secs(),
            stations = summary.stations,
            "Total processing time"
        );
        Ok(summary)
    }

    async fn write_metadata(&self, data_type: DataType, source: &str) -> Result<()> {
        let metadata = FeedMetadata {
            data_type,
            last_updated: Utc::now(),
            source_url: source.to_string(),
            is_supplemented: data_type.is_supplemented(),
        };
        self.store
            .upsert_one(
                collections::METADATA,
                &Filter::data_type(data_type),
                to_document(&metadata)?,
            )
            .await?;
        info!("Updated metadata");
        Ok(())
    }
}
