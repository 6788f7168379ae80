//! Table loaders: one feed table in, one collection replaced.
//!
//! Every loader replaces only the documents tagged with the current data
//! type, inside a single replace session, so the other variant is never
//! touched and a failed load leaves the previous contents in place.

mod records;

pub use records::{KeyedRecord, TableRecord};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::archive::FeedArchive;
use crate::config::DataType;
use crate::model::Tagged;
use crate::parser::RowReader;
use crate::store::{Document, DocumentStore, Filter, to_document};

/// What the loaders share for one run.
pub struct LoadContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub data_type: DataType,
    pub processed_at: DateTime<Utc>,
}

impl<'a> LoadContext<'a> {
    pub fn new(store: &'a dyn DocumentStore, data_type: DataType) -> Self {
        Self {
            store,
            data_type,
            processed_at: Utc::now(),
        }
    }

    /// Document form of `record`, labelled with the data type and load time.
    pub fn tag<T: Serialize>(&self, record: &T) -> Result<Document> {
        to_document(&Tagged::new(record, self.data_type, self.processed_at))
    }

    fn scope(&self) -> Filter {
        Filter::data_type(self.data_type)
    }
}

/// Row and document counts for one loaded table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableLoad {
    pub rows: u64,
    pub inserted: u64,
    pub duplicates: u64,
}

/// Loads a table whose records are only persisted.
#[tracing::instrument(skip_all, fields(table = T::FILE, data_type = %ctx.data_type))]
pub async fn load_table<T: TableRecord>(
    ctx: &LoadContext<'_>,
    archive: &FeedArchive,
) -> Result<TableLoad> {
    let records = read_records::<T>(archive)?;
    let rows = records.len() as u64;

    let docs = records
        .iter()
        .map(|record| ctx.tag(record))
        .collect::<Result<Vec<_>>>()?;
    let inserted = replace_all(ctx, T::COLLECTION, docs).await?;

    info!(inserted, "Inserted {}", T::COLLECTION);
    Ok(TableLoad {
        rows,
        inserted,
        duplicates: 0,
    })
}

/// Loads a table and returns its records keyed by natural identifier.
///
/// A key repeated within the file keeps its last occurrence, both in the
/// returned map and in the collection; each repeat is reported.
#[tracing::instrument(skip_all, fields(table = T::FILE, data_type = %ctx.data_type))]
pub async fn load_keyed<T: KeyedRecord>(
    ctx: &LoadContext<'_>,
    archive: &FeedArchive,
) -> Result<(HashMap<String, T>, TableLoad)> {
    let records = read_records::<T>(archive)?;
    let rows = records.len() as u64;

    let mut order = Vec::with_capacity(records.len());
    let mut by_key: HashMap<String, T> = HashMap::with_capacity(records.len());
    let mut duplicates = 0u64;

    for record in records {
        let key = record.key().to_string();
        if by_key.insert(key.clone(), record).is_some() {
            duplicates += 1;
            debug!(key = %key, "Duplicate identifier, keeping the last occurrence");
        } else {
            order.push(key);
        }
    }

    if duplicates > 0 {
        warn!(duplicates, "Table repeats identifiers; later rows replaced earlier ones");
    }

    let docs = order
        .iter()
        .filter_map(|key| by_key.get(key))
        .map(|record| ctx.tag(record))
        .collect::<Result<Vec<_>>>()?;
    let inserted = replace_all(ctx, T::COLLECTION, docs).await?;

    info!(inserted, "Inserted {}", T::COLLECTION);
    Ok((
        by_key,
        TableLoad {
            rows,
            inserted,
            duplicates,
        },
    ))
}

/// Streams a large table into its collection in fixed-size batches.
#[tracing::instrument(skip_all, fields(table = T::FILE, data_type = %ctx.data_type, batch_size = batch_size))]
pub async fn load_batched<T: TableRecord>(
    ctx: &LoadContext<'_>,
    archive: &FeedArchive,
    batch_size: usize,
) -> Result<TableLoad> {
    let batch_size = batch_size.max(1);
    let mut session = ctx.store.begin_replace(T::COLLECTION, ctx.scope()).await?;
    let mut rows = 0u64;

    if let Some(bytes) = table_bytes::<T>(archive)? {
        let mut batch = Vec::with_capacity(batch_size);
        for row in RowReader::new(T::FILE, bytes)? {
            let record = T::from_row(&row?)?;
            batch.push(ctx.tag(&record)?);
            rows += 1;

            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                session.insert_many(full).await?;
                info!(rows, "Inserted {} so far", T::COLLECTION);
            }
        }
        if !batch.is_empty() {
            session.insert_many(batch).await?;
        }
    }

    let inserted = session.commit().await?;
    info!(inserted, "Inserted total of {}", T::COLLECTION);
    Ok(TableLoad {
        rows,
        inserted,
        duplicates: 0,
    })
}

fn table_bytes<T: TableRecord>(archive: &FeedArchive) -> Result<Option<&[u8]>> {
    if T::REQUIRED {
        return Ok(Some(archive.table(T::FILE)?));
    }
    let bytes = archive.optional_table(T::FILE);
    if bytes.is_none() {
        warn!(table = T::FILE, "Optional table missing from feed, collection will be emptied");
    }
    Ok(bytes)
}

fn read_records<T: TableRecord>(archive: &FeedArchive) -> Result<Vec<T>> {
    match table_bytes::<T>(archive)? {
        Some(bytes) => RowReader::new(T::FILE, bytes)?
            .map(|row| T::from_row(&row?))
            .collect(),
        None => Ok(Vec::new()),
    }
}

async fn replace_all(ctx: &LoadContext<'_>, collection: &str, docs: Vec<Document>) -> Result<u64> {
    let mut session = ctx.store.begin_replace(collection, ctx.scope()).await?;
    session.insert_many(docs).await?;
    session.commit().await
}
