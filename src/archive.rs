//! Decompression of a feed bundle into its named table files.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tracing::{debug, info};

/// The table files of one feed archive, keyed by bare file name (`stops.txt`).
#[derive(Debug, Default)]
pub struct FeedArchive {
    files: BTreeMap<String, Vec<u8>>,
}

impl FeedArchive {
    /// Reads every `.txt` entry of a zip archive into memory.
    ///
    /// Feeds are sometimes zipped with an enclosing directory, so any path
    /// prefix is dropped and only the file name is kept.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).context("feed is not a valid zip archive")?;
        let mut files = BTreeMap::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let name = match entry.name().rsplit('/').next() {
                Some(name) if name.ends_with(".txt") => name.to_string(),
                _ => {
                    debug!(entry = entry.name(), "Skipping non-table archive entry");
                    continue;
                }
            };

            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to decompress {name}"))?;
            files.insert(name, data);
        }

        let archive = Self { files };
        info!(files = %archive.file_names().join(", "), "Files in feed archive");
        Ok(archive)
    }

    /// Builds an archive from already-extracted tables.
    pub fn from_tables<I, N, D>(tables: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<Vec<u8>>,
    {
        Self {
            files: tables
                .into_iter()
                .map(|(name, data)| (name.into(), data.into()))
                .collect(),
        }
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// Returns the contents of a table the feed must contain.
    pub fn table(&self, name: &str) -> Result<&[u8]> {
        self.optional_table(name)
            .ok_or_else(|| anyhow!("{name}: not found in feed archive"))
    }

    pub fn optional_table(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }
}
