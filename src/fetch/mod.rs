//! Feed archive retrieval over HTTP or from the local filesystem.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::info;

/// GETs `url` and returns the body. Non-success statuses are errors.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client
        .execute(req)
        .await
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("feed endpoint {url} returned an error status"))?;

    Ok(resp.bytes().await?)
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(skip(client))]
pub async fn fetch_source<C: HttpClient>(client: &C, source: &str) -> Result<Bytes> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        info!("Downloading feed archive");
        fetch_bytes(client, source).await?
    } else {
        info!("Reading feed archive from disk");
        let data = tokio::fs::read(source)
            .await
            .with_context(|| format!("failed to read feed archive {source}"))?;
        Bytes::from(data)
    };

    info!(bytes = bytes.len(), "Feed archive loaded");
    Ok(bytes)
}
