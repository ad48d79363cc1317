//! URL-addressed blob store for block ciphertext
//!
//! Blocks are stored at URLs issued by the metadata service. For the OpenDAL
//! backends a URL is `blob://<path>`, and `<path>` is the object key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;

pub const BLOB_URL_SCHEME: &str = "blob";

/// Build the URL under which an object key is addressed.
pub fn blob_url(path: &str) -> String {
    format!("{BLOB_URL_SCHEME}://{}", path.trim_start_matches('/'))
}

/// Opaque PUT/GET of ciphertext bytes by URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, url: &str, data: Bytes) -> Result<()>;

    async fn get(&self, url: &str) -> Result<Bytes>;

    async fn delete(&self, url: &str) -> Result<()>;
}

/// [`BlobStore`] over an OpenDAL operator.
#[derive(Clone, Debug)]
pub struct OperatorBlobStore {
    op: Operator,
}

impl OperatorBlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

fn url_to_path(url: &str) -> Result<&str> {
    let path = url
        .strip_prefix(BLOB_URL_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .with_context(|| format!("not a blob URL: {url}"))?;

    if path.is_empty() || path.split('/').any(|seg| seg == "..") {
        anyhow::bail!("invalid blob path in URL: {url}");
    }
    Ok(path)
}

#[async_trait]
impl BlobStore for OperatorBlobStore {
    async fn put(&self, url: &str, data: Bytes) -> Result<()> {
        let path = url_to_path(url)?;
        let len = data.len();
        self.op
            .write(path, data)
            .await
            .with_context(|| format!("uploading blob: {path}"))?;
        tracing::trace!(path, bytes = len, "blob stored");
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Bytes> {
        let path = url_to_path(url)?;
        let buffer = self
            .op
            .read(path)
            .await
            .with_context(|| format!("downloading blob: {path}"))?;
        Ok(buffer.to_bytes())
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let path = url_to_path(url)?;
        self.op
            .delete(path)
            .await
            .with_context(|| format!("deleting blob: {path}"))
    }
}
