//! Shared fixtures for the transfer integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use sdrive_core::config::TransferConfig;
use sdrive_core::{FileSample, NodeIdentity, Revision, TransferResult, VerificationStatus};
use sdrive_storage::{BlobStore, OperatorBlobStore};
use sdrive_transfer::loopback::LoopbackDrive;
use sdrive_transfer::{TransferClient, UploadRequest};
use tokio_util::sync::CancellationToken;

pub const CLIENT_ID: &str = "integration-client";

pub fn memory_store() -> Arc<dyn BlobStore> {
    let op = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    Arc::new(OperatorBlobStore::new(op))
}

/// Small blocks and pages so that a few hundred bytes span several of each.
pub fn config(block_size: usize, transfers: usize) -> TransferConfig {
    TransferConfig {
        block_size,
        block_page_size: 2,
        max_block_transfers: transfers,
        max_block_processing: 0,
        client_id: Some(CLIENT_ID.into()),
    }
}

pub struct Harness {
    pub drive: Arc<LoopbackDrive>,
    pub client: TransferClient,
    pub file: NodeIdentity,
}

impl Harness {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_store(config, memory_store())
    }

    pub fn with_store(config: TransferConfig, blobs: Arc<dyn BlobStore>) -> Self {
        let drive = Arc::new(LoopbackDrive::new(blobs));
        let client = drive.client(config);
        let file = drive.create_file("share-main").expect("create file");
        Self {
            drive,
            client,
            file,
        }
    }

    pub fn request(&self) -> UploadRequest {
        UploadRequest {
            file: self.file.clone(),
            current_revision_id: None,
        }
    }

    pub async fn upload(&self, data: &[u8]) -> TransferResult<Revision> {
        self.upload_with(data, Vec::new(), &CancellationToken::new())
            .await
    }

    pub async fn upload_with(
        &self,
        data: &[u8],
        samples: Vec<FileSample>,
        cancel: &CancellationToken,
    ) -> TransferResult<Revision> {
        let uploader = self
            .client
            .wait_for_file_uploader(data.len() as u64, samples.len(), cancel)
            .await?;
        uploader
            .upload(&self.request(), data, samples, Some(1_700_000_000), None, cancel)
            .await
    }

    pub async fn download(&self, revision: &Revision) -> TransferResult<(Vec<u8>, VerificationStatus)> {
        self.download_with(revision, &CancellationToken::new()).await
    }

    pub async fn download_with(
        &self,
        revision: &Revision,
        cancel: &CancellationToken,
    ) -> TransferResult<(Vec<u8>, VerificationStatus)> {
        let downloader = self.client.wait_for_file_downloader(cancel).await?;
        let mut out = Vec::new();
        let status = downloader
            .download(&self.file, revision, &mut out, None, cancel)
            .await?;
        Ok((out, status))
    }
}

/// Deterministic, non-repeating-per-block content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Tracks how many calls are inside an operation at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// Blob store that delays every call, measures concurrency, and can be told
/// to hang until the caller gives up.
pub struct ProbeStore {
    inner: Arc<dyn BlobStore>,
    delay: Duration,
    pub puts: Gauge,
    pub gets: Gauge,
    pub stall_puts: AtomicBool,
    pub stall_gets: AtomicBool,
}

impl ProbeStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: memory_store(),
            delay,
            puts: Gauge::default(),
            gets: Gauge::default(),
            stall_puts: AtomicBool::new(false),
            stall_gets: AtomicBool::new(false),
        })
    }

    async fn pause(&self, stall: &AtomicBool) {
        if stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl BlobStore for ProbeStore {
    async fn put(&self, url: &str, data: Bytes) -> anyhow::Result<()> {
        self.puts.enter();
        self.pause(&self.stall_puts).await;
        let result = self.inner.put(url, data).await;
        self.puts.exit();
        result
    }

    async fn get(&self, url: &str) -> anyhow::Result<Bytes> {
        self.gets.enter();
        self.pause(&self.stall_gets).await;
        let result = self.inner.get(url).await;
        self.gets.exit();
        result
    }

    async fn delete(&self, url: &str) -> anyhow::Result<()> {
        self.inner.delete(url).await
    }
}

/// Wait until `condition` holds, polling briefly.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
