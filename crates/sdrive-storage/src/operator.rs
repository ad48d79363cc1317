//! OpenDAL Operator factory for sdrive blob backends

use anyhow::{Context, Result};
use opendal::Operator;
use sdrive_core::config::StorageConfig;

/// Access keys for S3-compatible backends.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for the configured backend.
///
/// `memory` and `fs` need no credentials. `s3` uses path-style addressing
/// (the opendal 0.55 default, required by SeaweedFS and MinIO); if
/// `enforce_tls` is set, plaintext HTTP endpoints are refused.
pub fn build_operator(cfg: &StorageConfig, credentials: Option<&S3Credentials>) -> Result<Operator> {
    let op = match cfg.backend.as_str() {
        "memory" => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        "fs" => {
            let root = cfg.root.to_string_lossy();
            Operator::new(opendal::services::Fs::default().root(&root))
                .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        "s3" => build_s3(cfg, credentials)?,
        other => anyhow::bail!("unknown storage backend '{other}' (expected memory, fs or s3)"),
    };

    tracing::debug!(backend = %cfg.backend, "storage operator ready");
    Ok(op)
}

fn build_s3(cfg: &StorageConfig, credentials: Option<&S3Credentials>) -> Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                cfg.endpoint
            );
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted"
        );
    }

    let credentials = credentials.context("s3 backend requires access credentials")?;

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&credentials.access_key_id)
        .secret_access_key(&credentials.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}
