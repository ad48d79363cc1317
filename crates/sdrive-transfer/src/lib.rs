//! sdrive-transfer: chunked encrypted transfer engine
//!
//! Upload path:
//! ```text
//! AsyncRead → block_size chunks → [transfer permit] → encrypt + sign → verify prefix
//!           → request upload target → PUT blob            (spawned, bounded by the pool)
//!           → drained in enqueue order → manifest → sign → finalize
//! ```
//!
//! Download path:
//! ```text
//! paged block listing (contiguity checked) → [transfer permit] → GET blob → decrypt
//!           → drained in index order → AsyncWrite; manifest verified at the end
//! ```
//!
//! Concurrency is governed by [`FifoResource`] pools owned by [`TransferClient`].

pub mod api;
pub mod client;
pub mod downloader;
pub mod loopback;
mod pending;
pub mod progress;
pub mod reader;
pub mod revision;
pub mod secrets;
pub mod semaphore;
pub mod uploader;
pub mod verifier;
pub mod writer;

pub use api::{AccountApi, DriveApi, SigningIdentity};
pub use client::{Collaborators, FileDownloader, FileUploader, PoolUsage, TransferClient, UploadRequest};
pub use progress::ProgressFn;
pub use reader::RevisionReader;
pub use secrets::{CacheKey, InMemorySecretsCache, Secret, SecretKind, SecretsCache};
pub use semaphore::{FifoPermit, FifoResource};
pub use verifier::BlockVerifier;
pub use writer::RevisionWriter;
