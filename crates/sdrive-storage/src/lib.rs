//! sdrive-storage: OpenDAL-backed blob storage for block ciphertext

pub mod blob;
pub mod health;
pub mod operator;

pub use blob::{blob_url, BlobStore, OperatorBlobStore, BLOB_URL_SCHEME};
pub use health::check_health;
pub use operator::{build_operator, S3Credentials};
