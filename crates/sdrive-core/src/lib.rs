pub mod config;
pub mod error;
pub mod types;

pub use error::{ApiError, RevisionConflict, TransferError, TransferResult};
pub use types::{
    AddressId, Block, CommonAttributes, ExtendedAttributes, FileSample, NodeId, NodeIdentity,
    Revision, RevisionId, RevisionState, SampleKind, ShareId, VerificationStatus, VolumeId,
};
