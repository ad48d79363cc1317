use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Volume holding a node
    VolumeId
);
string_id!(
    /// Share through which a node is addressed
    ShareId
);
string_id!(
    /// File or folder node (link) id
    NodeId
);
string_id!(RevisionId);
string_id!(
    /// Address whose primary key signs content
    AddressId
);

/// Fully-qualified identity of a file node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub volume_id: VolumeId,
    pub share_id: ShareId,
    pub node_id: NodeId,
}

/// Lifecycle state of a revision.
///
/// Content may only be written while `Draft` and only read otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionState {
    Draft,
    Active,
    Obsolete,
    Deleted,
}

/// One version of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub file_id: NodeId,
    pub volume_id: VolumeId,
    pub state: RevisionState,
    /// Plaintext size in bytes
    pub size: u64,
    /// Encrypted bytes stored server-side
    pub quota_consumption: u64,
    /// Unix timestamp (seconds)
    pub creation_time: u64,
    /// Detached signature over the full manifest
    pub manifest_signature: Option<Vec<u8>>,
    /// Address whose keys verify the manifest signature
    pub signature_email: Option<String>,
    /// SHA-256 digests of the encrypted samples, ordered by sample kind
    pub samples_sha256_digests: Vec<[u8; 32]>,
}

impl Revision {
    /// A freshly created draft with no content.
    pub fn draft(id: RevisionId, file_id: NodeId, volume_id: VolumeId, creation_time: u64) -> Self {
        Self {
            id,
            file_id,
            volume_id,
            state: RevisionState::Draft,
            size: 0,
            quota_consumption: 0,
            creation_time,
            manifest_signature: None,
            signature_email: None,
            samples_sha256_digests: Vec::new(),
        }
    }

    pub fn is_draft(&self) -> bool {
        self.state == RevisionState::Draft
    }
}

/// One ciphertext block of a revision, as listed by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based, contiguous within a revision
    pub index: u32,
    /// Location of the ciphertext blob
    pub url: String,
    /// Plaintext signature, sealed to the node key
    pub encrypted_signature: Option<Vec<u8>>,
    /// Address whose keys verify the block signature
    pub signature_email: Option<String>,
}

/// Kind of an auxiliary sample (thumbnail) stored alongside content blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    Thumbnail = 1,
    Preview = 2,
}

/// A plaintext sample uploaded with a revision.
#[derive(Debug, Clone)]
pub struct FileSample {
    pub kind: SampleKind,
    pub content: Vec<u8>,
}

/// Trust outcome of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Ok,
    NotSigned,
    NoVerifier,
    Failed,
    BadContext,
}

/// Attributes sealed to the node key at finalize time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedAttributes {
    pub common: CommonAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonAttributes {
    pub size: u64,
    /// Unix timestamp (seconds) of the last local modification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification_time: Option<u64>,
    pub block_sizes: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_kinds_order_thumbnail_first() {
        let mut kinds = vec![SampleKind::Preview, SampleKind::Thumbnail];
        kinds.sort();
        assert_eq!(kinds, vec![SampleKind::Thumbnail, SampleKind::Preview]);
    }

    #[test]
    fn extended_attributes_use_pascal_case() {
        let xattr = ExtendedAttributes {
            common: CommonAttributes {
                size: 5,
                modification_time: Some(1_700_000_000),
                block_sizes: vec![5],
            },
        };
        let json = serde_json::to_string(&xattr).unwrap();
        assert_eq!(
            json,
            r#"{"Common":{"Size":5,"ModificationTime":1700000000,"BlockSizes":[5]}}"#
        );
    }

    #[test]
    fn new_draft_is_draft() {
        let rev = Revision::draft("r1".into(), "f1".into(), "v1".into(), 0);
        assert!(rev.is_draft());
        assert!(rev.samples_sha256_digests.is_empty());
    }
}
