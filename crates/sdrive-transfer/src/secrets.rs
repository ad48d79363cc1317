//! Secrets cache: unlocked node keys and content keys, keyed by node
//!
//! The engine never persists key material; it only asks the cache and fills
//! it after fetching from the metadata collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use sdrive_core::{NodeId, NodeIdentity, TransferError, TransferResult, VolumeId};
use sdrive_crypto::{open_content_key, ContentKey, NodeKey};
use tracing::debug;

use crate::api::DriveApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    NodeKey,
    ContentKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub volume: VolumeId,
    pub node: NodeId,
    pub kind: SecretKind,
}

impl CacheKey {
    pub fn new(file: &NodeIdentity, kind: SecretKind) -> Self {
        Self {
            volume: file.volume_id.clone(),
            node: file.node_id.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Secret {
    NodeKey(NodeKey),
    ContentKey(ContentKey),
}

pub trait SecretsCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Secret>;

    fn set(&self, key: CacheKey, secret: Secret);

    fn remove(&self, key: &CacheKey);
}

#[derive(Debug, Default)]
pub struct InMemorySecretsCache {
    entries: Mutex<HashMap<CacheKey, Secret>>,
}

impl InMemorySecretsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretsCache for InMemorySecretsCache {
    fn get(&self, key: &CacheKey) -> Option<Secret> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: CacheKey, secret: Secret) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, secret);
    }

    fn remove(&self, key: &CacheKey) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}

/// Node key of `file`, from the cache or the metadata service.
pub(crate) async fn node_key(
    cache: &dyn SecretsCache,
    api: &dyn DriveApi,
    file: &NodeIdentity,
) -> TransferResult<NodeKey> {
    let key = CacheKey::new(file, SecretKind::NodeKey);
    if let Some(Secret::NodeKey(node_key)) = cache.get(&key) {
        return Ok(node_key);
    }

    debug!(node = %file.node_id, "node key cache miss");
    let node_key = api.get_node_key(file).await?;
    cache.set(key, Secret::NodeKey(node_key.clone()));
    Ok(node_key)
}

/// Content key of `file`, opened from its packet with the node key.
pub(crate) async fn content_key(
    cache: &dyn SecretsCache,
    api: &dyn DriveApi,
    file: &NodeIdentity,
    node_key: &NodeKey,
) -> TransferResult<ContentKey> {
    let key = CacheKey::new(file, SecretKind::ContentKey);
    if let Some(Secret::ContentKey(content_key)) = cache.get(&key) {
        return Ok(content_key);
    }

    debug!(node = %file.node_id, "content key cache miss");
    let packet = api.get_content_key_packet(file).await?;
    let content_key = open_content_key(node_key, &packet).map_err(|_| TransferError::KeyMismatch)?;
    cache.set(key, Secret::ContentKey(content_key.clone()));
    Ok(content_key)
}
