//! Persisted space metadata.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, RwLock},
};

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use plexus_base::{FeedKey, SpaceKey};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

/// Everything needed to reopen a space without issuing credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMetadata {
    /// The space.
    pub space_key: SpaceKey,
    /// The control feed of the space creator, holding the genesis credential.
    pub genesis_feed: FeedKey,
    /// The local control feed.
    pub control_feed: FeedKey,
    /// The local data feed.
    pub data_feed: FeedKey,
}

impl SpaceMetadata {
    /// Whether this node created the space.
    pub fn is_genesis(&self) -> bool {
        self.genesis_feed == self.control_feed
    }

    /// Encode for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_stdvec(self).expect("postcard serialization failed")
    }

    /// Decode from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        postcard::from_bytes(bytes).context(DecodeSnafu)
    }
}

/// Errors of a [`MetadataStore`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum MetadataError {
    #[snafu(display("invalid metadata record"))]
    Decode { source: postcard::Error },
    #[snafu(display("metadata store failed: {message}"))]
    Storage { message: String },
}

/// Durable storage of [`SpaceMetadata`], one record per space.
pub trait MetadataStore: Debug + Send + Sync + 'static {
    /// Insert or replace the record of a space.
    fn put(&self, metadata: SpaceMetadata) -> BoxFuture<Result<(), MetadataError>>;

    /// The record of `space_key`.
    fn get(&self, space_key: SpaceKey) -> BoxFuture<Result<Option<SpaceMetadata>, MetadataError>>;

    /// All records.
    fn list(&self) -> BoxFuture<Result<Vec<SpaceMetadata>, MetadataError>>;

    /// Remove the record of `space_key`. Returns false if there was none.
    fn delete(&self, space_key: SpaceKey) -> BoxFuture<Result<bool, MetadataError>>;
}

/// In-memory [`MetadataStore`] keeping encoded records.
#[derive(Debug, Clone, Default)]
pub struct MemMetadataStore {
    records: Arc<RwLock<BTreeMap<SpaceKey, Vec<u8>>>>,
}

impl MemMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw record, for tests that need to corrupt one.
    pub fn put_raw(&self, space_key: SpaceKey, bytes: Vec<u8>) {
        self.records
            .write()
            .expect("poisoned")
            .insert(space_key, bytes);
    }
}

impl MetadataStore for MemMetadataStore {
    fn put(&self, metadata: SpaceMetadata) -> BoxFuture<Result<(), MetadataError>> {
        self.put_raw(metadata.space_key, metadata.to_bytes());
        Box::pin(async { Ok(()) })
    }

    fn get(&self, space_key: SpaceKey) -> BoxFuture<Result<Option<SpaceMetadata>, MetadataError>> {
        let res = self
            .records
            .read()
            .expect("poisoned")
            .get(&space_key)
            .map(|bytes| SpaceMetadata::from_bytes(bytes))
            .transpose();
        Box::pin(async move { res })
    }

    fn list(&self) -> BoxFuture<Result<Vec<SpaceMetadata>, MetadataError>> {
        let res = self
            .records
            .read()
            .expect("poisoned")
            .values()
            .map(|bytes| SpaceMetadata::from_bytes(bytes))
            .collect();
        Box::pin(async move { res })
    }

    fn delete(&self, space_key: SpaceKey) -> BoxFuture<Result<bool, MetadataError>> {
        let existed = self
            .records
            .write()
            .expect("poisoned")
            .remove(&space_key)
            .is_some();
        Box::pin(async move { Ok(existed) })
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::Result;
    use plexus_base::SecretKey;

    use super::*;

    #[tokio::test]
    async fn store_roundtrip() -> Result {
        let mut rng = rand::thread_rng();
        let mut key = || SecretKey::generate(&mut rng).public();
        let metadata = SpaceMetadata {
            space_key: key(),
            genesis_feed: key(),
            control_feed: key(),
            data_feed: key(),
        };
        assert!(!metadata.is_genesis());

        let store = MemMetadataStore::new();
        store.put(metadata).await?;
        assert_eq!(store.get(metadata.space_key).await?, Some(metadata));
        assert_eq!(store.list().await?, vec![metadata]);
        assert!(store.delete(metadata.space_key).await?);
        assert!(!store.delete(metadata.space_key).await?);
        assert_eq!(store.get(metadata.space_key).await?, None);

        store.put_raw(metadata.space_key, vec![1, 2, 3]);
        assert!(matches!(
            store.get(metadata.space_key).await,
            Err(MetadataError::Decode { .. })
        ));
        Ok(())
    }
}
