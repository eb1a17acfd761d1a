//! Append-only signed logs.
//!
//! A feed is a per-peer log of binary records. Every record is signed by the feed's
//! secret key and can be verified by anyone who knows the feed key. The storage behind a
//! feed is not part of this crate: [`SignedLog`] and [`FeedStore`] are the contract the
//! rest of the crate consumes, and [`MemFeedStore`] is the in-memory implementation.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::Range,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use plexus_base::{FeedKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu, ensure};
use tracing::trace;

/// A single record of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Position of the record in its feed, starting at 0.
    pub seq: u64,
    /// The record payload.
    pub data: Bytes,
    /// Signature of the feed key over `(feed key, seq, data)`.
    pub signature: Signature,
}

impl FeedRecord {
    /// Sign a new record at `seq`.
    pub fn sign(secret: &SecretKey, seq: u64, data: Bytes) -> Self {
        let signature = secret.sign(&signing_bytes(&secret.public(), seq, &data));
        Self {
            seq,
            data,
            signature,
        }
    }

    /// Verify that this record was signed by `key`.
    pub fn verify(&self, key: &FeedKey) -> bool {
        key.verify(&signing_bytes(key, self.seq, &self.data), &self.signature)
            .is_ok()
    }
}

fn signing_bytes(key: &FeedKey, seq: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 8 + data.len());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Errors of feed operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum FeedError {
    #[snafu(display("feed {} was opened read-only", key.fmt_short()))]
    NotWritable { key: FeedKey },
    #[snafu(display("range {start}..{end} exceeds feed length {len}"))]
    OutOfRange { start: u64, end: u64, len: u64 },
    #[snafu(display("feed {} is unknown", key.fmt_short()))]
    NotFound { key: FeedKey },
    #[snafu(display("feed {} is closed", key.fmt_short()))]
    Closed { key: FeedKey },
    #[snafu(display("record {seq} does not verify against feed {}", key.fmt_short()))]
    InvalidRecord { key: FeedKey, seq: u64 },
    #[snafu(display("expected record {expected}, got {seq}"))]
    OutOfOrder { expected: u64, seq: u64 },
}

/// An append-only log of signed records.
pub trait SignedLog: Debug + Send + Sync + 'static {
    /// The public key of this feed.
    fn key(&self) -> FeedKey;

    /// Whether this handle holds the secret key and may append.
    fn is_writable(&self) -> bool;

    /// Append a record, returning its sequence number.
    ///
    /// Fails with [`FeedError::NotWritable`] if the feed was opened read-only.
    fn append(&self, data: Bytes) -> BoxFuture<Result<u64, FeedError>>;

    /// Read the records in `range`.
    ///
    /// Fails with [`FeedError::OutOfRange`] if the range exceeds [`Self::len`].
    fn read_range(&self, range: Range<u64>) -> BoxFuture<Result<Vec<FeedRecord>, FeedError>>;

    /// The number of records in this feed.
    fn len(&self) -> u64;

    /// Whether the feed has no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify a record against this feed's key.
    fn verify(&self, record: &FeedRecord) -> bool {
        record.verify(&self.key())
    }

    /// Close this handle. Further appends and reads fail with [`FeedError::Closed`].
    fn close(&self) -> BoxFuture<()>;
}

/// Opens and creates feeds.
pub trait FeedStore: Debug + Send + Sync + 'static {
    /// Mint a new writable feed.
    fn create(&self) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>>;

    /// Open a feed that exists in this store.
    ///
    /// Fails with [`FeedError::NotFound`] if the store has never seen `key`.
    fn open(&self, key: FeedKey) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>>;

    /// Open a feed, creating an empty read-only replica if the key is unknown.
    fn replicate(&self, key: FeedKey) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>>;
}

#[derive(Debug)]
struct FeedState {
    key: FeedKey,
    secret: Option<SecretKey>,
    records: RwLock<Vec<FeedRecord>>,
}

/// A handle to an in-memory feed.
#[derive(Debug, Clone)]
pub struct MemFeed {
    state: Arc<FeedState>,
    closed: Arc<AtomicBool>,
}

impl MemFeed {
    fn new(state: Arc<FeedState>) -> Self {
        Self {
            state,
            closed: Default::default(),
        }
    }

    /// Import a record received from a remote peer into a replica.
    ///
    /// The record must verify and must be the next record of the feed.
    pub fn import(&self, record: FeedRecord) -> Result<(), FeedError> {
        let key = self.state.key;
        ensure!(!self.closed.load(Ordering::Relaxed), ClosedSnafu { key });
        ensure!(
            record.verify(&key),
            InvalidRecordSnafu {
                key,
                seq: record.seq
            }
        );
        let mut records = self.state.records.write().expect("poisoned");
        let expected = records.len() as u64;
        ensure!(
            record.seq == expected,
            OutOfOrderSnafu {
                expected,
                seq: record.seq
            }
        );
        records.push(record);
        Ok(())
    }

    fn append_sync(&self, data: Bytes) -> Result<u64, FeedError> {
        let key = self.state.key;
        ensure!(!self.closed.load(Ordering::Relaxed), ClosedSnafu { key });
        let Some(secret) = &self.state.secret else {
            return Err(NotWritableSnafu { key }.build());
        };
        let mut records = self.state.records.write().expect("poisoned");
        let seq = records.len() as u64;
        records.push(FeedRecord::sign(secret, seq, data));
        trace!(feed = %key.fmt_short(), seq, "append");
        Ok(seq)
    }

    fn read_range_sync(&self, range: Range<u64>) -> Result<Vec<FeedRecord>, FeedError> {
        let key = self.state.key;
        ensure!(!self.closed.load(Ordering::Relaxed), ClosedSnafu { key });
        let records = self.state.records.read().expect("poisoned");
        let len = records.len() as u64;
        ensure!(
            range.start <= range.end && range.end <= len,
            OutOfRangeSnafu {
                start: range.start,
                end: range.end,
                len
            }
        );
        Ok(records[range.start as usize..range.end as usize].to_vec())
    }
}

impl SignedLog for MemFeed {
    fn key(&self) -> FeedKey {
        self.state.key
    }

    fn is_writable(&self) -> bool {
        self.state.secret.is_some()
    }

    fn append(&self, data: Bytes) -> BoxFuture<Result<u64, FeedError>> {
        let this = self.clone();
        Box::pin(async move { this.append_sync(data) })
    }

    fn read_range(&self, range: Range<u64>) -> BoxFuture<Result<Vec<FeedRecord>, FeedError>> {
        let this = self.clone();
        Box::pin(async move { this.read_range_sync(range) })
    }

    fn len(&self) -> u64 {
        self.state.records.read().expect("poisoned").len() as u64
    }

    fn close(&self) -> BoxFuture<()> {
        self.closed.store(true, Ordering::Relaxed);
        Box::pin(async {})
    }
}

/// In-memory [`FeedStore`].
///
/// Cloning the store yields a handle to the same set of feeds, which is how a node
/// keeps its feeds across a simulated restart in tests.
#[derive(Debug, Clone, Default)]
pub struct MemFeedStore {
    feeds: Arc<RwLock<BTreeMap<FeedKey, Arc<FeedState>>>>,
}

impl MemFeedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a concrete handle to a feed of this store.
    pub fn get(&self, key: &FeedKey) -> Option<MemFeed> {
        let feeds = self.feeds.read().expect("poisoned");
        feeds.get(key).cloned().map(MemFeed::new)
    }

    /// The keys of all feeds in this store.
    pub fn keys(&self) -> Vec<FeedKey> {
        self.feeds.read().expect("poisoned").keys().copied().collect()
    }

    fn create_sync(&self) -> Arc<dyn SignedLog> {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let key = secret.public();
        let state = Arc::new(FeedState {
            key,
            secret: Some(secret),
            records: Default::default(),
        });
        self.feeds
            .write()
            .expect("poisoned")
            .insert(key, state.clone());
        trace!(feed = %key.fmt_short(), "created feed");
        Arc::new(MemFeed::new(state))
    }
}

impl FeedStore for MemFeedStore {
    fn create(&self) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>> {
        let feed = self.create_sync();
        Box::pin(async move { Ok(feed) })
    }

    fn open(&self, key: FeedKey) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>> {
        let res = match self.get(&key) {
            Some(feed) => Ok(Arc::new(feed) as Arc<dyn SignedLog>),
            None => Err(NotFoundSnafu { key }.build()),
        };
        Box::pin(async move { res })
    }

    fn replicate(&self, key: FeedKey) -> BoxFuture<Result<Arc<dyn SignedLog>, FeedError>> {
        let state = self
            .feeds
            .write()
            .expect("poisoned")
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FeedState {
                    key,
                    secret: None,
                    records: Default::default(),
                })
            })
            .clone();
        let feed: Arc<dyn SignedLog> = Arc::new(MemFeed::new(state));
        Box::pin(async move { Ok(feed) })
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::Result;

    use super::*;

    #[tokio::test]
    async fn append_and_read() -> Result {
        let store = MemFeedStore::new();
        let feed = store.create().await?;
        assert!(feed.is_writable());
        assert!(feed.is_empty());
        assert_eq!(feed.append(Bytes::from_static(b"one")).await?, 0);
        assert_eq!(feed.append(Bytes::from_static(b"two")).await?, 1);
        assert_eq!(feed.len(), 2);

        let records = feed.read_range(0..2).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data.as_ref(), b"two");
        assert!(records.iter().all(|r| feed.verify(r)));
        Ok(())
    }

    #[tokio::test]
    async fn read_out_of_range() -> Result {
        let store = MemFeedStore::new();
        let feed = store.create().await?;
        feed.append(Bytes::from_static(b"one")).await?;
        let err = feed.read_range(0..2).await.unwrap_err();
        assert!(matches!(err, FeedError::OutOfRange { len: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn replica_is_not_writable() -> Result {
        let store = MemFeedStore::new();
        let remote = MemFeedStore::new();
        let source = remote.create().await?;
        source.append(Bytes::from_static(b"hello")).await?;

        let replica = store.replicate(source.key()).await?;
        let err = replica.append(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, FeedError::NotWritable { .. }));

        let handle = store.get(&source.key()).expect("replica exists");
        for record in source.read_range(0..1).await? {
            handle.import(record)?;
        }
        assert_eq!(replica.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn import_rejects_foreign_records() -> Result {
        let store = MemFeedStore::new();
        let a = store.create().await?;
        let b = store.create().await?;
        b.append(Bytes::from_static(b"not yours")).await?;
        let record = b.read_range(0..1).await?.remove(0);
        let replica = MemFeedStore::new();
        replica.replicate(a.key()).await?;
        let err = replica.get(&a.key()).unwrap().import(record).unwrap_err();
        assert!(matches!(err, FeedError::InvalidRecord { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn open_unknown_and_closed() -> Result {
        let store = MemFeedStore::new();
        let mut rng = rand::thread_rng();
        let unknown = SecretKey::generate(&mut rng).public();
        assert!(matches!(
            store.open(unknown).await.unwrap_err(),
            FeedError::NotFound { .. }
        ));

        let feed = store.create().await?;
        feed.close().await;
        assert!(matches!(
            feed.append(Bytes::new()).await.unwrap_err(),
            FeedError::Closed { .. }
        ));
        // reopening yields a fresh handle
        let reopened = store.open(feed.key()).await?;
        reopened.append(Bytes::new()).await?;
        Ok(())
    }
}
