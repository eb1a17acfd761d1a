//! Replicated documents and their synchronization.
//!
//! A [`Document`] is any CRDT that can describe its state as [`Heads`], encode the
//! changes another replica is missing, and merge such changes. Each (document, peer)
//! pair has a [`DocSyncCursor`] remembering what the peer is known to have; the
//! [`ReplicationScheduler`] batches the cursors' outgoing [`Mutation`]s per peer.

use std::{collections::BTreeMap, fmt::Debug};

use bytes::Bytes;
use nested_enum_utils::common_fields;
use plexus_base::FeedKey;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

use crate::topology::TopicId;

pub mod cursor;
pub mod document;
pub mod scheduler;

pub use self::{
    cursor::DocSyncCursor,
    document::{ActorId, MapDocument},
    scheduler::{
        BatchDispatcher, Builder as SchedulerBuilder, DispatchError, DocHandle, ReplicationEvent,
        ReplicationScheduler, SchedulerError,
    },
};

/// Identifier of a document within a space.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct DocId(String);

impl From<&str> for DocId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl DocId {
    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Version vector of a document: the number of changes seen from each actor.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct Heads {
    heads: BTreeMap<ActorId, u64>,
}

impl Heads {
    /// Insert a new head, keeping the larger of the two.
    pub fn insert(&mut self, actor: ActorId, seq: u64) {
        self.heads
            .entry(actor)
            .and_modify(|t| *t = (*t).max(seq))
            .or_insert(seq);
    }

    /// The head of `actor`, 0 if unknown.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.heads.get(actor).copied().unwrap_or_default()
    }

    /// Can this state offer newer changes to `other`?
    pub fn has_news_for(&self, other: &Self) -> bool {
        self.heads
            .iter()
            .any(|(actor, seq)| *seq > other.get(actor))
    }

    /// Whether this state includes everything `other` has seen.
    pub fn covers(&self, other: &Self) -> bool {
        !other.has_news_for(self)
    }

    /// Merge another state into this one.
    pub fn merge(&mut self, other: &Self) {
        for (actor, seq) in other.iter() {
            self.insert(*actor, *seq);
        }
    }

    /// Create an iterator over the entries in this state.
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, ActorId, u64> {
        self.heads.iter()
    }

    /// Whether no change has been seen.
    pub fn is_empty(&self) -> bool {
        self.heads.values().all(|seq| *seq == 0)
    }
}

/// Errors merging changes into a document.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DocumentError {
    #[snafu(display("malformed changes"))]
    Decode { source: postcard::Error },
    #[snafu(display("mutation for {actual} applied to {expected}"))]
    WrongDocument { expected: DocId, actual: DocId },
}

/// A CRDT document that can be replicated incrementally.
pub trait Document: Debug + Send + 'static {
    /// The checkpoint of everything this replica has seen.
    fn heads(&self) -> Heads;

    /// Encode the changes not covered by `since`.
    fn encode_since(&self, since: &Heads) -> Bytes;

    /// Merge changes produced by [`Self::encode_since`] on another replica.
    ///
    /// Merging is commutative and idempotent: applying the same bytes twice, or changes
    /// from different replicas in any order, converges to the same state.
    fn apply_changes(&mut self, changes: &[u8]) -> Result<(), DocumentError>;
}

/// The changes of one document a peer is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// The document.
    pub doc_id: DocId,
    /// What the sender believed the receiver had.
    pub base: Heads,
    /// The sender's heads after the changes.
    pub heads: Heads,
    /// Encoded changes between `base` and `heads`.
    pub changes: Bytes,
}

/// The mutations sent to one peer in one flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// The space topic the documents belong to.
    pub topic: TopicId,
    /// The sender's data feed, which records the changes in this batch.
    ///
    /// Receivers that gate on admission only accept batches whose feed is an admitted
    /// data feed.
    pub feed: Option<FeedKey>,
    /// One mutation per dirty document.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// An empty batch for `topic`.
    pub fn new(topic: TopicId) -> Self {
        Self {
            topic,
            feed: None,
            mutations: Vec::new(),
        }
    }

    /// Attribute the batch to the data feed `feed`.
    pub fn with_feed(mut self, feed: FeedKey) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Number of mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Whether there are no mutations.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}
