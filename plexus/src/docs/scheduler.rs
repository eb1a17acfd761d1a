//! Batching and dispatch of document mutations.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::{Arc, Mutex},
};

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use n0_future::{
    boxed::BoxFuture,
    task::{self, AbortOnDropHandle, JoinSet},
    time::{self, Instant},
};
use nested_enum_utils::common_fields;
use plexus_base::PeerId;
use snafu::{Backtrace, Snafu};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, error_span, trace, warn};

use super::{DocId, Document, DocumentError, DocSyncCursor, Mutation, MutationBatch};
use crate::{
    config::ReplicationConfig,
    credential::{AuthState, FeedDesignation},
    feed::SignedLog,
    metrics::Metrics,
    topology::TopicId,
};

const INBOX_CAP: usize = 64;
const EVENT_CHANNEL_CAP: usize = 256;

/// Sends mutation batches to peers.
pub trait BatchDispatcher: Debug + Send + Sync + 'static {
    /// Deliver `batch` to `peer`, resolving once the transport acknowledged it.
    fn dispatch(&self, peer: PeerId, batch: MutationBatch) -> BoxFuture<Result<(), DispatchError>>;
}

/// A batch could not be delivered.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DispatchError {
    #[snafu(display("peer {} is not connected", peer.fmt_short()))]
    NotConnected { peer: PeerId },
    #[snafu(display("transport failed: {message}"))]
    Transport { message: String },
}

impl DispatchError {
    /// A transport failure described by `message`.
    pub fn transport(message: impl Into<String>) -> Self {
        TransportSnafu {
            message: message.into(),
        }
        .build()
    }

    /// `peer` has no session.
    pub fn not_connected(peer: PeerId) -> Self {
        NotConnectedSnafu { peer }.build()
    }
}

/// Errors of [`ReplicationScheduler`] operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SchedulerError {
    #[snafu(display("replication scheduler is shut down"))]
    Closed {},
    #[snafu(display("{} is not an admitted device", peer.fmt_short()))]
    NotAdmitted { peer: PeerId },
    #[snafu(display("batch from {} is not attributed to an admitted data feed", peer.fmt_short()))]
    Unattributed { peer: PeerId },
    #[snafu(transparent)]
    Document { source: DocumentError },
}

/// Events of a [`ReplicationScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A batch was delivered to a peer.
    BatchDispatched {
        /// The receiver.
        peer: PeerId,
        /// The documents in the batch.
        docs: Vec<DocId>,
    },
    /// A batch from a peer was merged.
    BatchReceived {
        /// The sender.
        peer: PeerId,
        /// The documents in the batch.
        docs: Vec<DocId>,
    },
    /// A batch could not be delivered after all retries.
    ///
    /// The documents stay dirty and are sent again on a later flush.
    DispatchFailed {
        /// The receiver.
        peer: PeerId,
        /// The documents in the batch.
        docs: Vec<DocId>,
        /// The last error.
        reason: String,
    },
}

/// Shared access to a tracked document.
///
/// Every [`DocHandle::change`] schedules the document for replication.
#[derive(derive_more::Debug)]
pub struct DocHandle<D> {
    id: DocId,
    #[debug("Arc<Mutex<D>>")]
    doc: Arc<Mutex<D>>,
    #[debug("mpsc::UnboundedSender")]
    changes: mpsc::UnboundedSender<DocId>,
}

impl<D> Clone for DocHandle<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            doc: self.doc.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<D: Document> DocHandle<D> {
    /// The document id.
    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Mutate the document and schedule the change for replication.
    pub fn change<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let res = {
            let mut doc = self.doc.lock().expect("poisoned");
            f(&mut doc)
        };
        // the scheduler is gone once the space closed, the change stays local
        self.changes.send(self.id.clone()).ok();
        res
    }

    /// Read the document.
    pub fn read<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        let doc = self.doc.lock().expect("poisoned");
        f(&doc)
    }
}

#[derive(derive_more::Debug, strum::Display)]
enum ToActor<D> {
    Track {
        doc_id: DocId,
        #[debug(skip)]
        doc: D,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<DocHandle<D>>,
    },
    Get {
        doc_id: DocId,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Option<DocHandle<D>>>,
    },
    AddPeer {
        peer: PeerId,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
    RemovePeer {
        peer: PeerId,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<bool>,
    },
    Receive {
        from: PeerId,
        batch: MutationBatch,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    FlushNow {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Builder for a [`ReplicationScheduler`].
#[derive(Debug)]
pub struct Builder {
    dispatcher: Arc<dyn BatchDispatcher>,
    config: ReplicationConfig,
    metrics: Arc<Metrics>,
    gate: Option<watch::Receiver<Arc<AuthState>>>,
    data_feed: Option<Arc<dyn SignedLog>>,
    topic: TopicId,
    name: String,
}

impl Builder {
    /// Set the configuration.
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Count into `metrics`.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Only accept batches from devices admitted in `auth`.
    pub fn gate(mut self, auth: watch::Receiver<Arc<AuthState>>) -> Self {
        self.gate = Some(auth);
        self
    }

    /// Record document changes in `log` and attribute outgoing batches to it.
    ///
    /// Documents recorded in `log` are restored when the scheduler starts.
    pub fn data_feed(mut self, log: Arc<dyn SignedLog>) -> Self {
        self.data_feed = Some(log);
        self
    }

    /// Stamp outgoing batches with `topic`.
    pub fn topic(mut self, topic: TopicId) -> Self {
        self.topic = topic;
        self
    }

    /// Name used in the actor's tracing span.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Spawn the scheduler actor.
    pub fn spawn<D: Document + Default>(self) -> ReplicationScheduler<D> {
        let (tx, inbox) = mpsc::channel(INBOX_CAP);
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let actor = Actor {
            inbox,
            changes_tx,
            changes_rx,
            dispatcher: self.dispatcher,
            config: self.config,
            metrics: self.metrics,
            gate: self.gate,
            topic: self.topic,
            events: events.clone(),
            journal: self.data_feed.map(|log| Journal {
                log,
                cursors: Default::default(),
            }),
            docs: Default::default(),
            peers: Default::default(),
            dirty: Default::default(),
            in_flight: Default::default(),
            dispatches: JoinSet::new(),
            flush_at: None,
            settle_until: None,
        };
        let task = task::spawn(
            actor
                .run()
                .instrument(error_span!("replication", name = %self.name)),
        );
        ReplicationScheduler {
            tx,
            events,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        }
    }
}

/// Batches local document changes and dispatches them to peers.
///
/// A change marks its document dirty and schedules a flush after the debounce window.
/// A flush takes the dirty set, computes one mutation per (document, peer) cursor and
/// sends one batch per peer. Changes made while a flush runs land in the next one.
///
/// Batches are delivered and retried in background tasks, so a slow or offline peer
/// does not hold up the others. A peer gets its next batch once the previous one was
/// delivered or given up on.
///
/// With a [data feed](Builder::data_feed), every flush first records the new changes of
/// each dirty document in that feed, and outgoing batches name it so receivers can
/// check that it is admitted.
#[derive(derive_more::Debug)]
pub struct ReplicationScheduler<D> {
    #[debug("mpsc::Sender")]
    tx: mpsc::Sender<ToActor<D>>,
    events: broadcast::Sender<ReplicationEvent>,
    #[debug("AbortOnDropHandle")]
    _task: Arc<AbortOnDropHandle<()>>,
}

impl<D> Clone for ReplicationScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            events: self.events.clone(),
            _task: self._task.clone(),
        }
    }
}

impl<D: Document + Default> ReplicationScheduler<D> {
    /// Start configuring a scheduler that sends through `dispatcher`.
    pub fn builder(dispatcher: Arc<dyn BatchDispatcher>) -> Builder {
        Builder {
            dispatcher,
            config: Default::default(),
            metrics: Default::default(),
            gate: None,
            data_feed: None,
            topic: TopicId::from_bytes([0; 32]),
            name: String::new(),
        }
    }

    /// Spawn a scheduler with the given configuration and no admission gate.
    pub fn spawn(dispatcher: Arc<dyn BatchDispatcher>, config: ReplicationConfig) -> Self {
        Self::builder(dispatcher).config(config).spawn()
    }

    /// Track a document, creating cursors for every known peer.
    ///
    /// If the document is already tracked, the existing handle is returned and `doc` is
    /// dropped.
    pub async fn track(&self, doc_id: impl Into<DocId>, doc: D) -> Result<DocHandle<D>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::Track {
            doc_id: doc_id.into(),
            doc,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    /// The handle of a tracked document.
    pub async fn get(&self, doc_id: impl Into<DocId>) -> Result<Option<DocHandle<D>>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::Get {
            doc_id: doc_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    /// Start replicating every document to `peer`.
    pub async fn add_peer(&self, peer: PeerId) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::AddPeer { peer, reply }).await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    /// Stop replicating to `peer`, dropping its cursors.
    pub async fn remove_peer(&self, peer: PeerId) -> Result<bool, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::RemovePeer { peer, reply }).await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    /// Merge a batch received from `from`. Returns the number of mutations applied.
    pub async fn receive(&self, from: PeerId, batch: MutationBatch) -> Result<usize, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::Receive { from, batch, reply }).await?;
        rx.await.map_err(|_| ClosedSnafu.build())?
    }

    /// Flush the dirty set now, ignoring the debounce and settle delays.
    pub async fn flush_now(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::FlushNow { reply }).await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    /// Subscribe to replication events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Flush pending changes and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::Shutdown { reply }).await?;
        rx.await.map_err(|_| ClosedSnafu.build())
    }

    async fn send(&self, msg: ToActor<D>) -> Result<(), SchedulerError> {
        self.tx.send(msg).await.map_err(|_| ClosedSnafu.build())
    }
}

#[derive(Debug)]
struct Actor<D> {
    inbox: mpsc::Receiver<ToActor<D>>,
    changes_tx: mpsc::UnboundedSender<DocId>,
    changes_rx: mpsc::UnboundedReceiver<DocId>,
    dispatcher: Arc<dyn BatchDispatcher>,
    config: ReplicationConfig,
    metrics: Arc<Metrics>,
    gate: Option<watch::Receiver<Arc<AuthState>>>,
    topic: TopicId,
    events: broadcast::Sender<ReplicationEvent>,
    journal: Option<Journal>,
    docs: BTreeMap<DocId, DocHandle<D>>,
    peers: BTreeMap<PeerId, BTreeMap<DocId, DocSyncCursor>>,
    dirty: BTreeSet<DocId>,
    /// Peers with a batch on the way. They get no new batch until it settled.
    in_flight: BTreeSet<PeerId>,
    dispatches: JoinSet<Dispatched>,
    flush_at: Option<Instant>,
    settle_until: Option<Instant>,
}

/// The local data feed and, per document, what was recorded in it.
#[derive(Debug)]
struct Journal {
    log: Arc<dyn SignedLog>,
    cursors: BTreeMap<DocId, DocSyncCursor>,
}

/// Outcome of a dispatch task.
#[derive(Debug)]
struct Dispatched {
    peer: PeerId,
    batch: MutationBatch,
    result: Result<(), DispatchError>,
}

impl<D: Document + Default> Actor<D> {
    async fn run(mut self) {
        self.replay().await;
        loop {
            let flush_at = self.flush_at;
            let flush_timer = async move {
                match flush_at {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("all handles dropped, shutdown");
                        break;
                    };
                    trace!(%msg, "tick: inbox");
                    if let ToActor::Shutdown { reply } = msg {
                        self.drain_changes();
                        self.drain_dispatches().await;
                        self.flush().await;
                        self.drain_dispatches().await;
                        reply.send(()).ok();
                        break;
                    }
                    self.on_message(msg).await;
                }
                Some(doc_id) = self.changes_rx.recv() => {
                    self.mark_dirty(doc_id);
                }
                Some(res) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    trace!("tick: dispatched");
                    self.on_joined(res);
                }
                _ = flush_timer => {
                    trace!("tick: flush");
                    self.flush().await;
                }
            }
        }
        debug!("replication scheduler stopped");
    }

    async fn on_message(&mut self, msg: ToActor<D>) {
        match msg {
            ToActor::Track { doc_id, doc, reply } => {
                let handle = self.track(doc_id, doc);
                reply.send(handle).ok();
            }
            ToActor::Get { doc_id, reply } => {
                reply.send(self.docs.get(&doc_id).cloned()).ok();
            }
            ToActor::AddPeer { peer, reply } => {
                self.add_peer(peer);
                reply.send(()).ok();
            }
            ToActor::RemovePeer { peer, reply } => {
                let existed = self.peers.remove(&peer).is_some();
                debug!(peer = %peer.fmt_short(), existed, "remove peer");
                reply.send(existed).ok();
            }
            ToActor::Receive { from, batch, reply } => {
                let res = self.receive(from, batch);
                reply.send(res).ok();
            }
            ToActor::FlushNow { reply } => {
                self.drain_changes();
                self.flush().await;
                reply.send(()).ok();
            }
            ToActor::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    /// Rebuild the documents recorded in the data feed.
    async fn replay(&mut self) {
        let Some(log) = self.journal.as_ref().map(|journal| journal.log.clone()) else {
            return;
        };
        let records = match log.read_range(0..log.len()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(feed = %log.key().fmt_short(), "failed to read data feed: {err}");
                return;
            }
        };
        let mut restored = 0;
        for record in records {
            let mutation: Mutation = match postcard::from_bytes(&record.data) {
                Ok(mutation) => mutation,
                Err(err) => {
                    warn!(seq = record.seq, "skipping malformed data record: {err}");
                    continue;
                }
            };
            match self.restore(&mutation) {
                Ok(()) => restored += 1,
                Err(err) => warn!(seq = record.seq, doc = %mutation.doc_id, "skipping data record: {err}"),
            }
        }
        debug!(records = restored, docs = self.docs.len(), "replayed data feed");
    }

    fn restore(&mut self, mutation: &Mutation) -> Result<(), DocumentError> {
        let doc_id = mutation.doc_id.clone();
        if !self.docs.contains_key(&doc_id) {
            self.track(doc_id.clone(), D::default());
        }
        let (Some(handle), Some(journal)) = (self.docs.get(&doc_id), self.journal.as_mut()) else {
            return Ok(());
        };
        let key = journal.log.key();
        let cursor = journal
            .cursors
            .entry(doc_id.clone())
            .or_insert_with(|| DocSyncCursor::new(doc_id, key));
        let mut doc = handle.doc.lock().expect("poisoned");
        cursor.apply_incoming(&mut *doc, mutation)
    }

    fn track(&mut self, doc_id: DocId, doc: D) -> DocHandle<D> {
        if let Some(handle) = self.docs.get(&doc_id) {
            return handle.clone();
        }
        let handle = DocHandle {
            id: doc_id.clone(),
            doc: Arc::new(Mutex::new(doc)),
            changes: self.changes_tx.clone(),
        };
        for (peer, cursors) in self.peers.iter_mut() {
            cursors.insert(doc_id.clone(), DocSyncCursor::new(doc_id.clone(), *peer));
        }
        if let Some(journal) = self.journal.as_mut() {
            let cursor = DocSyncCursor::new(doc_id.clone(), journal.log.key());
            journal.cursors.insert(doc_id.clone(), cursor);
        }
        self.docs.insert(doc_id.clone(), handle.clone());
        debug!(doc = %doc_id, "track");
        // an existing document may hold changes the peers have not seen
        self.mark_dirty(doc_id);
        handle
    }

    fn add_peer(&mut self, peer: PeerId) {
        if self.peers.contains_key(&peer) {
            return;
        }
        let cursors = self
            .docs
            .keys()
            .map(|doc_id| (doc_id.clone(), DocSyncCursor::new(doc_id.clone(), peer)))
            .collect();
        self.peers.insert(peer, cursors);
        debug!(peer = %peer.fmt_short(), "add peer");
        let doc_ids: Vec<_> = self.docs.keys().cloned().collect();
        for doc_id in doc_ids {
            self.mark_dirty(doc_id);
        }
    }

    fn drain_changes(&mut self) {
        while let Ok(doc_id) = self.changes_rx.try_recv() {
            self.mark_dirty(doc_id);
        }
    }

    fn mark_dirty(&mut self, doc_id: DocId) {
        if !self.docs.contains_key(&doc_id) {
            return;
        }
        for cursor in self.peers.values_mut().filter_map(|c| c.get_mut(&doc_id)) {
            cursor.mark_dirty();
        }
        self.dirty.insert(doc_id);
        self.schedule_flush();
    }

    /// Arm the flush timer unless a flush is already pending.
    fn schedule_flush(&mut self) {
        if self.flush_at.is_some() || self.dirty.is_empty() {
            return;
        }
        let mut at = Instant::now() + self.config.debounce;
        if let Some(settle_until) = self.settle_until {
            at = at.max(settle_until);
        }
        self.flush_at = Some(at);
    }

    /// Check that a batch comes from an admitted device and an admitted data feed.
    fn check_admission(&self, from: PeerId, batch: &MutationBatch) -> Result<(), SchedulerError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let auth = gate.borrow().clone();
        if !auth.is_device_admitted(&from) {
            self.metrics.batches_refused.inc();
            warn!(peer = %from.fmt_short(), "refusing batch from unadmitted device");
            return Err(NotAdmittedSnafu { peer: from }.build());
        }
        let attributed = batch
            .feed
            .and_then(|feed| auth.feeds().get(&feed).copied())
            .is_some_and(|info| info.designation == FeedDesignation::Data);
        if !attributed {
            self.metrics.batches_refused.inc();
            warn!(
                peer = %from.fmt_short(),
                feed = ?batch.feed.map(|feed| feed.fmt_short()),
                "refusing batch without an admitted data feed"
            );
            return Err(UnattributedSnafu { peer: from }.build());
        }
        Ok(())
    }

    /// Merge a batch mutation by mutation.
    ///
    /// A mutation that fails to merge drops the rest of the batch. The mutations
    /// merged before it stay applied and are reported in the
    /// [`ReplicationEvent::BatchReceived`] event.
    fn receive(&mut self, from: PeerId, batch: MutationBatch) -> Result<usize, SchedulerError> {
        self.check_admission(from, &batch)?;
        self.add_peer(from);
        let mut docs = Vec::with_capacity(batch.len());
        let mut failed = None;
        for mutation in batch.mutations {
            let doc_id = mutation.doc_id.clone();
            if !self.docs.contains_key(&doc_id) {
                self.track(doc_id.clone(), D::default());
            }
            let (Some(handle), Some(cursors)) = (self.docs.get(&doc_id), self.peers.get_mut(&from))
            else {
                continue;
            };
            let cursor = cursors
                .entry(doc_id.clone())
                .or_insert_with(|| DocSyncCursor::new(doc_id.clone(), from));
            let res = {
                let mut doc = handle.doc.lock().expect("poisoned");
                cursor.apply_incoming(&mut *doc, &mutation)
            };
            if let Err(err) = res {
                warn!(peer = %from.fmt_short(), doc = %doc_id, "dropping rest of batch: {err}");
                failed = Some(err);
                break;
            }
            self.metrics.mutations_received.inc();
            trace!(peer = %from.fmt_short(), doc = %doc_id, "applied mutation");
            // relay to the other peers
            self.mark_dirty(doc_id.clone());
            docs.push(doc_id);
        }
        let count = docs.len();
        if count > 0 || failed.is_none() {
            self.events
                .send(ReplicationEvent::BatchReceived { peer: from, docs })
                .ok();
        }
        match failed {
            Some(err) => Err(err.into()),
            None => Ok(count),
        }
    }

    async fn flush(&mut self) {
        self.flush_at = None;
        // take the dirty set first: changes arriving from here on go to the next flush
        let dirty = std::mem::take(&mut self.dirty);
        if dirty.is_empty() {
            return;
        }
        self.record(&dirty).await;
        let feed = self.journal.as_ref().map(|journal| journal.log.key());
        let mut batches: BTreeMap<PeerId, MutationBatch> = BTreeMap::new();
        let mut deferred = false;
        for doc_id in &dirty {
            let Some(handle) = self.docs.get(doc_id) else {
                continue;
            };
            let doc = handle.doc.lock().expect("poisoned");
            for (peer, cursors) in self.peers.iter_mut() {
                if self.in_flight.contains(peer) {
                    deferred = true;
                    continue;
                }
                let Some(cursor) = cursors.get_mut(doc_id) else {
                    continue;
                };
                if let Some(mutation) = cursor.compute_outgoing(&*doc) {
                    batches
                        .entry(*peer)
                        .or_insert_with(|| MutationBatch {
                            feed,
                            ..MutationBatch::new(self.topic)
                        })
                        .mutations
                        .push(mutation);
                }
            }
        }
        if deferred {
            // picked up again once the pending batch settled
            self.dirty.extend(dirty.iter().cloned());
        }
        if batches.is_empty() {
            trace!(docs = dirty.len(), deferred, "flush: nothing to send");
            return;
        }
        for (peer, batch) in batches {
            self.spawn_dispatch(peer, batch);
        }
        self.settle_until = Some(Instant::now() + self.config.settle);
    }

    /// Append what each dirty document gained since its last record to the data feed.
    async fn record(&mut self, dirty: &BTreeSet<DocId>) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        let key = journal.log.key();
        for doc_id in dirty {
            let Some(handle) = self.docs.get(doc_id) else {
                continue;
            };
            let cursor = journal
                .cursors
                .entry(doc_id.clone())
                .or_insert_with(|| DocSyncCursor::new(doc_id.clone(), key));
            let mutation = {
                let doc = handle.doc.lock().expect("poisoned");
                cursor.compute_outgoing(&*doc)
            };
            let Some(mutation) = mutation else {
                continue;
            };
            let record = postcard::to_stdvec(&mutation).expect("postcard serialization failed");
            if let Err(err) = journal.log.append(Bytes::from(record)).await {
                warn!(doc = %doc_id, "failed to record changes in data feed: {err}");
                cursor.rewind(&mutation.base);
            }
        }
    }

    fn spawn_dispatch(&mut self, peer: PeerId, batch: MutationBatch) {
        self.in_flight.insert(peer);
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        self.dispatches.spawn(
            dispatch(dispatcher, config, metrics, peer, batch)
                .instrument(error_span!("dispatch", peer = %peer.fmt_short())),
        );
    }

    fn on_joined(&mut self, res: Result<Dispatched, tokio::task::JoinError>) {
        match res {
            Ok(dispatched) => self.on_dispatched(dispatched),
            Err(err) => {
                if !err.is_cancelled() {
                    error!("dispatch task panicked: {err:?}");
                }
            }
        }
    }

    fn on_dispatched(&mut self, dispatched: Dispatched) {
        let Dispatched {
            peer,
            batch,
            result,
        } = dispatched;
        self.in_flight.remove(&peer);
        let docs: Vec<DocId> = batch.mutations.iter().map(|m| m.doc_id.clone()).collect();
        match result {
            Ok(()) => {
                self.metrics.batches_dispatched.inc();
                self.metrics.mutations_sent.inc_by(batch.len() as u64);
                debug!(peer = %peer.fmt_short(), docs = docs.len(), "batch dispatched");
                self.events
                    .send(ReplicationEvent::BatchDispatched { peer, docs })
                    .ok();
            }
            Err(err) => {
                error!(peer = %peer.fmt_short(), "dispatch failed, retries exhausted: {err}");
                self.metrics.dispatch_failures.inc();
                self.give_up(peer, &batch.mutations);
                self.events
                    .send(ReplicationEvent::DispatchFailed {
                        peer,
                        docs,
                        reason: err.to_string(),
                    })
                    .ok();
            }
        }
        self.schedule_flush();
    }

    async fn drain_dispatches(&mut self) {
        while let Some(res) = self.dispatches.join_next().await {
            self.on_joined(res);
        }
    }

    /// Rewind the cursors of an undelivered batch and keep its documents dirty.
    fn give_up(&mut self, peer: PeerId, mutations: &[Mutation]) {
        if let Some(cursors) = self.peers.get_mut(&peer) {
            for mutation in mutations {
                if let Some(cursor) = cursors.get_mut(&mutation.doc_id) {
                    cursor.rewind(&mutation.base);
                }
            }
        }
        for mutation in mutations {
            self.dirty.insert(mutation.doc_id.clone());
        }
    }
}

/// Deliver one batch, retrying with exponential backoff.
async fn dispatch(
    dispatcher: Arc<dyn BatchDispatcher>,
    config: ReplicationConfig,
    metrics: Arc<Metrics>,
    peer: PeerId,
    batch: MutationBatch,
) -> Dispatched {
    let mut backoff = ExponentialBuilder::new()
        .with_min_delay(config.retry_min_delay)
        .with_max_delay(config.retry_max_delay)
        .with_max_times(config.max_dispatch_retries)
        .with_jitter()
        .build();
    loop {
        match dispatcher.dispatch(peer, batch.clone()).await {
            Ok(()) => {
                return Dispatched {
                    peer,
                    batch,
                    result: Ok(()),
                };
            }
            Err(err) => {
                let Some(delay) = backoff.next() else {
                    return Dispatched {
                        peer,
                        batch,
                        result: Err(err),
                    };
                };
                warn!("dispatch failed, retry in {delay:?}: {err}");
                metrics.dispatch_retries.inc();
                time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use n0_snafu::{Result, ResultExt};
    use plexus_base::{FeedKey, SecretKey};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        credential::CredentialChain,
        docs::{ActorId, MapDocument},
        feed::{FeedStore, MemFeedStore},
    };

    /// Records every batch and optionally fails the first `fail` attempts.
    ///
    /// Batches to `offline` always fail.
    #[derive(Debug, Default)]
    struct Recorder {
        sent: Mutex<Vec<(PeerId, MutationBatch)>>,
        fail: AtomicUsize,
        offline: Option<PeerId>,
    }

    impl Recorder {
        fn failing(fail: usize) -> Self {
            Self {
                fail: AtomicUsize::new(fail),
                ..Default::default()
            }
        }

        fn offline(peer: PeerId) -> Self {
            Self {
                offline: Some(peer),
                ..Default::default()
            }
        }

        fn sent_to(&self, peer: PeerId) -> usize {
            self.sent().iter().filter(|(to, _)| *to == peer).count()
        }

        fn sent(&self) -> Vec<(PeerId, MutationBatch)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl BatchDispatcher for Recorder {
        fn dispatch(
            &self,
            peer: PeerId,
            batch: MutationBatch,
        ) -> BoxFuture<Result<(), DispatchError>> {
            if self.offline == Some(peer) {
                return Box::pin(async move { Err(DispatchError::not_connected(peer)) });
            }
            let fail = self
                .fail
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let res = if fail {
                Err(DispatchError::transport("link down"))
            } else {
                self.sent.lock().unwrap().push((peer, batch));
                Ok(())
            };
            Box::pin(async move { res })
        }
    }

    fn peer() -> PeerId {
        SecretKey::generate(&mut rand::thread_rng()).public()
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn burst_is_coalesced() -> Result {
        let recorder = Arc::new(Recorder::default());
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        let remote = peer();
        scheduler.add_peer(remote).await?;
        let doc = scheduler
            .track("notes", MapDocument::new(ActorId::from_bytes([1; 16])))
            .await?;

        for i in 0..50 {
            doc.change(|doc| doc.set("counter", i.to_string()));
            time::sleep(Duration::from_millis(1)).await;
        }
        time::sleep(Duration::from_millis(500)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        let (to, batch) = &sent[0];
        assert_eq!(*to, remote);
        assert_eq!(batch.len(), 1);

        let mut replica = MapDocument::new(ActorId::from_bytes([2; 16]));
        replica.apply_changes(&batch.mutations[0].changes)?;
        assert_eq!(replica.get("counter").unwrap().as_ref(), b"49");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn one_batch_per_peer_across_documents() -> Result {
        let recorder = Arc::new(Recorder::default());
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        let (p1, p2) = (peer(), peer());
        scheduler.add_peer(p1).await?;
        scheduler.add_peer(p2).await?;
        let a = scheduler.track("a", MapDocument::default()).await?;
        let b = scheduler.track("b", MapDocument::default()).await?;
        a.change(|doc| doc.set("x", "1"));
        b.change(|doc| doc.set("y", "2"));
        time::sleep(Duration::from_millis(200)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, batch)| batch.len() == 2));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn settle_delays_the_next_flush() -> Result {
        let recorder = Arc::new(Recorder::default());
        let config = ReplicationConfig::default()
            .with_debounce(Duration::from_millis(100))
            .with_settle(Duration::from_secs(1));
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), config);
        scheduler.add_peer(peer()).await?;
        let doc = scheduler.track("doc", MapDocument::default()).await?;

        doc.change(|doc| doc.set("k", "1"));
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.sent().len(), 1);

        doc.change(|doc| doc.set("k", "2"));
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.sent().len(), 1, "still settling");
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.sent().len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn dispatch_is_retried() -> Result {
        let recorder = Arc::new(Recorder::failing(2));
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        let mut events = scheduler.subscribe();
        scheduler.add_peer(peer()).await?;
        let doc = scheduler.track("doc", MapDocument::default()).await?;
        doc.change(|doc| doc.set("k", "v"));
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.sent().len(), 1);
        assert!(matches!(
            events.recv().await.e()?,
            ReplicationEvent::BatchDispatched { .. }
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn exhausted_retries_keep_changes() -> Result {
        let recorder = Arc::new(Recorder::failing(2));
        let config = ReplicationConfig::default().with_max_dispatch_retries(1);
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), config);
        let mut events = scheduler.subscribe();
        let remote = peer();
        scheduler.add_peer(remote).await?;
        let doc = scheduler.track("doc", MapDocument::default()).await?;
        doc.change(|doc| doc.set("k", "v"));
        time::sleep(Duration::from_secs(30)).await;

        assert!(matches!(
            events.recv().await.e()?,
            ReplicationEvent::DispatchFailed { peer, .. } if peer == remote
        ));
        // the rewound cursor sends the same changes on the next flush
        assert!(matches!(
            events.recv().await.e()?,
            ReplicationEvent::BatchDispatched { .. }
        ));
        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.mutations[0].base.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn received_changes_are_relayed_not_echoed() -> Result {
        let recorder = Arc::new(Recorder::default());
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        let (from, other) = (peer(), peer());
        scheduler.add_peer(other).await?;

        let mut source = MapDocument::default();
        source.set("k", "v");
        let mut cursor = DocSyncCursor::new("doc".into(), peer());
        let mutation = cursor.compute_outgoing(&source).unwrap();
        let applied = scheduler
            .receive(
                from,
                MutationBatch {
                    mutations: vec![mutation],
                    ..MutationBatch::new(TopicId::from_bytes([0; 32]))
                },
            )
            .await?;
        assert_eq!(applied, 1);
        time::sleep(Duration::from_millis(500)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, other);

        let handle = scheduler.get("doc").await?.expect("auto-tracked");
        assert_eq!(handle.read(|doc| doc.to_map()), source.to_map());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes() -> Result {
        let recorder = Arc::new(Recorder::default());
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        scheduler.add_peer(peer()).await?;
        let doc = scheduler.track("doc", MapDocument::default()).await?;
        doc.change(|doc| doc.set("k", "v"));
        scheduler.shutdown().await?;
        assert_eq!(recorder.sent().len(), 1);
        assert!(scheduler.add_peer(peer()).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn offline_peer_does_not_hold_up_others() -> Result {
        let (down, up) = (peer(), peer());
        let recorder = Arc::new(Recorder::offline(down));
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        scheduler.add_peer(down).await?;
        scheduler.add_peer(up).await?;
        let doc = scheduler.track("doc", MapDocument::default()).await?;

        doc.change(|doc| doc.set("k", "1"));
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.sent_to(up), 1);

        // the actor keeps answering while the offline peer is retried
        tokio::time::timeout(Duration::from_millis(10), scheduler.get("doc"))
            .await
            .e()??
            .expect("tracked");
        doc.change(|doc| doc.set("k", "2"));
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.sent_to(up), 2);
        assert_eq!(recorder.sent_to(down), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn changes_are_recorded_in_the_data_feed() -> Result {
        let store = MemFeedStore::new();
        let log = store.create().await?;
        let recorder = Arc::new(Recorder::default());
        let scheduler = ReplicationScheduler::<MapDocument>::builder(recorder.clone())
            .data_feed(log.clone())
            .spawn::<MapDocument>();
        scheduler.add_peer(peer()).await?;
        let doc = scheduler.track("notes", MapDocument::default()).await?;
        doc.change(|doc| doc.set("title", "kept"));
        time::sleep(Duration::from_millis(200)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.feed, Some(log.key()));
        assert_eq!(log.len(), 1);
        scheduler.shutdown().await?;

        let restarted = ReplicationScheduler::<MapDocument>::builder(recorder.clone())
            .data_feed(store.open(log.key()).await?)
            .spawn::<MapDocument>();
        let restored = restarted.get("notes").await?.expect("restored");
        assert_eq!(
            restored.read(|doc| doc.get("title").cloned()),
            Some(Bytes::from("kept"))
        );
        // restoring does not record the same changes again
        restarted.flush_now().await?;
        assert_eq!(log.len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn batches_need_an_admitted_data_feed() -> Result {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let space = SecretKey::generate(&mut rng);
        let store = MemFeedStore::new();
        let control = store.create().await?;
        let mut chain = CredentialChain::new(space.public(), control.clone());
        chain.append_genesis(control.key(), &space).await?;
        let (identity, device) = (SecretKey::generate(&mut rng), peer());
        chain
            .admit_member(identity.public(), device, &space)
            .await?;
        let data = SecretKey::generate(&mut rng).public();
        chain
            .admit_feed(data, FeedDesignation::Data, &space)
            .await?;

        let metrics = Arc::new(Metrics::default());
        let scheduler = ReplicationScheduler::<MapDocument>::builder(Arc::new(Recorder::default()))
            .gate(chain.watch())
            .metrics(metrics.clone())
            .spawn::<MapDocument>();
        let batch = |feed: Option<FeedKey>| {
            let mut source = MapDocument::default();
            source.set("k", "v");
            let mutation = DocSyncCursor::new("doc".into(), peer())
                .compute_outgoing(&source)
                .expect("changed");
            MutationBatch {
                feed,
                mutations: vec![mutation],
                ..MutationBatch::new(TopicId::from_bytes([0; 32]))
            }
        };

        assert!(matches!(
            scheduler.receive(device, batch(None)).await,
            Err(SchedulerError::Unattributed { .. })
        ));
        // the control feed is admitted, but does not carry documents
        assert!(matches!(
            scheduler.receive(device, batch(Some(control.key()))).await,
            Err(SchedulerError::Unattributed { .. })
        ));
        assert!(matches!(
            scheduler.receive(peer(), batch(Some(data))).await,
            Err(SchedulerError::NotAdmitted { .. })
        ));
        assert!(scheduler.get("doc").await?.is_none());
        assert_eq!(metrics.batches_refused.get(), 3);

        assert_eq!(scheduler.receive(device, batch(Some(data))).await?, 1);
        assert!(scheduler.get("doc").await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn malformed_mutation_reports_the_applied_part() -> Result {
        let recorder = Arc::new(Recorder::default());
        let scheduler: ReplicationScheduler<MapDocument> =
            ReplicationScheduler::spawn(recorder.clone(), ReplicationConfig::default());
        let mut events = scheduler.subscribe();
        let from = peer();

        let mut source = MapDocument::default();
        source.set("k", "v");
        let good = DocSyncCursor::new("a".into(), from)
            .compute_outgoing(&source)
            .expect("changed");
        let bad = Mutation {
            doc_id: "b".into(),
            changes: Bytes::from_static(&[0xff; 4]),
            ..good.clone()
        };
        let after = Mutation {
            doc_id: "c".into(),
            ..good.clone()
        };
        let err = scheduler
            .receive(
                from,
                MutationBatch {
                    mutations: vec![good, bad, after],
                    ..MutationBatch::new(TopicId::from_bytes([0; 32]))
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Document { .. }));
        assert_eq!(
            events.recv().await.e()?,
            ReplicationEvent::BatchReceived {
                peer: from,
                docs: vec!["a".into()],
            }
        );
        let a = scheduler.get("a").await?.expect("applied");
        assert_eq!(a.read(|doc| doc.to_map()), source.to_map());
        assert!(scheduler.get("c").await?.is_none());
        Ok(())
    }
}
