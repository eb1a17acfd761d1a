//! Spaces and their lifecycle.
//!
//! A space is a shared set of documents whose writers are governed by a
//! [`CredentialChain`]. Each open space runs one actor that owns the chain and its
//! control feed, so credential writes of one space are serialized while different
//! spaces progress independently. The [`SpaceManager`] keeps the index of open spaces
//! and serializes lifecycle operations per space key.

use std::{
    collections::BTreeMap,
    fmt,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use n0_future::task::{self, AbortOnDropHandle};
use nested_enum_utils::common_fields;
use plexus_base::{DeviceKey, FeedKey, IdentityKey, PublicKey, SecretKey, SpaceKey};
use rand_core::CryptoRngCore;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, error_span, info, trace, warn};

use crate::{
    config::Config,
    credential::{
        AuthState, ChainError, ChainEvent, Credential, CredentialChain, FeedDesignation, Intake,
        RejectedCredential, chain::read_credentials,
    },
    docs::{
        BatchDispatcher, DocHandle, DocId, Document, MapDocument, MutationBatch,
        ReplicationScheduler, SchedulerError,
    },
    feed::{FeedError, FeedStore, MemFeedStore, SignedLog},
    metrics::Metrics,
    topology::{PeerTopology, TopicId},
};

mod metadata;

pub use self::metadata::{MemMetadataStore, MetadataError, MetadataStore, SpaceMetadata};

const INBOX_CAP: usize = 64;
const EVENT_CHANNEL_CAP: usize = 64;

/// The keys a node acts with.
///
/// The identity key is the member that gets admitted to spaces and signs credentials;
/// the device key identifies this node as a replication peer.
#[derive(Clone)]
pub struct Identity {
    identity: SecretKey,
    device: SecretKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("identity", &self.identity.public())
            .field("device", &self.device.public())
            .finish()
    }
}

impl Identity {
    /// Create an identity from existing keys.
    pub fn new(identity: SecretKey, device: SecretKey) -> Self {
        Self { identity, device }
    }

    /// Generate fresh identity and device keys.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Self {
            identity: SecretKey::generate(rng),
            device: SecretKey::generate(rng),
        }
    }

    /// The public identity key.
    pub fn identity_key(&self) -> IdentityKey {
        self.identity.public()
    }

    /// The public device key.
    pub fn device_key(&self) -> DeviceKey {
        self.device.public()
    }

    pub(crate) fn signer(&self) -> &SecretKey {
        &self.identity
    }
}

/// Lifecycle state of a [`Space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SpaceState {
    /// The local feeds have not been admitted yet.
    PendingAdmission,
    /// The local feeds are admitted.
    Ready,
    /// The space was closed.
    Closed,
    /// A credential failed verification, the space must be re-synced.
    Failed,
}

/// Errors of space operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum SpaceError {
    #[snafu(display("metadata of space {} does not match its feeds", space_key.fmt_short()))]
    CorruptMetadata {
        space_key: SpaceKey,
        source: ChainError,
    },
    #[snafu(display("space {} is closed", space_key.fmt_short()))]
    SpaceClosed { space_key: SpaceKey },
    #[snafu(display("space {} failed an integrity check", space_key.fmt_short()))]
    SpaceFailed { space_key: SpaceKey },
    #[snafu(display("credential for space {} failed verification", space_key.fmt_short()))]
    Integrity {
        space_key: SpaceKey,
        source: RejectedCredential,
    },
    #[snafu(transparent)]
    Chain { source: ChainError },
    #[snafu(transparent)]
    Feed { source: FeedError },
    #[snafu(transparent)]
    Metadata { source: MetadataError },
    #[snafu(transparent)]
    Replication { source: SchedulerError },
}

/// Changes of the open-space index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceEvent {
    /// A space was created, opened or accepted.
    Opened {
        /// The space.
        space_key: SpaceKey,
        /// Its state when opened.
        state: SpaceState,
    },
    /// A space was closed.
    Closed {
        /// The space.
        space_key: SpaceKey,
    },
}

#[derive(derive_more::Debug, strum::Display)]
enum ToSpace {
    AdmitFeed {
        feed_key: FeedKey,
        designation: FeedDesignation,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<Credential, SpaceError>>,
    },
    AdmitMember {
        identity_key: IdentityKey,
        device_key: DeviceKey,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<Credential, SpaceError>>,
    },
    AdmitGuest {
        identity_key: IdentityKey,
        device_key: DeviceKey,
        control_feed: FeedKey,
        data_feed: FeedKey,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<Vec<Credential>, SpaceError>>,
    },
    Receive {
        source: FeedKey,
        credentials: Vec<Credential>,
        notarize: bool,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<Vec<Credential>, SpaceError>>,
    },
    Credentials {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<Vec<Credential>, SpaceError>>,
    },
    Close {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Handle to an open space.
///
/// Cheap to clone. Credential operations are executed by the space's actor in the
/// order they are submitted.
#[derive(derive_more::Debug)]
pub struct Space<D = MapDocument> {
    metadata: SpaceMetadata,
    #[debug("mpsc::Sender")]
    tx: mpsc::Sender<ToSpace>,
    state: watch::Receiver<SpaceState>,
    #[debug("watch::Receiver")]
    auth: watch::Receiver<Arc<AuthState>>,
    #[debug("broadcast::Sender")]
    events: broadcast::Sender<ChainEvent>,
    topology: PeerTopology,
    replication: ReplicationScheduler<D>,
    #[debug("AbortOnDropHandle")]
    _task: Arc<AbortOnDropHandle<()>>,
}

impl<D> Clone for Space<D> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata,
            tx: self.tx.clone(),
            state: self.state.clone(),
            auth: self.auth.clone(),
            events: self.events.clone(),
            topology: self.topology.clone(),
            replication: self.replication.clone(),
            _task: self._task.clone(),
        }
    }
}

impl<D: Document + Default> Space<D> {
    /// The space key.
    pub fn key(&self) -> SpaceKey {
        self.metadata.space_key
    }

    /// The topic the space replicates under.
    pub fn topic(&self) -> TopicId {
        TopicId::from(self.metadata.space_key)
    }

    /// The persisted metadata of this space.
    pub fn metadata(&self) -> &SpaceMetadata {
        &self.metadata
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SpaceState {
        *self.state.borrow()
    }

    /// Watch the lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<SpaceState> {
        self.state.clone()
    }

    /// Wait until the local feeds are admitted.
    pub async fn wait_ready(&self) -> Result<(), SpaceError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|state| *state != SpaceState::PendingAdmission)
            .await
            .map(|state| *state)
            .unwrap_or(SpaceState::Closed);
        match reached {
            SpaceState::Ready => Ok(()),
            SpaceState::Failed => Err(SpaceFailedSnafu {
                space_key: self.key(),
            }
            .build()),
            _ => Err(self.closed()),
        }
    }

    /// The current authorization state.
    pub fn auth(&self) -> Arc<AuthState> {
        self.auth.borrow().clone()
    }

    /// Watch the authorization state.
    pub fn watch_auth(&self) -> watch::Receiver<Arc<AuthState>> {
        self.auth.clone()
    }

    /// Whether `key` is an authorized writer or an admitted feed of this space.
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.auth.borrow().is_authorized(key)
    }

    /// Subscribe to credentials as they are applied.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Admit a feed, signed by the local identity.
    pub async fn admit_feed(
        &self,
        feed_key: FeedKey,
        designation: FeedDesignation,
    ) -> Result<Credential, SpaceError> {
        self.request(|reply| ToSpace::AdmitFeed {
            feed_key,
            designation,
            reply,
        })
        .await
    }

    /// Admit a member and its device, signed by the local identity.
    pub async fn admit_member(
        &self,
        identity_key: IdentityKey,
        device_key: DeviceKey,
    ) -> Result<Credential, SpaceError> {
        self.request(|reply| ToSpace::AdmitMember {
            identity_key,
            device_key,
            reply,
        })
        .await
    }

    /// Fold credentials observed on the remote feed `source`, in log order.
    ///
    /// Credentials whose issuer is not known yet are kept until it is. Returns the
    /// credentials that were applied by this call.
    pub async fn receive_credentials(
        &self,
        source: FeedKey,
        credentials: Vec<Credential>,
    ) -> Result<Vec<Credential>, SpaceError> {
        self.request(|reply| ToSpace::Receive {
            source,
            credentials,
            notarize: false,
            reply,
        })
        .await
    }

    /// All applied credentials, in fold order.
    pub async fn credentials(&self) -> Result<Vec<Credential>, SpaceError> {
        self.request(|reply| ToSpace::Credentials { reply }).await
    }

    /// The replication scheduler of this space's documents.
    pub fn replication(&self) -> &ReplicationScheduler<D> {
        &self.replication
    }

    /// Open a document, creating an empty one if it is not tracked yet.
    pub async fn doc(&self, doc_id: impl Into<DocId>) -> Result<DocHandle<D>, SpaceError> {
        let doc = self.replication.track(doc_id, D::default()).await?;
        Ok(doc)
    }

    /// Start replicating with the device `peer` of member `owner`.
    pub async fn add_peer(&self, peer: DeviceKey, owner: IdentityKey) -> Result<(), SpaceError> {
        self.topology.add_peer(self.topic(), peer, owner);
        self.replication.add_peer(peer).await?;
        Ok(())
    }

    /// Stop replicating with `peer`.
    pub async fn remove_peer(&self, peer: DeviceKey) -> Result<bool, SpaceError> {
        self.topology.remove_peer(self.topic(), peer);
        let removed = self.replication.remove_peer(peer).await?;
        Ok(removed)
    }

    /// Merge a mutation batch received from the device `from`.
    pub async fn receive_batch(&self, from: DeviceKey, batch: MutationBatch) -> Result<usize, SpaceError> {
        let applied = self.replication.receive(from, batch).await?;
        Ok(applied)
    }

    /// Admit an invited member with its control and data feeds.
    ///
    /// Returns every credential of the space, for the guest to fold.
    pub(crate) async fn admit_guest(
        &self,
        identity_key: IdentityKey,
        device_key: DeviceKey,
        control_feed: FeedKey,
        data_feed: FeedKey,
    ) -> Result<Vec<Credential>, SpaceError> {
        self.request(|reply| ToSpace::AdmitGuest {
            identity_key,
            device_key,
            control_feed,
            data_feed,
            reply,
        })
        .await
    }

    /// Fold credentials handed over by the admitting peer and record them in the local
    /// control feed, so the admission survives a restart.
    pub(crate) async fn notarize(
        &self,
        source: FeedKey,
        credentials: Vec<Credential>,
    ) -> Result<Vec<Credential>, SpaceError> {
        self.request(|reply| ToSpace::Receive {
            source,
            credentials,
            notarize: true,
            reply,
        })
        .await
    }

    async fn shutdown(&self) {
        if let Err(err) = self.replication.shutdown().await {
            debug!("replication already stopped: {err}");
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ToSpace::Close { reply }).await.is_ok() {
            rx.await.ok();
        }
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<Result<T, SpaceError>>) -> ToSpace,
    ) -> Result<T, SpaceError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(msg(reply)).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> SpaceError {
        SpaceClosedSnafu {
            space_key: self.key(),
        }
        .build()
    }
}

/// The feeds a space actor holds open.
#[derive(Debug)]
struct SpaceFeeds {
    control: Arc<dyn SignedLog>,
    data: Arc<dyn SignedLog>,
    genesis: Option<Arc<dyn SignedLog>>,
}

#[derive(Debug)]
struct SpaceActor {
    metadata: SpaceMetadata,
    identity: Arc<Identity>,
    chain: CredentialChain,
    intake: Intake,
    feeds: SpaceFeeds,
    state: watch::Sender<SpaceState>,
    metrics: Arc<Metrics>,
    inbox: mpsc::Receiver<ToSpace>,
}

impl SpaceActor {
    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            trace!(%msg, "tick: inbox");
            match msg {
                ToSpace::AdmitFeed {
                    feed_key,
                    designation,
                    reply,
                } => {
                    let res = self.admit_feed(feed_key, designation).await;
                    reply.send(res).ok();
                }
                ToSpace::AdmitMember {
                    identity_key,
                    device_key,
                    reply,
                } => {
                    let res = self.admit_member(identity_key, device_key).await;
                    reply.send(res).ok();
                }
                ToSpace::AdmitGuest {
                    identity_key,
                    device_key,
                    control_feed,
                    data_feed,
                    reply,
                } => {
                    let res = self
                        .admit_guest(identity_key, device_key, control_feed, data_feed)
                        .await;
                    reply.send(res).ok();
                }
                ToSpace::Receive {
                    source,
                    credentials,
                    notarize,
                    reply,
                } => {
                    let res = self.receive(source, credentials, notarize).await;
                    reply.send(res).ok();
                }
                ToSpace::Credentials { reply } => {
                    reply.send(Ok(self.chain.credentials().to_vec())).ok();
                }
                ToSpace::Close { reply } => {
                    self.close().await;
                    reply.send(()).ok();
                    return;
                }
            }
        }
        debug!("all handles dropped, close");
        self.close().await;
    }

    fn space_key(&self) -> SpaceKey {
        self.metadata.space_key
    }

    fn ensure_usable(&self) -> Result<(), SpaceError> {
        ensure!(
            *self.state.borrow() != SpaceState::Failed,
            SpaceFailedSnafu {
                space_key: self.space_key()
            }
        );
        Ok(())
    }

    async fn admit_feed(
        &mut self,
        feed_key: FeedKey,
        designation: FeedDesignation,
    ) -> Result<Credential, SpaceError> {
        self.ensure_usable()?;
        let credential = self
            .chain
            .admit_feed(feed_key, designation, self.identity.signer())
            .await?;
        self.update_state();
        Ok(credential)
    }

    async fn admit_member(
        &mut self,
        identity_key: IdentityKey,
        device_key: DeviceKey,
    ) -> Result<Credential, SpaceError> {
        self.ensure_usable()?;
        let credential = self
            .chain
            .admit_member(identity_key, device_key, self.identity.signer())
            .await?;
        Ok(credential)
    }

    async fn admit_guest(
        &mut self,
        identity_key: IdentityKey,
        device_key: DeviceKey,
        control_feed: FeedKey,
        data_feed: FeedKey,
    ) -> Result<Vec<Credential>, SpaceError> {
        self.ensure_usable()?;
        let signer = self.identity.signer();
        self.chain
            .admit_member(identity_key, device_key, signer)
            .await?;
        self.chain
            .admit_feed(control_feed, FeedDesignation::Control, signer)
            .await?;
        self.chain
            .admit_feed(data_feed, FeedDesignation::Data, signer)
            .await?;
        info!(
            identity = %identity_key.fmt_short(),
            device = %device_key.fmt_short(),
            "admitted guest"
        );
        Ok(self.chain.credentials().to_vec())
    }

    async fn receive(
        &mut self,
        source: FeedKey,
        credentials: Vec<Credential>,
        notarize: bool,
    ) -> Result<Vec<Credential>, SpaceError> {
        self.ensure_usable()?;
        self.intake.push(source, credentials);
        let applied = self
            .intake
            .process(&mut self.chain)
            .context(IntegritySnafu {
                space_key: self.space_key(),
            });
        let applied = match applied {
            Ok(applied) => applied,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        if notarize {
            for credential in &applied {
                self.chain
                    .log()
                    .append(Bytes::from(credential.to_bytes()))
                    .await?;
            }
        }
        if !self.intake.is_empty() {
            debug!(pending = self.intake.pending(), "credentials waiting for their issuer");
        }
        self.update_state();
        Ok(applied)
    }

    fn update_state(&mut self) {
        let ready = is_admitted(&self.chain.snapshot(), &self.metadata);
        let changed = self.state.send_if_modified(|state| {
            if *state == SpaceState::PendingAdmission && ready {
                *state = SpaceState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            info!("local feeds admitted, space ready");
        }
    }

    fn fail(&mut self, err: &SpaceError) {
        error!("marking space as failed: {err}");
        self.metrics.spaces_failed.inc();
        self.state.send_replace(SpaceState::Failed);
    }

    async fn close(&mut self) {
        self.feeds.control.close().await;
        self.feeds.data.close().await;
        if let Some(genesis) = &self.feeds.genesis {
            genesis.close().await;
        }
        self.state.send_replace(SpaceState::Closed);
        debug!("space closed");
    }
}

fn is_admitted(auth: &AuthState, metadata: &SpaceMetadata) -> bool {
    auth.is_feed_admitted(&metadata.control_feed) && auth.is_feed_admitted(&metadata.data_feed)
}

/// Builder for a [`SpaceManager`].
#[derive(Debug)]
pub struct Builder<D> {
    identity: Identity,
    dispatcher: Arc<dyn BatchDispatcher>,
    feeds: Option<Arc<dyn FeedStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    topology: Option<PeerTopology>,
    config: Config,
    metrics: Arc<Metrics>,
    _doc: PhantomData<D>,
}

impl<D: Document + Default> Builder<D> {
    /// Store feeds in `feeds`. Defaults to a [`MemFeedStore`].
    pub fn feeds(mut self, feeds: Arc<dyn FeedStore>) -> Self {
        self.feeds = Some(feeds);
        self
    }

    /// Persist space metadata in `metadata`. Defaults to a [`MemMetadataStore`].
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Register space peers in `topology`.
    pub fn topology(mut self, topology: PeerTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Count into `metrics`.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Create the manager. No space is opened yet, see [`SpaceManager::open_all`].
    pub fn build(self) -> SpaceManager<D> {
        let topology = self
            .topology
            .unwrap_or_else(|| PeerTopology::new(self.identity.identity_key()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        SpaceManager {
            inner: Arc::new(Inner {
                identity: Arc::new(self.identity),
                dispatcher: self.dispatcher,
                feeds: self
                    .feeds
                    .unwrap_or_else(|| Arc::new(MemFeedStore::new())),
                metadata: self
                    .metadata
                    .unwrap_or_else(|| Arc::new(MemMetadataStore::new())),
                topology,
                config: self.config,
                metrics: self.metrics,
                spaces: Default::default(),
                locks: Default::default(),
                events,
            }),
        }
    }
}

#[derive(derive_more::Debug)]
struct Inner<D> {
    identity: Arc<Identity>,
    dispatcher: Arc<dyn BatchDispatcher>,
    feeds: Arc<dyn FeedStore>,
    metadata: Arc<dyn MetadataStore>,
    topology: PeerTopology,
    config: Config,
    metrics: Arc<Metrics>,
    #[debug("Mutex<BTreeMap<SpaceKey, Space>>")]
    spaces: Mutex<BTreeMap<SpaceKey, Space<D>>>,
    #[debug(skip)]
    locks: Mutex<BTreeMap<SpaceKey, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<SpaceEvent>,
}

/// Creates, opens and closes the spaces of one node.
///
/// The manager is an owned registry: each instance has its own index of open spaces.
/// Lifecycle operations on the same space key are serialized.
#[derive(derive_more::Debug)]
pub struct SpaceManager<D = MapDocument> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for SpaceManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Document + Default> SpaceManager<D> {
    /// Start configuring a manager for `identity` that sends document mutations
    /// through `dispatcher`.
    pub fn builder(identity: Identity, dispatcher: Arc<dyn BatchDispatcher>) -> Builder<D> {
        Builder {
            identity,
            dispatcher,
            feeds: None,
            metadata: None,
            topology: None,
            config: Default::default(),
            metrics: Default::default(),
            _doc: PhantomData,
        }
    }

    /// The local identity key.
    pub fn identity_key(&self) -> IdentityKey {
        self.inner.identity.identity_key()
    }

    /// The local device key.
    pub fn device_key(&self) -> DeviceKey {
        self.inner.identity.device_key()
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// The peer topology spaces register in.
    pub fn topology(&self) -> &PeerTopology {
        &self.inner.topology
    }

    /// Subscribe to changes of the open-space index.
    pub fn subscribe(&self) -> broadcast::Receiver<SpaceEvent> {
        self.inner.events.subscribe()
    }

    /// Create a new space with this node's identity as its first member.
    ///
    /// Mints the space key, opens a control and a data feed, writes the genesis, the
    /// data feed admission and the member admission, and persists the metadata. The
    /// space secret key is dropped afterwards; later credentials are signed by the
    /// member identity.
    pub async fn create_space(&self) -> Result<Space<D>, SpaceError> {
        let space_secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let space_key = space_secret.public();
        let lock = self.key_lock(space_key);
        let _guard = lock.lock().await;

        let control = self.inner.feeds.create().await?;
        let data = self.inner.feeds.create().await?;
        let mut chain = CredentialChain::new(space_key, control.clone())
            .with_metrics(self.inner.metrics.clone());
        chain.append_genesis(control.key(), &space_secret).await?;
        chain
            .admit_feed(data.key(), FeedDesignation::Data, &space_secret)
            .await?;
        let identity = &self.inner.identity;
        chain
            .admit_member(identity.identity_key(), identity.device_key(), &space_secret)
            .await?;
        drop(space_secret);

        let metadata = SpaceMetadata {
            space_key,
            genesis_feed: control.key(),
            control_feed: control.key(),
            data_feed: data.key(),
        };
        self.inner.metadata.put(metadata).await?;
        let feeds = SpaceFeeds {
            control,
            data,
            genesis: None,
        };
        let space = self.start(metadata, chain, Intake::default(), feeds, SpaceState::Ready);
        self.inner.metrics.spaces_created.inc();
        info!(space = %space_key.fmt_short(), "created space");
        self.register(space.clone());
        Ok(space)
    }

    /// Open a space from persisted metadata without issuing credentials.
    ///
    /// The chain is rebuilt by replaying the genesis feed, if it is not the local
    /// control feed, and the local control feed. Returns the open space if it already
    /// is. A space whose credentials fail verification is opened in
    /// [`SpaceState::Failed`].
    pub async fn open_space(&self, metadata: SpaceMetadata) -> Result<Space<D>, SpaceError> {
        let space_key = metadata.space_key;
        let lock = self.key_lock(space_key);
        let _guard = lock.lock().await;
        if let Some(space) = self.get(space_key) {
            return Ok(space);
        }

        let feeds = self
            .open_feeds(&metadata)
            .await
            .context(CorruptMetadataSnafu { space_key })?;
        let mut chain = CredentialChain::new(space_key, feeds.control.clone())
            .with_metrics(self.inner.metrics.clone());
        let mut intake = Intake::default();
        if let Some(genesis) = &feeds.genesis {
            let credentials = read_credentials(genesis.as_ref())
                .await
                .context(CorruptMetadataSnafu { space_key })?;
            intake.push(genesis.key(), credentials);
        }
        let credentials = read_credentials(feeds.control.as_ref())
            .await
            .context(CorruptMetadataSnafu { space_key })?;
        intake.push(metadata.control_feed, credentials);

        let state = match intake.process(&mut chain) {
            Ok(applied) => {
                debug!(space = %space_key.fmt_short(), credentials = applied.len(), "replayed control feeds");
                if is_admitted(&chain.snapshot(), &metadata) {
                    SpaceState::Ready
                } else {
                    SpaceState::PendingAdmission
                }
            }
            Err(err) => {
                error!(space = %space_key.fmt_short(), "replay failed, marking space as failed: {err}");
                self.inner.metrics.spaces_failed.inc();
                SpaceState::Failed
            }
        };
        let space = self.start(metadata, chain, intake, feeds, state);
        self.inner.metrics.spaces_opened.inc();
        info!(space = %space_key.fmt_short(), %state, "opened space");
        self.register(space.clone());
        Ok(space)
    }

    /// Join a space after a successful invitation.
    ///
    /// Mints local control and data feeds and opens the space in
    /// [`SpaceState::PendingAdmission`] until credentials admitting both feeds have
    /// been folded. Returns the open space if it already is.
    pub async fn accept_space(
        &self,
        space_key: SpaceKey,
        genesis_feed: FeedKey,
    ) -> Result<Space<D>, SpaceError> {
        let lock = self.key_lock(space_key);
        let _guard = lock.lock().await;
        if let Some(space) = self.get(space_key) {
            return Ok(space);
        }

        let control = self.inner.feeds.create().await?;
        let data = self.inner.feeds.create().await?;
        let genesis = self.inner.feeds.replicate(genesis_feed).await?;
        let metadata = SpaceMetadata {
            space_key,
            genesis_feed,
            control_feed: control.key(),
            data_feed: data.key(),
        };
        self.inner.metadata.put(metadata).await?;
        let chain = CredentialChain::new(space_key, control.clone())
            .with_metrics(self.inner.metrics.clone());
        let feeds = SpaceFeeds {
            control,
            data,
            genesis: Some(genesis),
        };
        let space = self.start(
            metadata,
            chain,
            Intake::default(),
            feeds,
            SpaceState::PendingAdmission,
        );
        self.inner.metrics.spaces_accepted.inc();
        info!(space = %space_key.fmt_short(), "accepted space");
        self.register(space.clone());
        Ok(space)
    }

    /// Close a space: flush its documents, close its feeds and remove it from the index.
    ///
    /// Closing a space that is not open does nothing.
    pub async fn close_space(&self, space_key: SpaceKey) -> Result<(), SpaceError> {
        let lock = self.key_lock(space_key);
        {
            let _guard = lock.lock().await;
            self.close_locked(space_key).await;
        }
        self.release_lock(space_key, lock);
        Ok(())
    }

    /// Close a space and remove its metadata. Returns false if no metadata existed.
    pub async fn delete_space(&self, space_key: SpaceKey) -> Result<bool, SpaceError> {
        let lock = self.key_lock(space_key);
        let existed = {
            let _guard = lock.lock().await;
            self.close_locked(space_key).await;
            self.inner.metadata.delete(space_key).await
        };
        self.release_lock(space_key, lock);
        Ok(existed?)
    }

    /// Open every persisted space.
    ///
    /// Spaces that fail to open are logged and skipped, so one corrupt record does not
    /// keep the others closed.
    pub async fn open_all(&self) -> Result<Vec<Space<D>>, SpaceError> {
        let records = self.inner.metadata.list().await?;
        let mut spaces = Vec::with_capacity(records.len());
        for metadata in records {
            match self.open_space(metadata).await {
                Ok(space) => spaces.push(space),
                Err(err) => {
                    warn!(space = %metadata.space_key.fmt_short(), "failed to open space: {err}")
                }
            }
        }
        Ok(spaces)
    }

    /// The open space `space_key`.
    pub fn get(&self, space_key: SpaceKey) -> Option<Space<D>> {
        self.inner
            .spaces
            .lock()
            .expect("poisoned")
            .get(&space_key)
            .cloned()
    }

    /// All open spaces.
    pub fn spaces(&self) -> Vec<Space<D>> {
        self.inner
            .spaces
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn key_lock(&self, space_key: SpaceKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .lock()
            .expect("poisoned")
            .entry(space_key)
            .or_default()
            .clone()
    }

    /// Drop the lock of a closed space unless another operation holds it.
    fn release_lock(&self, space_key: SpaceKey, lock: Arc<tokio::sync::Mutex<()>>) {
        if self.get(space_key).is_some() {
            return;
        }
        let mut locks = self.inner.locks.lock().expect("poisoned");
        // one reference in the map and ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&space_key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.inner.locks.lock().expect("poisoned").len()
    }

    async fn open_feeds(&self, metadata: &SpaceMetadata) -> Result<SpaceFeeds, ChainError> {
        let control = self.inner.feeds.open(metadata.control_feed).await?;
        let data = self.inner.feeds.open(metadata.data_feed).await?;
        let genesis = if metadata.is_genesis() {
            None
        } else {
            Some(self.inner.feeds.replicate(metadata.genesis_feed).await?)
        };
        Ok(SpaceFeeds {
            control,
            data,
            genesis,
        })
    }

    fn start(
        &self,
        metadata: SpaceMetadata,
        chain: CredentialChain,
        intake: Intake,
        feeds: SpaceFeeds,
        state: SpaceState,
    ) -> Space<D> {
        let space_key = metadata.space_key;
        let (state_tx, state_rx) = watch::channel(state);
        let auth = chain.watch();
        let events = chain.event_sender();
        let replication = ReplicationScheduler::<D>::builder(self.inner.dispatcher.clone())
            .config(self.inner.config.replication.clone())
            .metrics(self.inner.metrics.clone())
            .gate(chain.watch())
            .data_feed(feeds.data.clone())
            .topic(TopicId::from(space_key))
            .name(space_key.fmt_short())
            .spawn();
        let (tx, inbox) = mpsc::channel(INBOX_CAP);
        let actor = SpaceActor {
            metadata,
            identity: self.inner.identity.clone(),
            chain,
            intake,
            feeds,
            state: state_tx,
            metrics: self.inner.metrics.clone(),
            inbox,
        };
        let task = task::spawn(
            actor
                .run()
                .instrument(error_span!("space", key = %space_key.fmt_short())),
        );
        Space {
            metadata,
            tx,
            state: state_rx,
            auth,
            events,
            topology: self.inner.topology.clone(),
            replication,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        }
    }

    fn register(&self, space: Space<D>) {
        let space_key = space.key();
        let state = space.state();
        self.inner.topology.add_peer(
            space.topic(),
            self.inner.identity.device_key(),
            self.inner.identity.identity_key(),
        );
        self.inner
            .spaces
            .lock()
            .expect("poisoned")
            .insert(space_key, space);
        self.inner
            .events
            .send(SpaceEvent::Opened { space_key, state })
            .ok();
    }

    async fn close_locked(&self, space_key: SpaceKey) {
        let removed = self
            .inner
            .spaces
            .lock()
            .expect("poisoned")
            .remove(&space_key);
        let Some(space) = removed else {
            return;
        };
        let topic = space.topic();
        for peer in self.inner.topology.peers_for_topic(topic) {
            self.inner.topology.remove_peer(topic, peer.peer_id);
        }
        space.shutdown().await;
        info!(space = %space_key.fmt_short(), "closed space");
        self.inner
            .events
            .send(SpaceEvent::Closed { space_key })
            .ok();
    }
}
