//! The authorization state of one space.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use nested_enum_utils::common_fields;
use plexus_base::{DeviceKey, FeedKey, IdentityKey, PublicKey, SecretKey, SpaceKey};
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use super::{Assertion, Credential, FeedDesignation};
use crate::{
    feed::{FeedError, SignedLog},
    metrics::Metrics,
};

const EVENT_CHANNEL_CAP: usize = 256;

/// Reasons a credential does not fold into a chain.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RejectedCredential {
    #[snafu(display("signature of {} does not verify", issuer.fmt_short()))]
    InvalidSignature { issuer: PublicKey },
    #[snafu(display(
        "credential for space {} applied to space {}",
        actual.fmt_short(),
        expected.fmt_short()
    ))]
    SpaceMismatch {
        expected: SpaceKey,
        actual: SpaceKey,
    },
    #[snafu(display("space has no genesis credential yet"))]
    MissingGenesis {},
    #[snafu(display("{} is not an authorized issuer", issuer.fmt_short()))]
    Unauthorized { issuer: PublicKey },
    #[snafu(display("space already has a genesis credential"))]
    AlreadyInitialized {},
}

impl RejectedCredential {
    /// Whether the credential may fold once another credential has been applied.
    ///
    /// This is the case when its issuer, or the genesis, is not known yet.
    pub fn is_missing_prerequisite(&self) -> bool {
        matches!(
            self,
            RejectedCredential::MissingGenesis { .. } | RejectedCredential::Unauthorized { .. }
        )
    }
}

/// Errors of [`CredentialChain`] write operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ChainError {
    #[snafu(transparent)]
    Rejected { source: RejectedCredential },
    #[snafu(transparent)]
    Feed { source: FeedError },
    #[snafu(display("control record {seq} is not a credential"))]
    Decode { seq: u64, source: postcard::Error },
}

/// Outcome of a successful [`CredentialChain::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The credential changed the fold.
    New,
    /// The credential had been applied before.
    Duplicate,
}

/// An admitted feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedInfo {
    /// What the feed carries.
    pub designation: FeedDesignation,
    /// Who admitted the feed.
    pub issuer: PublicKey,
}

/// Snapshot of the fold over a space's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    space_key: SpaceKey,
    genesis_feed: Option<FeedKey>,
    writers: BTreeSet<PublicKey>,
    feeds: BTreeMap<FeedKey, FeedInfo>,
    members: BTreeMap<IdentityKey, BTreeSet<DeviceKey>>,
    applied: u64,
}

impl AuthState {
    fn new(space_key: SpaceKey) -> Self {
        Self {
            space_key,
            genesis_feed: None,
            writers: Default::default(),
            feeds: Default::default(),
            members: Default::default(),
            applied: 0,
        }
    }

    /// The space.
    pub fn space_key(&self) -> SpaceKey {
        self.space_key
    }

    /// The genesis feed, once the genesis credential was applied.
    pub fn genesis_feed(&self) -> Option<FeedKey> {
        self.genesis_feed
    }

    /// Keys that may issue credentials: the space key and every admitted identity.
    pub fn writers(&self) -> &BTreeSet<PublicKey> {
        &self.writers
    }

    /// Admitted feeds.
    pub fn feeds(&self) -> &BTreeMap<FeedKey, FeedInfo> {
        &self.feeds
    }

    /// Admitted members and their devices.
    pub fn members(&self) -> &BTreeMap<IdentityKey, BTreeSet<DeviceKey>> {
        &self.members
    }

    /// Number of credentials in the fold.
    pub fn len(&self) -> u64 {
        self.applied
    }

    /// Whether no credential has been applied.
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }

    /// Whether `key` is an authorized writer or an admitted feed.
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.writers.contains(key) || self.feeds.contains_key(key)
    }

    /// Whether `key` may issue credentials.
    pub fn is_writer(&self, key: &PublicKey) -> bool {
        self.writers.contains(key)
    }

    /// Whether `key` is an admitted feed.
    pub fn is_feed_admitted(&self, key: &FeedKey) -> bool {
        self.feeds.contains_key(key)
    }

    /// Whether `device` belongs to an admitted member.
    pub fn is_device_admitted(&self, device: &DeviceKey) -> bool {
        self.members.values().any(|devices| devices.contains(device))
    }

    fn check(&self, credential: &Credential) -> Result<(), RejectedCredential> {
        let issuer = credential.issuer();
        ensure!(credential.verify(), InvalidSignatureSnafu { issuer });
        let actual = credential.space_key();
        ensure!(
            actual == self.space_key,
            SpaceMismatchSnafu {
                expected: self.space_key,
                actual
            }
        );
        match credential.assertion() {
            Assertion::SpaceGenesis { .. } => {
                ensure!(self.genesis_feed.is_none(), AlreadyInitializedSnafu);
                // the first genesis credential is self-authorizing
                ensure!(issuer == self.space_key, UnauthorizedSnafu { issuer });
            }
            _ => {
                ensure!(self.genesis_feed.is_some(), MissingGenesisSnafu);
                ensure!(self.writers.contains(&issuer), UnauthorizedSnafu { issuer });
            }
        }
        Ok(())
    }

    fn fold(&mut self, credential: &Credential) {
        match credential.assertion() {
            Assertion::SpaceGenesis {
                space_key,
                control_feed,
            } => {
                self.genesis_feed = Some(*control_feed);
                self.writers.insert(*space_key);
            }
            Assertion::FeedAdmission {
                feed_key,
                designation,
                ..
            } => {
                self.feeds.insert(
                    *feed_key,
                    FeedInfo {
                        designation: *designation,
                        issuer: credential.issuer(),
                    },
                );
            }
            Assertion::MemberAdmission {
                identity_key,
                device_key,
                ..
            } => {
                self.writers.insert(*identity_key);
                self.members
                    .entry(*identity_key)
                    .or_default()
                    .insert(*device_key);
            }
        }
        self.applied += 1;
    }
}

/// Events emitted by a [`CredentialChain`], in fold order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainEvent {
    /// A credential was folded into the chain.
    CredentialApplied {
        /// Position of the credential in the fold.
        position: u64,
        /// The credential.
        credential: Credential,
    },
}

/// Accepts and issues the credentials of one space.
///
/// The chain is owned by the space's actor, which serializes every mutation. Readers
/// observe the fold through [`Self::watch`] or [`Self::snapshot`] without blocking it.
#[derive(Debug)]
pub struct CredentialChain {
    space_key: SpaceKey,
    log: Arc<dyn SignedLog>,
    state: watch::Sender<Arc<AuthState>>,
    events: broadcast::Sender<ChainEvent>,
    seen: HashSet<[u8; 64]>,
    credentials: Vec<Credential>,
    metrics: Arc<Metrics>,
}

impl CredentialChain {
    /// Create an empty chain for `space_key` that writes its credentials to `log`.
    pub fn new(space_key: SpaceKey, log: Arc<dyn SignedLog>) -> Self {
        let (state, _) = watch::channel(Arc::new(AuthState::new(space_key)));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            space_key,
            log,
            state,
            events,
            seen: Default::default(),
            credentials: Default::default(),
            metrics: Default::default(),
        }
    }

    /// Count applied and rejected credentials in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The space of this chain.
    pub fn space_key(&self) -> SpaceKey {
        self.space_key
    }

    /// The control log this chain writes to.
    pub fn log(&self) -> &Arc<dyn SignedLog> {
        &self.log
    }

    /// Issue the genesis credential and the admission of the genesis control feed.
    ///
    /// `signer` must be the space's secret key.
    pub async fn append_genesis(
        &mut self,
        control_feed: FeedKey,
        signer: &SecretKey,
    ) -> Result<Vec<Credential>, ChainError> {
        ensure!(
            self.state.borrow().genesis_feed().is_none(),
            AlreadyInitializedSnafu
        );
        let genesis = Credential::sign(
            Assertion::SpaceGenesis {
                space_key: self.space_key,
                control_feed,
            },
            signer,
        );
        self.write(genesis.clone()).await?;
        let admission = Credential::sign(
            Assertion::FeedAdmission {
                space_key: self.space_key,
                feed_key: control_feed,
                designation: FeedDesignation::Control,
            },
            signer,
        );
        self.write(admission.clone()).await?;
        Ok(vec![genesis, admission])
    }

    /// Admit `feed_key`. `signer` must be an authorized writer.
    pub async fn admit_feed(
        &mut self,
        feed_key: FeedKey,
        designation: FeedDesignation,
        signer: &SecretKey,
    ) -> Result<Credential, ChainError> {
        let credential = Credential::sign(
            Assertion::FeedAdmission {
                space_key: self.space_key,
                feed_key,
                designation,
            },
            signer,
        );
        self.write(credential.clone()).await?;
        Ok(credential)
    }

    /// Admit a member identity and its device. `signer` must be an authorized writer.
    pub async fn admit_member(
        &mut self,
        identity_key: IdentityKey,
        device_key: DeviceKey,
        signer: &SecretKey,
    ) -> Result<Credential, ChainError> {
        let credential = Credential::sign(
            Assertion::MemberAdmission {
                space_key: self.space_key,
                identity_key,
                device_key,
            },
            signer,
        );
        self.write(credential.clone()).await?;
        Ok(credential)
    }

    /// Fold a credential written elsewhere into the chain.
    ///
    /// Credentials whose issuer is not authorized at this point of the fold are rejected,
    /// never deferred. Callers that receive credentials from several feeds buffer them
    /// in an [`Intake`].
    pub fn apply(&mut self, credential: Credential) -> Result<Applied, RejectedCredential> {
        if self.seen.contains(&credential.signature().to_bytes()) {
            return Ok(Applied::Duplicate);
        }
        if let Err(err) = self.state.borrow().check(&credential) {
            self.metrics.credentials_rejected.inc();
            trace!(kind = credential.assertion().kind(), "rejected credential: {err}");
            return Err(err);
        }
        self.fold(credential);
        Ok(Applied::New)
    }

    /// Fold a credential and record it in the local control log.
    ///
    /// Used to keep credentials received from another peer so the chain can be rebuilt
    /// from local feeds alone.
    pub async fn notarize(&mut self, credential: Credential) -> Result<Applied, ChainError> {
        let applied = self.apply(credential.clone())?;
        if applied == Applied::New {
            self.log.append(Bytes::from(credential.to_bytes())).await?;
        }
        Ok(applied)
    }

    /// Whether `key` is an authorized writer or an admitted feed.
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.state.borrow().is_authorized(key)
    }

    /// The current fold.
    pub fn snapshot(&self) -> Arc<AuthState> {
        self.state.borrow().clone()
    }

    /// Watch the fold.
    pub fn watch(&self) -> watch::Receiver<Arc<AuthState>> {
        self.state.subscribe()
    }

    /// Subscribe to credential events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ChainEvent> {
        self.events.clone()
    }

    /// All applied credentials, in fold order.
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Check, persist and fold a locally issued credential.
    ///
    /// An identical credential that was applied before is checked against the current
    /// fold like any other and then not written again.
    async fn write(&mut self, credential: Credential) -> Result<Applied, ChainError> {
        self.state.borrow().check(&credential)?;
        if self.seen.contains(&credential.signature().to_bytes()) {
            trace!(kind = credential.assertion().kind(), "credential already applied");
            return Ok(Applied::Duplicate);
        }
        self.log.append(Bytes::from(credential.to_bytes())).await?;
        self.fold(credential);
        Ok(Applied::New)
    }

    fn fold(&mut self, credential: Credential) {
        let mut state = AuthState::clone(&self.state.borrow());
        state.fold(&credential);
        let position = state.applied - 1;
        self.state.send_replace(Arc::new(state));
        self.seen.insert(credential.signature().to_bytes());
        self.credentials.push(credential.clone());
        self.metrics.credentials_applied.inc();
        debug!(
            space = %self.space_key.fmt_short(),
            kind = credential.assertion().kind(),
            issuer = %credential.issuer().fmt_short(),
            position,
            "credential applied"
        );
        self.events
            .send(ChainEvent::CredentialApplied {
                position,
                credential,
            })
            .ok();
    }
}

/// Read every credential of a control log.
pub async fn read_credentials(log: &dyn SignedLog) -> Result<Vec<Credential>, ChainError> {
    let records = log.read_range(0..log.len()).await?;
    records
        .into_iter()
        .map(|record| Credential::from_bytes(&record.data).context(DecodeSnafu { seq: record.seq }))
        .collect()
}

/// Buffers credentials observed on several feeds until they fold.
///
/// Each source feed is a queue applied in order. A credential that is missing its
/// issuer or the genesis stalls its queue; stalled queues are retried whenever any
/// other credential folds. Other rejections are integrity failures and are returned.
#[derive(Debug, Default)]
pub struct Intake {
    queues: BTreeMap<FeedKey, VecDeque<Credential>>,
}

impl Intake {
    /// Queue credentials observed on `source`, in log order.
    pub fn push(&mut self, source: FeedKey, credentials: impl IntoIterator<Item = Credential>) {
        self.queues.entry(source).or_default().extend(credentials);
    }

    /// Number of credentials waiting for a prerequisite.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Fold everything that can fold, returning the credentials that were new.
    pub fn process(
        &mut self,
        chain: &mut CredentialChain,
    ) -> Result<Vec<Credential>, RejectedCredential> {
        let mut applied = Vec::new();
        loop {
            let mut progress = false;
            for (source, queue) in self.queues.iter_mut() {
                while let Some(credential) = queue.front() {
                    match chain.apply(credential.clone()) {
                        Ok(outcome) => {
                            if let Some(credential) = queue.pop_front() {
                                if outcome == Applied::New {
                                    progress = true;
                                    applied.push(credential);
                                }
                            }
                        }
                        Err(err) if err.is_missing_prerequisite() => {
                            trace!(source = %source.fmt_short(), "feed stalled: {err}");
                            break;
                        }
                        Err(err) => {
                            queue.clear();
                            return Err(err);
                        }
                    }
                }
            }
            self.queues.retain(|_, queue| !queue.is_empty());
            if !progress {
                break;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::feed::{FeedStore, MemFeedStore};

    struct Fixture {
        space: SecretKey,
        control: Arc<dyn SignedLog>,
        chain: CredentialChain,
        rng: ChaCha8Rng,
    }

    async fn fixture() -> Result<Fixture> {
        let mut rng = ChaCha8Rng::seed_from_u64(11u64);
        let space = SecretKey::generate(&mut rng);
        let store = MemFeedStore::new();
        let control = store.create().await?;
        let chain = CredentialChain::new(space.public(), control.clone());
        Ok(Fixture {
            space,
            control,
            chain,
            rng,
        })
    }

    #[tokio::test]
    async fn genesis_and_unauthorized_admission() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        let credentials = chain.append_genesis(control.key(), &space).await?;
        assert_eq!(credentials.len(), 2);
        let data_feed = SecretKey::generate(&mut rng).public();
        chain
            .admit_feed(data_feed, FeedDesignation::Data, &space)
            .await?;
        assert!(chain.is_authorized(&data_feed));
        assert_eq!(control.len(), 3);

        let stranger = SecretKey::generate(&mut rng);
        let other_feed = SecretKey::generate(&mut rng).public();
        let before = chain.snapshot();
        let err = chain
            .admit_feed(other_feed, FeedDesignation::Data, &stranger)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected {
                source: RejectedCredential::Unauthorized { .. },
                ..
            }
        ));
        assert!(!chain.is_authorized(&other_feed));
        assert_eq!(chain.snapshot(), before);
        // nothing was written for the rejected credential
        assert_eq!(control.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn genesis_only_once() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        chain.append_genesis(control.key(), &space).await?;
        let before = chain.snapshot();
        // the same arguments sign byte-identical credentials
        let err = chain
            .append_genesis(control.key(), &space)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected {
                source: RejectedCredential::AlreadyInitialized { .. },
                ..
            }
        ));
        let other_feed = SecretKey::generate(&mut rng).public();
        let err = chain.append_genesis(other_feed, &space).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::Rejected {
                source: RejectedCredential::AlreadyInitialized { .. },
                ..
            }
        ));
        assert_eq!(chain.snapshot(), before);
        assert_eq!(control.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn reissued_admission_is_not_written_twice() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        chain.append_genesis(control.key(), &space).await?;
        let feed = SecretKey::generate(&mut rng).public();
        let first = chain
            .admit_feed(feed, FeedDesignation::Data, &space)
            .await?;
        let second = chain
            .admit_feed(feed, FeedDesignation::Data, &space)
            .await?;
        assert_eq!(first, second);
        assert_eq!(control.len(), 3);
        assert_eq!(chain.credentials().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn member_becomes_writer() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        chain.append_genesis(control.key(), &space).await?;
        let identity = SecretKey::generate(&mut rng);
        let device = SecretKey::generate(&mut rng).public();
        chain
            .admit_member(identity.public(), device, &space)
            .await?;
        let feed = SecretKey::generate(&mut rng).public();
        chain
            .admit_feed(feed, FeedDesignation::Data, &identity)
            .await?;

        let state = chain.snapshot();
        assert!(state.is_writer(&identity.public()));
        assert!(state.is_device_admitted(&device));
        assert_eq!(state.feeds()[&feed].issuer, identity.public());
        Ok(())
    }

    #[tokio::test]
    async fn out_of_order_is_rejected() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        let genesis = chain.append_genesis(control.key(), &space).await?;
        let identity = SecretKey::generate(&mut rng);
        let device = SecretKey::generate(&mut rng).public();
        let member = chain
            .admit_member(identity.public(), device, &space)
            .await?;
        let feed = SecretKey::generate(&mut rng).public();
        let by_member = chain
            .admit_feed(feed, FeedDesignation::Data, &identity)
            .await?;

        let store = MemFeedStore::new();
        let mut remote = CredentialChain::new(space.public(), store.create().await?);
        // before genesis
        let err = remote.apply(member.clone()).unwrap_err();
        assert!(matches!(err, RejectedCredential::MissingGenesis { .. }));
        for credential in genesis {
            remote.apply(credential)?;
        }
        // issuer not admitted yet
        let err = remote.apply(by_member.clone()).unwrap_err();
        assert!(matches!(err, RejectedCredential::Unauthorized { .. }));
        assert!(!remote.is_authorized(&feed));

        assert_eq!(remote.apply(member.clone())?, Applied::New);
        assert_eq!(remote.apply(by_member)?, Applied::New);
        assert_eq!(remote.apply(member)?, Applied::Duplicate);
        assert!(remote.is_authorized(&feed));
        Ok(())
    }

    #[tokio::test]
    async fn integrity_failures() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        chain.append_genesis(control.key(), &space).await?;
        let other_space = SecretKey::generate(&mut rng);
        let foreign = Credential::sign(
            Assertion::FeedAdmission {
                space_key: other_space.public(),
                feed_key: control.key(),
                designation: FeedDesignation::Data,
            },
            &other_space,
        );
        assert!(matches!(
            chain.apply(foreign).unwrap_err(),
            RejectedCredential::SpaceMismatch { .. }
        ));

        let mut bytes = postcard::to_stdvec(&Credential::sign(
            Assertion::FeedAdmission {
                space_key: space.public(),
                feed_key: SecretKey::generate(&mut rng).public(),
                designation: FeedDesignation::Data,
            },
            &space,
        ))
        .e()?;
        // flip a bit in the signature
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let tampered: Credential = postcard::from_bytes(&bytes).e()?;
        let err = chain.apply(tampered).unwrap_err();
        assert!(matches!(err, RejectedCredential::InvalidSignature { .. }));
        assert!(!err.is_missing_prerequisite());
        Ok(())
    }

    #[tokio::test]
    async fn events_and_watch() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        let mut events = chain.subscribe();
        let mut watch = chain.watch();
        chain.append_genesis(control.key(), &space).await?;
        let feed = SecretKey::generate(&mut rng).public();
        chain
            .admit_feed(feed, FeedDesignation::Data, &space)
            .await?;

        let mut positions = Vec::new();
        while let Ok(ChainEvent::CredentialApplied { position, .. }) = events.try_recv() {
            positions.push(position);
        }
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(watch.has_changed().e()?);
        assert_eq!(watch.borrow_and_update().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn intake_retries_stalled_feeds() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            mut rng,
        } = fixture().await?;
        let genesis = chain.append_genesis(control.key(), &space).await?;
        let identity = SecretKey::generate(&mut rng);
        let member = chain
            .admit_member(
                identity.public(),
                SecretKey::generate(&mut rng).public(),
                &space,
            )
            .await?;
        let feed = SecretKey::generate(&mut rng).public();
        let by_member = chain
            .admit_feed(feed, FeedDesignation::Data, &identity)
            .await?;

        let store = MemFeedStore::new();
        let mut remote = CredentialChain::new(space.public(), store.create().await?);
        let member_feed = SecretKey::generate(&mut rng).public();
        let mut intake = Intake::default();
        // the member's feed arrives before the genesis feed
        intake.push(member_feed, [by_member]);
        assert!(intake.process(&mut remote)?.is_empty());
        assert_eq!(intake.pending(), 1);

        let mut from_genesis = genesis;
        from_genesis.push(member);
        intake.push(control.key(), from_genesis);
        let applied = intake.process(&mut remote)?;
        assert_eq!(applied.len(), 4);
        assert!(intake.is_empty());
        assert!(remote.is_authorized(&feed));
        Ok(())
    }

    #[tokio::test]
    async fn notarize_and_replay() -> Result {
        let Fixture {
            space,
            control,
            mut chain,
            ..
        } = fixture().await?;
        chain.append_genesis(control.key(), &space).await?;

        let store = MemFeedStore::new();
        let own = store.create().await?;
        let mut guest = CredentialChain::new(space.public(), own.clone());
        for credential in chain.credentials().to_vec() {
            guest.notarize(credential).await?;
        }
        assert_eq!(own.len(), 2);

        let mut restored = CredentialChain::new(space.public(), own.clone());
        for credential in read_credentials(own.as_ref()).await? {
            restored.apply(credential)?;
        }
        assert_eq!(restored.snapshot(), guest.snapshot());
        Ok(())
    }
}
