//! Single-use invitations into a space.
//!
//! The host creates an invitation for a space and shares its [`InvitationTicket`] and
//! a [`SharedSecret`] out of band. The guest connects with the ticket and runs the
//! handshake:
//!
//! ```text
//! guest                              host
//!   Introduce ------------------------->   INIT -> CONNECTED
//!            <------------ Introduction
//!            <------------ RequestSecret   CONNECTED -> AUTHENTICATING
//!   Authenticate ---------------------->   secret checked
//!            <------------ Authenticated
//!   Admit ----------------------------->   member and feeds admitted
//!            <------------ Admitted        AUTHENTICATING -> SUCCESS
//! ```
//!
//! The first guest to introduce itself claims the invitation; every later session is
//! refused. A session that does not reach `Admit` before the deadline ends in
//! [`InvitationState::Timeout`]. Once the host started writing the admission it runs to
//! [`InvitationState::Success`] or [`InvitationState::Error`], and the guest waits up to
//! one more timeout period for the verdict. After success both sides replicate with
//! each other.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use n0_future::task::{self, AbortOnDropHandle, JoinSet};
use nested_enum_utils::common_fields;
use plexus_base::{DeviceKey, FeedKey, IdentityKey, InvitationId, InvitationTicket};
use snafu::{Backtrace, Snafu, ensure};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, error, error_span, info, info_span, warn};

use crate::{
    config::InvitationConfig,
    docs::{Document, MapDocument},
    metrics::Metrics,
    space::{Space, SpaceError, SpaceManager, SpaceState},
};

mod secret;
mod transport;

pub use self::{
    secret::{SECRET_DIGITS, SecretProvider, SecretValidator, SharedSecret},
    transport::{
        Channel, GuestChannel, GuestMessage, HostChannel, HostMessage, InvitationTransport,
        MemTransport, RejectReason, channel_pair,
    },
};

/// State of an invitation on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationState {
    /// Waiting for a guest.
    Init,
    /// A guest claimed the invitation.
    Connected,
    /// The guest was asked for the secret.
    Authenticating,
    /// The guest was admitted.
    Success,
    /// The secret did not match or the admission failed.
    Error,
    /// The deadline passed.
    Timeout,
    /// The host cancelled the invitation.
    Cancelled,
}

impl InvitationState {
    /// Whether the invitation has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Cancelled
        )
    }
}

/// Errors of invitations, on either side.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum InvitationError {
    #[snafu(display("the secret does not match"))]
    SecretMismatch {},
    #[snafu(display("the invitation expired"))]
    Timeout {},
    #[snafu(display("the invitation was cancelled"))]
    Cancelled {},
    #[snafu(display("the admission was rejected: {reason}"))]
    AdmissionRejected { reason: String },
    #[snafu(display("the invitation was already used"))]
    InvitationConsumed {},
    #[snafu(display("the space was closed"))]
    SpaceClosed {},
    #[snafu(display("space is {state}, cannot invite"))]
    NotReady { state: SpaceState },
    #[snafu(display("unknown invitation"))]
    UnknownInvitation {},
    #[snafu(display("unsupported handshake version {version}"))]
    UnsupportedVersion { version: u16 },
    #[snafu(display("unexpected message: {message}"))]
    Protocol { message: String },
    #[snafu(display("transport failed: {message}"))]
    Transport { message: String },
    #[snafu(transparent)]
    Space { source: SpaceError },
}

impl InvitationError {
    /// The reason to send to the guest, if the session can still carry one.
    fn reject_reason(&self) -> Option<RejectReason> {
        let reason = match self {
            Self::SecretMismatch { .. } => RejectReason::SecretMismatch,
            Self::Timeout { .. } => RejectReason::Timeout,
            Self::Cancelled { .. } => RejectReason::Cancelled,
            Self::AdmissionRejected { .. } | Self::NotReady { .. } | Self::Space { .. } => {
                RejectReason::AdmissionRejected
            }
            Self::InvitationConsumed { .. } => RejectReason::InvitationConsumed,
            Self::SpaceClosed { .. } => RejectReason::SpaceClosed,
            Self::UnknownInvitation { .. } => RejectReason::UnknownInvitation,
            Self::UnsupportedVersion { .. } => RejectReason::UnsupportedVersion,
            Self::Protocol { .. } => RejectReason::Protocol,
            Self::Transport { .. } => return None,
        };
        Some(reason)
    }

    /// The state a host session ends in after this error.
    fn end_state(&self) -> InvitationState {
        match self {
            Self::Timeout { .. } => InvitationState::Timeout,
            Self::Cancelled { .. } => InvitationState::Cancelled,
            _ => InvitationState::Error,
        }
    }

    /// The error for a session that already ended in `state`.
    fn ended(state: InvitationState) -> Self {
        match state {
            InvitationState::Timeout => TimeoutSnafu.build(),
            InvitationState::Cancelled => CancelledSnafu.build(),
            _ => InvitationConsumedSnafu.build(),
        }
    }
}

impl From<RejectReason> for InvitationError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::SecretMismatch => SecretMismatchSnafu.build(),
            RejectReason::InvitationConsumed => InvitationConsumedSnafu.build(),
            RejectReason::Timeout => TimeoutSnafu.build(),
            RejectReason::Cancelled => CancelledSnafu.build(),
            RejectReason::AdmissionRejected => AdmissionRejectedSnafu {
                reason: "refused by host",
            }
            .build(),
            RejectReason::SpaceClosed => SpaceClosedSnafu.build(),
            RejectReason::UnknownInvitation => UnknownInvitationSnafu.build(),
            RejectReason::UnsupportedVersion => UnsupportedVersionSnafu {
                version: InvitationTicket::PROTOCOL_VERSION,
            }
            .build(),
            RejectReason::Protocol => ProtocolSnafu {
                message: "host refused the handshake",
            }
            .build(),
        }
    }
}

/// Handle to an invitation created on the host.
///
/// Dropping every clone of the handle cancels the invitation.
#[derive(Debug, Clone)]
pub struct InvitationHandle {
    ticket: InvitationTicket,
    state: watch::Receiver<InvitationState>,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl InvitationHandle {
    /// The ticket to share with the guest.
    pub fn ticket(&self) -> &InvitationTicket {
        &self.ticket
    }

    /// The invitation id.
    pub fn id(&self) -> InvitationId {
        self.ticket.invitation_id()
    }

    /// The current state.
    pub fn state(&self) -> InvitationState {
        *self.state.borrow()
    }

    /// Watch the state.
    pub fn watch(&self) -> watch::Receiver<InvitationState> {
        self.state.clone()
    }

    /// Cancel the invitation. Has no effect once it ended.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the invitation to end.
    pub async fn wait(&self) -> InvitationState {
        let mut state = self.state.clone();
        let res = state.wait_for(InvitationState::is_terminal).await.map(|s| *s);
        res.unwrap_or_else(|_| *self.state.borrow())
    }
}

#[derive(derive_more::Debug)]
struct Session<D> {
    id: InvitationId,
    space: Space<D>,
    #[debug(skip)]
    validator: Box<dyn SecretValidator>,
    state: watch::Sender<InvitationState>,
    /// Set once the host started writing the admission.
    admitting: AtomicBool,
    cancel: CancellationToken,
    deadline: Instant,
}

impl<D> Session<D> {
    /// Claim the invitation for the first guest.
    fn claim(&self) -> Result<(), InvitationError> {
        let mut current = InvitationState::Init;
        let claimed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == InvitationState::Init {
                *state = InvitationState::Connected;
                true
            } else {
                false
            }
        });
        if claimed {
            Ok(())
        } else {
            Err(InvitationError::ended(current))
        }
    }

    /// Commit to admitting the guest unless the session already ended.
    ///
    /// From here on the deadline and cancellation no longer end the session.
    fn begin_admission(&self) -> Result<(), InvitationError> {
        let mut current = InvitationState::Init;
        self.state.send_if_modified(|state| {
            current = *state;
            if !state.is_terminal() {
                self.admitting.store(true, Ordering::SeqCst);
            }
            false
        });
        if current.is_terminal() {
            return Err(InvitationError::ended(current));
        }
        debug!(invitation = %self.id.fmt_short(), "admitting guest");
        Ok(())
    }

    /// End the session in `to` on deadline or cancellation, unless an admission runs.
    fn expire(&self, to: InvitationState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if state.is_terminal() || self.admitting.load(Ordering::SeqCst) {
                false
            } else {
                *state = to;
                true
            }
        });
        if moved {
            debug!(invitation = %self.id.fmt_short(), %to, "invitation state");
        }
        moved
    }

    /// Move to `to` unless the session already ended.
    fn transition(&self, to: InvitationState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = to;
                true
            }
        });
        if moved {
            debug!(invitation = %self.id.fmt_short(), %to, "invitation state");
        }
        moved
    }

    fn current(&self) -> InvitationState {
        *self.state.borrow()
    }
}

#[derive(derive_more::Debug)]
enum SessionEntry<D> {
    Active(Arc<Session<D>>),
    Finished(InvitationState),
}

#[derive(derive_more::Debug)]
struct Inner<D> {
    manager: SpaceManager<D>,
    transport: Arc<dyn InvitationTransport>,
    config: InvitationConfig,
    metrics: Arc<Metrics>,
    #[debug("Mutex<Sessions>")]
    sessions: Mutex<Sessions<D>>,
}

/// Active sessions and the outcome of recently ended ones.
struct Sessions<D> {
    entries: BTreeMap<InvitationId, SessionEntry<D>>,
    /// Ended invitations, oldest first.
    finished: VecDeque<InvitationId>,
}

impl<D> Default for Sessions<D> {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            finished: Default::default(),
        }
    }
}

/// Hosts invitations into the spaces of a [`SpaceManager`] and joins spaces as a guest.
#[derive(derive_more::Debug)]
pub struct Invitations<D = MapDocument> {
    inner: Arc<Inner<D>>,
    #[debug("AbortOnDropHandle")]
    _accept: Arc<AbortOnDropHandle<()>>,
}

impl<D> Clone for Invitations<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _accept: self._accept.clone(),
        }
    }
}

impl<D: Document + Default> Invitations<D> {
    /// Serve invitations for `manager`.
    ///
    /// Guests connect through `transport`; sessions opened by guests arrive on
    /// `incoming` and are handled concurrently.
    pub fn spawn(
        manager: SpaceManager<D>,
        transport: Arc<dyn InvitationTransport>,
        incoming: mpsc::Receiver<HostChannel>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config: manager.config().invitation.clone(),
            metrics: manager.metrics().clone(),
            manager,
            transport,
            sessions: Default::default(),
        });
        let span = error_span!("invitations", device = %inner.manager.device_key().fmt_short());
        let task = task::spawn(accept_loop(inner.clone(), incoming).instrument(span));
        Self {
            inner,
            _accept: Arc::new(AbortOnDropHandle::new(task)),
        }
    }

    /// Create an invitation into `space`, checking guest secrets with `validator`.
    ///
    /// Returns immediately. The invitation ends after one guest was admitted or
    /// refused, on [`InvitationHandle::cancel`], or when the configured timeout passes.
    pub fn create_invitation(
        &self,
        space: &Space<D>,
        validator: impl SecretValidator,
    ) -> Result<InvitationHandle, InvitationError> {
        match space.state() {
            SpaceState::Ready => {}
            SpaceState::Closed => return Err(SpaceClosedSnafu.build()),
            state => return Err(NotReadySnafu { state }.build()),
        }
        let id = InvitationId::generate(&mut rand::rngs::OsRng);
        let ticket = InvitationTicket::new(id, space.key(), self.inner.manager.device_key());
        let (state, state_rx) = watch::channel(InvitationState::Init);
        let cancel = CancellationToken::new();
        let session = Arc::new(Session {
            id,
            space: space.clone(),
            validator: Box::new(validator),
            state,
            admitting: AtomicBool::new(false),
            cancel: cancel.clone(),
            deadline: Instant::now() + self.inner.config.timeout,
        });
        self.inner
            .sessions
            .lock()
            .expect("poisoned")
            .entries
            .insert(id, SessionEntry::Active(session.clone()));
        task::spawn(
            supervise(Arc::downgrade(&self.inner), session)
                .instrument(error_span!("invitation", id = %id.fmt_short())),
        );
        self.inner.metrics.invitations_created.inc();
        info!(invitation = %id.fmt_short(), space = %space.key().fmt_short(), "created invitation");
        Ok(InvitationHandle {
            ticket,
            state: state_rx,
            cancel: cancel.clone(),
            _guard: Arc::new(cancel.drop_guard()),
        })
    }

    /// Run the host side of a session opened by a guest.
    pub async fn handle_connection(&self, channel: HostChannel) {
        self.inner.handle_connection(channel).await
    }

    /// Join the space of `ticket`, authenticating with the secret from `provider`.
    ///
    /// Resolves with the space once the host admitted this node's feeds, with the host
    /// added as a replication peer. On failure a space opened for this attempt is
    /// deleted again.
    pub async fn accept_invitation(
        &self,
        ticket: &InvitationTicket,
        provider: impl SecretProvider,
    ) -> Result<Space<D>, InvitationError> {
        let version = ticket.version();
        ensure!(
            version == InvitationTicket::PROTOCOL_VERSION,
            UnsupportedVersionSnafu { version }
        );
        let timeout = self.inner.config.timeout;
        let deadline = Instant::now() + timeout;
        let (channel, host) = time::timeout_at(deadline, self.authenticate(ticket, &provider))
            .await
            .map_err(|_| TimeoutSnafu.build())??;

        let manager = &self.inner.manager;
        let space_key = ticket.space_key();
        let existed = manager.get(space_key).is_some();
        let space = manager.accept_space(space_key, host.genesis_feed).await?;
        let res = admission(channel, &space, host.genesis_feed, deadline, timeout).await;
        match res {
            Ok(()) => {
                info!(space = %space_key.fmt_short(), "joined space");
                if let Err(err) = space.add_peer(ticket.host(), host.identity_key).await {
                    warn!("failed to replicate with the host: {err}");
                }
                Ok(space)
            }
            Err(err) => {
                warn!(space = %space_key.fmt_short(), "joining failed: {err}");
                if !existed {
                    if let Err(err) = manager.delete_space(space_key).await {
                        warn!("failed to remove the space of a failed join: {err}");
                    }
                }
                Err(err)
            }
        }
    }

    async fn authenticate(
        &self,
        ticket: &InvitationTicket,
        provider: &impl SecretProvider,
    ) -> Result<(GuestChannel, IntroducedHost), InvitationError> {
        let manager = &self.inner.manager;
        let mut channel = self.inner.transport.connect(ticket).await?;
        channel
            .send(GuestMessage::Introduce {
                invitation_id: ticket.invitation_id(),
                identity_key: manager.identity_key(),
                device_key: manager.device_key(),
                version: InvitationTicket::PROTOCOL_VERSION,
            })
            .await?;
        let (space_key, host) = match recv_from_host(&mut channel).await? {
            HostMessage::Introduction {
                space_key,
                genesis_feed,
                identity_key,
            } => (
                space_key,
                IntroducedHost {
                    genesis_feed,
                    identity_key,
                },
            ),
            msg => return Err(unexpected(msg)),
        };
        ensure!(
            space_key == ticket.space_key(),
            ProtocolSnafu {
                message: "host introduced another space"
            }
        );
        match recv_from_host(&mut channel).await? {
            HostMessage::RequestSecret => {}
            msg => return Err(unexpected(msg)),
        }
        let secret = provider.provide().await.ok_or_else(|| CancelledSnafu.build())?;
        channel.send(GuestMessage::Authenticate { secret }).await?;
        match recv_from_host(&mut channel).await? {
            HostMessage::Authenticated => Ok((channel, host)),
            msg => Err(unexpected(msg)),
        }
    }
}

/// Ask the host to admit the local feeds and fold the credentials it answers with.
///
/// `Admit` must be sent before `deadline`. The host may already be writing the
/// admission when the deadline passes, so its answer is awaited for up to `grace`
/// longer.
async fn admission<D: Document + Default>(
    mut channel: GuestChannel,
    space: &Space<D>,
    genesis_feed: FeedKey,
    deadline: Instant,
    grace: Duration,
) -> Result<(), InvitationError> {
    let metadata = space.metadata();
    let admit = GuestMessage::Admit {
        control_feed: metadata.control_feed,
        data_feed: metadata.data_feed,
    };
    time::timeout_at(deadline, channel.send(admit))
        .await
        .map_err(|_| TimeoutSnafu.build())??;
    let verdict = time::timeout_at(deadline + grace, recv_from_host(&mut channel))
        .await
        .map_err(|_| TimeoutSnafu.build())??;
    let credentials = match verdict {
        HostMessage::Admitted { credentials } => credentials,
        msg => return Err(unexpected(msg)),
    };
    space.notarize(genesis_feed, credentials).await?;
    ensure!(
        space.state() == SpaceState::Ready,
        AdmissionRejectedSnafu {
            reason: "the host did not admit the local feeds"
        }
    );
    Ok(())
}

async fn recv_from_host(channel: &mut GuestChannel) -> Result<HostMessage, InvitationError> {
    match channel.recv().await? {
        HostMessage::Rejected { reason } => Err(reason.into()),
        msg => Ok(msg),
    }
}

fn unexpected(msg: impl std::fmt::Display) -> InvitationError {
    ProtocolSnafu {
        message: msg.to_string(),
    }
    .build()
}

impl<D: Document + Default> Inner<D> {
    async fn handle_connection(&self, mut channel: HostChannel) {
        let (session, guest) = match self.introduce(&mut channel).await {
            Ok(introduced) => introduced,
            Err(err) => {
                debug!("refused session: {err}");
                if let Some(reason) = err.reject_reason() {
                    channel.send(HostMessage::Rejected { reason }).await.ok();
                }
                return;
            }
        };
        let handshake = tokio::select! {
            res = self.handshake(&session, &mut channel) => res,
            _ = time::sleep_until(session.deadline) => Err(TimeoutSnafu.build()),
            _ = session.cancel.cancelled() => Err(CancelledSnafu.build()),
        };
        // once admission began it is not abandoned
        let res = match handshake {
            Ok(feeds) => self.admit(&session, guest, feeds, &mut channel).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            warn!(invitation = %session.id.fmt_short(), "invitation failed: {err}");
            session.transition(err.end_state());
            if let Some(reason) = err.reject_reason() {
                channel.send(HostMessage::Rejected { reason }).await.ok();
            }
        }
    }

    /// Read the guest's introduction and claim the invitation for it.
    async fn introduce(
        &self,
        channel: &mut HostChannel,
    ) -> Result<(Arc<Session<D>>, IntroducedGuest), InvitationError> {
        let msg = time::timeout(self.config.timeout, channel.recv())
            .await
            .map_err(|_| TimeoutSnafu.build())??;
        let GuestMessage::Introduce {
            invitation_id,
            identity_key,
            device_key,
            version,
        } = msg
        else {
            return Err(unexpected(msg));
        };
        let session = self.session(invitation_id)?;
        ensure!(
            version == InvitationTicket::PROTOCOL_VERSION,
            UnsupportedVersionSnafu { version }
        );
        session.claim()?;
        debug!(
            invitation = %invitation_id.fmt_short(),
            guest = %identity_key.fmt_short(),
            "guest connected"
        );
        Ok((
            session,
            IntroducedGuest {
                identity_key,
                device_key,
            },
        ))
    }

    /// Authenticate the guest and wait for the feeds it wants admitted.
    ///
    /// Resolves once the session is committed to the admission.
    async fn handshake(
        &self,
        session: &Session<D>,
        channel: &mut HostChannel,
    ) -> Result<GuestFeeds, InvitationError> {
        let space = &session.space;
        channel
            .send(HostMessage::Introduction {
                space_key: space.key(),
                genesis_feed: space.metadata().genesis_feed,
                identity_key: self.manager.identity_key(),
            })
            .await?;
        session.transition(InvitationState::Authenticating);
        channel.send(HostMessage::RequestSecret).await?;
        let secret = match channel.recv().await? {
            GuestMessage::Authenticate { secret } => secret,
            msg => return Err(unexpected(msg)),
        };
        ensure!(session.validator.validate(&secret), SecretMismatchSnafu);
        channel.send(HostMessage::Authenticated).await?;

        let feeds = match channel.recv().await? {
            GuestMessage::Admit {
                control_feed,
                data_feed,
            } => GuestFeeds {
                control_feed,
                data_feed,
            },
            msg => return Err(unexpected(msg)),
        };
        session.begin_admission()?;
        Ok(feeds)
    }

    /// Admit the guest and its feeds, then replicate with it.
    async fn admit(
        &self,
        session: &Session<D>,
        guest: IntroducedGuest,
        feeds: GuestFeeds,
        channel: &mut HostChannel,
    ) -> Result<(), InvitationError> {
        let space = &session.space;
        let credentials = space
            .admit_guest(
                guest.identity_key,
                guest.device_key,
                feeds.control_feed,
                feeds.data_feed,
            )
            .await
            .map_err(|err| match err {
                SpaceError::SpaceClosed { .. } => SpaceClosedSnafu.build(),
                err => AdmissionRejectedSnafu {
                    reason: err.to_string(),
                }
                .build(),
            })?;
        if !session.transition(InvitationState::Success) {
            return Err(InvitationError::ended(session.current()));
        }
        channel.send(HostMessage::Admitted { credentials }).await?;
        if let Err(err) = space.add_peer(guest.device_key, guest.identity_key).await {
            warn!("failed to replicate with the guest: {err}");
        }
        Ok(())
    }

    fn session(&self, id: InvitationId) -> Result<Arc<Session<D>>, InvitationError> {
        match self.sessions.lock().expect("poisoned").entries.get(&id) {
            None => Err(UnknownInvitationSnafu.build()),
            Some(SessionEntry::Active(session)) => Ok(session.clone()),
            Some(SessionEntry::Finished(state)) => Err(InvitationError::ended(*state)),
        }
    }

    /// Keep the outcome of an ended invitation, forgetting the oldest beyond the
    /// configured limit.
    fn retire(&self, id: InvitationId, state: InvitationState) {
        let mut sessions = self.sessions.lock().expect("poisoned");
        sessions.entries.insert(id, SessionEntry::Finished(state));
        sessions.finished.push_back(id);
        while sessions.finished.len() > self.config.retain_finished {
            if let Some(oldest) = sessions.finished.pop_front() {
                sessions.entries.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IntroducedGuest {
    identity_key: IdentityKey,
    device_key: DeviceKey,
}

#[derive(Debug, Clone, Copy)]
struct IntroducedHost {
    genesis_feed: FeedKey,
    identity_key: IdentityKey,
}

#[derive(Debug, Clone, Copy)]
struct GuestFeeds {
    control_feed: FeedKey,
    data_feed: FeedKey,
}

/// Accept sessions until the transport stops delivering them.
async fn accept_loop<D: Document + Default>(
    inner: Arc<Inner<D>>,
    mut incoming: mpsc::Receiver<HostChannel>,
) {
    let mut join_set = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            Some(res) = join_set.join_next() => {
                if let Err(err) = res {
                    if err.is_panic() {
                        error!("invitation session panicked: {err:?}");
                    }
                }
            }
            channel = incoming.recv() => {
                let Some(channel) = channel else {
                    break;
                };
                let inner = inner.clone();
                join_set.spawn(
                    async move { inner.handle_connection(channel).await }
                        .instrument(info_span!("invitations.accept")),
                );
            }
        }
    }
    debug!("transport closed, stop accepting");
    join_set.shutdown().await;
}

/// End the session on timeout or cancellation, then retire it.
///
/// A running admission is not interrupted, the session is retired once it ended.
async fn supervise<D: Document + Default>(inner: Weak<Inner<D>>, session: Arc<Session<D>>) {
    let mut state = session.state.subscribe();
    tokio::select! {
        _ = time::sleep_until(session.deadline) => {
            if !session.expire(InvitationState::Timeout) {
                debug!("deadline passed");
            }
        }
        _ = session.cancel.cancelled() => {
            if !session.expire(InvitationState::Cancelled) {
                debug!("cancelled");
            }
        }
        _ = state.wait_for(InvitationState::is_terminal) => {}
    }
    // the session holds the sender, the wait ends with the admission
    state.wait_for(InvitationState::is_terminal).await.ok();
    let end = session.current();
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if end == InvitationState::Success {
        inner.metrics.invitations_succeeded.inc();
    } else {
        inner.metrics.invitations_failed.inc();
    }
    info!(state = %end, "invitation ended");
    inner.retire(session.id, end);
}
