//! Internal utilities to support testing.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock},
};

use n0_future::{
    boxed::BoxFuture,
    task::{self, AbortOnDropHandle},
};
use plexus_base::{DeviceKey, PeerId, PublicKey};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    docs::{BatchDispatcher, DispatchError, Document, MutationBatch},
    space::SpaceManager,
};

/// An in-process network delivering mutation batches between space managers.
///
/// Each joined node gets an inbound queue drained by its own task. A dispatch resolves
/// with the receiving space's verdict, so a batch the receiver refuses, or sent for a
/// space it has not opened, fails and is retried by the sender.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    state: Arc<RwLock<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: BTreeMap<DeviceKey, Node>,
    offline: BTreeSet<DeviceKey>,
}

type Delivery = (DeviceKey, MutationBatch, oneshot::Sender<Result<(), DispatchError>>);

#[derive(Debug)]
struct Node {
    inbox: mpsc::UnboundedSender<Delivery>,
    _task: AbortOnDropHandle<()>,
}

impl MemNetwork {
    /// A dispatcher sending on behalf of `from`.
    pub fn dispatcher(&self, from: DeviceKey) -> Arc<dyn BatchDispatcher> {
        Arc::new(MemDispatcher {
            from,
            network: self.clone(),
        })
    }

    /// Deliver batches addressed to the device of `manager` to its spaces.
    pub fn join<D: Document + Default>(&self, manager: &SpaceManager<D>) {
        let device = manager.device_key();
        let (inbox, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let manager = manager.clone();
        let task = task::spawn(
            async move {
                while let Some((from, batch, reply)) = rx.recv().await {
                    let res = deliver(&manager, from, batch).await;
                    reply.send(res).ok();
                }
            }
            .instrument(error_span!("mem-network", me = %device.fmt_short())),
        );
        let node = Node {
            inbox,
            _task: AbortOnDropHandle::new(task),
        };
        self.state
            .write()
            .expect("poisoned")
            .nodes
            .insert(device, node);
    }

    /// Remove `device` from the network.
    pub fn leave(&self, device: &DeviceKey) {
        let mut state = self.state.write().expect("poisoned");
        state.nodes.remove(device);
        state.offline.remove(device);
    }

    /// Make dispatches to `device` fail with [`DispatchError::NotConnected`].
    pub fn set_offline(&self, device: DeviceKey, offline: bool) {
        let mut state = self.state.write().expect("poisoned");
        if offline {
            state.offline.insert(device);
        } else {
            state.offline.remove(&device);
        }
    }

    fn send(
        &self,
        from: DeviceKey,
        peer: PeerId,
        batch: MutationBatch,
    ) -> Result<oneshot::Receiver<Result<(), DispatchError>>, DispatchError> {
        let state = self.state.read().expect("poisoned");
        if state.offline.contains(&peer) || state.offline.contains(&from) {
            return Err(DispatchError::not_connected(peer));
        }
        let node = state
            .nodes
            .get(&peer)
            .ok_or_else(|| DispatchError::not_connected(peer))?;
        let (reply, rx) = oneshot::channel();
        node.inbox
            .send((from, batch, reply))
            .map_err(|_| DispatchError::transport("receiver stopped"))?;
        Ok(rx)
    }
}

async fn deliver<D: Document + Default>(
    manager: &SpaceManager<D>,
    from: DeviceKey,
    batch: MutationBatch,
) -> Result<(), DispatchError> {
    let Ok(space_key) = PublicKey::from_bytes(batch.topic.as_bytes()) else {
        warn!("batch for a topic that is no space key");
        return Err(DispatchError::transport("unknown topic"));
    };
    let Some(space) = manager.get(space_key) else {
        debug!(space = %space_key.fmt_short(), "refusing batch for a space that is not open");
        return Err(DispatchError::transport("space not open"));
    };
    match space.receive_batch(from, batch).await {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(from = %from.fmt_short(), "failed to receive batch: {err}");
            Err(DispatchError::transport(err.to_string()))
        }
    }
}

#[derive(Debug)]
struct MemDispatcher {
    from: DeviceKey,
    network: MemNetwork,
}

impl BatchDispatcher for MemDispatcher {
    fn dispatch(&self, peer: PeerId, batch: MutationBatch) -> BoxFuture<Result<(), DispatchError>> {
        let sent = self.network.send(self.from, peer, batch);
        Box::pin(async move {
            sent?
                .await
                .map_err(|_| DispatchError::transport("receiver stopped"))?
        })
    }
}
