//! A last-writer-wins map, the default document type.

use std::{
    collections::{BTreeMap, btree_map},
    fmt,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{DecodeSnafu, Document, DocumentError, Heads};

/// Identifier of a replica writing to a document.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId([u8; 16]);

impl ActorId {
    /// A random actor id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create an actor id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", data_encoding::HEXLOWER.encode(&self.0[..4]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Op {
    actor: ActorId,
    seq: u64,
    lamport: u64,
    key: String,
    value: Option<Bytes>,
}

impl Op {
    fn clock(&self) -> (u64, ActorId) {
        (self.lamport, self.actor)
    }
}

/// A map from string keys to byte values where concurrent writes to the same key are
/// resolved by lamport clock, ties broken by actor id.
#[derive(Debug, Clone)]
pub struct MapDocument {
    actor: ActorId,
    lamport: u64,
    log: BTreeMap<ActorId, Vec<Op>>,
    // ops that arrived ahead of a gap in their actor's sequence
    pending: BTreeMap<(ActorId, u64), Op>,
    values: BTreeMap<String, Op>,
}

impl Default for MapDocument {
    fn default() -> Self {
        Self::new(ActorId::random())
    }
}

impl MapDocument {
    /// An empty document written by `actor`.
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            lamport: 0,
            log: Default::default(),
            pending: Default::default(),
            values: Default::default(),
        }
    }

    /// The local actor.
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Set `key` to `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.local_op(key.into(), Some(value.into()));
    }

    /// Delete `key`.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.local_op(key.into(), None);
    }

    /// The current value of `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.values.get(key).and_then(|op| op.value.as_ref())
    }

    /// Iterate over the live entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.values
            .iter()
            .filter_map(|(key, op)| op.value.as_ref().map(|value| (key.as_str(), value)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live entries.
    pub fn to_map(&self) -> BTreeMap<String, Bytes> {
        self.iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn local_op(&mut self, key: String, value: Option<Bytes>) {
        self.lamport += 1;
        let seq = self.log.get(&self.actor).map_or(0, Vec::len) as u64 + 1;
        let op = Op {
            actor: self.actor,
            seq,
            lamport: self.lamport,
            key,
            value,
        };
        self.integrate(op);
    }

    /// Add `op` to the log and the map. The op must be the next of its actor.
    fn integrate(&mut self, op: Op) {
        self.lamport = self.lamport.max(op.lamport);
        match self.values.entry(op.key.clone()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(op.clone());
            }
            btree_map::Entry::Occupied(mut entry) => {
                if op.clock() > entry.get().clock() {
                    entry.insert(op.clone());
                }
            }
        }
        self.log.entry(op.actor).or_default().push(op);
    }

    fn next_seq(&self, actor: &ActorId) -> u64 {
        self.log.get(actor).map_or(0, Vec::len) as u64 + 1
    }
}

impl Document for MapDocument {
    fn heads(&self) -> Heads {
        let mut heads = Heads::default();
        for (actor, ops) in &self.log {
            heads.insert(*actor, ops.len() as u64);
        }
        heads
    }

    fn encode_since(&self, since: &Heads) -> Bytes {
        let ops: Vec<&Op> = self
            .log
            .iter()
            .flat_map(|(actor, ops)| {
                let skip = since.get(actor).min(ops.len() as u64) as usize;
                ops[skip..].iter()
            })
            .collect();
        postcard::to_stdvec(&ops)
            .expect("postcard serialization failed")
            .into()
    }

    fn apply_changes(&mut self, changes: &[u8]) -> Result<(), DocumentError> {
        let ops: Vec<Op> = postcard::from_bytes(changes).context(DecodeSnafu)?;
        for op in ops {
            if op.seq >= self.next_seq(&op.actor) {
                self.pending.insert((op.actor, op.seq), op);
            }
        }
        // drain everything that became contiguous
        loop {
            let ready = self
                .pending
                .keys()
                .find(|(actor, seq)| *seq <= self.next_seq(actor))
                .copied();
            let Some(key) = ready else {
                break;
            };
            let Some(op) = self.pending.remove(&key) else {
                break;
            };
            if op.seq == self.next_seq(&op.actor) {
                self.integrate(op);
            }
        }
        Ok(())
    }
}
