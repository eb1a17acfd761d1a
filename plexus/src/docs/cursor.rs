//! Per (document, peer) sync state.

use plexus_base::PeerId;

use super::{DocId, Document, DocumentError, Heads, Mutation, WrongDocumentSnafu};

/// Sync state of one document towards one peer.
///
/// The cursor remembers the heads the peer is known to have. Every emitted mutation
/// starts at that marker and moves it forward, so mutations sent to a peer never
/// overlap.
#[derive(Debug, Clone)]
pub struct DocSyncCursor {
    doc_id: DocId,
    peer: PeerId,
    last_sent: Heads,
    dirty: bool,
}

impl DocSyncCursor {
    /// A cursor for a peer that has nothing yet.
    pub fn new(doc_id: DocId, peer: PeerId) -> Self {
        Self {
            doc_id,
            peer,
            last_sent: Heads::default(),
            dirty: true,
        }
    }

    /// The document.
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// The peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The heads the peer is believed to have.
    pub fn last_sent(&self) -> &Heads {
        &self.last_sent
    }

    /// Whether local changes may be pending for this peer.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag the cursor as having pending local changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Compute the mutation carrying everything `doc` has beyond the last-sent marker.
    ///
    /// Returns `None` if the peer already has everything. Otherwise the marker advances
    /// to the document's heads, so only call this when the result will be transmitted.
    pub fn compute_outgoing<D: Document>(&mut self, doc: &D) -> Option<Mutation> {
        self.dirty = false;
        let heads = doc.heads();
        if !heads.has_news_for(&self.last_sent) {
            return None;
        }
        let changes = doc.encode_since(&self.last_sent);
        let base = std::mem::replace(&mut self.last_sent, heads.clone());
        Some(Mutation {
            doc_id: self.doc_id.clone(),
            base,
            heads,
            changes,
        })
    }

    /// Merge a mutation received from the peer into `doc`.
    ///
    /// The peer has at least the mutation's heads, so they are merged into the
    /// last-sent marker and not sent back.
    pub fn apply_incoming<D: Document>(
        &mut self,
        doc: &mut D,
        mutation: &Mutation,
    ) -> Result<(), DocumentError> {
        if mutation.doc_id != self.doc_id {
            return Err(WrongDocumentSnafu {
                expected: self.doc_id.clone(),
                actual: mutation.doc_id.clone(),
            }
            .build());
        }
        doc.apply_changes(&mutation.changes)?;
        self.last_sent.merge(&mutation.heads);
        Ok(())
    }

    /// Move the last-sent marker back to `base` after a mutation was not delivered.
    pub fn rewind(&mut self, base: &Heads) {
        self.last_sent = base.clone();
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use plexus_base::SecretKey;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::docs::{ActorId, MapDocument};

    fn peer() -> PeerId {
        SecretKey::generate(&mut rand::thread_rng()).public()
    }

    #[test]
    fn outgoing_advances() {
        let mut doc = MapDocument::new(ActorId::from_bytes([1; 16]));
        let mut cursor = DocSyncCursor::new("doc".into(), peer());
        assert!(cursor.compute_outgoing(&doc).is_none());

        doc.set("a", "1");
        let first = cursor.compute_outgoing(&doc).unwrap();
        assert!(first.base.is_empty());
        assert!(cursor.compute_outgoing(&doc).is_none());

        doc.set("b", "2");
        let second = cursor.compute_outgoing(&doc).unwrap();
        // no overlap: the second mutation starts where the first ended
        assert_eq!(second.base, first.heads);
        assert!(second.heads.has_news_for(&first.heads));
    }

    #[test]
    fn incoming_is_not_echoed() {
        let (pa, pb) = (peer(), peer());
        let mut a = MapDocument::new(ActorId::from_bytes([1; 16]));
        let mut b = MapDocument::new(ActorId::from_bytes([2; 16]));
        let mut a_to_b = DocSyncCursor::new("doc".into(), pb);
        let mut b_to_a = DocSyncCursor::new("doc".into(), pa);

        a.set("k", "v");
        let mutation = a_to_b.compute_outgoing(&a).unwrap();
        b_to_a.apply_incoming(&mut b, &mutation).unwrap();
        assert_eq!(a.to_map(), b.to_map());
        assert!(b_to_a.compute_outgoing(&b).is_none());

        // applying the same mutation twice is a no-op
        b_to_a.apply_incoming(&mut b, &mutation).unwrap();
        assert_eq!(a.to_map(), b.to_map());
    }

    #[test]
    fn rewind_resends() {
        let mut doc = MapDocument::new(ActorId::from_bytes([1; 16]));
        let mut cursor = DocSyncCursor::new("doc".into(), peer());
        doc.set("a", "1");
        let lost = cursor.compute_outgoing(&doc).unwrap();
        cursor.rewind(&lost.base);
        assert!(cursor.is_dirty());
        let again = cursor.compute_outgoing(&doc).unwrap();
        assert_eq!(again, lost);
    }

    #[test]
    fn wrong_document() {
        let mut doc = MapDocument::default();
        let mut other = MapDocument::default();
        other.set("a", "1");
        let mut cursor = DocSyncCursor::new("one".into(), peer());
        let mut source = DocSyncCursor::new("two".into(), peer());
        let mutation = source.compute_outgoing(&other).unwrap();
        assert!(matches!(
            cursor.apply_incoming(&mut doc, &mutation),
            Err(DocumentError::WrongDocument { .. })
        ));
    }
}
