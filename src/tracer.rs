use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use cid::Cid;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Observes every inbound bitswap want-list entry and routes entries that
/// match a registered CID to the probe that registered it.
///
/// The delivery channel holds a single sighting. A probe only needs one
/// sighting per iteration; additional wants for the same CID arriving while
/// the slot is full are dropped, which also keeps the node's event loop from
/// ever blocking on a slow probe.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    cids: Arc<RwLock<AHashMap<Vec<u8>, mpsc::Sender<PeerId>>>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a CID and returns the receive end of its sighting channel.
    ///
    /// At most one registration is live per CID: registering a CID again
    /// replaces the previous channel, closing it.
    pub fn register(&self, cid: &Cid) -> mpsc::Receiver<PeerId> {
        debug!(cid = %cid, "tracer registered cid");

        let (tx, rx) = mpsc::channel(1);
        self.cids
            .write()
            .expect("tracer lock poisoned")
            .insert(cid.to_bytes(), tx);

        rx
    }

    /// Removes a CID's registration, closing its channel.
    pub fn unregister(&self, cid: &Cid) {
        debug!(cid = %cid, "tracer unregistered cid");

        self.cids
            .write()
            .expect("tracer lock poisoned")
            .remove(&cid.to_bytes());
    }

    /// Called by the node for every want-list entry of an inbound bitswap
    /// message. Never blocks: a full or closed channel drops the sighting.
    pub fn want_received(&self, peer_id: PeerId, cid: &Cid) {
        let cids = self.cids.read().expect("tracer lock poisoned");
        let Some(tx) = cids.get(&cid.to_bytes()) else {
            return;
        };

        match tx.try_send(peer_id) {
            Ok(()) => trace!(peer = %peer_id, cid = %cid, "tracer delivered sighting"),
            Err(_) => trace!(peer = %peer_id, cid = %cid, "tracer dropped sighting"),
        }
    }

    /// Whether a CID currently has a live registration.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.cids
            .read()
            .expect("tracer lock poisoned")
            .contains_key(&cid.to_bytes())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.cids.read().expect("tracer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use iroh_bitswap::Block;

    use super::*;

    fn test_cid(data: &[u8]) -> Cid {
        *Block::from_v0_data(Bytes::copy_from_slice(data)).unwrap().cid()
    }

    #[tokio::test]
    async fn delivers_first_sighting_and_drops_the_rest() {
        let tracer = Tracer::new();
        let cid = test_cid(b"watched");
        let mut sightings = tracer.register(&cid);

        let first = PeerId::random();
        let second = PeerId::random();
        tracer.want_received(first, &cid);
        // slot is full, dropped
        tracer.want_received(second, &cid);

        assert_eq!(sightings.recv().await, Some(first));
        assert!(sightings.try_recv().is_err());
    }

    #[tokio::test]
    async fn ignores_unregistered_cids() {
        let tracer = Tracer::new();
        let cid = test_cid(b"watched");
        let mut sightings = tracer.register(&cid);

        tracer.want_received(PeerId::random(), &test_cid(b"unrelated"));
        assert!(sightings.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_closes_the_channel() {
        let tracer = Tracer::new();
        let cid = test_cid(b"watched");
        let mut sightings = tracer.register(&cid);

        tracer.unregister(&cid);
        assert!(tracer.is_empty());
        assert_eq!(sightings.recv().await, None);

        // sightings after unregister are silently dropped
        tracer.want_received(PeerId::random(), &cid);
    }

    #[tokio::test]
    async fn reregistering_replaces_the_previous_channel() {
        let tracer = Tracer::new();
        let cid = test_cid(b"watched");

        let mut old = tracer.register(&cid);
        let mut new = tracer.register(&cid);
        assert_eq!(tracer.len(), 1);

        // the old channel is closed, the new one receives
        assert_eq!(old.recv().await, None);
        let peer = PeerId::random();
        tracer.want_received(peer, &cid);
        assert_eq!(new.recv().await, Some(peer));
    }
}
