use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use bytes::Bytes;
use cid::Cid;
use iroh_bitswap::Block;
use tracing::debug;

/// In-memory block store shared between the probes and the network node.
///
/// Probes put freshly generated blocks here before providing them; the node
/// serves them to peers whose want-lists name them. Blocks are deleted again
/// when the probe iteration ends, so the store stays tiny.
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    blocks: Arc<RwLock<AHashMap<Cid, Bytes>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, block: Block) {
        debug!(cid = %block.cid(), size = block.data().len(), "storing block");
        self.blocks
            .write()
            .expect("block store lock poisoned")
            .insert(*block.cid(), block.data().clone());
    }

    pub fn get(&self, cid: &Cid) -> Option<Bytes> {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .get(cid)
            .cloned()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .contains_key(cid)
    }

    /// Removes a block. Returns false if it was not stored.
    pub fn delete(&self, cid: &Cid) -> bool {
        debug!(cid = %cid, "removing block");
        self.blocks
            .write()
            .expect("block store lock poisoned")
            .remove(cid)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
