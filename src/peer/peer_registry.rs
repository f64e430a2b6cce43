use std::str::FromStr;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::peer::{Peer, PeerError};
use crate::probe::NodeId;
use crate::util::random::{Random, RngRandom};

/// All configured peers, keyed by the id that probes addressed to them carry as `dst_id`.
///
/// A peer named `localhost` is assigned the local node's own id, all other peers get a fresh
///  random id. This is how a node probes itself: the probe is addressed to the local id, so it is
///  stamped and echoed when it arrives for the first time, and it is recognized as a returning
///  probe (stamped, originating from the local id) on its second arrival.
///
/// NB: The alias is based on the peer's name only, not on its address being a loopback address
///      - a peer named `localhost` that points to some other node will never see a valid return
///      probe.
pub struct PeerRegistry {
    peers: FxHashMap<NodeId, Peer>,
}

impl PeerRegistry {
    pub fn build(local_id: NodeId, descriptors: &[String]) -> Result<PeerRegistry, PeerError> {
        Self::build_with::<RngRandom>(local_id, descriptors)
    }

    fn build_with<R: Random>(local_id: NodeId, descriptors: &[String]) -> Result<PeerRegistry, PeerError> {
        let mut peers = FxHashMap::default();

        for descriptor in descriptors {
            let peer = Peer::from_str(descriptor)?;

            if peers.values().any(|p: &Peer| p.name() == peer.name()) {
                return Err(PeerError::DuplicateName(peer.name().to_string()));
            }

            let id = if peer.is_localhost() {
                local_id
            }
            else {
                Self::new_random_id::<R>(local_id, &peers)?
            };

            debug!(?id, ?peer, "registered peer");
            peers.insert(id, peer);
        }

        Ok(PeerRegistry { peers })
    }

    fn new_random_id<R: Random>(local_id: NodeId, peers: &FxHashMap<NodeId, Peer>) -> Result<NodeId, PeerError> {
        loop {
            let id = R::try_next_node_id()
                .map_err(|e| PeerError::RandomId(e.to_string()))?;

            // practically impossible for v4 UUIDs, but a collision would silently merge two peers
            if id != local_id && !peers.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Peer)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
