//! Peer-exchange gossip: sharing known addresses and dialing discovered
//! ones.
//!
//! Every exchange message carries the sender's own listen address alongside
//! the active peers from its address book. That self-advertisement is what
//! lets the mesh converge: the address book only ever records the remote
//! ends of live connections, and for inbound connections those are
//! ephemeral ports nobody can dial back.

use common::{NodeMessage, PeerInfo, WireError};
use std::sync::Arc;
use tracing::{debug, info};

use crate::constants::{
    DISCOVER_DIAL_GAP, DISCOVER_MAX_ATTEMPTS, GOSSIP_MAX_AGE, GOSSIP_PEER_LIMIT,
};
use crate::server::ServerInner;

/// Sends one `PeerExchange` to `peer_addr` with this node's address and its
/// recently seen peers.
pub(crate) async fn send_peer_exchange(
    inner: &Arc<ServerInner>,
    peer_addr: &str,
) -> anyhow::Result<()> {
    let mut peers = vec![PeerInfo {
        address: inner.transport.address(),
        last_seen: common::now_secs(),
    }];

    if let Some(db) = &inner.db {
        let active = db.get_active_peers(GOSSIP_MAX_AGE, GOSSIP_PEER_LIMIT).await?;
        peers.extend(active.into_iter().filter_map(|p| {
            p.last_seen.map(|last_seen| PeerInfo {
                address: p.address,
                last_seen: last_seen as u64,
            })
        }));
    }

    let Some(peer) = inner.peers.get(peer_addr).map(|e| e.value().clone()) else {
        anyhow::bail!("peer {} not in connected peers", peer_addr);
    };

    debug!(to = %peer_addr, count = peers.len(), "Sending peer exchange");
    match peer.send_message(&NodeMessage::PeerExchange { peers }).await {
        Ok(()) => Ok(()),
        // A peer that vanished between connect and gossip is routine.
        Err(e) if is_expected_network_error(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Dials gossiped addresses, skipping self and already-connected peers.
/// Capped per message; failures are logged at debug.
pub(crate) async fn discover_peers(inner: Arc<ServerInner>, peers: Vec<PeerInfo>) {
    let my_addr = inner.transport.address();
    let mut attempted = 0usize;
    let mut connected = 0usize;

    for info in peers {
        if attempted >= DISCOVER_MAX_ATTEMPTS {
            break;
        }
        if info.address == my_addr {
            continue;
        }
        if inner.peers.contains_key(&info.address) {
            continue;
        }

        attempted += 1;
        match inner.transport.dial(&info.address).await {
            Ok(()) => {
                debug!(remote = %info.address, "Connected to discovered peer");
                connected += 1;
                tokio::time::sleep(DISCOVER_DIAL_GAP).await;
            }
            Err(e) => {
                debug!(remote = %info.address, error = %e, "Discovery dial failed");
            }
        }
    }

    if connected > 0 {
        info!(connected, "Peer discovery connected new peers");
    }
}

/// I/O conditions that routinely accompany a peer going away; gossip treats
/// them as success rather than noise.
fn is_expected_network_error(err: &WireError) -> bool {
    err.is_disconnect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnects_are_expected() {
        let err = WireError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_expected_network_error(&err));
    }

    #[test]
    fn framing_errors_are_not_expected() {
        assert!(!is_expected_network_error(&WireError::BadTag(0x9)));
    }
}
