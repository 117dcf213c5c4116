//! Tuning constants for the storage node.
//!
//! # Categories
//!
//! - **Channel sizing**: capacity of the shared frames channel
//! - **Timeouts**: network fetch deadline, peer-wait polling
//! - **Gossip**: peer-exchange pacing, retry policy, discovery caps
//! - **Maintenance**: staleness thresholds for the peers table

use std::time::Duration;

/// Capacity of the bounded frames channel shared by all read loops.
pub const FRAMES_CHANNEL_CAPACITY: usize = 1024;

/// Deadline for a network `get` once the fetch has been broadcast.
pub const GET_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval while waiting for the first peer connection.
pub const WAIT_PEERS_POLL: Duration = Duration::from_millis(100);

/// Grace period after a peer connects before gossiping to it, so the
/// connection is fully registered on both sides.
pub const PEER_EXCHANGE_DELAY: Duration = Duration::from_millis(500);

/// Attempts to deliver a peer exchange before giving up.
pub const PEER_EXCHANGE_RETRIES: u32 = 5;

/// Pause between peer-exchange delivery retries.
pub const PEER_EXCHANGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum dial attempts triggered by a single received peer exchange.
pub const DISCOVER_MAX_ATTEMPTS: usize = 10;

/// Pause between successful discovery dials.
pub const DISCOVER_DIAL_GAP: Duration = Duration::from_millis(100);

/// Only peers seen within this window are gossiped.
pub const GOSSIP_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Maximum peers carried in one exchange message.
pub const GOSSIP_PEER_LIMIT: i64 = 50;

/// Age window for the `peers` CLI listing.
pub const PEERS_LIST_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Row cap for the `peers` CLI listing.
pub const PEERS_LIST_LIMIT: i64 = 100;

/// Peers not seen within this threshold are removed by `cleanup`.
pub const CLEANUP_STALE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Settling time a one-shot command gives the mesh before acting.
pub const ONESHOT_SETTLE: Duration = Duration::from_millis(500);

/// Extra settling time before a one-shot `store`, which wants gossip to have
/// expanded the peer set for wider replication.
pub const ONESHOT_STORE_SETTLE: Duration = Duration::from_secs(2);

/// How long one-shot commands wait for at least one peer when bootstrap
/// nodes were configured.
pub const ONESHOT_WAIT_FOR_PEERS: Duration = Duration::from_secs(5);
