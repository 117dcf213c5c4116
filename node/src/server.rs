//! The file server: the coordinator that owns the transport, the CAS, the
//! encryption key, and all replication state.
//!
//! # Dispatch model
//!
//! A single dispatch task consumes the transport's frames channel. Control
//! frames decode to [`NodeMessage`] and dispatch by variant; the synthetic
//! stream frame consumes the pending transfer registered by the preceding
//! `StoreFile` and drains the body straight off the peer's connection. The
//! pending-transfer map lives on the dispatch task's stack — nothing else
//! may touch it.
//!
//! # State machine per inbound stream (peer P, key K)
//!
//! ```text
//! IDLE ──StoreFile(K,n) from P──▶ PENDING(P,K,n)
//! PENDING(P,K,n) ──stream frame from P──▶ RECEIVING
//! RECEIVING ──n plaintext bytes copied──▶ IDLE
//!         │
//!         └─ then: close_stream(P); signal rendezvous(K) if any
//! Any state ──connection drop from P──▶ discard pending, release barrier
//! ```

use common::crypto::{self, DecryptReader, IV_SIZE, KEY_SIZE};
use common::framing;
use common::{NodeMessage, WireError};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    GET_TIMEOUT, PEER_EXCHANGE_DELAY, PEER_EXCHANGE_RETRIES, PEER_EXCHANGE_RETRY_DELAY,
    WAIT_PEERS_POLL,
};
use crate::db::{FileRow, MetaStore, PeerRow, ShareRow, DEFAULT_KEY_ID};
use crate::peer_exchange;
use crate::store::CasStore;
use crate::transport::{nop_handshake, Peer, Rpc, TcpTransport, TcpTransportOpts};

/// Errors surfaced by the coordinator's public operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The requested key exists neither locally nor on any peer that
    /// answered in time.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The network fetch deadline (or a peer-wait deadline) elapsed.
    #[error("timeout {0}")]
    Timeout(String),

    /// A stream frame arrived with no pending transfer recorded for that
    /// peer. The barrier is released anyway; the connection survives until
    /// the next framing read fails.
    #[error("stream from {0} without a pending transfer")]
    PendingMismatch(String),

    /// Metadata repository failure.
    #[error("metadata store error: {0}")]
    Metadata(#[from] sqlx::Error),

    /// Wire-level failure (framing, codec, cipher).
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Local disk failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A `StoreFile` announcement waiting for its stream body.
#[derive(Debug)]
struct PendingTransfer {
    key: String,
    size: i64,
}

/// Construction options for a [`FileServer`].
pub struct FileServerOpts {
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub encryption_key: [u8; KEY_SIZE],
    pub bootstrap: Vec<String>,
    pub db: Option<MetaStore>,
}

/// A running storage node. Cloning shares the node; the handle is cheap.
#[derive(Clone)]
pub struct FileServer {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) transport: TcpTransport,
    pub(crate) store: CasStore,
    pub(crate) db: Option<MetaStore>,
    pub(crate) peers: DashMap<String, Peer>,
    encryption_key: [u8; KEY_SIZE],
    bootstrap: Vec<String>,
    downloads: Mutex<HashMap<String, oneshot::Sender<()>>>,
    quit: CancellationToken,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Self {
        let transport = TcpTransport::new(TcpTransportOpts {
            listen_addr: opts.listen_addr,
            handshake: nop_handshake(),
        });

        let inner = Arc::new(ServerInner {
            transport,
            store: CasStore::new(opts.storage_root),
            db: opts.db,
            peers: DashMap::new(),
            encryption_key: opts.encryption_key,
            bootstrap: opts.bootstrap,
            downloads: Mutex::new(HashMap::new()),
            quit: CancellationToken::new(),
        });

        // The transport holds only a weak reference so a dropped server does
        // not keep itself alive through its own callback.
        let weak = Arc::downgrade(&inner);
        inner
            .transport
            .set_on_peer(Arc::new(move |peer| match weak.upgrade() {
                Some(inner) => {
                    inner.on_peer(peer);
                    Ok(())
                }
                None => anyhow::bail!("server has shut down"),
            }));

        Self { inner }
    }

    /// Binds the listener. After this returns, [`FileServer::address`] is
    /// the node's dialable address.
    pub async fn listen(&self) -> anyhow::Result<()> {
        self.inner.transport.listen_and_accept().await
    }

    /// Dials the bootstrap set and runs the dispatch loop until
    /// [`FileServer::stop`]. Call [`FileServer::listen`] first.
    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.inner.bootstrap.is_empty() {
            Arc::clone(&self.inner).bootstrap_network();
        }

        let rx = self
            .inner
            .transport
            .take_receiver()
            .await
            .ok_or_else(|| anyhow::anyhow!("dispatch loop already running"))?;
        Arc::clone(&self.inner).dispatch_loop(rx).await;
        Ok(())
    }

    /// Listens and runs in one call — the blocking entry point used by the
    /// CLI.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.listen().await?;
        self.run().await
    }

    /// Stops the dispatch loop and shuts the transport down.
    pub fn stop(&self) {
        self.inner.quit.cancel();
        self.inner.transport.close();
    }

    /// The node's own address (actual bound address once listening).
    pub fn address(&self) -> String {
        self.inner.transport.address()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Stat-only check for a CAS entry under its wire identifier.
    pub async fn local_has(&self, wire_key: &str) -> bool {
        self.inner.store.has(wire_key).await
    }

    /// Encrypts `reader` into the local CAS under `H(key)`, records
    /// metadata, and replicates the plaintext to every connected peer.
    /// Returns the on-disk byte count (IV included). Per-peer replication
    /// failures are logged, not returned: the local write already succeeded.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let inner = &self.inner;
        let wire_key = crypto::hash_key(key);

        let written = inner
            .store
            .write_encrypt(&inner.encryption_key, &wire_key, reader)
            .await?;
        let plaintext_size = written as i64 - IV_SIZE as i64;
        info!(key = %key, bytes = written, "Stored file locally (encrypted)");

        if let Some(db) = &inner.db {
            let row = FileRow {
                id: wire_key.clone(),
                name: key.to_string(),
                hash: wire_key.clone(),
                size: plaintext_size,
                local_path: inner.store.full_path_for(&wire_key).display().to_string(),
                created_at: 0,
            };
            if let Err(e) = db.insert_file_with_key(&row, DEFAULT_KEY_ID).await {
                debug!(key = %key, error = %e, "File row not inserted (may already exist)");
            }
        }

        // Snapshot the peers map before any network I/O.
        let peers: Vec<Peer> = inner.peers.iter().map(|e| e.value().clone()).collect();
        if peers.is_empty() {
            return Ok(written);
        }

        let results = join_all(
            peers
                .iter()
                .map(|peer| inner.stream_to_peer(peer, &wire_key, plaintext_size)),
        )
        .await;

        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(sent) => {
                    debug!(peer = %peer.remote_addr(), bytes = sent, "Replicated to peer");
                    inner
                        .record_share(&wire_key, peer.remote_addr(), "outgoing")
                        .await;
                }
                Err(e) => {
                    warn!(peer = %peer.remote_addr(), error = %e, "Replication to peer failed");
                }
            }
        }

        Ok(written)
    }

    /// Returns the plaintext size and a lazy decrypting reader for `key`,
    /// fetching from the mesh when the local CAS misses.
    pub async fn get(
        &self,
        key: &str,
    ) -> Result<(u64, DecryptReader<tokio::fs::File>), ServerError> {
        let inner = &self.inner;
        let wire_key = crypto::hash_key(key);

        if inner.store.has(&wire_key).await {
            info!(key = %key, "Serving file from local store");
            return Ok(inner
                .store
                .read_decrypt(&inner.encryption_key, &wire_key)
                .await?);
        }

        info!(key = %key, "Not found locally, searching the mesh");
        let (tx, rx) = oneshot::channel();
        inner.downloads.lock().insert(wire_key.clone(), tx);

        let request = NodeMessage::GetFile {
            key: wire_key.clone(),
        };
        if let Err(e) = inner.broadcast(&request).await {
            inner.downloads.lock().remove(&wire_key);
            return Err(e);
        }

        match tokio::time::timeout(GET_TIMEOUT, rx).await {
            Ok(Ok(())) => {
                info!(key = %key, "File downloaded from the mesh");
                Ok(inner
                    .store
                    .read_decrypt(&inner.encryption_key, &wire_key)
                    .await?)
            }
            _ => {
                // Timeout, or the node is shutting down and dropped the
                // sender. Either way the rendezvous entry must go.
                inner.downloads.lock().remove(&wire_key);
                Err(ServerError::Timeout(format!(
                    "waiting for file download: {}",
                    key
                )))
            }
        }
    }

    /// Deletes `key` locally (metadata first — a failed metadata delete
    /// aborts before the disk is touched) and broadcasts the delete to the
    /// mesh.
    pub async fn delete(&self, key: &str) -> Result<(), ServerError> {
        let inner = &self.inner;
        let wire_key = crypto::hash_key(key);

        if let Some(db) = &inner.db {
            db.delete_file(&wire_key).await?;
            debug!(key = %key, "Deleted metadata row");
        }

        if inner.store.has(&wire_key).await {
            inner.store.delete(&wire_key).await?;
            info!(key = %key, "Deleted file from local storage");
        } else {
            debug!(key = %key, "No local copy; broadcasting delete anyway");
        }

        let peers = inner.peers.len();
        if peers == 0 {
            debug!(key = %key, "No peers connected, delete stays local");
            return Ok(());
        }

        inner
            .broadcast(&NodeMessage::DeleteFile { key: wire_key })
            .await?;
        info!(key = %key, peers, "Broadcasted delete request");
        Ok(())
    }

    /// Polls until at least one peer is connected or `timeout` elapses.
    pub async fn wait_for_peers(&self, timeout: Duration) -> Result<(), ServerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.inner.peers.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(WAIT_PEERS_POLL).await;
        }
        Err(ServerError::Timeout(
            "waiting for peer connections".to_string(),
        ))
    }
}

impl ServerInner {
    /// Transport callback: a connection (either direction) is live.
    fn on_peer(self: Arc<Self>, peer: Peer) {
        let addr = peer.remote_addr().to_string();
        info!(peer = %addr, "Connected with remote peer");
        self.peers.insert(addr.clone(), peer);

        tokio::spawn(async move {
            if let Some(db) = &self.db {
                let row = PeerRow {
                    id: addr.clone(),
                    address: addr.clone(),
                    status: "connected".to_string(),
                    last_seen: Some(common::now_secs() as i64),
                };
                if let Err(e) = db.upsert_peer(&row).await {
                    warn!(peer = %addr, error = %e, "Failed to upsert peer row");
                }
            }

            // Give the remote side time to register the connection before
            // gossiping to it.
            tokio::time::sleep(PEER_EXCHANGE_DELAY).await;
            for attempt in 1..=PEER_EXCHANGE_RETRIES {
                match peer_exchange::send_peer_exchange(&self, &addr).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            peer = %addr,
                            attempt,
                            max = PEER_EXCHANGE_RETRIES,
                            error = %e,
                            "Peer exchange failed"
                        );
                        tokio::time::sleep(PEER_EXCHANGE_RETRY_DELAY).await;
                    }
                }
            }
        });
    }

    /// Dials every bootstrap address concurrently; failures are logged.
    fn bootstrap_network(self: Arc<Self>) {
        for addr in self.bootstrap.iter().filter(|a| !a.is_empty()).cloned() {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                info!(remote = %addr, "Attempting to connect with bootstrap node");
                if let Err(e) = inner.transport.dial(&addr).await {
                    warn!(remote = %addr, error = %e, "Bootstrap dial error");
                }
            });
        }
    }

    /// The dispatch loop. The pending-transfer map lives here, on this
    /// task's stack, and nowhere else.
    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Rpc>) {
        let mut pending: HashMap<String, PendingTransfer> = HashMap::new();

        loop {
            let rpc = tokio::select! {
                _ = self.quit.cancelled() => break,
                received = rx.recv() => match received {
                    Some(rpc) => rpc,
                    None => break,
                },
            };

            if rpc.stream {
                if let Err(e) = self.handle_stream(&mut pending, &rpc.from).await {
                    warn!(peer = %rpc.from, error = %e, "Error handling stream");
                }
                continue;
            }

            let msg = match NodeMessage::decode(&rpc.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(peer = %rpc.from, error = %e, "Dropping malformed control message");
                    continue;
                }
            };

            if let Err(e) = Arc::clone(&self)
                .handle_message(&mut pending, &rpc.from, msg)
                .await
            {
                warn!(peer = %rpc.from, error = %e, "Error handling message");
            }
        }

        info!(addr = %self.transport.address(), "File server stopped");
    }

    async fn handle_message(
        self: Arc<Self>,
        pending: &mut HashMap<String, PendingTransfer>,
        from: &str,
        msg: NodeMessage,
    ) -> Result<(), ServerError> {
        match msg {
            NodeMessage::StoreFile { key, size } => {
                debug!(peer = %from, key = %key, size, "Expecting stream");
                if let Some(stale) = pending.insert(from.to_string(), PendingTransfer { key, size })
                {
                    // Protocol violation: a second announcement before the
                    // first stream body. The newer one wins.
                    warn!(
                        peer = %from,
                        stale_key = %stale.key,
                        "Replacing unconsumed pending transfer"
                    );
                }
                Ok(())
            }
            NodeMessage::GetFile { key } => self.handle_get_file(from, &key).await,
            NodeMessage::DeleteFile { key } => self.handle_delete_file(from, &key).await,
            NodeMessage::PeerExchange { peers } => {
                debug!(peer = %from, count = peers.len(), "Received peer exchange");
                tokio::spawn(peer_exchange::discover_peers(Arc::clone(&self), peers));
                Ok(())
            }
        }
    }

    /// Consumes a stream body announced by the pending transfer for `from`.
    async fn handle_stream(
        &self,
        pending: &mut HashMap<String, PendingTransfer>,
        from: &str,
    ) -> Result<(), ServerError> {
        let peer = self.peers.get(from).map(|entry| entry.value().clone());

        let Some(transfer) = pending.remove(from) else {
            // No pending transfer: release the barrier regardless so the
            // read loop is not deadlocked. The unconsumed body will fail the
            // next framing read and drop the connection.
            if let Some(peer) = peer {
                peer.close_stream();
            }
            return Err(ServerError::PendingMismatch(from.to_string()));
        };

        let Some(peer) = peer else {
            return Err(ServerError::PendingMismatch(from.to_string()));
        };

        let result = {
            let mut reader = peer.reader().await;
            let mut body = (&mut *reader).take(transfer.size.max(0) as u64);
            self.store
                .write_encrypt(&self.encryption_key, &transfer.key, &mut body)
                .await
        };
        // Barrier release happens on every exit path, success or not.
        peer.close_stream();
        let written = result?;

        info!(
            peer = %from,
            key = %transfer.key,
            bytes = written,
            "Wrote replicated file to disk (encrypted)"
        );

        self.record_share(&transfer.key, from, "incoming").await;

        let waiter = self.downloads.lock().remove(&transfer.key);
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }

        Ok(())
    }

    /// Serves a `GetFile` request: control frame announcing the plaintext
    /// size, stream tag, then the decrypted content — all under one
    /// writer-lock acquisition so concurrent sends cannot interleave.
    async fn handle_get_file(&self, from: &str, key: &str) -> Result<(), ServerError> {
        debug!(peer = %from, key = %key, "Received request to serve file");

        let Some(peer) = self.peers.get(from).map(|e| e.value().clone()) else {
            return Err(ServerError::NotFound(format!(
                "peer {} not connected",
                from
            )));
        };

        if !self.store.has(key).await {
            return Err(ServerError::NotFound(key.to_string()));
        }

        if let Some(db) = &self.db {
            if let Ok(Some(row)) = db.find_file_by_hash(key).await {
                debug!(key = %key, name = %row.name, "Serving locally stored file");
            }
        }

        let (plaintext_size, mut content) =
            self.store.read_decrypt(&self.encryption_key, key).await?;

        let announce = NodeMessage::StoreFile {
            key: key.to_string(),
            size: plaintext_size as i64,
        }
        .encode()?;

        let mut writer = peer.writer().await;
        framing::write_message(&mut *writer, &announce).await?;
        framing::write_stream_tag(&mut *writer).await?;
        let sent = tokio::io::copy(&mut content, &mut *writer).await?;
        tokio::io::AsyncWriteExt::flush(&mut *writer).await?;
        drop(writer);

        info!(peer = %from, key = %key, bytes = sent, "Served file over the network");
        Ok(())
    }

    /// Applies a peer's delete hint: metadata failures WARN and the disk
    /// delete proceeds anyway — remote deletes are hints, local deletes are
    /// authoritative.
    async fn handle_delete_file(&self, from: &str, key: &str) -> Result<(), ServerError> {
        debug!(peer = %from, key = %key, "Received delete request");

        if let Some(db) = &self.db {
            if let Err(e) = db.delete_file(key).await {
                warn!(
                    key = %key,
                    error = %e,
                    "Metadata delete failed; continuing with disk delete"
                );
            }
        }

        if self.store.has(key).await {
            self.store.delete(key).await?;
            info!(peer = %from, key = %key, "Deleted file from local storage");
        } else {
            debug!(key = %key, "File not present locally, skipping delete");
        }

        Ok(())
    }

    /// Streams one full replication sequence to one peer.
    async fn stream_to_peer(
        &self,
        peer: &Peer,
        wire_key: &str,
        plaintext_size: i64,
    ) -> Result<u64, ServerError> {
        let announce = NodeMessage::StoreFile {
            key: wire_key.to_string(),
            size: plaintext_size,
        }
        .encode()?;

        // Each peer gets its own decrypting read of the local CAS; a slow or
        // failing peer cannot corrupt anyone else's stream.
        let (_, mut content) = self
            .store
            .read_decrypt(&self.encryption_key, wire_key)
            .await?;

        let mut writer = peer.writer().await;
        framing::write_message(&mut *writer, &announce).await?;
        framing::write_stream_tag(&mut *writer).await?;
        let sent = tokio::io::copy(&mut content, &mut *writer).await?;
        tokio::io::AsyncWriteExt::flush(&mut *writer).await?;

        Ok(sent)
    }

    /// Sends one control frame to every connected peer. The peers map is
    /// snapshotted first; no map entry is held across network I/O. Fails on
    /// the first send error.
    pub(crate) async fn broadcast(&self, msg: &NodeMessage) -> Result<(), ServerError> {
        let peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();

        for peer in peers {
            debug!(peer = %peer.remote_addr(), "Sending message to peer");
            peer.send_message(msg).await?;
        }
        Ok(())
    }

    /// Best-effort share bookkeeping; failures are logged, never surfaced.
    async fn record_share(&self, wire_key: &str, peer_addr: &str, direction: &str) {
        let Some(db) = &self.db else { return };
        let share = ShareRow {
            id: crypto::hash_key(&format!("{}{}{}", wire_key, peer_addr, direction)),
            file_id: wire_key.to_string(),
            peer_id: peer_addr.to_string(),
            direction: direction.to_string(),
        };
        if let Err(e) = db.insert_share(&share).await {
            warn!(file = %wire_key, peer = %peer_addr, error = %e, "Failed to record share");
        }
    }
}
