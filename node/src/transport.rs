//! TCP transport for the peer mesh.
//!
//! One listener, one dialer, one read loop per connection. Every decoded
//! frame lands on a single bounded channel the coordinator consumes; raw
//! stream bodies never pass through the channel.
//!
//! # Stream barrier
//!
//! The read loop and the coordinator share one socket. When the codec sees a
//! stream tag, the loop publishes a synthetic frame and then parks on the
//! peer's barrier; the coordinator locks the read half, drains exactly the
//! announced number of body bytes, and calls [`Peer::close_stream`]. Only
//! then does the loop decode the next frame. This is what lets the body be
//! consumed straight off the connection without racing the codec — and it is
//! why the read half is never wrapped in a buffered reader.

use common::framing::{self, Frame};
use common::{NodeMessage, WireError};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::FRAMES_CHANNEL_CAPACITY;
use crate::helpers::normalize_listen_addr;

/// A decoded frame tagged with its origin address.
#[derive(Debug)]
pub struct Rpc {
    pub from: String,
    pub payload: Vec<u8>,
    /// True for the synthetic frame announcing a raw stream body.
    pub stream: bool,
}

/// Connection-setup hook. The default is a no-op; returning an error drops
/// the peer before it is surfaced to the coordinator.
pub type HandshakeFn = Arc<dyn Fn(&Peer) -> anyhow::Result<()> + Send + Sync>;

/// Invoked once per established connection, before the read loop starts.
/// Returning an error drops the peer.
pub type OnPeerFn = Arc<dyn Fn(Peer) -> anyhow::Result<()> + Send + Sync>;

/// The no-op handshake.
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_| Ok(()))
}

/// Handle to one remote node over a live TCP connection.
///
/// Cloning is cheap; all clones share the connection halves and the stream
/// barrier.
#[derive(Clone)]
pub struct Peer {
    addr: Arc<str>,
    outbound: bool,
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    stream_done: Arc<Notify>,
}

impl Peer {
    fn from_stream(stream: TcpStream, outbound: bool) -> std::io::Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr: addr.into(),
            outbound,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            stream_done: Arc::new(Notify::new()),
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// True when this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Unbuffered write of raw bytes.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encodes and writes one complete control frame under a single
    /// writer-lock acquisition.
    pub async fn send_message(&self, msg: &NodeMessage) -> Result<(), WireError> {
        let payload = msg.encode()?;
        let mut writer = self.writer.lock().await;
        framing::write_message(&mut *writer, &payload).await
    }

    /// Exclusive access to the read half. Held by the coordinator while it
    /// drains a stream body; the read loop is parked on the barrier for the
    /// duration.
    pub async fn reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Exclusive access to the write half, for emitting a control frame and
    /// a stream body as one uninterrupted sequence.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Releases the read loop's stream barrier. Must be called exactly once
    /// per received stream frame, on every exit path. Safe to call before
    /// the loop reaches the barrier (the permit is stored).
    pub fn close_stream(&self) {
        self.stream_done.notify_one();
    }

    /// Shuts down the connection.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Transport construction options.
pub struct TcpTransportOpts {
    /// Listen address; a bare `:port` binds all interfaces.
    pub listen_addr: String,
    pub handshake: HandshakeFn,
}

/// TCP transport: listener, dialer, and the shared frames channel. Cloning
/// shares the transport.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    opts: TcpTransportOpts,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    on_peer: OnceLock<OnPeerFn>,
    bound_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(FRAMES_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TransportInner {
                opts,
                rpc_tx,
                rpc_rx: Mutex::new(Some(rpc_rx)),
                on_peer: OnceLock::new(),
                bound_addr: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers the coordinator callback. Later registrations are ignored.
    pub fn set_on_peer(&self, callback: OnPeerFn) {
        let _ = self.inner.on_peer.set(callback);
    }

    /// The node's own address: the actual bound address once listening,
    /// otherwise the configured one.
    pub fn address(&self) -> String {
        match self.inner.bound_addr.get() {
            Some(addr) => addr.to_string(),
            None => self.inner.opts.listen_addr.clone(),
        }
    }

    /// Takes the consuming end of the frames channel. Yields `None` on the
    /// second call.
    pub async fn take_receiver(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.inner.rpc_rx.lock().await.take()
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn listen_and_accept(&self) -> anyhow::Result<()> {
        let addr = normalize_listen_addr(&self.inner.opts.listen_addr);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        let _ = self.inner.bound_addr.set(local);
        info!(addr = %local, "Listening on TCP");

        let transport = self.clone();
        tokio::spawn(transport.accept_loop(listener));
        Ok(())
    }

    /// Dials `addr` and hands the connection to a read loop.
    pub async fn dial(&self, addr: &str) -> anyhow::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        debug!(remote = %addr, "Dialed outbound connection");

        let transport = self.clone();
        tokio::spawn(transport.handle_conn(stream, true));
        Ok(())
    }

    /// Shuts down the accept loop and every per-connection read loop.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    debug!("Accept loop shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "New inbound connection");
                        let transport = self.clone();
                        tokio::spawn(transport.handle_conn(stream, false));
                    }
                    Err(e) => warn!(error = %e, "TCP accept error"),
                }
            }
        }
    }

    async fn handle_conn(self, stream: TcpStream, outbound: bool) {
        let peer = match Peer::from_stream(stream, outbound) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Failed to set up connection");
                return;
            }
        };
        let addr = peer.remote_addr().to_string();

        if let Err(e) = (self.inner.opts.handshake)(&peer) {
            warn!(peer = %addr, error = %e, "Handshake failed, dropping peer");
            peer.close().await;
            return;
        }

        if let Some(on_peer) = self.inner.on_peer.get() {
            if let Err(e) = on_peer(peer.clone()) {
                warn!(peer = %addr, error = %e, "Peer callback rejected connection");
                peer.close().await;
                return;
            }
        }

        match self.read_loop(&peer).await {
            Ok(()) => debug!(peer = %addr, "Connection closed"),
            Err(e) if e.is_disconnect() => debug!(peer = %addr, "Peer disconnected"),
            Err(e) => warn!(peer = %addr, error = %e, "Dropping peer connection"),
        }
        peer.close().await;
    }

    /// Decodes frames until the connection dies or the transport shuts down.
    async fn read_loop(&self, peer: &Peer) -> Result<(), WireError> {
        let from = peer.remote_addr().to_string();
        loop {
            let frame = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                frame = async {
                    let mut reader = peer.reader().await;
                    framing::read_frame(&mut *reader).await
                } => frame?,
            };

            match frame {
                Frame::Stream => {
                    let rpc = Rpc {
                        from: from.clone(),
                        payload: Vec::new(),
                        stream: true,
                    };
                    if self.inner.rpc_tx.send(rpc).await.is_err() {
                        return Ok(());
                    }
                    // Barrier: the consumer drains the body off the raw
                    // connection and signals completion.
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return Ok(()),
                        _ = peer.stream_done.notified() => {}
                    }
                }
                Frame::Message(payload) => {
                    let rpc = Rpc {
                        from: from.clone(),
                        payload,
                        stream: false,
                    };
                    if self.inner.rpc_tx.send(rpc).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::framing::{INCOMING_MESSAGE, INCOMING_STREAM};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        transport: TcpTransport,
        rpc_rx: mpsc::Receiver<Rpc>,
        peer_rx: mpsc::UnboundedReceiver<Peer>,
        addr: String,
    }

    async fn harness_with_handshake(handshake: HandshakeFn) -> Harness {
        let transport = TcpTransport::new(TcpTransportOpts {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake,
        });
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        transport.set_on_peer(Arc::new(move |peer| {
            peer_tx
                .send(peer)
                .map_err(|_| anyhow::anyhow!("harness gone"))
        }));
        transport.listen_and_accept().await.unwrap();
        let rpc_rx = transport.take_receiver().await.unwrap();
        let addr = transport.address();
        Harness {
            transport,
            rpc_rx,
            peer_rx,
            addr,
        }
    }

    async fn harness() -> Harness {
        harness_with_handshake(nop_handshake()).await
    }

    fn message_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![INCOMING_MESSAGE];
        frame.extend_from_slice(&(payload.len() as i64).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn frames_are_published_in_order() {
        let mut h = harness().await;

        let mut client = TcpStream::connect(&h.addr).await.unwrap();
        client.write_all(&message_frame(b"first")).await.unwrap();
        client.write_all(&message_frame(b"second")).await.unwrap();

        let rpc = h.rpc_rx.recv().await.unwrap();
        assert!(!rpc.stream);
        assert_eq!(rpc.payload, b"first");

        let rpc = h.rpc_rx.recv().await.unwrap();
        assert_eq!(rpc.payload, b"second");

        h.transport.close();
    }

    #[tokio::test]
    async fn stream_barrier_serializes_control_and_body() {
        let mut h = harness().await;

        let mut client = TcpStream::connect(&h.addr).await.unwrap();
        let peer = h.peer_rx.recv().await.unwrap();

        // Control frame, stream tag + 5-byte body, then another control
        // frame, all written back to back.
        client.write_all(&message_frame(b"announce")).await.unwrap();
        client.write_all(&[INCOMING_STREAM]).await.unwrap();
        client.write_all(b"12345").await.unwrap();
        client.write_all(&message_frame(b"after")).await.unwrap();

        let rpc = h.rpc_rx.recv().await.unwrap();
        assert_eq!(rpc.payload, b"announce");

        let rpc = h.rpc_rx.recv().await.unwrap();
        assert!(rpc.stream);
        assert_eq!(rpc.from, peer.remote_addr());

        // The decoder must be parked: the trailing control frame may not
        // surface while the barrier is held.
        let parked = tokio::time::timeout(Duration::from_millis(200), h.rpc_rx.recv()).await;
        assert!(parked.is_err(), "read loop must wait for close_stream");

        // Drain the body directly off the connection, then release.
        {
            let mut reader = peer.reader().await;
            let mut body = [0u8; 5];
            reader.read_exact(&mut body).await.unwrap();
            assert_eq!(&body, b"12345");
        }
        peer.close_stream();

        let rpc = h.rpc_rx.recv().await.unwrap();
        assert!(!rpc.stream);
        assert_eq!(rpc.payload, b"after");

        h.transport.close();
    }

    #[tokio::test]
    async fn close_stream_before_barrier_wait_is_not_lost() {
        let mut h = harness().await;

        let mut client = TcpStream::connect(&h.addr).await.unwrap();
        let peer = h.peer_rx.recv().await.unwrap();

        client.write_all(&[INCOMING_STREAM]).await.unwrap();
        let rpc = h.rpc_rx.recv().await.unwrap();
        assert!(rpc.stream);

        // Signal completion immediately (empty body). The stored permit must
        // let the loop continue even if it had not reached the barrier yet.
        peer.close_stream();

        client.write_all(&message_frame(b"next")).await.unwrap();
        let rpc = tokio::time::timeout(Duration::from_secs(1), h.rpc_rx.recv())
            .await
            .expect("read loop must resume after close_stream")
            .unwrap();
        assert_eq!(rpc.payload, b"next");

        h.transport.close();
    }

    #[tokio::test]
    async fn bad_tag_drops_the_connection() {
        let mut h = harness().await;

        let mut client = TcpStream::connect(&h.addr).await.unwrap();
        let _peer = h.peer_rx.recv().await.unwrap();

        client.write_all(&[0x7f]).await.unwrap();

        // The transport closes its side; the client observes EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("expected the transport to close the connection")
            .unwrap();
        assert_eq!(n, 0);

        h.transport.close();
    }

    #[tokio::test]
    async fn handshake_failure_drops_peer_before_callback() {
        let mut h =
            harness_with_handshake(Arc::new(|_| anyhow::bail!("rejected by handshake"))).await;

        let mut client = TcpStream::connect(&h.addr).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("expected the transport to close the connection")
            .unwrap();
        assert_eq!(n, 0);

        assert!(
            h.peer_rx.try_recv().is_err(),
            "on_peer must not run after a failed handshake"
        );

        h.transport.close();
    }

    #[tokio::test]
    async fn dial_surfaces_peer_through_callback() {
        let mut listening = harness().await;
        let mut dialing = harness().await;

        dialing.transport.dial(&listening.addr).await.unwrap();

        let outbound = tokio::time::timeout(Duration::from_secs(2), dialing.peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outbound.is_outbound());
        assert_eq!(outbound.remote_addr(), listening.addr);

        let inbound = tokio::time::timeout(Duration::from_secs(2), listening.peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!inbound.is_outbound());

        listening.transport.close();
        dialing.transport.close();
    }

    #[tokio::test]
    async fn send_message_roundtrips_through_remote_decoder() {
        let mut listening = harness().await;
        let mut dialing = harness().await;

        dialing.transport.dial(&listening.addr).await.unwrap();
        let peer = dialing.peer_rx.recv().await.unwrap();

        peer.send_message(&NodeMessage::GetFile {
            key: "cafebabe".to_string(),
        })
        .await
        .unwrap();

        let rpc = tokio::time::timeout(Duration::from_secs(2), listening.rpc_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!rpc.stream);
        match NodeMessage::decode(&rpc.payload).unwrap() {
            NodeMessage::GetFile { key } => assert_eq!(key, "cafebabe"),
            other => panic!("unexpected message: {:?}", other),
        }

        listening.transport.close();
        dialing.transport.close();
    }
}
