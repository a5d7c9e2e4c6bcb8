//! TCP transport.
//!
//! Frame format on the stream: `[length:4][bytes:N]`, length little-endian.
//! The first frame in each direction is the sender's peer id (handshake).
//!
//! Each connection gets a writer task fed by an unbounded queue and a
//! reader task forwarding frames to the session's inbound channel, so frames
//! from one peer arrive in the order they were sent. When the stream ends the
//! reader reports the peer as disconnected.

use crate::error::TransportError;
use crate::id::PeerId;
use crate::messaging::MAX_MESSAGE_SIZE;
use crate::transport::{InboundFrame, Link, LinkEvent, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest frame accepted on a stream.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

struct Shared {
    id: PeerId,
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Shared {
    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        if self.closed.load(Ordering::Acquire) {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.peers().clear();
    }
}

/// Transport over TCP streams.
pub struct TcpTransport {
    shared: Arc<Shared>,
    bound: Vec<String>,
}

impl TcpTransport {
    /// Bind every listener, then dial every peer.
    ///
    /// Returns once each dialed peer completed its handshake. Listener
    /// addresses may use port 0; [`locators`](Transport::locators) reports
    /// the bound ports.
    ///
    /// # Errors
    ///
    /// - `TransportError::AddressInUse` if a listener cannot bind
    /// - `TransportError::Unreachable` if a peer cannot be dialed
    /// - `TransportError::Handshake` if a peer does not identify itself
    pub async fn open(id: PeerId, listeners: &[String], peers: &[String]) -> Result<Link, TransportError> {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            peers: Mutex::new(HashMap::new()),
            inbound,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        match Self::start(&shared, listeners, peers).await {
            Ok(bound) => Ok(Link {
                transport: Arc::new(TcpTransport { shared, bound }),
                inbound: receiver,
            }),
            Err(e) => {
                shared.shutdown();
                Err(e)
            }
        }
    }

    async fn start(shared: &Arc<Shared>, listeners: &[String], peers: &[String]) -> Result<Vec<String>, TransportError> {
        let mut bound = Vec::with_capacity(listeners.len());
        for addr in listeners {
            let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    TransportError::AddressInUse(format!("tcp/{}", addr))
                } else {
                    TransportError::Io(e)
                }
            })?;
            let local = listener.local_addr()?;
            tracing::info!(peer = %shared.id, addr = %local, "listening");
            bound.push(format!("tcp/{}", local));
            shared.track(tokio::spawn(accept_loop(listener, shared.clone())));
        }

        for addr in peers {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| TransportError::Unreachable(format!("tcp/{}: {}", addr, e)))?;
            let remote = attach(stream, shared.clone()).await?;
            tracing::info!(peer = %shared.id, remote = %remote, addr = %addr, "connected");
        }
        Ok(bound)
    }
}

impl Transport for TcpTransport {
    fn local_id(&self) -> &PeerId {
        &self.shared.id
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.peers().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let peers = self.shared.peers();
        let writer = peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        writer
            .send(frame)
            .map_err(|_| TransportError::UnknownPeer(peer.clone()))
    }

    fn close(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        self.shared.shutdown();
        tracing::debug!(peer = %self.shared.id, "tcp transport closed");
    }

    fn locators(&self) -> Vec<String> {
        self.bound.clone()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let attaching = shared.clone();
                shared.track(tokio::spawn(async move {
                    match attach(stream, attaching.clone()).await {
                        Ok(remote) => {
                            tracing::info!(peer = %attaching.id, remote = %remote, %addr, "accepted");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %attaching.id, %addr, error = %e, "rejected connection");
                        }
                    }
                }));
            }
            Err(e) => {
                tracing::warn!(peer = %shared.id, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Handshake on a fresh stream and start its reader and writer tasks.
async fn attach(stream: TcpStream, shared: Arc<Shared>) -> Result<PeerId, TransportError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        write_frame(&mut writer, shared.id.as_str().as_bytes()).await?;
        let raw = read_frame(&mut reader).await?;
        let text = String::from_utf8(raw)
            .map_err(|_| TransportError::Handshake("peer id is not UTF-8".to_string()))?;
        PeerId::new(text).map_err(|e| TransportError::Handshake(e.to_string()))
    })
    .await
    .map_err(|_| TransportError::Handshake("timed out".to_string()))??;

    if remote == shared.id {
        return Err(TransportError::Handshake("connected to self".to_string()));
    }

    let (queue, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut peers = shared.peers();
        if shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if peers.contains_key(&remote) {
            return Err(TransportError::DuplicatePeer(remote));
        }
        peers.insert(remote.clone(), queue.clone());
    }

    let writer_peer = remote.clone();
    shared.track(tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!(remote = %writer_peer, error = %e, "write failed, dropping link");
                break;
            }
        }
    }));

    let reader_peer = remote.clone();
    let reader_shared = shared.clone();
    shared.track(tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(bytes) => {
                    let frame = InboundFrame {
                        from: reader_peer.clone(),
                        bytes,
                    };
                    if reader_shared.inbound.send(LinkEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(remote = %reader_peer, error = %e, "link closed");
                    break;
                }
            }
        }
        let removed = {
            let mut peers = reader_shared.peers();
            let owned = peers.get(&reader_peer).is_some_and(|q| q.same_channel(&queue));
            owned && peers.remove(&reader_peer).is_some()
        };
        if removed {
            let _ = reader_shared.inbound.send(LinkEvent::Disconnected(reader_peer));
        }
    }));

    Ok(remote)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        })?;
    writer.write_u32_le(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}
