//! TCP transport
//!
//! Each link is one TCP stream carrying length-prefixed frames. The first
//! frame in each direction is a handshake holding the sender's peer id, so
//! the accepting side can attribute inbound links.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::error::NetworkError;
use super::transport::{
    ConnectionHandle, IceConfig, Transport, TransportEvent, TransportEventSender, TransportState,
};
use crate::protocol::PeerId;

/// Largest frame accepted from a remote peer
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Time allowed per candidate address
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Time allowed for the remote handshake frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Links = Arc<Mutex<HashMap<ConnectionHandle, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Shared state cloned into every link task
#[derive(Clone)]
struct Shared {
    local: PeerId,
    events: TransportEventSender,
    links: Links,
    next_handle: Arc<AtomicU64>,
}

impl Shared {
    fn allocate(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn emit_state(&self, handle: ConnectionHandle, peer: &PeerId, state: TransportState) {
        let _ = self.events.send(TransportEvent::StateChanged {
            handle,
            peer: peer.clone(),
            state,
        });
    }
}

/// Transport over direct TCP streams
pub struct TcpTransport {
    shared: Shared,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind a listener and start accepting inbound links
    pub async fn bind(
        addr: SocketAddr,
        local: PeerId,
        events: TransportEventSender,
    ) -> Result<Self, NetworkError> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!("TCP transport for {} listening on {}", local, local_addr);

        let shared = Shared {
            local,
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
        };
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.shared.local
    }

    /// Number of links with a running writer
    pub fn link_count(&self) -> usize {
        self.shared.links.lock().len()
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, peer: &PeerId, ice: &IceConfig) -> Result<ConnectionHandle, NetworkError> {
        if ice.candidates.is_empty() {
            return Err(NetworkError::NoCandidates(peer.clone()));
        }

        let handle = self.shared.allocate();
        let shared = self.shared.clone();
        let peer = peer.clone();
        let candidates = ice.candidates.clone();

        shared.emit_state(handle, &peer, TransportState::Connecting);
        tokio::spawn(async move {
            match connect_any(&candidates).await {
                Some(stream) => {
                    if let Err(e) = run_link(stream, handle, Some(peer.clone()), shared.clone()).await {
                        warn!("Handshake with {} failed: {}", peer, e);
                        shared.emit_state(handle, &peer, TransportState::Failed);
                    }
                }
                None => {
                    warn!("Could not reach {} at any of {:?}", peer, candidates);
                    shared.emit_state(handle, &peer, TransportState::Failed);
                }
            }
        });

        Ok(handle)
    }

    fn send(&mut self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), NetworkError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(bytes.len()));
        }
        let links = self.shared.links.lock();
        let writer = links.get(&handle).ok_or(NetworkError::NotConnected)?;
        writer.send(bytes).map_err(|_| NetworkError::NotConnected)
    }

    fn close(&mut self, handle: ConnectionHandle) {
        // Dropping the writer sender shuts the stream down
        if self.shared.links.lock().remove(&handle).is_some() {
            debug!("Closing link {}", handle);
        }
    }

    fn needs_candidates(&self) -> bool {
        true
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.shared.links.lock().clear();
    }
}

async fn accept_loop(listener: TcpListener, shared: Shared) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                debug!("Inbound TCP link from {}", remote_addr);
                let handle = shared.allocate();
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_link(stream, handle, None, shared).await {
                        debug!("Inbound handshake from {} failed: {}", remote_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

async fn connect_any(candidates: &[SocketAddr]) -> Option<TcpStream> {
    for addr in candidates {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => debug!("Connect to {} failed: {}", addr, e),
            Err(_) => debug!("Connect to {} timed out", addr),
        }
    }
    None
}

/// Drive one established stream until either side ends it
///
/// `expected` is the peer we dialed; inbound links learn the peer from
/// the handshake. Errors are only returned before the link is open.
async fn run_link(
    stream: TcpStream,
    handle: ConnectionHandle,
    expected: Option<PeerId>,
    shared: Shared,
) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    write_frame(&mut writer, shared.local.as_str().as_bytes()).await?;
    let remote = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => String::from_utf8(frame)
            .map(PeerId::from)
            .map_err(|_| NetworkError::Handshake("peer id is not UTF-8".to_string())),
        Ok(Ok(None)) => Err(NetworkError::Handshake("closed during handshake".to_string())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(NetworkError::ConnectionTimeout),
    };

    let remote = remote?;
    if let Some(expected) = expected {
        if remote != expected {
            return Err(NetworkError::Handshake(format!(
                "expected {}, got {}",
                expected, remote
            )));
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    shared.links.lock().insert(handle, tx);
    shared.emit_state(handle, &remote, TransportState::Open);
    info!("Link {} to {} open", handle, remote);

    let mut writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("Write failed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // The writer finishes when `close` drops its sender or a write fails
    let outcome = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(bytes)) => {
                        trace!("{} <- {}: {} bytes", shared.local, remote, bytes.len());
                        let _ = shared.events.send(TransportEvent::Message {
                            handle,
                            peer: remote.clone(),
                            bytes,
                        });
                    }
                    Ok(None) => break TransportState::Closed,
                    Err(e) => {
                        debug!("Read from {} failed: {}", remote, e);
                        break TransportState::Failed;
                    }
                }
            }
            _ = &mut writer_task => break TransportState::Closed,
        }
    };

    shared.links.lock().remove(&handle);
    writer_task.abort();
    shared.emit_state(handle, &remote, outcome);
    info!("Link {} to {} {:?}", handle, remote, outcome);
    Ok(())
}

async fn write_frame(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), NetworkError> {
    let len = u32::try_from(bytes.len()).map_err(|_| NetworkError::FrameTooLarge(bytes.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means a clean end of stream.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>, NetworkError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
