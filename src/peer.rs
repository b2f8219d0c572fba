use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, mpsc},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::ApplicationError,
    manager::PieceManager,
    protocol::{HANDSHAKE_LEN, Handshake, Message, MessageCodec, PeerId},
    queue::PeerQueue,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// The piece manager as shared by all connections
pub type SharedManager = Arc<Mutex<PieceManager>>;

/// Notifications sent by connections to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    BlockRetrieved {
        peer_id: PeerId,
        piece:   usize,
        offset:  u32,
        length:  usize,
    },
}

/// Choke and interest flags of one connection, seen from both ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub remote_id:         PeerId,
    /// We told the peer we want its pieces
    pub local_interested:  bool,
    /// The peer refuses our requests
    pub local_choked:      bool,
    pub remote_interested: bool,
    pub remote_choked:     bool,
    /// A request of ours is waiting for its piece
    pub pending_request:   bool,
}

impl ConnectionState {
    pub fn new(remote_id: PeerId) -> Self {
        Self {
            remote_id,
            local_interested: false,
            local_choked: true,
            remote_interested: false,
            remote_choked: true,
            pending_request: false,
        }
    }

    pub fn can_request(&self) -> bool {
        self.local_interested && !self.local_choked && !self.pending_request
    }
}

/// Protocol logic of a single connection, independent of the socket.
///
/// Every incoming message goes through [`PeerSession::handle`], which
/// updates the connection state, talks to the piece manager and returns the
/// request to send next, if any.
pub struct PeerSession {
    state:   ConnectionState,
    manager: SharedManager,
    events:  mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSession {
    /// Registers the connection with the piece manager. A peer id that is
    /// already connected is refused, since availability and pending blocks
    /// are tracked per id.
    pub async fn open(
        remote_id: PeerId,
        manager: SharedManager,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, ApplicationError> {
        if !manager.lock().await.connect_peer(remote_id) {
            return Err(ApplicationError::ProtocolError(format!(
                "peer id {} is already connected",
                String::from_utf8_lossy(&remote_id)
            )));
        }

        Ok(Self {
            state: ConnectionState::new(remote_id),
            manager,
            events,
        })
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The message declaring our interest, sent right after the handshake
    pub fn interested(&mut self) -> Message {
        self.state.local_interested = true;
        Message::Interested
    }

    pub async fn handle(&mut self, message: Message) -> Result<Option<Message>, ApplicationError> {
        let remote_id = self.state.remote_id;

        match message {
            Message::Bitfield(bitfield) => {
                self.manager.lock().await.add_peer(remote_id, &bitfield);
            }
            Message::Have(index) => {
                self.manager.lock().await.update_peer(remote_id, index as usize);
            }
            Message::Choke => {
                self.state.local_choked = true;
                // a choking peer drops the requests it was sent
                self.state.pending_request = false;
                self.manager.lock().await.release_peer(&remote_id);
            }
            Message::Unchoke => self.state.local_choked = false,
            Message::Interested => self.state.remote_interested = true,
            Message::NotInterested => self.state.remote_interested = false,
            Message::Piece {
                index,
                begin,
                block,
            } => {
                self.state.pending_request = false;
                let length = block.len();
                self.manager
                    .lock()
                    .await
                    .block_received(remote_id, index as usize, begin, block)?;
                let _ = self.events.send(PeerEvent::BlockRetrieved {
                    peer_id: remote_id,
                    piece: index as usize,
                    offset: begin,
                    length,
                });
            }
            Message::Request { .. } | Message::Cancel { .. } => {
                debug!("ignoring upload message, uploading is not supported");
            }
            Message::KeepAlive | Message::Port(_) => {}
        }

        if !self.state.can_request() {
            return Ok(None);
        }

        let Some(block) = self.manager.lock().await.next_request(remote_id) else {
            return Ok(None);
        };
        self.state.pending_request = true;
        debug!(
            piece = block.piece,
            offset = block.offset,
            length = block.length,
            "requesting block"
        );
        Ok(Some(Message::Request {
            index:  block.piece as u32,
            begin:  block.offset,
            length: block.length,
        }))
    }

    /// Gives the peer's pending blocks back and forgets its availability
    pub async fn close(&self) {
        self.manager.lock().await.remove_peer(&self.state.remote_id);
    }
}

/// Manages the connection to a peer once the handshake went through
pub struct PeerConnection<S = TcpStream> {
    framed:    Framed<S, MessageCodec>,
    remote_id: PeerId,
}

impl PeerConnection<TcpStream> {
    pub async fn connect(
        peer:      &Peer,
        info_hash: [u8; 20],
        peer_id:   PeerId,
        config:    &Config,
    ) -> Result<Self, ApplicationError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(peer.addr()))
            .await
            .map_err(|_| ApplicationError::timed_out("connect"))??;
        debug!(%peer, "connection open");

        Self::handshake(stream, info_hash, peer_id, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchanges handshakes over `stream` and checks the peer serves
    /// `info_hash`. Whatever the peer sent after its handshake is kept for
    /// the message loop.
    pub async fn handshake(
        mut stream: S,
        info_hash:  [u8; 20],
        peer_id:    PeerId,
        config:     &Config,
    ) -> Result<Self, ApplicationError> {
        stream
            .write_all(&Handshake::new(info_hash, peer_id).encode())
            .await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(1024);
        let mut attempts = 0;
        while buf.len() < HANDSHAKE_LEN {
            if attempts == config.handshake_attempts {
                return Err(ApplicationError::ProtocolError(format!(
                    "no handshake after {} reads",
                    attempts
                )));
            }
            attempts += 1;

            let read = timeout(config.read_timeout, stream.read_buf(&mut buf))
                .await
                .map_err(|_| ApplicationError::timed_out("handshake"))??;
            if read == 0 {
                return Err(ApplicationError::TransportError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
        }

        let handshake = Handshake::decode(&buf).ok_or_else(|| {
            ApplicationError::ProtocolError("unable to receive and parse a handshake".into())
        })?;
        if handshake.info_hash != info_hash {
            return Err(ApplicationError::ProtocolError(
                "handshake with invalid info_hash".into(),
            ));
        }
        buf.advance(HANDSHAKE_LEN);

        let mut parts = FramedParts::new::<Message>(stream, MessageCodec);
        parts.read_buf = buf;

        Ok(Self {
            framed:    Framed::from_parts(parts),
            remote_id: handshake.peer_id,
        })
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    async fn send(&mut self, message: Message, limit: Duration) -> Result<(), ApplicationError> {
        timeout(limit, self.framed.send(message))
            .await
            .map_err(|_| ApplicationError::timed_out("peer write"))?
    }

    /// Declares interest and then serves incoming messages until the peer
    /// hangs up, goes silent for `read_timeout`, misbehaves, or `stop` fires.
    /// Stopping interrupts pending reads and writes alike.
    pub async fn run(
        &mut self,
        session:      &mut PeerSession,
        read_timeout: Duration,
        stop:         &CancellationToken,
    ) -> Result<(), ApplicationError> {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Ok(()),
            result = self.exchange(session, read_timeout) => result,
        }
    }

    async fn exchange(
        &mut self,
        session:      &mut PeerSession,
        read_timeout: Duration,
    ) -> Result<(), ApplicationError> {
        let interested = session.interested();
        self.send(interested, read_timeout).await?;

        loop {
            let message = match timeout(read_timeout, self.framed.next()).await {
                Err(_) => return Err(ApplicationError::timed_out("peer read")),
                Ok(None) => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
                Ok(Some(message)) => message?,
            };

            if let Some(request) = session.handle(message).await? {
                self.send(request, read_timeout).await?;
            }
        }
    }

    pub async fn close(mut self) {
        match timeout(CLOSE_TIMEOUT, self.framed.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "error while closing connection"),
            Err(_) => debug!("timed out closing connection"),
        }
    }
}

/// What the workers of a client share
#[derive(Clone)]
pub struct WorkerContext {
    pub queue:     Arc<PeerQueue>,
    pub manager:   SharedManager,
    pub events:    mpsc::UnboundedSender<PeerEvent>,
    pub info_hash: [u8; 20],
    pub peer_id:   PeerId,
    pub config:    Arc<Config>,
    pub stop:      CancellationToken,
}

/// One connection slot of the client.
///
/// Takes addresses from the queue and serves them one after the other until
/// `stop` fires. Failures of a peer only end that peer; any other error ends
/// the worker and is returned.
pub async fn run_worker(worker: usize, ctx: WorkerContext) -> Result<(), ApplicationError> {
    loop {
        let ticket = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return Ok(()),
            ticket = ctx.queue.pop() => ticket,
        };
        let peer = ticket.peer().clone();
        debug!(worker, %peer, "got assigned peer");

        let result = serve_peer(&ctx, &peer).await;
        drop(ticket);

        match result {
            Ok(()) => debug!(worker, %peer, "peer done"),
            Err(e) if e.is_peer_local() => warn!(worker, %peer, error = %e, "dropping peer"),
            Err(e) => {
                error!(worker, %peer, error = %e, "worker failed");
                return Err(e);
            }
        }
    }
}

async fn serve_peer(ctx: &WorkerContext, peer: &Peer) -> Result<(), ApplicationError> {
    let connect = PeerConnection::connect(peer, ctx.info_hash, ctx.peer_id, &ctx.config);
    let mut conn = tokio::select! {
        biased;
        _ = ctx.stop.cancelled() => return Ok(()),
        conn = connect => conn?,
    };
    info!(%peer, remote = %String::from_utf8_lossy(&conn.remote_id()), "handshake with peer was successful");

    let session = PeerSession::open(conn.remote_id(), Arc::clone(&ctx.manager), ctx.events.clone()).await;
    let mut session = match session {
        Ok(session) => session,
        Err(e) => {
            conn.close().await;
            return Err(e);
        }
    };
    let result = conn.run(&mut session, ctx.config.read_timeout, &ctx.stop).await;

    session.close().await;
    // a stopped worker does not wait for the peer to drain its socket
    if !ctx.stop.is_cancelled() {
        conn.close().await;
    }
    result
}
