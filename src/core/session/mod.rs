//! Peer sessions.
//!
//! A session is an actor owning its socket: a reader task that drives the
//! handshake and decodes inbound traffic into [`SessionEvent`]s, and a
//! writer task that owns the sink and is the only place outgoing bytes are
//! produced, which totally orders the outgoing stream. The torrent pipeline
//! holds a [`SessionHandle`] (a bounded command channel plus shared
//! counters) and never touches the socket.
//!
//! Lifecycle: `Connecting` → `HandshakeSent` → `HandshakeReceived` →
//! `Active` → `Closed`. Any protocol violation, I/O error or idle timeout
//! short-circuits to `Closed`; exactly one [`SessionEventKind::Closed`] is
//! emitted per session.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use riptide_primitives::{Bitfield, InfoHash, PeerId};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::rate_limiter::RateLimiterPair;
use crate::discovery::pex::PexMessage;
use crate::protocol::extended::{ExtendedHandshake, HANDSHAKE_EXT_ID, LOCAL_UT_PEX_ID};
use crate::protocol::handshake::{self, Handshake};
use crate::protocol::message::{BlockInfo, Message, MessageCodec};
use crate::protocol::WireError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Commands a torrent pipeline can issue to a session.
#[derive(Debug)]
pub enum SessionCommand {
    Send(Message),
    Close,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ConnectFailed,
    BadHandshake,
    InfoHashMismatch,
    ProtocolViolation(&'static str),
    Oversized,
    FloodedRequests,
    IdleTimeout,
    SocketClosed,
    Shutdown,
}

impl CloseReason {
    /// Whether this closure counts against the torrent's error counter.
    #[must_use]
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::BadHandshake
                | CloseReason::InfoHashMismatch
                | CloseReason::ProtocolViolation(_)
                | CloseReason::Oversized
                | CloseReason::FloodedRequests
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ConnectFailed => write!(f, "connect failed"),
            CloseReason::BadHandshake => write!(f, "bad handshake"),
            CloseReason::InfoHashMismatch => write!(f, "info-hash mismatch"),
            CloseReason::ProtocolViolation(what) => write!(f, "protocol violation: {what}"),
            CloseReason::Oversized => write!(f, "oversized frame"),
            CloseReason::FloodedRequests => write!(f, "request queue flooded"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::SocketClosed => write!(f, "socket closed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// What a session reports back to its torrent pipeline.
#[derive(Debug)]
pub enum SessionEventKind {
    /// Handshake completed; the session is `Active`.
    Connected { peer_id: PeerId, supports_extended: bool },
    /// The remote's extended handshake arrived.
    ExtendedHandshake(ExtendedHandshake),
    /// The remote's initial bitfield, already validated against the piece
    /// count.
    BitfieldReceived(Bitfield),
    Have { piece: u32 },
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    BlockReceived { block: BlockInfo, data: Bytes },
    RequestReceived(BlockInfo),
    CancelReceived(BlockInfo),
    /// Peers learned through `ut_pex`.
    PexPeers(Vec<SocketAddr>),
    /// Terminal. Emitted exactly once.
    Closed { reason: CloseReason },
}

#[derive(Debug)]
pub struct SessionEvent {
    pub addr: SocketAddr,
    pub kind: SessionEventKind,
}

/// Counters and identity shared between the session tasks and the pipeline.
#[derive(Debug, Default)]
pub struct SessionShared {
    pub peer_id: OnceLock<PeerId>,
    /// Payload bytes received in `piece` frames.
    pub bytes_in: AtomicU64,
    /// Payload bytes sent in `piece` frames.
    pub bytes_out: AtomicU64,
}

/// The pipeline's grip on a session.
#[derive(Debug)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    pub cmd: mpsc::Sender<SessionCommand>,
    pub shared: Arc<SessionShared>,
    pub cancel: CancellationToken,
}

impl SessionHandle {
    /// Queue a message without blocking the pipeline; a full queue drops
    /// the message, which is safe because every message here is either
    /// regenerated (requests time out) or advisory.
    pub fn send(&self, message: Message) {
        let _ = self.cmd.try_send(SessionCommand::Send(message));
    }

    /// Ask the session to close and cancel its tasks.
    pub fn close(&self) {
        let _ = self.cmd.try_send(SessionCommand::Close);
        self.cancel.cancel();
    }
}

/// Everything a session needs from its torrent, fixed at spawn time.
#[derive(Clone)]
pub struct SessionArgs {
    pub info_hash: InfoHash,
    pub our_peer_id: PeerId,
    pub piece_count: usize,
    /// Our verified bitfield at spawn time, wire form. Not sent when empty.
    pub initial_bitfield: Vec<u8>,
    pub listen_port: u16,
    pub max_queued_requests: usize,
    pub events: mpsc::Sender<SessionEvent>,
    pub global_rate: Arc<RateLimiterPair>,
    pub torrent_rate: Arc<RateLimiterPair>,
    /// Session-scoped token, a child of the torrent's.
    pub cancel: CancellationToken,
}

const COMMAND_QUEUE_DEPTH: usize = 512;

/// Dial `addr` and run the session. Returns immediately with the handle.
pub fn spawn_outbound(args: SessionArgs, addr: SocketAddr) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let handle = SessionHandle {
        addr,
        cmd: cmd_tx.clone(),
        shared: Arc::new(SessionShared::default()),
        cancel: args.cancel.clone(),
    };

    let shared = Arc::clone(&handle.shared);
    tokio::spawn(async move {
        let events = args.events.clone();
        let reason = match establish_outbound(&args, addr).await {
            Ok((stream, remote)) => run_active(&args, addr, &shared, stream, &remote, cmd_tx, cmd_rx).await,
            Err(reason) => reason,
        };
        let _ = events.send(SessionEvent { addr, kind: SessionEventKind::Closed { reason } }).await;
    });

    handle
}

/// Run a session over a connection accepted by the engine listener. The
/// remote handshake has already been read and routed by info-hash; we still
/// owe our own handshake.
pub fn spawn_inbound(args: SessionArgs, addr: SocketAddr, stream: TcpStream, remote: Handshake) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let handle = SessionHandle {
        addr,
        cmd: cmd_tx.clone(),
        shared: Arc::new(SessionShared::default()),
        cancel: args.cancel.clone(),
    };

    let shared = Arc::clone(&handle.shared);
    tokio::spawn(async move {
        let events = args.events.clone();
        let mut stream = stream;
        let our_handshake = Handshake::new(args.info_hash, args.our_peer_id);
        let reason = match timeout(HANDSHAKE_TIMEOUT, handshake::send(&mut stream, &our_handshake)).await {
            Ok(Ok(())) => run_active(&args, addr, &shared, stream, &remote, cmd_tx, cmd_rx).await,
            Ok(Err(_)) => CloseReason::SocketClosed,
            Err(_) => CloseReason::IdleTimeout,
        };
        let _ = events.send(SessionEvent { addr, kind: SessionEventKind::Closed { reason } }).await;
    });

    handle
}

async fn establish_outbound(args: &SessionArgs, addr: SocketAddr) -> Result<(TcpStream, Handshake), CloseReason> {
    let connect = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
    let mut stream = tokio::select! {
        () = args.cancel.cancelled() => return Err(CloseReason::Shutdown),
        result = connect => match result {
            Ok(Ok(stream)) => stream,
            _ => return Err(CloseReason::ConnectFailed),
        },
    };

    let our_handshake = Handshake::new(args.info_hash, args.our_peer_id);
    if timeout(HANDSHAKE_TIMEOUT, handshake::send(&mut stream, &our_handshake))
        .await
        .map_or(true, |r| r.is_err())
    {
        return Err(CloseReason::SocketClosed);
    }

    let remote = match timeout(HANDSHAKE_TIMEOUT, handshake::receive(&mut stream)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(WireError::BadHandshake)) => return Err(CloseReason::BadHandshake),
        Ok(Err(_)) => return Err(CloseReason::SocketClosed),
        Err(_) => return Err(CloseReason::IdleTimeout),
    };

    remote
        .expect_info_hash(args.info_hash)
        .map_err(|_| CloseReason::InfoHashMismatch)?;

    Ok((stream, remote))
}

/// The post-handshake session body: splits the socket, runs the writer task
/// and decodes inbound messages until something closes the session.
#[allow(clippy::too_many_lines)]
async fn run_active(
    args: &SessionArgs,
    addr: SocketAddr,
    shared: &Arc<SessionShared>,
    stream: TcpStream,
    remote: &Handshake,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
) -> CloseReason {
    let _ = shared.peer_id.set(remote.peer_id);
    debug!(%addr, peer_id = %remote.peer_id, "peer session active");

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(run_writer(
        FramedWrite::new(write_half, MessageCodec),
        cmd_rx,
        Arc::clone(shared),
        Arc::clone(&args.global_rate),
        Arc::clone(&args.torrent_rate),
        args.cancel.clone(),
    ));

    let supports_extended = remote.supports_extended();
    if args
        .events
        .send(SessionEvent {
            addr,
            kind: SessionEventKind::Connected {
                peer_id: remote.peer_id,
                supports_extended,
            },
        })
        .await
        .is_err()
    {
        args.cancel.cancel();
        let _ = writer.await;
        return CloseReason::Shutdown;
    }

    if supports_extended {
        let payload = ExtendedHandshake::local_payload(args.listen_port, args.max_queued_requests);
        let _ = cmd_tx
            .send(SessionCommand::Send(Message::Extended {
                ext_id: HANDSHAKE_EXT_ID,
                payload,
            }))
            .await;
    }
    if args.initial_bitfield.iter().any(|byte| *byte != 0) {
        let _ = cmd_tx
            .send(SessionCommand::Send(Message::Bitfield(Bytes::from(
                args.initial_bitfield.clone(),
            ))))
            .await;
    }
    drop(cmd_tx);

    let reason = read_loop(args, addr, shared, FramedRead::new(read_half, MessageCodec)).await;

    // Bounded grace for the writer to drain, then force it down.
    args.cancel.cancel();
    let _ = writer.await;
    reason
}

async fn read_loop(
    args: &SessionArgs,
    addr: SocketAddr,
    shared: &Arc<SessionShared>,
    mut frames: FramedRead<OwnedReadHalf, MessageCodec>,
) -> CloseReason {
    let mut seen_bitfield = false;
    let mut seen_any_message = false;

    loop {
        let frame = tokio::select! {
            () = args.cancel.cancelled() => return CloseReason::Shutdown,
            frame = timeout(IDLE_TIMEOUT, frames.next()) => frame,
        };

        let message = match frame {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::SocketClosed,
            Ok(Some(Err(WireError::Oversized { .. }))) => return CloseReason::Oversized,
            Ok(Some(Err(WireError::Io(_)))) => return CloseReason::SocketClosed,
            Ok(Some(Err(_))) => return CloseReason::ProtocolViolation("malformed frame"),
            Ok(Some(Ok(message))) => message,
        };

        trace!(%addr, ?message, "frame received");

        let kind = match message {
            Message::KeepAlive => {
                seen_any_message = true;
                continue;
            }
            Message::Choke => SessionEventKind::Choked,
            Message::Unchoke => SessionEventKind::Unchoked,
            Message::Interested => SessionEventKind::Interested,
            Message::NotInterested => SessionEventKind::NotInterested,
            Message::Have { piece } => {
                if piece as usize >= args.piece_count {
                    return CloseReason::ProtocolViolation("have beyond piece count");
                }
                SessionEventKind::Have { piece }
            }
            Message::Bitfield(bits) => {
                if seen_bitfield {
                    return CloseReason::ProtocolViolation("duplicate bitfield");
                }
                if seen_any_message {
                    return CloseReason::ProtocolViolation("bitfield after other messages");
                }
                seen_bitfield = true;
                match Bitfield::from_wire_bytes(&bits, args.piece_count) {
                    Ok(bitfield) => SessionEventKind::BitfieldReceived(bitfield),
                    Err(_) => return CloseReason::ProtocolViolation("bitfield size mismatch"),
                }
            }
            Message::Request(block) => SessionEventKind::RequestReceived(block),
            Message::Piece { piece, offset, data } => {
                shared.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                SessionEventKind::BlockReceived {
                    block: BlockInfo::new(piece, offset, data.len() as u32),
                    data,
                }
            }
            Message::Cancel(block) => SessionEventKind::CancelReceived(block),
            Message::Extended { ext_id, payload } => match ext_id {
                HANDSHAKE_EXT_ID => match ExtendedHandshake::from_payload(&payload) {
                    Ok(ext) => SessionEventKind::ExtendedHandshake(ext),
                    Err(_) => return CloseReason::ProtocolViolation("malformed extended handshake"),
                },
                LOCAL_UT_PEX_ID => match PexMessage::from_payload(&payload) {
                    Ok(pex) => SessionEventKind::PexPeers(pex.added),
                    Err(_) => return CloseReason::ProtocolViolation("malformed pex message"),
                },
                // Extensions we never advertised; a tolerant no-op.
                _ => {
                    seen_any_message = true;
                    continue;
                }
            },
        };

        seen_any_message = true;
        if args.events.send(SessionEvent { addr, kind }).await.is_err() {
            return CloseReason::Shutdown;
        }
    }
}

/// The writer task: sole owner of the outgoing sink. Consumes upload tokens
/// before every `piece` frame and emits keep-alives after two minutes of
/// write silence.
async fn run_writer(
    mut sink: FramedWrite<OwnedWriteHalf, MessageCodec>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    shared: Arc<SessionShared>,
    global_rate: Arc<RateLimiterPair>,
    torrent_rate: Arc<RateLimiterPair>,
    cancel: CancellationToken,
) {
    let mut last_write = Instant::now();

    loop {
        let command = tokio::select! {
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                None | Some(SessionCommand::Close) => break,
                Some(command) => command,
            },
            () = sleep_until(last_write + KEEPALIVE_INTERVAL) => {
                if sink.send(Message::KeepAlive).await.is_err() {
                    break;
                }
                last_write = Instant::now();
                continue;
            }
        };

        let SessionCommand::Send(message) = command else {
            break;
        };

        if let Message::Piece { data, .. } = &message {
            let len = data.len() as u64;
            if !global_rate.upload.wait_for(len, &cancel).await
                || !torrent_rate.upload.wait_for(len, &cancel).await
            {
                break;
            }
            shared.bytes_out.fetch_add(len, Ordering::Relaxed);
        }

        if sink.send(message).await.is_err() {
            break;
        }
        last_write = Instant::now();
    }

    let _ = sink.flush().await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use riptide_primitives::{InfoHash, PeerId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{spawn_outbound, CloseReason, SessionArgs, SessionEventKind};
    use crate::core::rate_limiter::RateLimiterPair;
    use crate::protocol::handshake::{Handshake, HANDSHAKE_LEN};

    fn args(events: mpsc::Sender<super::SessionEvent>) -> SessionArgs {
        SessionArgs {
            info_hash: InfoHash([0x33; 20]),
            our_peer_id: PeerId::from_entropy([1; 12]),
            piece_count: 8,
            initial_bitfield: vec![0],
            listen_port: 6881,
            max_queued_requests: 256,
            events,
            global_rate: Arc::new(RateLimiterPair::unlimited()),
            torrent_rate: Arc::new(RateLimiterPair::unlimited()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn outbound_session_completes_a_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let remote = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut buffer).await.unwrap();
            let theirs = Handshake::from_bytes(&buffer).unwrap();

            let ours = Handshake::new(theirs.info_hash, PeerId::from_entropy([2; 12]));
            socket.write_all(&ours.to_bytes()).await.unwrap();
            socket
        });

        let _handle = spawn_outbound(args(events_tx), addr);
        let socket = remote.await.unwrap();

        let event = events_rx.recv().await.unwrap();
        match event.kind {
            SessionEventKind::Connected { peer_id, supports_extended } => {
                assert_eq!(&peer_id.0[..8], b"-RT0100-");
                assert!(supports_extended);
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        drop(socket);
    }

    #[tokio::test]
    async fn a_wrong_info_hash_closes_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut buffer).await.unwrap();

            let wrong = Handshake::new(InfoHash([0xEE; 20]), PeerId::from_entropy([2; 12]));
            socket.write_all(&wrong.to_bytes()).await.unwrap();
            // Hold the socket open so the close is due to the mismatch.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        });

        let _handle = spawn_outbound(args(events_tx), addr);

        let event = events_rx.recv().await.unwrap();
        match event.kind {
            SessionEventKind::Closed { reason } => assert_eq!(reason, CloseReason::InfoHashMismatch),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_refused_connection_reports_connect_failed() {
        // Bind-then-drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _handle = spawn_outbound(args(events_tx), addr);

        let event = events_rx.recv().await.unwrap();
        match event.kind {
            SessionEventKind::Closed { reason } => assert_eq!(reason, CloseReason::ConnectFailed),
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
