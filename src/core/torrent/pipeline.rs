//! The per-torrent pipeline task: the single owner of a torrent's bitfield,
//! piece states, buffers and session set.
//!
//! One loop handles everything: session events, engine commands, discovered
//! endpoints and a 1 s tick. Requests flow out to unchoked sessions up to
//! the in-flight budgets, received blocks assemble into piece buffers,
//! completed pieces go through hash-verified storage, and a verified write
//! broadcasts `have` to every session. The choke scheduler and PEX rounds
//! ride the same tick.
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use riptide_primitives::{AnnounceEvent, Bitfield, Priority, BLOCK_LEN};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::choke::{ChokeCandidate, ChokeManager, CHOKE_INTERVAL};
use super::picker::PiecePicker;
use super::{
    TorrentArgs, TorrentCommand, TorrentError, TorrentErrorKind, TorrentHandle, TorrentSnapshot, TorrentStatus,
};
use crate::core::events::{Event, EventSender};
use crate::core::rate_limiter::RateLimiterPair;
use crate::core::resume::{FileResume, ResumeRecord};
use crate::core::session::{
    self, CloseReason, SessionArgs, SessionEvent, SessionEventKind, SessionHandle,
};
use crate::core::storage::StorageError;
use crate::discovery::pex::{PexMessage, SEND_INTERVAL as PEX_INTERVAL};
use crate::discovery::{self, DiscoveryConfig, DiscoveryHandle, TransferTotals};
use crate::protocol::message::{BlockInfo, Message};

/// An outstanding `request` times out after this long.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Block timeouts on one piece before a peer is disassociated from it.
const MAX_PIECE_STRIKES: u8 = 3;

/// Hash-mismatch contributions before a peer is dropped.
const MAX_HASH_STRIKES: u8 = 2;

/// Inbound request queue bound per peer.
const MAX_SERVE_QUEUE: usize = 256;

/// Resume checkpoint cadence.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Swarm-count refresh cadence via tracker scrape.
const SCRAPE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// EWMA smoothing factor for per-peer rates, applied on the 1 s tick.
const RATE_ALPHA: f64 = 0.2;

/// Largest `request` length we will serve.
const MAX_REQUEST_LEN: u32 = 1 << 17;

type BlockKey = (u32, u32);

struct RequestHolder {
    addr: SocketAddr,
    deadline: Instant,
}

struct PieceBuffer {
    data: Vec<u8>,
    have: Vec<bool>,
    received: usize,
    contributors: HashSet<SocketAddr>,
}

impl PieceBuffer {
    fn new(piece_len: u32) -> Self {
        let blocks = piece_len.div_ceil(BLOCK_LEN) as usize;
        Self {
            data: vec![0u8; piece_len as usize],
            have: vec![false; blocks],
            received: 0,
            contributors: HashSet::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.have.len()
    }
}

struct SessionEntry {
    handle: SessionHandle,
    connected: bool,
    bitfield: Bitfield,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    pex_id: Option<u8>,
    in_flight: HashSet<BlockKey>,
    serve_queue: VecDeque<BlockInfo>,
    /// Block timeouts per piece; three strikes bans the piece for this peer.
    piece_strikes: HashMap<u32, u8>,
    banned_pieces: HashSet<u32>,
    hash_strikes: u8,
    last_bytes_in: u64,
    last_bytes_out: u64,
    down_rate: f64,
    up_rate: f64,
    last_pex: HashSet<SocketAddr>,
}

impl SessionEntry {
    fn new(handle: SessionHandle, piece_count: usize) -> Self {
        Self {
            handle,
            connected: false,
            bitfield: Bitfield::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            pex_id: None,
            in_flight: HashSet::new(),
            serve_queue: VecDeque::new(),
            piece_strikes: HashMap::new(),
            banned_pieces: HashSet::new(),
            hash_strikes: 0,
            last_bytes_in: 0,
            last_bytes_out: 0,
            down_rate: 0.0,
            up_rate: 0.0,
            last_pex: HashSet::new(),
        }
    }
}

/// Start a torrent. The returned handle is the only way in.
pub fn spawn_torrent(args: TorrentArgs) -> TorrentHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    TorrentHandle {
        id: args.id,
        info_hash: args.metainfo.info_hash(),
        name: args.metainfo.name().to_owned(),
        cmd: cmd_tx,
        cancel: args.cancel.clone(),
        join: tokio::spawn(run(args, cmd_rx)),
    }
}

async fn run(args: TorrentArgs, mut cmd_rx: mpsc::Receiver<TorrentCommand>) {
    let (session_events_tx, mut session_events_rx) = mpsc::channel::<SessionEvent>(1024);
    let (peers_tx, mut peers_rx) = mpsc::channel::<SocketAddr>(256);

    let mut pipeline = Pipeline::new(args, session_events_tx, peers_tx);
    let cancel = pipeline.args.cancel.clone();
    pipeline.attach().await;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                None => break,
                Some(command) => pipeline.handle_command(command).await,
            },
            Some(event) = session_events_rx.recv() => pipeline.handle_session_event(event).await,
            Some(peer) = peers_rx.recv() => pipeline.queue_dial(peer),
            _ = tick.tick() => pipeline.on_tick().await,
        }
    }

    pipeline.shutdown().await;
}

struct Pipeline {
    args: TorrentArgs,
    session_events_tx: mpsc::Sender<SessionEvent>,
    peers_tx: mpsc::Sender<SocketAddr>,

    status: TorrentStatus,
    bitfield: Bitfield,
    picker: PiecePicker,
    file_priorities: Vec<Priority>,
    file_selected: Vec<bool>,
    file_downloaded: Vec<u64>,

    sessions: HashMap<SocketAddr, SessionEntry>,
    requests: HashMap<BlockKey, Vec<RequestHolder>>,
    buffers: HashMap<u32, PieceBuffer>,
    pending_dials: VecDeque<SocketAddr>,

    totals: Arc<TransferTotals>,
    torrent_rate: Arc<RateLimiterPair>,
    max_download_bps: Option<u64>,
    max_upload_bps: Option<u64>,
    swarm: Arc<Mutex<Option<(u32, u32)>>>,

    discovery: Option<DiscoveryHandle>,
    discovery_cancel: Option<CancellationToken>,

    choke: ChokeManager,
    last_choke: Instant,
    last_pex: Instant,
    last_scrape: Instant,
    last_checkpoint: Instant,
    resume_dirty: bool,

    error_count: u64,
    last_error: Option<TorrentError>,
}

impl Pipeline {
    fn new(args: TorrentArgs, session_events_tx: mpsc::Sender<SessionEvent>, peers_tx: mpsc::Sender<SocketAddr>) -> Self {
        let piece_count = args.metainfo.piece_count();
        let file_count = args.metainfo.files().len();
        let now = Instant::now();

        let bitfield = Bitfield::new(piece_count);
        let file_priorities = vec![Priority::Normal; file_count];
        let file_selected = vec![true; file_count];
        let picker = PiecePicker::new(&args.metainfo, &file_priorities, &file_selected, &bitfield);

        Self {
            status: TorrentStatus::Checking,
            bitfield,
            picker,
            file_priorities,
            file_selected,
            file_downloaded: vec![0; file_count],
            sessions: HashMap::new(),
            requests: HashMap::new(),
            buffers: HashMap::new(),
            pending_dials: VecDeque::new(),
            totals: Arc::new(TransferTotals::default()),
            torrent_rate: Arc::new(RateLimiterPair::unlimited()),
            max_download_bps: None,
            max_upload_bps: None,
            swarm: Arc::new(Mutex::new(None)),
            discovery: None,
            discovery_cancel: None,
            choke: ChokeManager::new(),
            last_choke: now,
            last_pex: now,
            last_scrape: now,
            last_checkpoint: now,
            resume_dirty: false,
            error_count: 0,
            last_error: None,
            args,
            session_events_tx,
            peers_tx,
        }
    }

    fn events(&self) -> &EventSender {
        &self.args.events
    }

    fn set_status(&mut self, status: TorrentStatus) {
        if self.status != status {
            self.status = status;
            info!(id = self.args.id, %status, "torrent status changed");
            self.events().send(Event::StatusChanged {
                id: self.args.id,
                status,
            });
        }
    }

    /// Bring the torrent up: open storage, hash-scan what is on disk, seed
    /// counters from the resume record, and start discovery.
    async fn attach(&mut self) {
        self.set_status(TorrentStatus::Checking);

        if let Err(source) = self.args.storage.init().await {
            self.fail(TorrentErrorKind::Disk, source.to_string());
            return;
        }

        let resume = self.args.state_store.load(self.args.metainfo.info_hash());
        if let Some(record) = &resume {
            self.max_download_bps = record.max_download_bps;
            self.max_upload_bps = record.max_upload_bps;
            self.torrent_rate.download.set_rate(record.max_download_bps);
            self.torrent_rate.upload.set_rate(record.max_upload_bps);

            for file in &record.files {
                if let Some(index) = self.file_index(&file.path) {
                    self.file_priorities[index] = file.priority;
                    self.file_selected[index] = file.selected;
                }
            }
        }

        // The resume bitfield is advisory; what is actually on disk wins.
        let verified = match self.args.storage.verify_existing(|_, _| {}).await {
            Ok(verified) => verified,
            Err(source) => {
                self.fail(TorrentErrorKind::Disk, source.to_string());
                return;
            }
        };

        self.bitfield = verified;
        self.picker = PiecePicker::new(
            &self.args.metainfo,
            &self.file_priorities,
            &self.file_selected,
            &self.bitfield,
        );
        for piece in self.bitfield.set_indexes() {
            self.picker.mark_verified(piece);
        }
        self.recompute_file_progress();

        let verified_bytes: u64 = self
            .bitfield
            .set_indexes()
            .map(|piece| u64::from(self.args.metainfo.piece_length(piece)))
            .sum();
        self.totals.left.store(
            self.args.metainfo.total_length() - verified_bytes,
            Ordering::Relaxed,
        );
        self.totals.downloaded.store(
            resume.as_ref().map_or(verified_bytes, |r| r.downloaded),
            Ordering::Relaxed,
        );
        self.totals
            .uploaded
            .store(resume.as_ref().map_or(0, |r| r.uploaded), Ordering::Relaxed);

        if self.args.start_stopped {
            self.set_status(TorrentStatus::Stopped);
            return;
        }
        self.start_discovery();
        self.enter_transfer_state();
    }

    fn enter_transfer_state(&mut self) {
        if self.picker.is_complete() {
            self.set_status(TorrentStatus::Seeding);
        } else {
            self.set_status(TorrentStatus::Downloading);
        }
    }

    fn start_discovery(&mut self) {
        if self.discovery.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = discovery::spawn(DiscoveryConfig {
            info_hash: self.args.metainfo.info_hash(),
            peer_id: self.args.peer_id,
            listen_port: self.args.listen_port,
            tiers: self.args.metainfo.trackers().to_vec(),
            settings: Arc::clone(&self.args.settings),
            totals: Arc::clone(&self.totals),
            registry: Arc::clone(&self.args.registry),
            peers_tx: self.peers_tx.clone(),
            swarm: Arc::clone(&self.swarm),
            dht: self.args.dht.clone(),
            lsd: self.args.lsd.clone(),
            cancel: cancel.clone(),
        });
        self.discovery = Some(handle);
        self.discovery_cancel = Some(cancel);
    }

    fn stop_discovery(&mut self, announce_stopped: bool) {
        if let Some(discovery) = self.discovery.take() {
            if announce_stopped {
                discovery.announce_event(AnnounceEvent::Stopped);
            }
        }
        // The driver exits on its own after a stopped announce; the token
        // covers the other paths.
        if let Some(cancel) = self.discovery_cancel.take() {
            if !announce_stopped {
                cancel.cancel();
            } else {
                // Bounded grace for the stopped announce.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    cancel.cancel();
                });
            }
        }
    }

    fn fail(&mut self, kind: TorrentErrorKind, message: String) {
        warn!(id = self.args.id, %message, "torrent failed");
        let error = TorrentError { kind, message };
        self.last_error = Some(error.clone());
        self.error_count += 1;
        self.events().send(Event::TorrentErrored {
            id: self.args.id,
            error,
        });
        self.close_all_sessions();
        self.stop_discovery(false);
        self.clear_transfers();
        self.set_status(TorrentStatus::Error);
    }

    fn close_all_sessions(&mut self) {
        for entry in self.sessions.values() {
            entry.handle.close();
        }
        self.sessions.clear();
        self.requests.clear();
    }

    /// Abandon all partial transfers and give their pieces back to the
    /// picker.
    fn clear_transfers(&mut self) {
        let pieces: Vec<u32> = self.buffers.keys().copied().collect();
        for piece in pieces {
            self.picker.unmark_downloading(piece as usize);
        }
        self.buffers.clear();
        self.requests.clear();
    }

    fn file_index(&self, path: &std::path::Path) -> Option<usize> {
        self.args
            .metainfo
            .files()
            .iter()
            .position(|file| file.path == path)
    }

    fn recompute_file_progress(&mut self) {
        self.file_downloaded = vec![0; self.args.metainfo.files().len()];
        for piece in self.bitfield.set_indexes() {
            for slice in self.args.metainfo.files_for_piece(piece) {
                self.file_downloaded[slice.file_index] += u64::from(slice.length);
            }
        }
    }

    // ---- commands ----------------------------------------------------

    async fn handle_command(&mut self, command: TorrentCommand) {
        match command {
            TorrentCommand::Start => {
                if matches!(self.status, TorrentStatus::Stopped | TorrentStatus::Paused | TorrentStatus::Error) {
                    self.last_error = None;
                    self.start_discovery();
                    self.enter_transfer_state();
                }
            }
            TorrentCommand::Pause => {
                if matches!(self.status, TorrentStatus::Downloading | TorrentStatus::Seeding) {
                    self.close_all_sessions();
                    self.clear_transfers();
                    self.checkpoint();
                    self.set_status(TorrentStatus::Paused);
                }
            }
            TorrentCommand::Stop => {
                if !matches!(self.status, TorrentStatus::Stopped) {
                    self.close_all_sessions();
                    self.clear_transfers();
                    self.stop_discovery(true);
                    self.checkpoint();
                    self.set_status(TorrentStatus::Stopped);
                }
            }
            TorrentCommand::SetRateLimits { download_bps, upload_bps } => {
                self.max_download_bps = download_bps;
                self.max_upload_bps = upload_bps;
                self.torrent_rate.download.set_rate(download_bps);
                self.torrent_rate.upload.set_rate(upload_bps);
                self.resume_dirty = true;
            }
            TorrentCommand::SetFilePriority { path, priority } => {
                if let Some(index) = self.file_index(&path) {
                    self.file_priorities[index] = priority;
                    self.refresh_selection();
                }
            }
            TorrentCommand::SetFileSelected { path, selected } => {
                if let Some(index) = self.file_index(&path) {
                    self.file_selected[index] = selected;
                    self.refresh_selection();
                }
            }
            TorrentCommand::AddPeer(addr) => {
                if self.args.registry.admit(addr) {
                    self.queue_dial(addr);
                }
            }
            TorrentCommand::Incoming { addr, stream, handshake } => {
                if self.sessions.len() < self.args.settings.max_connections
                    && !matches!(self.status, TorrentStatus::Stopped | TorrentStatus::Paused | TorrentStatus::Error)
                {
                    let session = session::spawn_inbound(self.session_args(), addr, stream, handshake);
                    self.sessions
                        .insert(addr, SessionEntry::new(session, self.args.metainfo.piece_count()));
                }
            }
            TorrentCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn refresh_selection(&mut self) {
        self.picker
            .refresh_file_selection(&self.args.metainfo, &self.file_priorities, &self.file_selected);
        self.resume_dirty = true;
        if matches!(self.status, TorrentStatus::Seeding) && !self.picker.is_complete() {
            // Newly selected files reopen the download.
            self.set_status(TorrentStatus::Downloading);
        }
    }

    // ---- sessions ----------------------------------------------------

    fn session_args(&self) -> SessionArgs {
        SessionArgs {
            info_hash: self.args.metainfo.info_hash(),
            our_peer_id: self.args.peer_id,
            piece_count: self.args.metainfo.piece_count(),
            initial_bitfield: self.bitfield.to_bytes(),
            listen_port: self.args.listen_port,
            max_queued_requests: MAX_SERVE_QUEUE,
            events: self.session_events_tx.clone(),
            global_rate: Arc::clone(&self.args.global_rate),
            torrent_rate: Arc::clone(&self.torrent_rate),
            cancel: self.args.cancel.child_token(),
        }
    }

    fn queue_dial(&mut self, addr: SocketAddr) {
        self.pending_dials.push_back(addr);
        self.dial_pending();
    }

    fn dial_pending(&mut self) {
        if !matches!(self.status, TorrentStatus::Downloading | TorrentStatus::Seeding) {
            return;
        }

        let connecting = self.sessions.values().filter(|entry| !entry.connected).count();
        let mut half_open_budget = self.args.settings.max_half_open_connections.saturating_sub(connecting);

        while half_open_budget > 0
            && self.sessions.len() < self.args.settings.max_connections
        {
            let Some(addr) = self.pending_dials.pop_front() else {
                return;
            };
            if self.sessions.contains_key(&addr) {
                continue;
            }

            let session = session::spawn_outbound(self.session_args(), addr);
            self.sessions
                .insert(addr, SessionEntry::new(session, self.args.metainfo.piece_count()));
            half_open_budget -= 1;
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let SessionEvent { addr, kind } = event;
        if !self.sessions.contains_key(&addr) {
            return;
        }

        match kind {
            SessionEventKind::Connected { peer_id, supports_extended } => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.connected = true;
                let _ = supports_extended;
                debug!(id = self.args.id, %addr, %peer_id, "peer connected");
                self.events().send(Event::PeerConnected { id: self.args.id, addr });
            }
            SessionEventKind::ExtendedHandshake(extended) => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.pex_id = extended.ut_pex_id;
            }
            SessionEventKind::BitfieldReceived(bitfield) => {
                self.picker.peer_bitfield(&bitfield);
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.bitfield = bitfield;
                self.update_interest(addr);
                self.top_up_requests();
            }
            SessionEventKind::Have { piece } => {
                self.picker.peer_has(piece as usize);
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.bitfield.set(piece as usize);
                self.update_interest(addr);
                self.top_up_requests();
            }
            SessionEventKind::Choked => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.peer_choking = true;
                let lost: Vec<BlockKey> = entry.in_flight.drain().collect();
                self.release_requests(addr, &lost);
            }
            SessionEventKind::Unchoked => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.peer_choking = false;
                self.top_up_requests();
            }
            SessionEventKind::Interested => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.peer_interested = true;
            }
            SessionEventKind::NotInterested => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.peer_interested = false;
            }
            SessionEventKind::BlockReceived { block, data } => {
                self.handle_block(addr, block, data).await;
            }
            SessionEventKind::RequestReceived(block) => {
                self.handle_peer_request(addr, block).await;
            }
            SessionEventKind::CancelReceived(block) => {
                let entry = self.sessions.get_mut(&addr).expect("checked above");
                entry.serve_queue.retain(|queued| *queued != block);
            }
            SessionEventKind::PexPeers(peers) => {
                for peer in peers {
                    if self.args.registry.admit(peer) {
                        self.pending_dials.push_back(peer);
                    }
                }
                self.dial_pending();
            }
            SessionEventKind::Closed { reason } => {
                self.remove_session(addr, reason);
            }
        }
    }

    fn remove_session(&mut self, addr: SocketAddr, reason: CloseReason) {
        let Some(entry) = self.sessions.remove(&addr) else {
            return;
        };
        debug!(id = self.args.id, %addr, %reason, "session closed");

        self.picker.peer_gone(&entry.bitfield);
        let lost: Vec<BlockKey> = entry.in_flight.iter().copied().collect();
        self.release_requests(addr, &lost);

        if reason.is_peer_fault() {
            self.error_count += 1;
        }
        if entry.connected {
            self.events().send(Event::PeerDisconnected { id: self.args.id, addr });
        } else {
            // Dead dial: let another source re-introduce the endpoint.
            self.args.registry.forget(addr);
        }
    }

    /// Drop `addr`'s claim on the given blocks so the next top-up can
    /// re-request them elsewhere.
    fn release_requests(&mut self, addr: SocketAddr, keys: &[BlockKey]) {
        for key in keys {
            if let Some(holders) = self.requests.get_mut(key) {
                holders.retain(|holder| holder.addr != addr);
                if holders.is_empty() {
                    self.requests.remove(key);
                }
            }
        }
    }

    /// Declare or retract interest based on what the peer has and we lack.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(entry) = self.sessions.get_mut(&addr) else {
            return;
        };
        let interested = self.bitfield.is_interested_in(&entry.bitfield);
        if interested && !entry.am_interested {
            entry.am_interested = true;
            entry.handle.send(Message::Interested);
        } else if !interested && entry.am_interested {
            entry.am_interested = false;
            entry.handle.send(Message::NotInterested);
        }
    }

    // ---- download path -----------------------------------------------

    async fn handle_block(&mut self, addr: SocketAddr, block: BlockInfo, data: Bytes) {
        let key: BlockKey = (block.piece, block.offset);

        {
            let Some(entry) = self.sessions.get_mut(&addr) else { return };
            if !entry.in_flight.remove(&key) {
                return; // unsolicited
            }
        }

        let expected = self.block_length(block.piece, block.offset);
        if expected != Some(block.length) {
            return; // size mismatch: discard, the request will time out
        }

        // Cancel endgame duplicates on first success.
        if let Some(holders) = self.requests.remove(&key) {
            for holder in holders {
                if holder.addr == addr {
                    continue;
                }
                if let Some(other) = self.sessions.get_mut(&holder.addr) {
                    other.in_flight.remove(&key);
                    other.handle.send(Message::Cancel(block));
                }
            }
        }

        // Consume download tokens before crediting; inbound frames keep
        // draining into the event queue while this waits.
        let len = u64::from(block.length);
        if !self.args.global_rate.download.wait_for(len, &self.args.cancel).await
            || !self.torrent_rate.download.wait_for(len, &self.args.cancel).await
        {
            return;
        }
        self.totals.downloaded.fetch_add(len, Ordering::Relaxed);

        let piece_len = self.args.metainfo.piece_length(block.piece as usize);
        let buffer = self
            .buffers
            .entry(block.piece)
            .or_insert_with(|| PieceBuffer::new(piece_len));

        let block_index = (block.offset / BLOCK_LEN) as usize;
        if !buffer.have[block_index] {
            buffer.have[block_index] = true;
            buffer.received += 1;
            let start = block.offset as usize;
            buffer.data[start..start + data.len()].copy_from_slice(&data);
        }
        buffer.contributors.insert(addr);

        if buffer.is_complete() {
            self.finish_piece(block.piece).await;
        } else {
            self.top_up_requests();
        }
    }

    async fn finish_piece(&mut self, piece: u32) {
        let Some(buffer) = self.buffers.remove(&piece) else {
            return;
        };
        let contributors = buffer.contributors;

        match self.args.storage.write_piece(piece as usize, buffer.data).await {
            Ok(()) => self.on_piece_verified(piece).await,
            Err(StorageError::HashMismatch { .. }) => {
                debug!(id = self.args.id, piece, "piece failed hash verification");
                self.error_count += 1;
                let piece_len = u64::from(self.args.metainfo.piece_length(piece as usize));
                let downloaded = self.totals.downloaded.load(Ordering::Relaxed);
                self.totals
                    .downloaded
                    .store(downloaded.saturating_sub(piece_len), Ordering::Relaxed);
                self.picker.unmark_downloading(piece as usize);

                // Only a sole contributor can be blamed for a bad piece;
                // repeat offenders are dropped.
                if contributors.len() == 1 {
                    let addr = *contributors.iter().next().expect("length checked");
                    if let Some(entry) = self.sessions.get_mut(&addr) {
                        entry.hash_strikes += 1;
                        if entry.hash_strikes >= MAX_HASH_STRIKES {
                            entry.handle.close();
                        }
                    }
                }
                self.top_up_requests();
            }
            Err(source) => self.fail(TorrentErrorKind::Disk, source.to_string()),
        }
    }

    async fn on_piece_verified(&mut self, piece: u32) {
        self.bitfield.set(piece as usize);
        self.picker.mark_verified(piece as usize);
        self.resume_dirty = true;

        let piece_len = u64::from(self.args.metainfo.piece_length(piece as usize));
        let left = self.totals.left.load(Ordering::Relaxed);
        self.totals.left.store(left.saturating_sub(piece_len), Ordering::Relaxed);

        for slice in self.args.metainfo.files_for_piece(piece as usize) {
            self.file_downloaded[slice.file_index] += u64::from(slice.length);
        }

        self.events().send(Event::PieceVerified { id: self.args.id, piece });

        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            if let Some(entry) = self.sessions.get(&addr) {
                if entry.connected {
                    entry.handle.send(Message::Have { piece });
                }
            }
            self.update_interest(addr);
        }

        if self.picker.is_complete() {
            info!(id = self.args.id, "torrent complete");
            self.checkpoint();
            if let Some(discovery) = &self.discovery {
                discovery.announce_event(AnnounceEvent::Completed);
            }
            self.events().send(Event::Completed { id: self.args.id });
            self.set_status(TorrentStatus::Seeding);
        } else {
            self.top_up_requests();
        }
    }

    fn block_length(&self, piece: u32, offset: u32) -> Option<u32> {
        let piece_len = self.args.metainfo.piece_length(piece as usize);
        if offset >= piece_len || offset % BLOCK_LEN != 0 {
            return None;
        }
        Some(BLOCK_LEN.min(piece_len - offset))
    }

    /// Fill every eligible session's request slots up to the budgets.
    fn top_up_requests(&mut self) {
        if self.status != TorrentStatus::Downloading {
            return;
        }

        let endgame = self.picker.endgame_active();
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.fill_session(addr, endgame);
        }
    }

    fn fill_session(&mut self, addr: SocketAddr, endgame: bool) {
        let max_per_peer = self.args.settings.max_requests_per_peer;
        let max_pieces = self.args.settings.max_pieces_in_flight;

        let eligible = self.sessions.get(&addr).is_some_and(|entry| {
            entry.connected && entry.am_interested && !entry.peer_choking && entry.in_flight.len() < max_per_peer
        });
        if !eligible {
            return;
        }

        // Continue partially requested pieces first, sequential offsets.
        let active: Vec<u32> = {
            let mut pieces: Vec<u32> = self.buffers.keys().copied().collect();
            pieces.sort_unstable();
            pieces
        };
        for piece in active {
            self.request_piece_blocks(addr, piece, false);
        }

        // Then open new pieces while the budgets allow.
        loop {
            let spare = {
                let entry = &self.sessions[&addr];
                max_per_peer.saturating_sub(entry.in_flight.len())
            };
            if spare == 0 || self.buffers.len() >= max_pieces {
                break;
            }

            let candidates = self.picker.pick_pieces(8, &mut rand::thread_rng());
            let chosen = {
                let entry = &self.sessions[&addr];
                candidates
                    .into_iter()
                    .find(|piece| entry.bitfield.has(*piece) && !entry.banned_pieces.contains(&(*piece as u32)))
            };
            let Some(piece) = chosen else { break };

            let piece = piece as u32;
            self.picker.mark_downloading(piece as usize);
            let piece_len = self.args.metainfo.piece_length(piece as usize);
            self.buffers.insert(piece, PieceBuffer::new(piece_len));
            self.request_piece_blocks(addr, piece, false);
        }

        if endgame {
            let active: Vec<u32> = self.buffers.keys().copied().collect();
            for piece in active {
                self.request_piece_blocks(addr, piece, true);
            }
        }
    }

    /// Request this piece's missing blocks from `addr`, in offset order.
    /// With `duplicate` set (endgame), blocks already requested elsewhere
    /// are eligible again, capped at two holders per block.
    fn request_piece_blocks(&mut self, addr: SocketAddr, piece: u32, duplicate: bool) {
        let piece_len = self.args.metainfo.piece_length(piece as usize);
        let max_per_peer = self.args.settings.max_requests_per_peer;

        let blocks = piece_len.div_ceil(BLOCK_LEN);
        for block_index in 0..blocks {
            let offset = block_index * BLOCK_LEN;
            let key: BlockKey = (piece, offset);

            let already_have = self
                .buffers
                .get(&piece)
                .map_or(true, |buffer| buffer.have[block_index as usize]);
            if already_have {
                continue;
            }

            let holders = self.requests.get(&key).map_or(0, Vec::len);
            if (!duplicate && holders > 0) || holders >= 2 {
                continue;
            }

            let Some(entry) = self.sessions.get_mut(&addr) else { return };
            if !entry.bitfield.has(piece as usize)
                || entry.banned_pieces.contains(&piece)
                || entry.in_flight.len() >= max_per_peer
                || entry.in_flight.contains(&key)
            {
                if entry.in_flight.len() >= max_per_peer {
                    return;
                }
                continue;
            }

            let length = BLOCK_LEN.min(piece_len - offset);
            entry.in_flight.insert(key);
            entry.handle.send(Message::Request(BlockInfo::new(piece, offset, length)));
            self.requests.entry(key).or_default().push(RequestHolder {
                addr,
                deadline: Instant::now() + BLOCK_TIMEOUT,
            });
        }
    }

    // ---- upload path -------------------------------------------------

    async fn handle_peer_request(&mut self, addr: SocketAddr, block: BlockInfo) {
        let piece_count = self.args.metainfo.piece_count() as u32;
        let out_of_bounds = block.piece >= piece_count
            || block.length == 0
            || block.length > MAX_REQUEST_LEN
            || block
                .offset
                .checked_add(block.length)
                .map_or(true, |end| end > self.args.metainfo.piece_length(block.piece as usize));
        if out_of_bounds {
            if let Some(entry) = self.sessions.get(&addr) {
                entry.handle.close();
            }
            self.remove_session(addr, CloseReason::ProtocolViolation("request out of bounds"));
            return;
        }

        {
            let Some(entry) = self.sessions.get_mut(&addr) else { return };
            if entry.am_choking {
                return; // requests while choked are ignored
            }
            if !self.bitfield.has(block.piece as usize) {
                return;
            }
            if entry.serve_queue.len() >= MAX_SERVE_QUEUE {
                entry.handle.close();
                self.remove_session(addr, CloseReason::FloodedRequests);
                return;
            }
            entry.serve_queue.push_back(block);
        }

        self.drain_serve_queue(addr).await;
    }

    async fn drain_serve_queue(&mut self, addr: SocketAddr) {
        loop {
            let block = {
                let Some(entry) = self.sessions.get_mut(&addr) else { return };
                if entry.am_choking {
                    entry.serve_queue.clear();
                    return;
                }
                let Some(block) = entry.serve_queue.pop_front() else { return };
                block
            };

            let data = match self
                .args
                .storage
                .read_range(block.piece as usize, block.offset, block.length)
                .await
            {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(source) => {
                    self.fail(TorrentErrorKind::Disk, source.to_string());
                    return;
                }
            };

            self.totals.uploaded.fetch_add(u64::from(block.length), Ordering::Relaxed);
            if let Some(entry) = self.sessions.get(&addr) {
                entry.handle.send(Message::Piece {
                    piece: block.piece,
                    offset: block.offset,
                    data: Bytes::from(data),
                });
            }
        }
    }

    // ---- periodic work -----------------------------------------------

    async fn on_tick(&mut self) {
        self.update_rates();
        self.expire_requests();
        self.sweep_stalled_buffers();

        let now = Instant::now();
        if now.duration_since(self.last_choke) >= CHOKE_INTERVAL {
            self.last_choke = now;
            self.run_choke_round();
        }
        if now.duration_since(self.last_pex) >= PEX_INTERVAL {
            self.last_pex = now;
            self.run_pex_round();
        }
        if now.duration_since(self.last_scrape) >= SCRAPE_INTERVAL {
            self.last_scrape = now;
            if let Some(discovery) = &self.discovery {
                discovery.scrape();
            }
        }
        if self.resume_dirty && now.duration_since(self.last_checkpoint) >= CHECKPOINT_INTERVAL {
            self.checkpoint();
        }

        self.dial_pending();
        self.top_up_requests();

        let snapshot = self.snapshot();
        self.events().send(Event::Stats {
            id: self.args.id,
            snapshot,
        });
    }

    fn update_rates(&mut self) {
        for entry in self.sessions.values_mut() {
            let bytes_in = entry.handle.shared.bytes_in.load(Ordering::Relaxed);
            let bytes_out = entry.handle.shared.bytes_out.load(Ordering::Relaxed);

            let in_delta = bytes_in.saturating_sub(entry.last_bytes_in) as f64;
            let out_delta = bytes_out.saturating_sub(entry.last_bytes_out) as f64;
            entry.last_bytes_in = bytes_in;
            entry.last_bytes_out = bytes_out;

            entry.down_rate = RATE_ALPHA * in_delta + (1.0 - RATE_ALPHA) * entry.down_rate;
            entry.up_rate = RATE_ALPHA * out_delta + (1.0 - RATE_ALPHA) * entry.up_rate;
        }
    }

    /// Cancel requests that outlived [`BLOCK_TIMEOUT`]; repeated timeouts
    /// on the same piece disassociate the peer from it.
    fn expire_requests(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<(BlockKey, SocketAddr)> = Vec::new();

        for (key, holders) in &mut self.requests {
            holders.retain(|holder| {
                if holder.deadline > now {
                    true
                } else {
                    expired.push((*key, holder.addr));
                    false
                }
            });
        }
        self.requests.retain(|_, holders| !holders.is_empty());

        for ((piece, offset), addr) in expired {
            let Some(entry) = self.sessions.get_mut(&addr) else { continue };
            let key = (piece, offset);
            entry.in_flight.remove(&key);

            let length = BLOCK_LEN.min(self.args.metainfo.piece_length(piece as usize) - offset);
            entry.handle.send(Message::Cancel(BlockInfo::new(piece, offset, length)));

            let strikes = entry.piece_strikes.entry(piece).or_insert(0);
            *strikes += 1;
            if *strikes >= MAX_PIECE_STRIKES {
                entry.banned_pieces.insert(piece);
            }
        }
    }

    /// Buffers whose piece has no received blocks and no outstanding
    /// requests go back to the picker.
    fn sweep_stalled_buffers(&mut self) {
        let stalled: Vec<u32> = self
            .buffers
            .iter()
            .filter(|(piece, buffer)| {
                buffer.received == 0 && !self.requests.keys().any(|(p, _)| p == *piece)
            })
            .map(|(piece, _)| *piece)
            .collect();
        for piece in stalled {
            self.buffers.remove(&piece);
            self.picker.unmark_downloading(piece as usize);
        }
    }

    fn run_choke_round(&mut self) {
        let seeding = matches!(self.status, TorrentStatus::Seeding);
        let candidates: Vec<ChokeCandidate> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(addr, entry)| ChokeCandidate {
                addr: *addr,
                peer_interested: entry.peer_interested,
                down_rate: entry.down_rate,
                up_rate: entry.up_rate,
            })
            .collect();

        let desired = self
            .choke
            .decide(seeding, &candidates, Instant::now(), &mut rand::thread_rng());
        let desired: HashSet<SocketAddr> = desired.into_iter().collect();

        for (addr, entry) in &mut self.sessions {
            if desired.contains(addr) && entry.am_choking {
                entry.am_choking = false;
                entry.handle.send(Message::Unchoke);
            } else if !desired.contains(addr) && !entry.am_choking {
                entry.am_choking = true;
                entry.serve_queue.clear();
                entry.handle.send(Message::Choke);
            }
        }
    }

    /// Advertise our connected peers over `ut_pex`, as deltas per peer.
    fn run_pex_round(&mut self) {
        let connected: HashSet<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(addr, _)| *addr)
            .collect();

        for (addr, entry) in &mut self.sessions {
            let Some(pex_id) = entry.pex_id else { continue };
            if !entry.connected {
                continue;
            }

            let mut current = connected.clone();
            current.remove(addr);

            let added: Vec<SocketAddr> = current.difference(&entry.last_pex).copied().collect();
            let dropped: Vec<SocketAddr> = entry.last_pex.difference(&current).copied().collect();
            if added.is_empty() && dropped.is_empty() {
                continue;
            }

            let message = PexMessage { added, dropped };
            entry.handle.send(Message::Extended {
                ext_id: pex_id,
                payload: Bytes::from(message.to_payload()),
            });
            entry.last_pex = current;
        }
    }

    fn checkpoint(&mut self) {
        let record = ResumeRecord {
            info_hash: self.args.metainfo.info_hash(),
            torrent_file_path: self.args.torrent_file_path.clone(),
            download_path: self.args.download_path.clone(),
            downloaded: self.totals.downloaded.load(Ordering::Relaxed),
            uploaded: self.totals.uploaded.load(Ordering::Relaxed),
            bitfield_bytes: self.bitfield.to_bytes(),
            files: self
                .args
                .metainfo
                .files()
                .iter()
                .enumerate()
                .map(|(index, file)| FileResume {
                    path: file.path.clone(),
                    downloaded: self.file_downloaded[index],
                    selected: self.file_selected[index],
                    priority: self.file_priorities[index],
                })
                .collect(),
            max_download_bps: self.max_download_bps,
            max_upload_bps: self.max_upload_bps,
            priority: Priority::Normal,
        };

        if let Err(source) = self.args.state_store.save(&record) {
            warn!(id = self.args.id, %source, "resume checkpoint failed");
        } else {
            self.resume_dirty = false;
            self.last_checkpoint = Instant::now();
        }
    }

    fn snapshot(&self) -> TorrentSnapshot {
        let wanted = self.picker.missing_count() + self.bitfield.set_count();
        let progress = if wanted == 0 {
            1.0
        } else {
            self.bitfield.set_count() as f64 / wanted as f64
        };

        let peers_connected = self.sessions.values().filter(|entry| entry.connected).count();
        let peers_active = self
            .sessions
            .values()
            .filter(|entry| !entry.in_flight.is_empty() || entry.down_rate > 1.0 || entry.up_rate > 1.0)
            .count();

        let (swarm_complete, swarm_incomplete) = self
            .swarm
            .lock()
            .expect("swarm lock poisoned")
            .map_or((None, None), |(complete, incomplete)| (Some(complete), Some(incomplete)));

        let (down_bps, up_bps) = self.sessions.values().fold((0.0, 0.0), |(down, up), entry| {
            (down + entry.down_rate, up + entry.up_rate)
        });

        TorrentSnapshot {
            id: self.args.id,
            info_hash: self.args.metainfo.info_hash(),
            name: self.args.metainfo.name().to_owned(),
            status: self.status,
            progress,
            downloaded: self.totals.downloaded.load(Ordering::Relaxed),
            uploaded: self.totals.uploaded.load(Ordering::Relaxed),
            left: self.totals.left.load(Ordering::Relaxed),
            down_bps: down_bps as u64,
            up_bps: up_bps as u64,
            peers_total: self.sessions.len() + self.pending_dials.len(),
            peers_connected,
            peers_active,
            swarm_complete,
            swarm_incomplete,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
        }
    }

    /// Graceful teardown: stopped announce (bounded), checkpoint, close.
    async fn shutdown(&mut self) {
        if matches!(self.status, TorrentStatus::Downloading | TorrentStatus::Seeding) {
            self.stop_discovery(true);
        } else {
            self.stop_discovery(false);
        }
        self.close_all_sessions();
        self.checkpoint();
        self.args.storage.close_all().await;
        debug!(id = self.args.id, "torrent pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use riptide_primitives::BLOCK_LEN;

    #[test]
    fn block_math_covers_short_final_blocks() {
        let piece_len: u32 = 40_000;
        let blocks = piece_len.div_ceil(BLOCK_LEN);
        assert_eq!(blocks, 3);

        let last_offset = (blocks - 1) * BLOCK_LEN;
        assert_eq!(BLOCK_LEN.min(piece_len - last_offset), 40_000 - 2 * 16_384);
    }
}
