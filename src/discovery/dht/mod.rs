//! Mainline DHT node (BEP 5).
//!
//! One DHT node serves the whole engine. It keeps a Kademlia routing table
//! bootstrapped from the well-known routers, answers inbound queries (so we
//! are a useful citizen), and runs iterative `get_peers` lookups on behalf
//! of torrents, following each converged lookup with `announce_peer` to the
//! closest token-bearing nodes.
pub mod krpc;
pub mod routing;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use riptide_primitives::InfoHash;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::krpc::{KrpcMessage, KrpcQuery, KrpcResponse};
use self::routing::{NodeId, NodeEntry, RoutingTable, BUCKET_SIZE};

/// Well-known bootstrap routers.
const BOOTSTRAP_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Concurrent queries per lookup, Kademlia's alpha.
const LOOKUP_CONCURRENCY: usize = 3;

/// Shortlist width considered for convergence.
const LOOKUP_WIDTH: usize = 16;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
const STORED_PEER_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_PACKET: usize = 1500;

/// Commands a torrent's discovery driver can issue.
#[derive(Debug)]
pub enum DhtCommand {
    /// Run a `get_peers` lookup, streaming found peers into `peers`.
    Search {
        info_hash: InfoHash,
        peers: mpsc::Sender<SocketAddr>,
    },
    /// Lookup plus `announce_peer` with our listen port on convergence.
    Announce { info_hash: InfoHash, port: u16 },
}

/// Cheap handle to the engine's DHT node.
#[derive(Debug, Clone)]
pub struct DhtHandle {
    cmd: mpsc::Sender<DhtCommand>,
}

impl DhtHandle {
    pub fn search(&self, info_hash: InfoHash, peers: mpsc::Sender<SocketAddr>) {
        let _ = self.cmd.try_send(DhtCommand::Search { info_hash, peers });
    }

    pub fn announce(&self, info_hash: InfoHash, port: u16) {
        let _ = self.cmd.try_send(DhtCommand::Announce { info_hash, port });
    }
}

/// Start the DHT node. `listen_port` is shared with the TCP listener by
/// convention; an occupied UDP port falls back to an ephemeral one. Returns
/// `None` when no UDP socket can be bound at all.
pub async fn spawn(listen_port: u16, cancel: CancellationToken) -> Option<(DhtHandle, SocketAddr)> {
    let socket = match UdpSocket::bind(("0.0.0.0", listen_port)).await {
        Ok(socket) => socket,
        Err(_) => match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(source) => {
                warn!(%source, "dht disabled: no udp socket");
                return None;
            }
        },
    };
    let local_addr = socket.local_addr().ok()?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(run(socket, cancel, cmd_rx));
    Some((DhtHandle { cmd: cmd_tx }, local_addr))
}

#[derive(Debug, Clone, Copy)]
enum Purpose {
    Bootstrap,
    Lookup { lookup_id: u64 },
    Announce,
}

struct Pending {
    addr: SocketAddr,
    purpose: Purpose,
    sent_at: Instant,
}

struct Lookup {
    info_hash: InfoHash,
    peers_tx: Option<mpsc::Sender<SocketAddr>>,
    announce_port: Option<u16>,
    queried: HashSet<SocketAddr>,
    reported: HashSet<SocketAddr>,
    /// Candidate nodes, kept sorted by distance to the target.
    candidates: Vec<(NodeId, SocketAddr)>,
    /// Nodes that answered, with their announce tokens.
    responded: Vec<(NodeId, SocketAddr, Option<Vec<u8>>)>,
    inflight: usize,
    started: Instant,
}

struct DhtNode {
    socket: UdpSocket,
    table: RoutingTable,
    pending: HashMap<u16, Pending>,
    next_transaction: u16,
    lookups: HashMap<u64, Lookup>,
    next_lookup: u64,
    /// Tokens we handed out with `get_peers` responses.
    issued_tokens: HashMap<SocketAddr, (Vec<u8>, Instant)>,
    /// Peers other nodes announced to us.
    stored_peers: HashMap<InfoHash, Vec<(SocketAddr, Instant)>>,
    last_bootstrap: Option<Instant>,
}

async fn run(socket: UdpSocket, cancel: CancellationToken, mut cmd_rx: mpsc::Receiver<DhtCommand>) {
    let own_id = NodeId::random(&mut rand::thread_rng());
    info!(node_id = ?own_id.0, "dht node starting");

    let mut node = DhtNode {
        socket,
        table: RoutingTable::new(own_id),
        pending: HashMap::new(),
        next_transaction: rand::thread_rng().gen(),
        lookups: HashMap::new(),
        next_lookup: 0,
        issued_tokens: HashMap::new(),
        stored_peers: HashMap::new(),
        last_bootstrap: None,
    };

    node.bootstrap().await;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut buffer = [0u8; MAX_PACKET];

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                None => break,
                Some(DhtCommand::Search { info_hash, peers }) => {
                    node.start_lookup(info_hash, Some(peers), None).await;
                }
                Some(DhtCommand::Announce { info_hash, port }) => {
                    node.start_lookup(info_hash, None, Some(port)).await;
                }
            },
            received = node.socket.recv_from(&mut buffer) => {
                if let Ok((len, from)) = received {
                    node.handle_packet(&buffer[..len], from).await;
                }
            }
            _ = tick.tick() => node.on_tick().await,
        }
    }
}

impl DhtNode {
    async fn bootstrap(&mut self) {
        self.last_bootstrap = Some(Instant::now());
        for router in BOOTSTRAP_ROUTERS {
            let Ok(mut addrs) = tokio::net::lookup_host(router).await else {
                continue;
            };
            if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                let own = self.table.own_id();
                self.send_query(addr, KrpcQuery::FindNode { id: own, target: own }, Purpose::Bootstrap)
                    .await;
            }
        }
    }

    async fn start_lookup(&mut self, info_hash: InfoHash, peers_tx: Option<mpsc::Sender<SocketAddr>>, announce_port: Option<u16>) {
        let target = NodeId(info_hash.0);
        let candidates: Vec<(NodeId, SocketAddr)> = self
            .table
            .closest(&target, LOOKUP_WIDTH)
            .into_iter()
            .map(|entry| (entry.id, entry.addr))
            .collect();

        let lookup_id = self.next_lookup;
        self.next_lookup += 1;
        self.lookups.insert(
            lookup_id,
            Lookup {
                info_hash,
                peers_tx,
                announce_port,
                queried: HashSet::new(),
                reported: HashSet::new(),
                candidates,
                responded: Vec::new(),
                inflight: 0,
                started: Instant::now(),
            },
        );
        debug!(%info_hash, lookup_id, "dht lookup starting");
        self.advance_lookup(lookup_id).await;
    }

    /// Keep alpha queries in flight against the closest unqueried
    /// candidates; finish when the shortlist is exhausted.
    async fn advance_lookup(&mut self, lookup_id: u64) {
        let own = self.table.own_id();

        let to_query: Vec<SocketAddr> = {
            let Some(lookup) = self.lookups.get(&lookup_id) else {
                return;
            };
            lookup
                .candidates
                .iter()
                .take(LOOKUP_WIDTH)
                .filter(|(_, addr)| !lookup.queried.contains(addr))
                .take(LOOKUP_CONCURRENCY.saturating_sub(lookup.inflight))
                .map(|(_, addr)| *addr)
                .collect()
        };

        let info_hash = self.lookups[&lookup_id].info_hash;
        for addr in to_query {
            if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                lookup.queried.insert(addr);
                lookup.inflight += 1;
            }
            self.send_query(addr, KrpcQuery::GetPeers { id: own, info_hash }, Purpose::Lookup { lookup_id })
                .await;
        }

        let finished = self.lookups.get(&lookup_id).is_some_and(|lookup| {
            let unqueried_near = lookup
                .candidates
                .iter()
                .take(LOOKUP_WIDTH)
                .any(|(_, addr)| !lookup.queried.contains(addr));
            lookup.inflight == 0 && !unqueried_near
        });
        if finished {
            self.finish_lookup(lookup_id).await;
        }
    }

    async fn finish_lookup(&mut self, lookup_id: u64) {
        let Some(lookup) = self.lookups.remove(&lookup_id) else {
            return;
        };
        debug!(info_hash = %lookup.info_hash, responded = lookup.responded.len(), "dht lookup finished");

        let Some(port) = lookup.announce_port else {
            return;
        };

        let target = NodeId(lookup.info_hash.0);
        let mut responded = lookup.responded;
        responded.sort_by_key(|(id, _, _)| id.distance(&target));

        let own = self.table.own_id();
        for (_, addr, token) in responded.into_iter().take(BUCKET_SIZE) {
            let Some(token) = token else { continue };
            self.send_query(
                addr,
                KrpcQuery::AnnouncePeer {
                    id: own,
                    info_hash: lookup.info_hash,
                    port,
                    token,
                    implied_port: false,
                },
                Purpose::Announce,
            )
            .await;
        }
    }

    async fn handle_packet(&mut self, bytes: &[u8], from: SocketAddr) {
        let message = match KrpcMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(source) => {
                trace!(%from, %source, "ignoring undecodable dht packet");
                return;
            }
        };

        match message {
            KrpcMessage::Query { transaction, query } => self.answer_query(&transaction, query, from).await,
            KrpcMessage::Response { transaction, response } => {
                let Some(pending) = self.take_pending(&transaction, from) else {
                    return;
                };
                self.table.insert(response.id, from);
                match pending.purpose {
                    Purpose::Bootstrap => self.on_bootstrap_response(response).await,
                    Purpose::Lookup { lookup_id } => self.on_lookup_response(lookup_id, from, response).await,
                    Purpose::Announce => {}
                }
            }
            KrpcMessage::Error { transaction, code, message } => {
                trace!(%from, code, message, "dht error response");
                if let Some(pending) = self.take_pending(&transaction, from) {
                    if let Purpose::Lookup { lookup_id } = pending.purpose {
                        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                            lookup.inflight = lookup.inflight.saturating_sub(1);
                        }
                        self.advance_lookup(lookup_id).await;
                    }
                }
            }
        }
    }

    fn take_pending(&mut self, transaction: &[u8], from: SocketAddr) -> Option<Pending> {
        let transaction: [u8; 2] = transaction.try_into().ok()?;
        let key = u16::from_be_bytes(transaction);
        // Responses must come from the node we queried.
        match self.pending.get(&key) {
            Some(pending) if pending.addr == from => self.pending.remove(&key),
            _ => None,
        }
    }

    async fn on_bootstrap_response(&mut self, response: KrpcResponse) {
        let own = self.table.own_id();
        for (id, addr) in response.nodes {
            self.table.insert(id, addr);
            // Widen the table while it is still small.
            if self.table.len() < 4 * BUCKET_SIZE {
                self.send_query(addr, KrpcQuery::FindNode { id: own, target: own }, Purpose::Bootstrap)
                    .await;
            }
        }
    }

    async fn on_lookup_response(&mut self, lookup_id: u64, from: SocketAddr, response: KrpcResponse) {
        let mut forward: Vec<(mpsc::Sender<SocketAddr>, SocketAddr)> = Vec::new();

        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
            lookup.inflight = lookup.inflight.saturating_sub(1);
            lookup.responded.push((response.id, from, response.token.clone()));

            if let Some(peers_tx) = &lookup.peers_tx {
                for peer in &response.values {
                    if lookup.reported.insert(*peer) {
                        forward.push((peers_tx.clone(), *peer));
                    }
                }
            }

            let target = NodeId(lookup.info_hash.0);
            for (id, addr) in response.nodes {
                let known = lookup.queried.contains(&addr)
                    || lookup.candidates.iter().any(|(_, existing)| *existing == addr);
                if !known {
                    lookup.candidates.push((id, addr));
                }
            }
            lookup.candidates.sort_by_key(|(id, _)| id.distance(&target));
            lookup.candidates.truncate(4 * LOOKUP_WIDTH);
        }

        for (peers_tx, peer) in forward {
            let _ = peers_tx.send(peer).await;
        }
        self.advance_lookup(lookup_id).await;
    }

    async fn answer_query(&mut self, transaction: &[u8], query: KrpcQuery, from: SocketAddr) {
        let own = self.table.own_id();

        let response = match query {
            KrpcQuery::Ping { id } => {
                self.table.insert(id, from);
                KrpcResponse {
                    id: own,
                    ..KrpcResponse::default()
                }
            }
            KrpcQuery::FindNode { id, target } => {
                self.table.insert(id, from);
                let nodes = self
                    .table
                    .closest(&target, BUCKET_SIZE)
                    .into_iter()
                    .map(|NodeEntry { id, addr, .. }| (id, addr))
                    .collect();
                KrpcResponse {
                    id: own,
                    nodes,
                    ..KrpcResponse::default()
                }
            }
            KrpcQuery::GetPeers { id, info_hash } => {
                self.table.insert(id, from);

                let mut token = vec![0u8; 8];
                rand::thread_rng().fill(token.as_mut_slice());
                self.issued_tokens.insert(from, (token.clone(), Instant::now()));

                let values: Vec<SocketAddr> = self
                    .stored_peers
                    .get(&info_hash)
                    .map(|peers| peers.iter().map(|(addr, _)| *addr).collect())
                    .unwrap_or_default();
                let nodes = if values.is_empty() {
                    self.table
                        .closest(&NodeId(info_hash.0), BUCKET_SIZE)
                        .into_iter()
                        .map(|NodeEntry { id, addr, .. }| (id, addr))
                        .collect()
                } else {
                    Vec::new()
                };

                KrpcResponse {
                    id: own,
                    nodes,
                    values,
                    token: Some(token),
                }
            }
            KrpcQuery::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            } => {
                let valid = self
                    .issued_tokens
                    .get(&from)
                    .is_some_and(|(issued, at)| *issued == token && at.elapsed() < TOKEN_TTL);
                if !valid {
                    let error = KrpcMessage::Error {
                        transaction: transaction.to_vec(),
                        code: 203,
                        message: "bad token".to_owned(),
                    };
                    let _ = self.socket.send_to(&error.to_bytes(), from).await;
                    return;
                }

                self.table.insert(id, from);
                let peer_port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                let peers = self.stored_peers.entry(info_hash).or_default();
                peers.retain(|(existing, _)| *existing != peer);
                peers.push((peer, Instant::now()));

                KrpcResponse {
                    id: own,
                    ..KrpcResponse::default()
                }
            }
        };

        let reply = KrpcMessage::Response {
            transaction: transaction.to_vec(),
            response,
        };
        let _ = self.socket.send_to(&reply.to_bytes(), from).await;
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        // Expired queries count as failures for their lookups.
        let timed_out: Vec<(u16, Purpose)> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.sent_at) > QUERY_TIMEOUT)
            .map(|(key, pending)| (*key, pending.purpose))
            .collect();
        for (key, purpose) in timed_out {
            self.pending.remove(&key);
            if let Purpose::Lookup { lookup_id } = purpose {
                if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                    lookup.inflight = lookup.inflight.saturating_sub(1);
                }
                self.advance_lookup(lookup_id).await;
            }
        }

        // Lookups have a hard deadline.
        let expired: Vec<u64> = self
            .lookups
            .iter()
            .filter(|(_, lookup)| now.duration_since(lookup.started) > LOOKUP_DEADLINE)
            .map(|(id, _)| *id)
            .collect();
        for lookup_id in expired {
            self.finish_lookup(lookup_id).await;
        }

        self.issued_tokens.retain(|_, (_, at)| at.elapsed() < TOKEN_TTL);
        for peers in self.stored_peers.values_mut() {
            peers.retain(|(_, at)| at.elapsed() < STORED_PEER_TTL);
        }
        self.stored_peers.retain(|_, peers| !peers.is_empty());

        let rebootstrap_due = self
            .last_bootstrap
            .map_or(true, |at| now.duration_since(at) > Duration::from_secs(60));
        if self.table.is_empty() && rebootstrap_due {
            self.bootstrap().await;
        }
    }

    async fn send_query(&mut self, addr: SocketAddr, query: KrpcQuery, purpose: Purpose) {
        let key = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);

        let message = KrpcMessage::Query {
            transaction: key.to_be_bytes().to_vec(),
            query,
        };
        if self.socket.send_to(&message.to_bytes(), addr).await.is_ok() {
            self.pending.insert(
                key,
                Pending {
                    addr,
                    purpose,
                    sent_at: Instant::now(),
                },
            );
        }
    }
}
