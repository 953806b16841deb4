//! Peer discovery: HTTP/UDP trackers, the DHT, PEX and LSD, all feeding one
//! deduplicated endpoint stream per torrent.
//!
//! Each torrent runs one discovery driver task. Tracker tiers are honored
//! in order: within a tier, the first tracker that answers is promoted to
//! the front and used for subsequent announces; a tier whose trackers all
//! fail backs off exponentially. The DHT and LSD are engine-wide services
//! the driver registers with. PEX is session-borne, so the pipeline handles
//! it and pushes learned endpoints through the same dedup gate.
pub mod dht;
pub mod http_tracker;
pub mod lsd;
pub mod pex;
pub mod udp_tracker;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use riptide_configuration::Settings;
use riptide_primitives::{AnnounceEvent, InfoHash, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use self::dht::DhtHandle;
use self::http_tracker::{AnnounceParams, AnnounceResponse, HttpTrackerClient, ScrapeStats};
use self::lsd::LsdHandle;
use self::udp_tracker::UdpTrackerClient;

/// Errors from tracker traffic. Never fatal to a torrent: the driver logs,
/// backs off and keeps the other sources running.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker client error: {0}")]
    Client(String),

    #[error("tracker unreachable: {0}")]
    Unreachable(String),

    #[error("tracker answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("tracker response malformed: {0}")]
    Malformed(String),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("tracker does not support scraping")]
    ScrapeUnsupported,
}

/// Base tracker backoff after a failed announce round; doubles per
/// consecutive failure.
const TRACKER_BACKOFF_BASE: Duration = Duration::from_secs(15);
const TRACKER_BACKOFF_CEILING: Duration = Duration::from_secs(3600);

/// Cadence of DHT lookups and announces per torrent.
const DHT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The process-global endpoint gate: deduplicates discovered endpoints and
/// drops anything that is actually us.
#[derive(Debug)]
pub struct EndpointRegistry {
    listen_port: u16,
    local_addrs: HashSet<IpAddr>,
    seen: Mutex<HashSet<SocketAddr>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new(listen_port: u16) -> Self {
        let mut local_addrs: HashSet<IpAddr> = HashSet::new();
        local_addrs.insert(IpAddr::from([127, 0, 0, 1]));
        local_addrs.insert(IpAddr::from([0u8, 0, 0, 0]));
        if let Ok(interfaces) = local_ip_address::list_afinet_netifas() {
            local_addrs.extend(interfaces.into_iter().map(|(_, addr)| addr));
        }

        Self {
            listen_port,
            local_addrs,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Admit an endpoint exactly once, never ourselves.
    #[must_use]
    pub fn admit(&self, addr: SocketAddr) -> bool {
        if addr.port() == self.listen_port && self.local_addrs.contains(&addr.ip()) {
            return false;
        }
        self.seen.lock().expect("endpoint lock poisoned").insert(addr)
    }

    /// Forget an endpoint so a later source may re-introduce it, used when
    /// a session ends without ever completing a handshake.
    pub fn forget(&self, addr: SocketAddr) {
        self.seen.lock().expect("endpoint lock poisoned").remove(&addr);
    }
}

/// Transfer totals shared between the pipeline (writer) and the discovery
/// driver (reader: announce parameters).
#[derive(Debug, Default)]
pub struct TransferTotals {
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub left: AtomicU64,
}

impl TransferTotals {
    fn announce_params(&self, info_hash: InfoHash, peer_id: PeerId, port: u16, event: AnnounceEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash,
            peer_id,
            port,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            event,
        }
    }
}

/// One announce-capable endpoint, HTTP(S) or UDP.
enum TrackerClient {
    Http(HttpTrackerClient),
    Udp(UdpTrackerClient),
}

impl TrackerClient {
    fn for_url(url: &Url, settings: &Settings) -> Option<Self> {
        match url.scheme() {
            "http" | "https" => {
                let cookie = settings.cookie_for_tracker(url.as_str()).map(str::to_owned);
                let headers = settings
                    .headers_for_tracker(url.as_str())
                    .map(|headers| headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                HttpTrackerClient::new(url.clone(), cookie, headers).ok().map(Self::Http)
            }
            "udp" => UdpTrackerClient::new(url.clone()).ok().map(Self::Udp),
            other => {
                warn!(%url, scheme = other, "unsupported tracker scheme");
                None
            }
        }
    }

    fn url(&self) -> &Url {
        match self {
            Self::Http(client) => client.url(),
            Self::Udp(client) => client.url(),
        }
    }

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Self::Http(client) => client.announce(params).await,
            Self::Udp(client) => client.announce(params).await,
        }
    }

    async fn scrape(&mut self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        match self {
            Self::Http(client) => client.scrape(info_hash).await,
            Self::Udp(client) => client.scrape(info_hash).await,
        }
    }
}

struct Tier {
    trackers: Vec<TrackerClient>,
    next_announce: Instant,
    backoff_level: u32,
    sent_started: bool,
}

/// Commands from the torrent pipeline.
#[derive(Debug)]
pub enum DiscoveryCommand {
    /// Push an event announce (completed, stopped) to every tier now.
    Announce(AnnounceEvent),
    /// Refresh swarm counts via scrape.
    Scrape,
}

/// The pipeline's grip on its discovery driver.
#[derive(Debug)]
pub struct DiscoveryHandle {
    pub cmd: mpsc::Sender<DiscoveryCommand>,
}

impl DiscoveryHandle {
    pub fn announce_event(&self, event: AnnounceEvent) {
        let _ = self.cmd.try_send(DiscoveryCommand::Announce(event));
    }

    pub fn scrape(&self) {
        let _ = self.cmd.try_send(DiscoveryCommand::Scrape);
    }
}

/// Everything the driver needs, fixed at torrent start.
pub struct DiscoveryConfig {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub tiers: Vec<Vec<Url>>,
    pub settings: Arc<Settings>,
    pub totals: Arc<TransferTotals>,
    pub registry: Arc<EndpointRegistry>,
    /// Deduplicated endpoints flow out here, into the pipeline.
    pub peers_tx: mpsc::Sender<SocketAddr>,
    /// Swarm counts from announces/scrapes, read by snapshots.
    pub swarm: Arc<Mutex<Option<(u32, u32)>>>,
    pub dht: Option<DhtHandle>,
    pub lsd: Option<LsdHandle>,
    pub cancel: CancellationToken,
}

/// Start a torrent's discovery driver.
pub fn spawn(config: DiscoveryConfig) -> DiscoveryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    tokio::spawn(run(config, cmd_rx));
    DiscoveryHandle { cmd: cmd_tx }
}

async fn run(mut config: DiscoveryConfig, mut cmd_rx: mpsc::Receiver<DiscoveryCommand>) {
    let now = Instant::now();
    let mut tiers: Vec<Tier> = config
        .tiers
        .iter()
        .map(|urls| Tier {
            trackers: urls
                .iter()
                .filter_map(|url| TrackerClient::for_url(url, &config.settings))
                .collect(),
            next_announce: now,
            backoff_level: 0,
            sent_started: false,
        })
        .filter(|tier| !tier.trackers.is_empty())
        .collect();

    // LAN peers flow straight into the pipeline channel; the registry gate
    // still applies below for tracker/DHT results, so route LSD through an
    // intermediate that applies the same gate.
    let (lan_tx, mut lan_rx) = mpsc::channel::<SocketAddr>(64);
    if let Some(lsd) = &config.lsd {
        lsd.register(config.info_hash, lan_tx.clone());
    }
    let (dht_tx, mut dht_rx) = mpsc::channel::<SocketAddr>(64);

    let cancel = config.cancel.clone();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut next_dht = now;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                None => break,
                Some(DiscoveryCommand::Announce(event)) => {
                    announce_all_tiers(&mut tiers, &mut config, event).await;
                    if event == AnnounceEvent::Stopped {
                        break;
                    }
                }
                Some(DiscoveryCommand::Scrape) => scrape_tiers(&mut tiers, &config).await,
            },
            Some(peer) = lan_rx.recv() => forward_peer(&config, peer).await,
            Some(peer) = dht_rx.recv() => forward_peer(&config, peer).await,
            _ = tick.tick() => {
                let now = Instant::now();

                for tier in &mut tiers {
                    if now >= tier.next_announce {
                        let event = if tier.sent_started { AnnounceEvent::None } else { AnnounceEvent::Started };
                        announce_tier(tier, &mut config, event).await;
                    }
                }

                if now >= next_dht {
                    next_dht = now + DHT_INTERVAL;
                    if let Some(dht) = &config.dht {
                        dht.search(config.info_hash, dht_tx.clone());
                        dht.announce(config.info_hash, config.listen_port);
                    }
                }
            }
        }
    }

    if let Some(lsd) = &config.lsd {
        lsd.unregister(config.info_hash);
    }
}

async fn forward_peer(config: &DiscoveryConfig, peer: SocketAddr) {
    if config.registry.admit(peer) {
        let _ = config.peers_tx.send(peer).await;
    }
}

/// Try the tier's trackers in order; first success is promoted to the
/// front. All failing backs the tier off exponentially.
async fn announce_tier(tier: &mut Tier, config: &mut DiscoveryConfig, event: AnnounceEvent) {
    let params = config
        .totals
        .announce_params(config.info_hash, config.peer_id, config.listen_port, event);

    for index in 0..tier.trackers.len() {
        let result = tier.trackers[index].announce(&params).await;
        let url = tier.trackers[index].url().clone();

        match result {
            Ok(response) => {
                debug!(%url, peers = response.peers.len(), "announce succeeded");
                if index != 0 {
                    tier.trackers.swap(0, index);
                }
                tier.backoff_level = 0;
                tier.sent_started = true;

                let interval = response.min_interval.map_or(response.interval, |min| response.interval.max(min));
                tier.next_announce = Instant::now() + interval;

                if let (Some(complete), Some(incomplete)) = (response.complete, response.incomplete) {
                    *config.swarm.lock().expect("swarm lock poisoned") = Some((complete, incomplete));
                }

                for peer in response.peers {
                    forward_peer(config, peer).await;
                }
                return;
            }
            Err(source) => {
                trace!(%url, %source, "announce failed");
            }
        }
    }

    tier.backoff_level = (tier.backoff_level + 1).min(8);
    let backoff = (TRACKER_BACKOFF_BASE * 2u32.pow(tier.backoff_level.min(7))).min(TRACKER_BACKOFF_CEILING);
    tier.next_announce = Instant::now() + backoff;
}

async fn announce_all_tiers(tiers: &mut [Tier], config: &mut DiscoveryConfig, event: AnnounceEvent) {
    for tier in tiers {
        // Event announces only make sense to trackers that know us.
        if tier.sent_started {
            announce_tier(tier, config, event).await;
        }
    }
}

async fn scrape_tiers(tiers: &mut [Tier], config: &DiscoveryConfig) {
    for tier in tiers {
        let Some(tracker) = tier.trackers.first_mut() else {
            continue;
        };
        match tracker.scrape(config.info_hash).await {
            Ok(stats) => {
                *config.swarm.lock().expect("swarm lock poisoned") = Some((stats.complete, stats.incomplete));
                return;
            }
            Err(TrackerError::ScrapeUnsupported) => continue,
            Err(source) => {
                trace!(url = %tracker.url(), %source, "scrape failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::EndpointRegistry;

    #[test]
    fn endpoints_are_admitted_exactly_once() {
        let registry = EndpointRegistry::new(6881);
        let addr: SocketAddr = "203.0.113.9:6881".parse().unwrap();

        assert!(registry.admit(addr));
        assert!(!registry.admit(addr));

        registry.forget(addr);
        assert!(registry.admit(addr));
    }

    #[test]
    fn our_own_listen_endpoint_is_rejected() {
        let registry = EndpointRegistry::new(6881);
        let self_addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(!registry.admit(self_addr));

        // Same address on a different port is a legitimate peer.
        let other_port: SocketAddr = "127.0.0.1:6999".parse().unwrap();
        assert!(registry.admit(other_port));
    }
}
