//! UDP tracker client (BEP 15).
//!
//! The protocol is three fixed-layout packets over UDP: `connect` proves
//! liveness and yields a connection id valid for 60 s, `announce` carries
//! the transfer report and returns compact peers, `scrape` returns swarm
//! counts. Every exchange retries with exponentially growing timeouts,
//! 15 s · 2ⁿ, for up to 8 attempts.
use std::time::Duration;

use rand::Rng;
use riptide_primitives::InfoHash;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};
use url::Url;

use super::http_tracker::{AnnounceParams, AnnounceResponse, ScrapeStats, DEFAULT_INTERVAL};
use super::pex::compact_to_addrs;
use super::TrackerError;

/// The connect-request magic, fixed by BEP 15.
const PROTOCOL_MAGIC: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Base retry timeout; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(15);

/// Total attempts before the tracker is reported unreachable.
const MAX_ATTEMPTS: u32 = 8;

/// How long a connection id stays valid.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const MAX_PACKET_SIZE: usize = 4096;

/// Client for one `udp://` tracker. Holds its own ephemeral socket (bound
/// lazily, then reused so the cached connection id stays tied to one source
/// port) and a cached connection id.
#[derive(Debug)]
pub struct UdpTrackerClient {
    url: Url,
    socket: Option<UdpSocket>,
    connection: Option<(u64, Instant)>,
}

impl UdpTrackerClient {
    /// # Errors
    ///
    /// Fails when the URL has no host or port.
    pub fn new(url: Url) -> Result<Self, TrackerError> {
        if url.host_str().is_none() || url.port().is_none() {
            return Err(TrackerError::Client(format!("udp tracker url {url} lacks host or port")));
        }
        Ok(Self {
            url,
            socket: None,
            connection: None,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Announce and parse the peer list.
    ///
    /// # Errors
    ///
    /// Fails when the tracker stays silent through all retries or answers
    /// with an error action.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        self.ensure_socket().await?;
        let connection_id = self.connection_id().await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&params.info_hash.0);
        packet.extend_from_slice(&params.peer_id.0);
        packet.extend_from_slice(&params.downloaded.to_be_bytes());
        packet.extend_from_slice(&params.left.to_be_bytes());
        packet.extend_from_slice(&params.uploaded.to_be_bytes());
        packet.extend_from_slice(&params.event.to_i32().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // ip: default
        packet.extend_from_slice(&rand::thread_rng().gen::<u32>().to_be_bytes()); // key
        packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want
        packet.extend_from_slice(&params.port.to_be_bytes());

        let socket = self.socket.as_ref().expect("socket was just ensured");
        let response = exchange(socket, &packet, transaction_id).await?;
        parse_announce(&response)
    }

    /// Scrape swarm counts for one torrent.
    ///
    /// # Errors
    ///
    /// As for [`UdpTrackerClient::announce`].
    pub async fn scrape(&mut self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        self.ensure_socket().await?;
        let connection_id = self.connection_id().await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(36);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&info_hash.0);

        let socket = self.socket.as_ref().expect("socket was just ensured");
        let response = exchange(socket, &packet, transaction_id).await?;
        if response.len() < 20 {
            return Err(TrackerError::Malformed("short scrape response".to_owned()));
        }
        Ok(ScrapeStats {
            complete: read_u32(&response, 8),
            downloaded: read_u32(&response, 12),
            incomplete: read_u32(&response, 16),
        })
    }

    async fn ensure_socket(&mut self) -> Result<(), TrackerError> {
        if self.socket.is_some() {
            return Ok(());
        }

        let host = self.url.host_str().expect("checked in new").to_owned();
        let port = self.url.port().expect("checked in new");

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| TrackerError::Client(source.to_string()))?;
        socket
            .connect((host.as_str(), port))
            .await
            .map_err(|source| TrackerError::Unreachable(source.to_string()))?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Get a valid connection id, reusing the cached one within its TTL.
    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, obtained)) = self.connection {
            if obtained.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let id = {
            let socket = self.socket.as_ref().expect("socket was just ensured");
            let response = exchange(socket, &packet, transaction_id).await?;
            if response.len() < 16 {
                return Err(TrackerError::Malformed("short connect response".to_owned()));
            }
            read_u64(&response, 8)
        };

        self.connection = Some((id, Instant::now()));
        debug!(url = %self.url, "udp tracker connection established");
        Ok(id)
    }
}

/// Send `packet` and wait for a response matching `transaction_id`, with
/// BEP 15 retry timing. An `error` action short-circuits the retries.
async fn exchange(socket: &UdpSocket, packet: &[u8], transaction_id: u32) -> Result<Vec<u8>, TrackerError> {
    for attempt in 0..MAX_ATTEMPTS {
        socket
            .send(packet)
            .await
            .map_err(|source| TrackerError::Unreachable(source.to_string()))?;
        trace!(attempt, bytes = packet.len(), "udp tracker packet sent");

        let wait = RETRY_BASE * 2u32.pow(attempt);
        let deadline = Instant::now() + wait;
        loop {
            let mut buffer = [0u8; MAX_PACKET_SIZE];
            let received = match timeout(deadline - Instant::now(), socket.recv(&mut buffer)).await {
                Err(_) => break, // this attempt timed out; re-send
                Ok(Err(source)) => return Err(TrackerError::Unreachable(source.to_string())),
                Ok(Ok(received)) => received,
            };

            if received < 8 {
                continue;
            }
            let response = &buffer[..received];
            if read_u32(response, 4) != transaction_id {
                continue;
            }

            let action = read_u32(response, 0);
            if action == ACTION_ERROR {
                let message = String::from_utf8_lossy(&response[8..]).into_owned();
                return Err(TrackerError::Failure(message));
            }
            return Ok(response.to_vec());
        }
    }

    Err(TrackerError::Unreachable("udp tracker never answered".to_owned()))
}

fn parse_announce(response: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    if response.len() < 20 || read_u32(response, 0) != ACTION_ANNOUNCE {
        return Err(TrackerError::Malformed("short announce response".to_owned()));
    }

    let interval = u64::from(read_u32(response, 8));
    let leechers = read_u32(response, 12);
    let seeders = read_u32(response, 16);

    Ok(AnnounceResponse {
        interval: if interval == 0 {
            DEFAULT_INTERVAL
        } else {
            Duration::from_secs(interval)
        },
        min_interval: None,
        peers: compact_to_addrs(&response[20..]),
        complete: Some(seeders),
        incomplete: Some(leechers),
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().expect("bounds checked by caller"))
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().expect("bounds checked by caller"))
}

#[cfg(test)]
mod tests {
    use riptide_primitives::{AnnounceEvent, InfoHash, PeerId};
    use tokio::net::UdpSocket;
    use url::Url;

    use super::{UdpTrackerClient, ACTION_ANNOUNCE, ACTION_CONNECT, PROTOCOL_MAGIC};
    use crate::discovery::http_tracker::AnnounceParams;

    /// A one-shot fake tracker: answers one connect and one announce.
    async fn run_fake_tracker(socket: UdpSocket, peers: Vec<u8>) {
        let mut buffer = [0u8; 4096];

        // connect
        let (received, from) = socket.recv_from(&mut buffer).await.unwrap();
        assert_eq!(received, 16);
        assert_eq!(u64::from_be_bytes(buffer[0..8].try_into().unwrap()), PROTOCOL_MAGIC);
        assert_eq!(u32::from_be_bytes(buffer[8..12].try_into().unwrap()), ACTION_CONNECT);
        let transaction = &buffer[12..16].to_vec();

        let mut response = Vec::new();
        response.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        response.extend_from_slice(transaction);
        response.extend_from_slice(&0x1122_3344_5566_7788u64.to_be_bytes());
        socket.send_to(&response, from).await.unwrap();

        // announce
        let (received, from) = socket.recv_from(&mut buffer).await.unwrap();
        assert_eq!(received, 98);
        assert_eq!(
            u64::from_be_bytes(buffer[0..8].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
        assert_eq!(u32::from_be_bytes(buffer[8..12].try_into().unwrap()), ACTION_ANNOUNCE);
        let transaction = &buffer[12..16].to_vec();

        let mut response = Vec::new();
        response.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        response.extend_from_slice(transaction);
        response.extend_from_slice(&1800u32.to_be_bytes());
        response.extend_from_slice(&3u32.to_be_bytes()); // leechers
        response.extend_from_slice(&7u32.to_be_bytes()); // seeders
        response.extend_from_slice(&peers);
        socket.send_to(&response, from).await.unwrap();
    }

    #[tokio::test]
    async fn connect_then_announce_yields_peers() {
        let tracker_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker_socket.local_addr().unwrap();
        let fake = tokio::spawn(run_fake_tracker(
            tracker_socket,
            vec![127, 0, 0, 1, 0x1a, 0xe1],
        ));

        let url = Url::parse(&format!("udp://127.0.0.1:{}", tracker_addr.port())).unwrap();
        let mut client = UdpTrackerClient::new(url).unwrap();

        let response = client
            .announce(&AnnounceParams {
                info_hash: InfoHash([9; 20]),
                peer_id: PeerId::from_entropy([3; 12]),
                port: 6881,
                uploaded: 10,
                downloaded: 20,
                left: 30,
                event: AnnounceEvent::Started,
            })
            .await
            .unwrap();

        assert_eq!(response.interval.as_secs(), 1800);
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        fake.await.unwrap();
    }

    #[test]
    fn urls_without_a_port_are_rejected() {
        let url = Url::parse("udp://tracker.example").unwrap();
        assert!(UdpTrackerClient::new(url).is_err());
    }
}
