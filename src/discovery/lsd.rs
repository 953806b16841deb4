//! Local service discovery (BEP 14): cleartext `BT-SEARCH` datagrams on a
//! well-known multicast group, so peers on the same LAN find each other
//! without a tracker.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use riptide_primitives::InfoHash;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const MULTICAST_PORT: u16 = 6771;

/// Re-announce cadence per registered torrent.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
enum LsdCommand {
    Register {
        info_hash: InfoHash,
        peers: mpsc::Sender<SocketAddr>,
    },
    Unregister {
        info_hash: InfoHash,
    },
}

/// Cheap handle to the engine's LSD listener.
#[derive(Debug, Clone)]
pub struct LsdHandle {
    cmd: mpsc::Sender<LsdCommand>,
}

impl LsdHandle {
    /// Announce `info_hash` on the LAN and route reciprocal announcements
    /// into `peers`.
    pub fn register(&self, info_hash: InfoHash, peers: mpsc::Sender<SocketAddr>) {
        let _ = self.cmd.try_send(LsdCommand::Register { info_hash, peers });
    }

    pub fn unregister(&self, info_hash: InfoHash) {
        let _ = self.cmd.try_send(LsdCommand::Unregister { info_hash });
    }
}

/// Start the LSD listener/announcer. Returns `None` when the multicast
/// socket cannot be set up (another client may own the port).
pub async fn spawn(listen_port: u16, cancel: CancellationToken) -> Option<LsdHandle> {
    let socket = match UdpSocket::bind(("0.0.0.0", MULTICAST_PORT)).await {
        Ok(socket) => socket,
        Err(source) => {
            warn!(%source, "lsd disabled: multicast port unavailable");
            return None;
        }
    };
    if let Err(source) = socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
        warn!(%source, "lsd disabled: cannot join multicast group");
        return None;
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(run(socket, listen_port, cancel, cmd_rx));
    Some(LsdHandle { cmd: cmd_tx })
}

struct Registration {
    peers: mpsc::Sender<SocketAddr>,
}

async fn run(socket: UdpSocket, listen_port: u16, cancel: CancellationToken, mut cmd_rx: mpsc::Receiver<LsdCommand>) {
    // The cookie lets us drop our own multicast echoes.
    let cookie: String = {
        use rand::Rng;
        let token: u64 = rand::thread_rng().gen();
        format!("{token:016x}")
    };

    let mut registrations: HashMap<InfoHash, Registration> = HashMap::new();
    let mut announce_tick = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut buffer = [0u8; 1500];
    let group = SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            command = cmd_rx.recv() => match command {
                None => break,
                Some(LsdCommand::Register { info_hash, peers }) => {
                    let announcement = announcement(listen_port, info_hash, &cookie);
                    let _ = socket.send_to(announcement.as_bytes(), group).await;
                    registrations.insert(info_hash, Registration { peers });
                }
                Some(LsdCommand::Unregister { info_hash }) => {
                    registrations.remove(&info_hash);
                }
            },
            _ = announce_tick.tick() => {
                for info_hash in registrations.keys() {
                    let announcement = announcement(listen_port, *info_hash, &cookie);
                    let _ = socket.send_to(announcement.as_bytes(), group).await;
                }
            }
            received = socket.recv_from(&mut buffer) => {
                let Ok((len, from)) = received else { continue };
                let Some(search) = parse_announcement(&buffer[..len]) else { continue };
                if search.cookie.as_deref() == Some(cookie.as_str()) {
                    continue; // our own echo
                }
                if let Some(registration) = registrations.get(&search.info_hash) {
                    let peer = SocketAddr::new(from.ip(), search.port);
                    debug!(%peer, info_hash = %search.info_hash, "lsd peer found");
                    let _ = registration.peers.send(peer).await;
                }
            }
        }
    }
}

/// The wire form of one announcement.
fn announcement(port: u16, info_hash: InfoHash, cookie: &str) -> String {
    let mut message = String::new();
    let _ = write!(
        message,
        "BT-SEARCH * HTTP/1.1\r\n\
         Host: {MULTICAST_GROUP}:{MULTICAST_PORT}\r\n\
         Port: {port}\r\n\
         Infohash: {info_hash}\r\n\
         cookie: {cookie}\r\n\
         \r\n\r\n"
    );
    message
}

#[derive(Debug, PartialEq, Eq)]
struct Search {
    info_hash: InfoHash,
    port: u16,
    cookie: Option<String>,
}

fn parse_announcement(bytes: &[u8]) -> Option<Search> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");
    if !lines.next()?.starts_with("BT-SEARCH") {
        return None;
    }

    let mut port = None;
    let mut info_hash = None;
    let mut cookie = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("port") {
            port = value.parse::<u16>().ok();
        } else if name.eq_ignore_ascii_case("infohash") {
            info_hash = value.parse::<InfoHash>().ok();
        } else if name.eq_ignore_ascii_case("cookie") {
            cookie = Some(value.to_owned());
        }
    }

    Some(Search {
        info_hash: info_hash?,
        port: port?,
        cookie,
    })
}

#[cfg(test)]
mod tests {
    use riptide_primitives::InfoHash;

    use super::{announcement, parse_announcement};

    #[test]
    fn announcements_round_trip() {
        let info_hash = InfoHash([0xCD; 20]);
        let wire = announcement(51413, info_hash, "deadbeef");

        assert!(wire.starts_with("BT-SEARCH * HTTP/1.1\r\n"));
        assert!(wire.contains("Host: 239.192.152.143:6771\r\n"));
        assert!(wire.ends_with("\r\n\r\n\r\n"));

        let parsed = parse_announcement(wire.as_bytes()).unwrap();
        assert_eq!(parsed.info_hash, info_hash);
        assert_eq!(parsed.port, 51413);
        assert_eq!(parsed.cookie.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn foreign_payloads_are_ignored() {
        assert!(parse_announcement(b"GET / HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_announcement(b"BT-SEARCH * HTTP/1.1\r\nPort: 1\r\n\r\n").is_none());
        assert!(parse_announcement(&[0xFF, 0xFE]).is_none());
    }

    #[test]
    fn the_host_header_is_tolerated_when_parsing() {
        let wire = "BT-SEARCH * HTTP/1.1\r\nHost: 239.192.152.143:6771\r\nPort: 7000\r\nInfohash: ".to_owned()
            + &"ab".repeat(20)
            + "\r\n\r\n\r\n";
        let parsed = parse_announcement(wire.as_bytes()).unwrap();
        assert_eq!(parsed.port, 7000);
        assert!(parsed.cookie.is_none());
    }
}
