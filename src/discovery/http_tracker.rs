//! HTTP(S) tracker client.
//!
//! Announces are plain GETs with the BEP 3 query parameters; responses are
//! bencoded dictionaries with peers in compact 6-byte form or as a list of
//! dictionaries. Scrapes use the `/announce` → `/scrape` URL convention and
//! degrade gracefully when a tracker does not follow it.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use riptide_bencode::Value;
use riptide_primitives::{AnnounceEvent, InfoHash, PeerId};
use tracing::debug;
use url::Url;

use super::pex::compact_to_addrs;
use super::TrackerError;

/// Whole-request timeout for tracker HTTP traffic.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback re-announce interval when a tracker sends none.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// What we tell the tracker about ourselves on each announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// A successful announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
}

/// Swarm counts from a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// Client for one announce URL. Per-tracker cookies and extra headers come
/// from the settings object.
#[derive(Debug, Clone)]
pub struct HttpTrackerClient {
    http: reqwest::Client,
    announce_url: Url,
    cookie: Option<String>,
    extra_headers: Vec<(String, String)>,
}

impl HttpTrackerClient {
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be built.
    pub fn new(
        announce_url: Url,
        cookie: Option<String>,
        extra_headers: Vec<(String, String)>,
    ) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| TrackerError::Client(source.to_string()))?;

        Ok(Self {
            http,
            announce_url,
            cookie,
            extra_headers,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.announce_url
    }

    /// Announce and parse the peer list.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success HTTP statuses, malformed
    /// bencode, or a `failure reason` from the tracker.
    pub async fn announce(&self, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
        let url = announce_url_with_query(&self.announce_url, params);
        let body = self.get(url).await?;
        parse_announce_response(&body)
    }

    /// Scrape swarm counts for one torrent.
    ///
    /// # Errors
    ///
    /// Fails with [`TrackerError::ScrapeUnsupported`] when the announce URL
    /// does not end in `announce`, and like [`HttpTrackerClient::announce`]
    /// otherwise.
    pub async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
        let mut url = scrape_url(&self.announce_url).ok_or(TrackerError::ScrapeUnsupported)?;
        let query = format!("info_hash={}", percent_encode(&info_hash.0, NON_ALPHANUMERIC));
        url.set_query(Some(&query));

        let body = self.get(url).await?;
        parse_scrape_response(&body, info_hash)
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>, TrackerError> {
        let mut request = self.http.get(url);
        if let Some(cookie) = &self.cookie {
            request = request.header("Cookie", cookie);
        }
        for (name, value) in &self.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|source| TrackerError::Unreachable(source.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| TrackerError::Unreachable(source.to_string()))?;
        debug!(bytes = body.len(), "tracker response received");
        Ok(body.to_vec())
    }
}

/// The query string is assembled by hand: `info_hash` and `peer_id` are raw
/// bytes and must be percent-encoded directly, which `Url`'s form
/// serializer would double-encode.
fn announce_url_with_query(base: &Url, params: &AnnounceParams) -> Url {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode(&params.info_hash.0, NON_ALPHANUMERIC),
        percent_encode(&params.peer_id.0, NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if params.event != AnnounceEvent::None {
        query.push_str("&event=");
        query.push_str(params.event.query_value());
    }

    let mut url = base.clone();
    match base.query() {
        Some(existing) if !existing.is_empty() => {
            url.set_query(Some(&format!("{existing}&{query}")));
        }
        _ => url.set_query(Some(&query)),
    }
    url
}

/// BEP 48 convention: replace a final `announce` path segment with
/// `scrape`. Trackers without such a segment do not support scraping.
fn scrape_url(announce: &Url) -> Option<Url> {
    let path = announce.path();
    let (prefix, last) = path.rsplit_once('/')?;
    if !last.starts_with("announce") {
        return None;
    }

    let mut url = announce.clone();
    url.set_path(&format!("{prefix}/{}", last.replacen("announce", "scrape", 1)));
    Some(url)
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = Value::decode(body).map_err(|source| TrackerError::Malformed(source.to_string()))?;

    if let Some(reason) = value.lookup(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unspecified").to_owned();
        return Err(TrackerError::Failure(reason));
    }

    let interval = value
        .lookup(b"interval")
        .and_then(Value::as_int)
        .and_then(|seconds| u64::try_from(seconds).ok())
        .map_or(DEFAULT_INTERVAL, Duration::from_secs);

    let min_interval = value
        .lookup(b"min interval")
        .and_then(Value::as_int)
        .and_then(|seconds| u64::try_from(seconds).ok())
        .map(Duration::from_secs);

    let peers = match value.lookup(b"peers") {
        Some(peers) => parse_peers(peers)?,
        None => return Err(TrackerError::Malformed("response has no peers key".to_owned())),
    };

    let count = |key: &[u8]| {
        value
            .lookup(key)
            .and_then(Value::as_int)
            .and_then(|n| u32::try_from(n).ok())
    };

    Ok(AnnounceResponse {
        interval,
        min_interval,
        peers,
        complete: count(b"complete"),
        incomplete: count(b"incomplete"),
    })
}

/// Peers arrive as compact bytes (6 per peer) or as a list of
/// `{ip, port}` dictionaries.
fn parse_peers(peers: &Value<'_>) -> Result<Vec<SocketAddr>, TrackerError> {
    if let Some(compact) = peers.as_bytes() {
        return Ok(compact_to_addrs(compact));
    }

    let Some(list) = peers.as_list() else {
        return Err(TrackerError::Malformed("peers is neither bytes nor a list".to_owned()));
    };

    Ok(list
        .iter()
        .filter_map(|entry| {
            let ip: IpAddr = entry.lookup(b"ip")?.as_str()?.parse().ok()?;
            let port = u16::try_from(entry.lookup(b"port")?.as_int()?).ok()?;
            Some(SocketAddr::new(ip, port))
        })
        .collect())
}

fn parse_scrape_response(body: &[u8], info_hash: InfoHash) -> Result<ScrapeStats, TrackerError> {
    let value = Value::decode(body).map_err(|source| TrackerError::Malformed(source.to_string()))?;

    if let Some(reason) = value.lookup(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unspecified").to_owned();
        return Err(TrackerError::Failure(reason));
    }

    let stats = value
        .lookup(b"files")
        .and_then(|files| files.lookup(&info_hash.0))
        .ok_or_else(|| TrackerError::Malformed("scrape response misses the torrent".to_owned()))?;

    let count = |key: &[u8]| {
        stats
            .lookup(key)
            .and_then(Value::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };

    Ok(ScrapeStats {
        complete: count(b"complete"),
        incomplete: count(b"incomplete"),
        downloaded: count(b"downloaded"),
    })
}

#[cfg(test)]
mod tests {
    use riptide_bencode::Bencode;
    use riptide_primitives::{AnnounceEvent, InfoHash, PeerId};
    use url::Url;

    use super::{announce_url_with_query, parse_announce_response, parse_scrape_response, scrape_url, AnnounceParams};
    use crate::discovery::TrackerError;

    fn params(event: AnnounceEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash([0xff; 20]),
            peer_id: PeerId(*b"-RT0100-abcdefghijkl"),
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event,
        }
    }

    #[test]
    fn the_query_carries_all_required_parameters() {
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let with_query = announce_url_with_query(&url, &params(AnnounceEvent::Started));
        let query = with_query.query().unwrap();

        assert!(query.contains(&format!("info_hash={}", "%FF".repeat(20))));
        assert!(query.contains("peer_id=%2DRT0100%2Dabcdefghijkl"));
        assert!(query.contains("port=6881"));
        assert!(query.contains("uploaded=1"));
        assert!(query.contains("downloaded=2"));
        assert!(query.contains("left=3"));
        assert!(query.contains("compact=1"));
        assert!(query.contains("event=started"));
    }

    #[test]
    fn periodic_announces_omit_the_event() {
        let url = Url::parse("http://tracker.example/announce").unwrap();
        let with_query = announce_url_with_query(&url, &params(AnnounceEvent::None));
        assert!(!with_query.query().unwrap().contains("event="));
    }

    #[test]
    fn existing_query_parameters_are_preserved() {
        let url = Url::parse("http://tracker.example/announce?passkey=s3cret").unwrap();
        let with_query = announce_url_with_query(&url, &params(AnnounceEvent::None));
        let query = with_query.query().unwrap();
        assert!(query.starts_with("passkey=s3cret&"));
        assert!(query.contains("info_hash="));
    }

    #[test]
    fn compact_peer_lists_parse() {
        let body = Bencode::dict([
            ("interval", Bencode::Int(120)),
            ("peers", Bencode::bytes(vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2])),
        ])
        .encode();

        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval.as_secs(), 120);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(response.peers[1], "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn dictionary_peer_lists_parse() {
        let peer = Bencode::dict([
            ("ip", Bencode::from("192.168.1.9")),
            ("peer id", Bencode::bytes(vec![0u8; 20])),
            ("port", Bencode::Int(51413)),
        ]);
        let body = Bencode::dict([
            ("complete", Bencode::Int(5)),
            ("incomplete", Bencode::Int(2)),
            ("interval", Bencode::Int(1800)),
            ("peers", Bencode::List(vec![peer])),
        ])
        .encode();

        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.peers, vec!["192.168.1.9:51413".parse().unwrap()]);
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(2));
    }

    #[test]
    fn failure_reason_surfaces_as_an_error() {
        let body = Bencode::dict([("failure reason", Bencode::from("torrent not registered"))]).encode();
        assert!(matches!(
            parse_announce_response(&body),
            Err(TrackerError::Failure(reason)) if reason == "torrent not registered"
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_announce_response(b"this is not bencode"),
            Err(TrackerError::Malformed(_))
        ));
    }

    #[test]
    fn scrape_url_follows_the_announce_convention() {
        let announce = Url::parse("http://tracker.example/announce").unwrap();
        assert_eq!(scrape_url(&announce).unwrap().path(), "/scrape");

        let with_key = Url::parse("http://tracker.example/announce.php").unwrap();
        assert_eq!(scrape_url(&with_key).unwrap().path(), "/scrape.php");

        let no_convention = Url::parse("http://tracker.example/a").unwrap();
        assert!(scrape_url(&no_convention).is_none());
    }

    #[test]
    fn scrape_responses_parse_per_torrent_counts() {
        let info_hash = InfoHash([0xab; 20]);
        let body = Bencode::dict([(
            "files",
            Bencode::dict([(
                info_hash.0.to_vec(),
                Bencode::dict([
                    ("complete", Bencode::Int(10)),
                    ("downloaded", Bencode::Int(99)),
                    ("incomplete", Bencode::Int(4)),
                ]),
            )]),
        )])
        .encode();

        let stats = parse_scrape_response(&body, info_hash).unwrap();
        assert_eq!(stats.complete, 10);
        assert_eq!(stats.incomplete, 4);
        assert_eq!(stats.downloaded, 99);
    }
}
