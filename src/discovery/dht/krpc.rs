//! KRPC: the bencoded query/response RPC the mainline DHT (BEP 5) speaks
//! over UDP.
//!
//! Every packet is a dictionary with a transaction id `t` and a type `y` of
//! `q` (query), `r` (response) or `e` (error). Node lists travel in compact
//! form: 26 bytes per node, a 20-byte node id followed by a 6-byte IPv4
//! endpoint.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use riptide_bencode::{Bencode, Value};
use riptide_primitives::InfoHash;
use thiserror::Error;

use super::routing::NodeId;
use crate::discovery::pex::compact_to_addrs;

#[derive(Debug, Error)]
pub enum KrpcError {
    #[error("packet is not valid bencode: {0}")]
    NotBencode(#[from] riptide_bencode::DecodeError),

    #[error("packet misses the required key '{0}'")]
    MissingKey(&'static str),

    #[error("packet has an unknown message type")]
    UnknownType,

    #[error("query '{0}' is not part of the protocol")]
    UnknownQuery(String),
}

/// A query another node may send us (and that we send out ourselves).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcQuery {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

/// The `r` dictionary of a response; which fields are present depends on
/// the query answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KrpcResponse {
    pub id: NodeId,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcMessage {
    Query { transaction: Vec<u8>, query: KrpcQuery },
    Response { transaction: Vec<u8>, response: KrpcResponse },
    Error { transaction: Vec<u8>, code: i64, message: String },
}

impl KrpcMessage {
    /// Decode one packet.
    ///
    /// # Errors
    ///
    /// Fails on bencode errors or a packet shape outside BEP 5.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KrpcError> {
        let value = Value::decode(bytes)?;
        let transaction = value
            .lookup(b"t")
            .and_then(Value::as_bytes)
            .ok_or(KrpcError::MissingKey("t"))?
            .to_vec();

        match value.lookup(b"y").and_then(Value::as_bytes) {
            Some(b"q") => {
                let query = decode_query(&value)?;
                Ok(KrpcMessage::Query { transaction, query })
            }
            Some(b"r") => {
                let response = decode_response(&value)?;
                Ok(KrpcMessage::Response { transaction, response })
            }
            Some(b"e") => {
                let (code, message) = value
                    .lookup(b"e")
                    .and_then(Value::as_list)
                    .map(|list| {
                        let code = list.first().and_then(Value::as_int).unwrap_or(0);
                        let message = list
                            .get(1)
                            .and_then(Value::as_str)
                            .unwrap_or("unspecified")
                            .to_owned();
                        (code, message)
                    })
                    .ok_or(KrpcError::MissingKey("e"))?;
                Ok(KrpcMessage::Error { transaction, code, message })
            }
            _ => Err(KrpcError::UnknownType),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KrpcMessage::Query { transaction, query } => encode_query(transaction, query),
            KrpcMessage::Response { transaction, response } => encode_response(transaction, response),
            KrpcMessage::Error { transaction, code, message } => Bencode::dict([
                (&b"e"[..], Bencode::List(vec![Bencode::Int(*code), Bencode::from(message.as_str())])),
                (&b"t"[..], Bencode::bytes(transaction.clone())),
                (&b"y"[..], Bencode::from("e")),
            ])
            .encode(),
        }
    }
}

fn decode_query(value: &Value<'_>) -> Result<KrpcQuery, KrpcError> {
    let name = value
        .lookup(b"q")
        .and_then(Value::as_bytes)
        .ok_or(KrpcError::MissingKey("q"))?;
    let args = value.lookup(b"a").ok_or(KrpcError::MissingKey("a"))?;

    let id = args
        .lookup(b"id")
        .and_then(Value::as_bytes)
        .filter(|bytes| bytes.len() == 20)
        .map(NodeId::from_bytes)
        .ok_or(KrpcError::MissingKey("id"))?;

    let info_hash = |key: &'static str| {
        args.lookup(key.as_bytes())
            .and_then(Value::as_bytes)
            .filter(|bytes| bytes.len() == 20)
            .map(InfoHash::from_bytes)
            .ok_or(KrpcError::MissingKey(key))
    };

    match name {
        b"ping" => Ok(KrpcQuery::Ping { id }),
        b"find_node" => {
            let target = args
                .lookup(b"target")
                .and_then(Value::as_bytes)
                .filter(|bytes| bytes.len() == 20)
                .map(NodeId::from_bytes)
                .ok_or(KrpcError::MissingKey("target"))?;
            Ok(KrpcQuery::FindNode { id, target })
        }
        b"get_peers" => Ok(KrpcQuery::GetPeers {
            id,
            info_hash: info_hash("info_hash")?,
        }),
        b"announce_peer" => {
            let token = args
                .lookup(b"token")
                .and_then(Value::as_bytes)
                .ok_or(KrpcError::MissingKey("token"))?
                .to_vec();
            let implied_port = args.lookup(b"implied_port").and_then(Value::as_int) == Some(1);
            let port = args
                .lookup(b"port")
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(0);
            Ok(KrpcQuery::AnnouncePeer {
                id,
                info_hash: info_hash("info_hash")?,
                port,
                token,
                implied_port,
            })
        }
        other => Err(KrpcError::UnknownQuery(String::from_utf8_lossy(other).into_owned())),
    }
}

fn decode_response(value: &Value<'_>) -> Result<KrpcResponse, KrpcError> {
    let body = value.lookup(b"r").ok_or(KrpcError::MissingKey("r"))?;

    let id = body
        .lookup(b"id")
        .and_then(Value::as_bytes)
        .filter(|bytes| bytes.len() == 20)
        .map(NodeId::from_bytes)
        .ok_or(KrpcError::MissingKey("id"))?;

    let nodes = body
        .lookup(b"nodes")
        .and_then(Value::as_bytes)
        .map(compact_to_nodes)
        .unwrap_or_default();

    let values = body
        .lookup(b"values")
        .and_then(Value::as_list)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_bytes)
                .flat_map(compact_to_addrs)
                .collect()
        })
        .unwrap_or_default();

    let token = body.lookup(b"token").and_then(Value::as_bytes).map(<[u8]>::to_vec);

    Ok(KrpcResponse { id, nodes, values, token })
}

fn encode_query(transaction: &[u8], query: &KrpcQuery) -> Vec<u8> {
    let (name, args) = match query {
        KrpcQuery::Ping { id } => ("ping", Bencode::dict([(&b"id"[..], Bencode::bytes(id.0.to_vec()))])),
        KrpcQuery::FindNode { id, target } => (
            "find_node",
            Bencode::dict([
                (&b"id"[..], Bencode::bytes(id.0.to_vec())),
                (&b"target"[..], Bencode::bytes(target.0.to_vec())),
            ]),
        ),
        KrpcQuery::GetPeers { id, info_hash } => (
            "get_peers",
            Bencode::dict([
                (&b"id"[..], Bencode::bytes(id.0.to_vec())),
                (&b"info_hash"[..], Bencode::bytes(info_hash.0.to_vec())),
            ]),
        ),
        KrpcQuery::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
            implied_port,
        } => (
            "announce_peer",
            Bencode::dict([
                (&b"id"[..], Bencode::bytes(id.0.to_vec())),
                (&b"implied_port"[..], Bencode::Int(i64::from(*implied_port))),
                (&b"info_hash"[..], Bencode::bytes(info_hash.0.to_vec())),
                (&b"port"[..], Bencode::Int(i64::from(*port))),
                (&b"token"[..], Bencode::bytes(token.clone())),
            ]),
        ),
    };

    Bencode::dict([
        (&b"a"[..], args),
        (&b"q"[..], Bencode::from(name)),
        (&b"t"[..], Bencode::bytes(transaction.to_vec())),
        (&b"y"[..], Bencode::from("q")),
    ])
    .encode()
}

fn encode_response(transaction: &[u8], response: &KrpcResponse) -> Vec<u8> {
    let mut body = vec![(b"id".to_vec(), Bencode::bytes(response.id.0.to_vec()))];
    if !response.nodes.is_empty() {
        body.push((b"nodes".to_vec(), Bencode::bytes(nodes_to_compact(&response.nodes))));
    }
    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => {
                    let mut compact = ip.octets().to_vec();
                    compact.extend_from_slice(&addr.port().to_be_bytes());
                    Some(Bencode::bytes(compact))
                }
                IpAddr::V6(_) => None,
            })
            .collect();
        body.push((b"values".to_vec(), Bencode::List(values)));
    }
    if let Some(token) = &response.token {
        body.push((b"token".to_vec(), Bencode::bytes(token.clone())));
    }

    Bencode::dict([
        (b"r".to_vec(), Bencode::dict(body)),
        (b"t".to_vec(), Bencode::bytes(transaction.to_vec())),
        (b"y".to_vec(), Bencode::from("r")),
    ])
    .encode()
}

/// Decode 26-byte compact node groups; a trailing partial group is dropped.
fn compact_to_nodes(compact: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    compact
        .chunks_exact(26)
        .map(|group| {
            let id = NodeId::from_bytes(&group[..20]);
            let ip = Ipv4Addr::new(group[20], group[21], group[22], group[23]);
            let port = u16::from_be_bytes([group[24], group[25]]);
            (id, SocketAddr::new(IpAddr::V4(ip), port))
        })
        .collect()
}

#[must_use]
pub fn nodes_to_compact(nodes: &[(NodeId, SocketAddr)]) -> Vec<u8> {
    let mut compact = Vec::with_capacity(26 * nodes.len());
    for (id, addr) in nodes {
        if let IpAddr::V4(ip) = addr.ip() {
            compact.extend_from_slice(&id.0);
            compact.extend_from_slice(&ip.octets());
            compact.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    compact
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use riptide_primitives::InfoHash;

    use super::{KrpcMessage, KrpcQuery, KrpcResponse};
    use crate::discovery::dht::routing::NodeId;

    fn round_trip(message: KrpcMessage) -> KrpcMessage {
        KrpcMessage::from_bytes(&message.to_bytes()).unwrap()
    }

    #[test]
    fn queries_round_trip() {
        let id = NodeId([1; 20]);
        for query in [
            KrpcQuery::Ping { id },
            KrpcQuery::FindNode { id, target: NodeId([2; 20]) },
            KrpcQuery::GetPeers {
                id,
                info_hash: InfoHash([3; 20]),
            },
            KrpcQuery::AnnouncePeer {
                id,
                info_hash: InfoHash([3; 20]),
                port: 6881,
                token: b"tok".to_vec(),
                implied_port: false,
            },
        ] {
            let message = KrpcMessage::Query {
                transaction: b"aa".to_vec(),
                query: query.clone(),
            };
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn responses_round_trip_with_nodes_values_and_token() {
        let addr: SocketAddr = "10.1.2.3:6881".parse().unwrap();
        let message = KrpcMessage::Response {
            transaction: b"bb".to_vec(),
            response: KrpcResponse {
                id: NodeId([7; 20]),
                nodes: vec![(NodeId([8; 20]), addr)],
                values: vec!["10.9.9.9:51413".parse().unwrap()],
                token: Some(b"opaque".to_vec()),
            },
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn errors_round_trip() {
        let message = KrpcMessage::Error {
            transaction: b"cc".to_vec(),
            code: 203,
            message: "protocol error".to_owned(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn a_real_world_ping_decodes() {
        // The BEP 5 example ping packet.
        let packet = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let message = KrpcMessage::from_bytes(packet).unwrap();
        assert!(matches!(
            message,
            KrpcMessage::Query {
                query: KrpcQuery::Ping { .. },
                ..
            }
        ));
    }

    #[test]
    fn garbage_and_unknown_queries_are_rejected() {
        assert!(KrpcMessage::from_bytes(b"not bencode").is_err());
        let unknown = b"d1:ad2:id20:abcdefghij0123456789e1:q4:oops1:t2:aa1:y1:qe";
        assert!(KrpcMessage::from_bytes(unknown).is_err());
    }
}
