//! Shared fixtures for the engine tests: a synthetic torrent builder, an
//! in-process seeder speaking the real wire protocol, and a minimal HTTP
//! tracker that records the events it is announced.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use riptide::protocol::handshake::{Handshake, HANDSHAKE_LEN};
use riptide::protocol::message::{Message, MessageCodec};
use riptide_bencode::Bencode;
use riptide_metainfo::Metainfo;
use riptide_primitives::{InfoHash, PeerId};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Deterministic but non-trivial payload bytes.
#[must_use]
pub fn synthetic_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 131 + 17) % 251) as u8).collect()
}

/// Build a single-file torrent over `data` and return its metainfo bytes.
#[must_use]
pub fn build_torrent(name: &str, piece_length: usize, data: &[u8], announce: &str) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_length) {
        let digest: [u8; 20] = Sha1::digest(chunk).into();
        pieces.extend_from_slice(&digest);
    }

    Bencode::dict([
        ("announce", Bencode::from(announce)),
        (
            "info",
            Bencode::dict([
                ("length", Bencode::Int(data.len() as i64)),
                ("name", Bencode::from(name)),
                ("piece length", Bencode::Int(piece_length as i64)),
                ("pieces", Bencode::bytes(pieces)),
            ]),
        ),
    ])
    .encode()
}

/// How a seeder misbehaves, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    Honest,
    /// Flip one bit in every delivery of the given piece.
    CorruptPiece(u32),
    /// After the handshake and bitfield, answer the first message with an
    /// impossibly large frame.
    OversizedFrame,
}

/// Serve `data` to every incoming connection, speaking the classic wire
/// protocol. Returns the seeder's listen address.
pub async fn spawn_seeder(metainfo: Arc<Metainfo>, data: Vec<u8>, behavior: SeederBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info_hash = metainfo.info_hash();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let metainfo = Arc::clone(&metainfo);
            let data = data.clone();
            tokio::spawn(async move {
                let _ = serve_peer(stream, info_hash, &metainfo, &data, behavior).await;
            });
        }
    });

    addr
}

async fn serve_peer(
    mut stream: TcpStream,
    info_hash: InfoHash,
    metainfo: &Metainfo,
    data: &[u8],
    behavior: SeederBehavior,
) -> std::io::Result<()> {
    // Handshake: read theirs, answer ours.
    let mut incoming = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut incoming).await?;
    let theirs = Handshake::from_bytes(&incoming).expect("engine sent a malformed handshake");
    assert_eq!(theirs.info_hash, info_hash);

    let ours = Handshake::new(info_hash, PeerId::from_entropy([0xEE; 12]));
    stream.write_all(&ours.to_bytes()).await?;

    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::new(read_half, MessageCodec);
    let mut frames_out = FramedWrite::new(write_half, MessageCodec);

    // Full bitfield.
    let piece_count = metainfo.piece_count();
    let mut bits = vec![0u8; piece_count.div_ceil(8)];
    for piece in 0..piece_count {
        bits[piece / 8] |= 0x80 >> (piece % 8);
    }
    frames_out.send(Message::Bitfield(Bytes::from(bits))).await.ok();

    if behavior == SeederBehavior::OversizedFrame {
        // Wait for the engine to say anything, then answer with a length
        // prefix far past the frame limit and hold the socket open; the
        // engine must be the one to close it.
        let _ = frames_in.next().await;
        let mut raw = frames_out.into_inner();
        raw.write_all(&(1u32 << 30).to_be_bytes()).await?;
        raw.flush().await?;
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        return Ok(());
    }

    while let Some(Ok(message)) = frames_in.next().await {
        match message {
            Message::Interested => {
                frames_out.send(Message::Unchoke).await.ok();
            }
            Message::Request(block) => {
                let start = block.piece as usize * metainfo.nominal_piece_length() as usize + block.offset as usize;
                let mut payload = data[start..start + block.length as usize].to_vec();
                if behavior == SeederBehavior::CorruptPiece(block.piece) {
                    payload[0] ^= 0x01;
                }
                frames_out
                    .send(Message::Piece {
                        piece: block.piece,
                        offset: block.offset,
                        data: Bytes::from(payload),
                    })
                    .await
                    .ok();
            }
            _ => {}
        }
    }
    Ok(())
}

/// A single-endpoint HTTP tracker: answers every announce with the given
/// peer list and records each `event` parameter it sees.
pub async fn spawn_tracker(peers: Vec<SocketAddr>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                match stream.read(&mut byte).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => request.push(byte[0]),
                }
            }

            let request = String::from_utf8_lossy(&request);
            let event = request
                .split_whitespace()
                .nth(1)
                .and_then(|path| path.split('?').nth(1))
                .and_then(|query| {
                    query
                        .split('&')
                        .find(|param| param.starts_with("event="))
                        .map(|param| param["event=".len()..].to_owned())
                })
                .unwrap_or_default();
            seen.lock().unwrap().push(event);

            let mut compact = Vec::new();
            for peer in &peers {
                if let std::net::IpAddr::V4(ip) = peer.ip() {
                    compact.extend_from_slice(&ip.octets());
                    compact.extend_from_slice(&peer.port().to_be_bytes());
                }
            }
            let body = Bencode::dict([
                ("interval", Bencode::Int(1800)),
                ("peers", Bencode::bytes(compact)),
            ])
            .encode();

            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        }
    });

    (format!("http://127.0.0.1:{}/announce", addr.port()), events)
}
