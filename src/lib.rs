//! **Riptide** is a `BitTorrent` peer engine.
//!
//! It ingests a metainfo file, discovers peers over HTTP/UDP trackers, the
//! mainline DHT, PEX and local service discovery, exchanges pieces with
//! them over the classic TCP wire protocol, verifies and persists data to
//! a multi-file layout, and reciprocates by serving pieces to other peers.
//! Interrupted transfers resume from per-torrent checkpoint records, and
//! token buckets bound throughput per torrent and process-wide.
//!
//! # Layout
//!
//! - [`core`]: the engine: orchestrator, per-torrent pipeline, peer
//!   sessions, piece picker, choke scheduler, storage, rate limiting,
//!   resume records and the observer event surface.
//! - [`protocol`]: the peer wire protocol: handshake, message framing and
//!   the BEP 10 extension layer.
//! - [`discovery`]: peer sources: tracker clients, DHT, PEX, LSD and the
//!   deduplicating endpoint gate.
//! - [`console`]: the command-line surface.
//!
//! The workspace splits the reusable leaves into their own packages:
//! `riptide-bencode`, `riptide-metainfo`, `riptide-primitives` and
//! `riptide-configuration`.
//!
//! # Embedding
//!
//! The engine does not own a UI. An embedding application hands
//! [`Engine::start`](core::Engine::start) a settings snapshot and a list of
//! observers, then drives torrents through the [`core::Engine`] handle:
//!
//! ```rust,no_run
//! use riptide::core::Engine;
//! use riptide_configuration::Settings;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::start(Settings::default(), Vec::new()).await?;
//! let bytes = std::fs::read("example.torrent")?;
//! let id = engine.add(&bytes, "example.torrent".as_ref(), None)?;
//! let snapshot = engine.get_snapshot(id).await?;
//! println!("{}: {:.1}%", snapshot.name, snapshot.progress * 100.0);
//! # Ok(())
//! # }
//! ```
pub mod app;
pub mod bootstrap;
pub mod console;
pub mod core;
pub mod discovery;
pub mod protocol;
