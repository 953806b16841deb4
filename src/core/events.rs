//! Engine events and the observer dispatch loop.
//!
//! The engine and its torrents publish [`Event`]s through an
//! [`EventSender`]; one dispatcher task fans them out to every registered
//! [`Observer`] sequentially, so observers never see overlapping calls.
//! Rate-snapshot events are the first to be dropped when the channel backs
//! up; lifecycle events are never silently discarded without a log line.
use std::net::SocketAddr;
use std::sync::Arc;

use riptide_primitives::InfoHash;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::core::torrent::{TorrentError, TorrentId, TorrentSnapshot, TorrentStatus};

const CHANNEL_DEPTH: usize = 4096;

/// What the engine tells the outside world.
#[derive(Debug, Clone)]
pub enum Event {
    TorrentAdded {
        id: TorrentId,
        info_hash: InfoHash,
        name: String,
    },
    TorrentRemoved {
        id: TorrentId,
        info_hash: InfoHash,
    },
    StatusChanged {
        id: TorrentId,
        status: TorrentStatus,
    },
    PieceVerified {
        id: TorrentId,
        piece: u32,
    },
    Completed {
        id: TorrentId,
    },
    PeerConnected {
        id: TorrentId,
        addr: SocketAddr,
    },
    PeerDisconnected {
        id: TorrentId,
        addr: SocketAddr,
    },
    TorrentErrored {
        id: TorrentId,
        error: TorrentError,
    },
    /// Periodic rate snapshot; droppable under load.
    Stats {
        id: TorrentId,
        snapshot: TorrentSnapshot,
    },
    EngineError {
        message: String,
    },
}

impl Event {
    fn droppable(&self) -> bool {
        matches!(self, Event::Stats { .. })
    }
}

/// Observers receive every event from one dispatcher task.
pub trait Observer: Send + Sync + 'static {
    fn handle_event(&self, event: &Event);
}

/// Cloneable producer half.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Queue an event without blocking. A full queue drops stats events
    /// silently and logs anything else it has to discard.
    pub fn send(&self, event: Event) {
        if let Err(source) = self.tx.try_send(event) {
            if let mpsc::error::TrySendError::Full(event) = source {
                if !event.droppable() {
                    warn!(?event, "event queue full, dropping event");
                }
            }
        }
    }

    /// A sender wired to nothing, for tests and tools.
    #[must_use]
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

/// Start the dispatcher. Dropping every `EventSender` clone ends the task.
#[must_use]
pub fn start_dispatcher(observers: Vec<Arc<dyn Observer>>) -> (EventSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
    let join = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for observer in &observers {
                observer.handle_event(&event);
            }
        }
    });
    (EventSender { tx }, join)
}
