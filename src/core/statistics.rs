//! Process-wide metrics, aggregated from the engine's event stream.
//!
//! The [`Keeper`] is an [`Observer`] the engine registers ahead of any
//! user-supplied ones; it folds events into a [`Metrics`] value behind a
//! read-write lock. Snapshots are cheap copies.
use std::sync::{Arc, RwLock};

use crate::core::events::{Event, Observer};

/// Metrics collected by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Torrents added over the process lifetime.
    pub torrents_added: u64,
    /// Torrents that reached 100%.
    pub torrents_completed: u64,
    /// Torrents that entered the error state.
    pub torrents_errored: u64,
    /// Successful peer handshakes.
    pub peers_connected: u64,
    /// Sessions that ended, for any reason.
    pub peers_disconnected: u64,
    /// Pieces that passed hash verification.
    pub pieces_verified: u64,
}

/// Shared handle to the metrics value.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    metrics: Arc<RwLock<Metrics>>,
}

impl Repo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Metrics {
        *self.metrics.read().expect("metrics lock poisoned")
    }
}

/// Folds events into the repo. Runs inside the observer dispatcher, so
/// updates are serialized with every other observer call.
#[derive(Debug, Clone, Default)]
pub struct Keeper {
    repo: Repo,
}

impl Keeper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn repo(&self) -> Repo {
        self.repo.clone()
    }
}

impl Observer for Keeper {
    fn handle_event(&self, event: &Event) {
        let mut metrics = self.repo.metrics.write().expect("metrics lock poisoned");
        match event {
            Event::TorrentAdded { .. } => metrics.torrents_added += 1,
            Event::Completed { .. } => metrics.torrents_completed += 1,
            Event::TorrentErrored { .. } => metrics.torrents_errored += 1,
            Event::PeerConnected { .. } => metrics.peers_connected += 1,
            Event::PeerDisconnected { .. } => metrics.peers_disconnected += 1,
            Event::PieceVerified { .. } => metrics.pieces_verified += 1,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use riptide_primitives::InfoHash;

    use super::{Keeper, Metrics};
    use crate::core::events::{Event, Observer};

    #[test]
    fn events_fold_into_counters() {
        let keeper = Keeper::new();
        let repo = keeper.repo();

        let events = [
            Event::TorrentAdded {
                id: 1,
                info_hash: InfoHash([1; 20]),
                name: "t".to_owned(),
            },
            Event::PieceVerified { id: 1, piece: 0 },
            Event::PieceVerified { id: 1, piece: 1 },
            Event::Completed { id: 1 },
        ];
        for event in &events {
            keeper.handle_event(event);
        }

        assert_eq!(
            repo.snapshot(),
            Metrics {
                torrents_added: 1,
                pieces_verified: 2,
                torrents_completed: 1,
                ..Metrics::default()
            }
        );
    }
}
