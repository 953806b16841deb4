//! The choke scheduler: which interested peers we serve.
//!
//! Every 10 s the top uploaders-to-us (while leeching) or downloaders-from-us
//! (while seeding) get the regular unchoke slots. Every 30 s one additional
//! random interested peer gets the optimistic slot, which is how new peers
//! prove themselves.
use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

/// Cadence of regular unchoke decisions.
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of optimistic slot rotation.
pub const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);

/// Regular upload slots.
pub const UPLOAD_SLOTS: usize = 4;

/// A peer as the choker sees it.
#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub addr: SocketAddr,
    pub peer_interested: bool,
    /// Their recent upload rate to us, bytes/s (EWMA).
    pub down_rate: f64,
    /// Our recent upload rate to them, bytes/s (EWMA).
    pub up_rate: f64,
}

#[derive(Debug)]
pub struct ChokeManager {
    optimistic: Option<SocketAddr>,
    last_rotation: Option<Instant>,
}

impl ChokeManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            optimistic: None,
            last_rotation: None,
        }
    }

    /// The set of peers that should be unchoked right now. The caller diffs
    /// this against current `am_choking` flags and sends `choke`/`unchoke`
    /// messages for the transitions only.
    pub fn decide(
        &mut self,
        seeding: bool,
        candidates: &[ChokeCandidate],
        now: Instant,
        rng: &mut impl Rng,
    ) -> Vec<SocketAddr> {
        let mut interested: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.peer_interested).collect();

        // Reciprocate the peers feeding us; when seeding there is nothing to
        // reciprocate, so reward the ones actually draining us.
        interested.sort_by(|a, b| {
            let key = |c: &ChokeCandidate| if seeding { c.up_rate } else { c.down_rate };
            key(b).partial_cmp(&key(a)).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut unchoked: Vec<SocketAddr> = interested.iter().take(UPLOAD_SLOTS).map(|c| c.addr).collect();

        let rotation_due = self
            .last_rotation
            .map_or(true, |last| now.duration_since(last) >= OPTIMISTIC_INTERVAL);
        let optimistic_still_valid = self
            .optimistic
            .is_some_and(|addr| candidates.iter().any(|c| c.addr == addr && c.peer_interested));

        if rotation_due || !optimistic_still_valid {
            let remaining: Vec<SocketAddr> = interested
                .iter()
                .map(|c| c.addr)
                .filter(|addr| !unchoked.contains(addr))
                .collect();
            self.optimistic = remaining.choose(rng).copied();
            if rotation_due {
                self.last_rotation = Some(now);
            }
        }

        if let Some(addr) = self.optimistic {
            if !unchoked.contains(&addr) {
                unchoked.push(addr);
            }
        }

        unchoked
    }
}

impl Default for ChokeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::Instant;

    use super::{ChokeCandidate, ChokeManager, OPTIMISTIC_INTERVAL, UPLOAD_SLOTS};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn candidate(n: u8, interested: bool, down_rate: f64, up_rate: f64) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(n),
            peer_interested: interested,
            down_rate,
            up_rate,
        }
    }

    #[tokio::test]
    async fn unchokes_the_fastest_uploaders_while_leeching() {
        let mut manager = ChokeManager::new();
        let mut rng = StdRng::seed_from_u64(1);

        let candidates: Vec<ChokeCandidate> =
            (0..8).map(|n| candidate(n, true, f64::from(n) * 1000.0, 0.0)).collect();

        let unchoked = manager.decide(false, &candidates, Instant::now(), &mut rng);

        // Top 4 by down_rate (7, 6, 5, 4) plus one optimistic from the rest.
        assert_eq!(unchoked.len(), UPLOAD_SLOTS + 1);
        for n in 4..8 {
            assert!(unchoked.contains(&addr(n)));
        }
    }

    #[tokio::test]
    async fn ranks_by_download_rate_when_seeding() {
        let mut manager = ChokeManager::new();
        let mut rng = StdRng::seed_from_u64(1);

        let candidates = vec![
            candidate(1, true, 0.0, 9000.0),
            candidate(2, true, 0.0, 100.0),
            candidate(3, false, 0.0, 50_000.0),
        ];

        let unchoked = manager.decide(true, &candidates, Instant::now(), &mut rng);
        assert!(unchoked.contains(&addr(1)));
        assert!(unchoked.contains(&addr(2)));
        // Not interested peers are never unchoked.
        assert!(!unchoked.contains(&addr(3)));
    }

    #[tokio::test]
    async fn uninterested_peers_get_nothing() {
        let mut manager = ChokeManager::new();
        let mut rng = StdRng::seed_from_u64(1);

        let candidates = vec![candidate(1, false, 1000.0, 0.0)];
        assert!(manager.decide(false, &candidates, Instant::now(), &mut rng).is_empty());
    }

    #[tokio::test]
    async fn the_optimistic_slot_rotates() {
        let mut manager = ChokeManager::new();
        let mut rng = StdRng::seed_from_u64(42);

        // 4 fast peers occupy the regular slots; 6 slow ones compete for
        // the optimistic slot.
        let candidates: Vec<ChokeCandidate> = (0..10)
            .map(|n| candidate(n, true, if n < 4 { 10_000.0 } else { 0.0 }, 0.0))
            .collect();

        let mut optimistic_seen: HashSet<SocketAddr> = HashSet::new();
        let mut now = Instant::now();
        for _ in 0..40 {
            let unchoked = manager.decide(false, &candidates, now, &mut rng);
            for peer in &unchoked {
                if (4..10).any(|n| addr(n) == *peer) {
                    optimistic_seen.insert(*peer);
                }
            }
            now += OPTIMISTIC_INTERVAL;
        }

        assert!(optimistic_seen.len() > 1, "optimistic slot never rotated");
    }

    #[tokio::test]
    async fn a_departed_optimistic_peer_is_replaced_immediately() {
        let mut manager = ChokeManager::new();
        let mut rng = StdRng::seed_from_u64(7);

        let first = vec![candidate(1, true, 0.0, 0.0)];
        let now = Instant::now();
        let unchoked = manager.decide(false, &first, now, &mut rng);
        assert_eq!(unchoked, vec![addr(1)]);

        // Peer 1 leaves before the 30 s rotation; peer 2 takes the slot.
        let second = vec![candidate(2, true, 0.0, 0.0)];
        let unchoked = manager.decide(false, &second, now + super::CHOKE_INTERVAL, &mut rng);
        assert_eq!(unchoked, vec![addr(2)]);
    }
}
