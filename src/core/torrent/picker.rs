//! Piece selection: rarest first, weighted by file priority, with
//! randomized tie-breaks.
//!
//! The picker never marks anything on its own. The pipeline calls
//! [`PiecePicker::mark_downloading`] / [`PiecePicker::unmark_downloading`]
//! around request dispatch and [`PiecePicker::mark_verified`] when storage
//! accepts a piece. Global availability is maintained incrementally from
//! `have`/`bitfield` messages and decremented when a session closes.
use rand::Rng;
use riptide_metainfo::Metainfo;
use riptide_primitives::{Bitfield, Priority};

/// With fewer than this many pieces missing (and all of them already
/// requested), the pipeline enters endgame and duplicates blocks across
/// peers.
pub const ENDGAME_THRESHOLD: usize = 20;

#[derive(Debug, Clone)]
struct PieceInfo {
    verified: bool,
    downloading: bool,
    /// Highest priority among the selected files this piece overlaps.
    priority: Priority,
    /// True when every overlapping file is deselected; never requested.
    excluded: bool,
    /// How many connected peers have this piece.
    availability: u32,
}

#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceInfo>,
}

impl PiecePicker {
    /// Build a picker from the current verified bitfield and per-file
    /// selection state. `file_priorities` and `file_selected` are indexed
    /// like [`Metainfo::files`].
    #[must_use]
    pub fn new(
        metainfo: &Metainfo,
        file_priorities: &[Priority],
        file_selected: &[bool],
        verified: &Bitfield,
    ) -> Self {
        let mut picker = Self {
            pieces: (0..metainfo.piece_count())
                .map(|piece| PieceInfo {
                    verified: verified.has(piece),
                    downloading: false,
                    priority: Priority::Normal,
                    excluded: false,
                    availability: 0,
                })
                .collect(),
        };
        picker.refresh_file_selection(metainfo, file_priorities, file_selected);
        picker
    }

    /// Recompute per-piece priority tags after a file priority or selection
    /// change.
    pub fn refresh_file_selection(&mut self, metainfo: &Metainfo, file_priorities: &[Priority], file_selected: &[bool]) {
        for (piece, info) in self.pieces.iter_mut().enumerate() {
            let mut priority = None;
            let mut any_selected = false;
            for file_index in metainfo.file_indexes_for_piece(piece) {
                if file_selected.get(file_index).copied().unwrap_or(true) {
                    any_selected = true;
                    let file_priority = file_priorities.get(file_index).copied().unwrap_or_default();
                    priority = Some(priority.map_or(file_priority, |p: Priority| p.max(file_priority)));
                }
            }
            info.excluded = !any_selected;
            info.priority = priority.unwrap_or_default();
        }
    }

    pub fn peer_has(&mut self, piece: usize) {
        if let Some(info) = self.pieces.get_mut(piece) {
            info.availability += 1;
        }
    }

    pub fn peer_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.set_indexes() {
            self.peer_has(piece);
        }
    }

    /// Remove a departed peer's contribution to availability.
    pub fn peer_gone(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.set_indexes() {
            if let Some(info) = self.pieces.get_mut(piece) {
                info.availability = info.availability.saturating_sub(1);
            }
        }
    }

    pub fn mark_downloading(&mut self, piece: usize) {
        if let Some(info) = self.pieces.get_mut(piece) {
            info.downloading = true;
        }
    }

    pub fn unmark_downloading(&mut self, piece: usize) {
        if let Some(info) = self.pieces.get_mut(piece) {
            info.downloading = false;
        }
    }

    pub fn mark_verified(&mut self, piece: usize) {
        if let Some(info) = self.pieces.get_mut(piece) {
            info.verified = true;
            info.downloading = false;
        }
    }

    #[must_use]
    pub fn is_downloading(&self, piece: usize) -> bool {
        self.pieces.get(piece).is_some_and(|info| info.downloading)
    }

    /// Pieces we still want: neither verified nor excluded.
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.pieces.iter().filter(|info| !info.verified && !info.excluded).count()
    }

    /// True when everything wanted is verified.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Indexes of wanted-but-unverified pieces, for endgame duplication.
    #[must_use]
    pub fn missing_pieces(&self) -> Vec<usize> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, info)| !info.verified && !info.excluded)
            .map(|(piece, _)| piece)
            .collect()
    }

    /// Endgame: few pieces left and every one of them already has an
    /// outstanding request.
    #[must_use]
    pub fn endgame_active(&self) -> bool {
        let missing: Vec<&PieceInfo> = self.pieces.iter().filter(|info| !info.verified && !info.excluded).collect();
        !missing.is_empty() && missing.len() < ENDGAME_THRESHOLD && missing.iter().all(|info| info.downloading)
    }

    /// Select up to `n` pieces to start downloading, best first. Returns
    /// only pieces some connected peer has; marks nothing.
    #[must_use]
    pub fn pick_pieces(&self, n: usize, rng: &mut impl Rng) -> Vec<usize> {
        let mut candidates: Vec<(std::cmp::Reverse<Priority>, u32, u32, usize)> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, info)| {
                !info.verified && !info.downloading && !info.excluded && info.availability > 0
            })
            .map(|(piece, info)| (std::cmp::Reverse(info.priority), info.availability, rng.gen::<u32>(), piece))
            .collect();

        candidates.sort_unstable();
        candidates.truncate(n);
        candidates.into_iter().map(|(_, _, _, piece)| piece).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use riptide_bencode::Bencode;
    use riptide_metainfo::Metainfo;
    use riptide_primitives::{Bitfield, Priority};

    use super::{PiecePicker, ENDGAME_THRESHOLD};

    /// Two 160-byte files, piece length 64: 5 pieces, piece 2 straddles.
    fn metainfo() -> Arc<Metainfo> {
        let file = |len: i64, name: &str| {
            Bencode::dict([
                ("length", Bencode::Int(len)),
                ("path", Bencode::List(vec![Bencode::from(name)])),
            ])
        };
        let torrent = Bencode::dict([
            ("announce", Bencode::from("http://tracker.example/announce")),
            (
                "info",
                Bencode::dict([
                    ("files", Bencode::List(vec![file(160, "a.bin"), file(160, "b.bin")])),
                    ("name", Bencode::from("pack")),
                    ("piece length", Bencode::Int(64)),
                    ("pieces", Bencode::bytes(vec![0u8; 20 * 5])),
                ]),
            ),
        ])
        .encode();
        Arc::new(Metainfo::parse(&torrent).unwrap())
    }

    fn picker_with_all_available(metainfo: &Metainfo) -> PiecePicker {
        let mut picker = PiecePicker::new(
            metainfo,
            &[Priority::Normal, Priority::Normal],
            &[true, true],
            &Bitfield::new(metainfo.piece_count()),
        );
        let mut full = Bitfield::new(metainfo.piece_count());
        for piece in 0..metainfo.piece_count() {
            full.set(piece);
        }
        picker.peer_bitfield(&full);
        picker
    }

    #[test]
    fn never_picks_verified_in_flight_or_unavailable_pieces() {
        let metainfo = metainfo();
        let mut verified = Bitfield::new(5);
        verified.set(0);

        let mut picker = PiecePicker::new(
            &metainfo,
            &[Priority::Normal, Priority::Normal],
            &[true, true],
            &verified,
        );

        // Peers have pieces 1 and 2 only; 2 is already in flight.
        picker.peer_has(1);
        picker.peer_has(2);
        picker.mark_downloading(2);

        let mut rng = StdRng::seed_from_u64(7);
        let picked = picker.pick_pieces(10, &mut rng);
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn rarer_pieces_are_preferred() {
        let metainfo = metainfo();
        let mut picker = picker_with_all_available(&metainfo);

        // Two more peers have everything except piece 3.
        for _ in 0..2 {
            for piece in [0usize, 1, 2, 4] {
                picker.peer_has(piece);
            }
        }

        let mut rng = StdRng::seed_from_u64(7);
        let picked = picker.pick_pieces(1, &mut rng);
        assert_eq!(picked, vec![3]);
    }

    #[test]
    fn higher_priority_files_trump_rarity() {
        let metainfo = metainfo();
        let mut picker = picker_with_all_available(&metainfo);

        // b.bin is high priority; pieces 3 and 4 are wholly inside it and
        // piece 2 straddles into it.
        picker.refresh_file_selection(&metainfo, &[Priority::Normal, Priority::High], &[true, true]);
        // Make a low-priority piece the rarest.
        for _ in 0..3 {
            for piece in [2usize, 3, 4] {
                picker.peer_has(piece);
            }
        }

        let mut rng = StdRng::seed_from_u64(7);
        let picked = picker.pick_pieces(3, &mut rng);
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|piece| [2, 3, 4].contains(piece)));
    }

    #[test]
    fn deselected_files_exclude_their_pieces() {
        let metainfo = metainfo();
        let mut picker = picker_with_all_available(&metainfo);

        // Deselect b.bin: pieces 3 and 4 are wholly inside it. Piece 2
        // straddles both files and stays wanted.
        picker.refresh_file_selection(&metainfo, &[Priority::Normal, Priority::Normal], &[true, false]);

        let mut rng = StdRng::seed_from_u64(7);
        let picked = picker.pick_pieces(10, &mut rng);
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&3));
        assert!(!picked.contains(&4));
        assert_eq!(picker.missing_count(), 3);
    }

    #[test]
    fn ties_break_randomly() {
        let metainfo = metainfo();
        let picker = picker_with_all_available(&metainfo);

        let mut seen_first: std::collections::HashSet<usize> = std::collections::HashSet::new();
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            seen_first.insert(picker.pick_pieces(1, &mut rng)[0]);
        }
        assert!(seen_first.len() > 1, "tie-break never varied");
    }

    #[test]
    fn availability_drops_when_a_peer_leaves() {
        let metainfo = metainfo();
        let mut picker = PiecePicker::new(
            &metainfo,
            &[Priority::Normal, Priority::Normal],
            &[true, true],
            &Bitfield::new(5),
        );

        let mut theirs = Bitfield::new(5);
        theirs.set(1);
        picker.peer_bitfield(&theirs);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(picker.pick_pieces(10, &mut rng), vec![1]);

        picker.peer_gone(&theirs);
        assert!(picker.pick_pieces(10, &mut rng).is_empty());
    }

    #[test]
    fn endgame_needs_all_missing_pieces_in_flight() {
        let metainfo = metainfo();
        let mut picker = picker_with_all_available(&metainfo);
        assert!(5 < ENDGAME_THRESHOLD);

        assert!(!picker.endgame_active());
        for piece in 0..5 {
            picker.mark_downloading(piece);
        }
        assert!(picker.endgame_active());

        for piece in 0..5 {
            picker.mark_verified(piece);
        }
        assert!(!picker.endgame_active());
        assert!(picker.is_complete());
    }
}
