use serde::{Deserialize, Serialize};

/// Download priority of a file within a torrent.
///
/// A piece inherits the maximum priority among the files it overlaps, and
/// pieces wholly inside deselected files are never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}
