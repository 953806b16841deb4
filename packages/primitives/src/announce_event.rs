//! Announce events, as described in
//! [BEP 3](https://www.bittorrent.org/beps/bep_0003.html).
use std::fmt;

use serde::{Deserialize, Serialize};

/// The event accompanying a tracker announce.
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// The peer has started downloading the torrent.
    Started,
    /// The peer has ceased downloading the torrent.
    Stopped,
    /// The peer has completed downloading the torrent.
    Completed,
    /// One of the announcements done at regular intervals.
    None,
}

impl AnnounceEvent {
    /// The value of the HTTP announce `event` query parameter; empty for
    /// periodic announces, which omit the parameter.
    #[must_use]
    pub fn query_value(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::None => "",
        }
    }

    /// The UDP announce (BEP 15) event field.
    #[must_use]
    pub fn to_i32(&self) -> i32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

impl fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.query_value())
    }
}
