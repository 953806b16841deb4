//! The settings object consumed by the riptide engine.
//!
//! The engine does not own a settings file: an embedding application (UI,
//! daemon, CLI) produces a [`Settings`] value by whatever means it likes and
//! hands the engine an immutable snapshot. Every field has a serde default,
//! so a partial JSON document deserializes into a complete value.
//!
//! Semantic constraints that span more than one field are checked through
//! the [`Validator`] trait before the engine starts.
pub mod validator;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::validator::{SemanticValidationError, Validator};

/// Engine-wide settings. Consumed as an immutable snapshot at engine start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for the data of newly added torrents.
    #[serde(default = "Settings::default_download_path")]
    pub default_download_path: PathBuf,

    /// Directory where resume records and the torrent registry are kept.
    #[serde(default = "Settings::default_state_path")]
    pub state_path: PathBuf,

    /// Upper bound on established sessions per torrent.
    #[serde(default = "Settings::default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on half-open (connecting) sessions per torrent.
    #[serde(default = "Settings::default_max_half_open_connections")]
    pub max_half_open_connections: usize,

    /// Pipeline cap on pieces being downloaded at once, per torrent.
    #[serde(default = "Settings::default_max_pieces_in_flight")]
    pub max_pieces_in_flight: usize,

    /// Cap on outstanding block requests to a single peer.
    #[serde(default = "Settings::default_max_requests_per_peer")]
    pub max_requests_per_peer: usize,

    /// Process-wide download ceiling in bytes per second. `None` or `0`
    /// means unlimited.
    #[serde(default)]
    pub global_max_download_bps: Option<u64>,

    /// Process-wide upload ceiling in bytes per second. `None` or `0` means
    /// unlimited.
    #[serde(default)]
    pub global_max_upload_bps: Option<u64>,

    /// Extra `Cookie` header value per tracker URL. Keys are matched
    /// case-insensitively against the announce URL.
    #[serde(default)]
    pub tracker_cookies: HashMap<String, String>,

    /// Extra headers per tracker URL.
    #[serde(default)]
    pub tracker_headers: HashMap<String, HashMap<String, String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: Self::default_download_path(),
            state_path: Self::default_state_path(),
            max_connections: Self::default_max_connections(),
            max_half_open_connections: Self::default_max_half_open_connections(),
            max_pieces_in_flight: Self::default_max_pieces_in_flight(),
            max_requests_per_peer: Self::default_max_requests_per_peer(),
            global_max_download_bps: None,
            global_max_upload_bps: None,
            tracker_cookies: HashMap::new(),
            tracker_headers: HashMap::new(),
        }
    }
}

impl Settings {
    fn default_download_path() -> PathBuf {
        PathBuf::from("./downloads")
    }

    fn default_state_path() -> PathBuf {
        PathBuf::from("./state")
    }

    fn default_max_connections() -> usize {
        50
    }

    fn default_max_half_open_connections() -> usize {
        10
    }

    fn default_max_pieces_in_flight() -> usize {
        100
    }

    fn default_max_requests_per_peer() -> usize {
        128
    }

    /// The configured `Cookie` value for a tracker URL, if any.
    #[must_use]
    pub fn cookie_for_tracker(&self, url: &str) -> Option<&str> {
        self.tracker_cookies
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(url))
            .map(|(_, value)| value.as_str())
    }

    /// The configured extra headers for a tracker URL, if any.
    #[must_use]
    pub fn headers_for_tracker(&self, url: &str) -> Option<&HashMap<String, String>> {
        self.tracker_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(url))
            .map(|(_, value)| value)
    }
}

impl Validator for Settings {
    fn validate(&self) -> Result<(), SemanticValidationError> {
        if self.max_connections == 0 {
            return Err(SemanticValidationError::NoConnectionsAllowed);
        }
        if self.max_half_open_connections == 0 {
            return Err(SemanticValidationError::NoHalfOpenConnectionsAllowed);
        }
        if self.max_pieces_in_flight == 0 || self.max_requests_per_peer == 0 {
            return Err(SemanticValidationError::PipelineWouldStall);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Settings, Validator};

    #[test]
    fn a_partial_document_fills_in_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"max_connections": 7}"#).unwrap();

        assert_eq!(settings.max_connections, 7);
        assert_eq!(settings.max_requests_per_peer, 128);
        assert_eq!(settings.global_max_download_bps, None);
    }

    #[test]
    fn defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn zero_connection_budget_is_rejected() {
        let settings = Settings {
            max_connections: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tracker_cookies_match_case_insensitively() {
        let mut settings = Settings::default();
        settings
            .tracker_cookies
            .insert("http://Tracker.Example/announce".to_owned(), "token=1".to_owned());

        assert_eq!(
            settings.cookie_for_tracker("http://tracker.example/announce"),
            Some("token=1")
        );
        assert_eq!(settings.cookie_for_tracker("http://other.example/"), None);
    }
}
