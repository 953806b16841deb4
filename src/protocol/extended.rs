//! The BEP 10 extension layer.
//!
//! Message id 20 carries an inner extension id. Id 0 is the extended
//! handshake, a bencoded dictionary advertising the extensions each side
//! speaks and the local ids it assigned to them. We advertise and consume
//! `ut_pex` (BEP 11); its payload codec lives in [`crate::discovery::pex`].
use bytes::Bytes;
use riptide_bencode::{Bencode, Value};

use super::WireError;

/// Inner id of the extended handshake itself.
pub const HANDSHAKE_EXT_ID: u8 = 0;

/// The id under which we expect `ut_pex` messages from the remote; sent in
/// our extended handshake `m` dictionary.
pub const LOCAL_UT_PEX_ID: u8 = 1;

/// What the remote advertised in its extended handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// The id the remote wants `ut_pex` messages sent under, when it
    /// supports PEX at all.
    pub ut_pex_id: Option<u8>,
    /// Remote client name and version, when advertised.
    pub client: Option<String>,
    /// The remote's listen port, when advertised.
    pub listen_port: Option<u16>,
}

impl ExtendedHandshake {
    /// Parse the bencoded handshake payload (after the inner id byte).
    ///
    /// # Errors
    ///
    /// Fails when the payload is not a bencoded dictionary.
    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        let (value, _) = Value::decode_prefix(payload)?;
        if value.as_dict().is_none() {
            return Err(WireError::BadExtensionHandshake);
        }

        let ut_pex_id = value
            .lookup(b"m")
            .and_then(|m| m.lookup(b"ut_pex"))
            .and_then(Value::as_int)
            .and_then(|id| u8::try_from(id).ok())
            .filter(|id| *id != 0);

        let client = value.lookup(b"v").and_then(Value::as_str).map(str::to_owned);

        let listen_port = value
            .lookup(b"p")
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok());

        Ok(Self {
            ut_pex_id,
            client,
            listen_port,
        })
    }

    /// Build our own handshake payload.
    #[must_use]
    pub fn local_payload(listen_port: u16, max_queued_requests: usize) -> Bytes {
        let payload = Bencode::dict([
            (
                &b"m"[..],
                Bencode::dict([("ut_pex", Bencode::Int(i64::from(LOCAL_UT_PEX_ID)))]),
            ),
            (&b"p"[..], Bencode::Int(i64::from(listen_port))),
            (
                &b"reqq"[..],
                Bencode::Int(i64::try_from(max_queued_requests).unwrap_or(i64::MAX)),
            ),
            (&b"v"[..], Bencode::from(concat!("riptide ", env!("CARGO_PKG_VERSION")))),
        ]);
        Bytes::from(payload.encode())
    }
}
