//! Trait to validate semantic errors.
//!
//! Errors can involve more than one configuration option; some combinations
//! leave the engine unable to make progress at all.
use thiserror::Error;

/// Errors that can occur validating the configuration.
#[derive(Error, Debug)]
pub enum SemanticValidationError {
    #[error("max_connections is 0; the engine could never open a session")]
    NoConnectionsAllowed,

    #[error("max_half_open_connections is 0; the engine could never dial a peer")]
    NoHalfOpenConnectionsAllowed,

    #[error("max_pieces_in_flight and max_requests_per_peer must both be non-zero")]
    PipelineWouldStall,
}

pub trait Validator {
    /// # Errors
    ///
    /// Will return an error if the configuration is invalid.
    fn validate(&self) -> Result<(), SemanticValidationError>;
}
