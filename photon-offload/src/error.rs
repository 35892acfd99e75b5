//! Fatal error taxonomy for an offload run.
//!
//! Everything in [`OffloadError`] ends the run. Recoverable per-event
//! conditions (retry exhaustion, stale replies, unmapped channels) are
//! handled and counted where they are detected and never show up here.

use thiserror::Error;

use photon_protocol::{ClientError, ProtocolError};

use crate::geometry::GeometryError;
use crate::replay::ReplayError;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Failed to resolve backend endpoint {endpoint}: {reason}")]
    Discovery { endpoint: String, reason: String },

    #[error("Backend handshake failed: {0}")]
    Handshake(ClientError),

    #[error("Detector info request failed: {0}")]
    DetectorInfo(ClientError),

    #[error("Geometry reconciliation failed: {0}")]
    Geometry(#[from] GeometryError),

    #[error("No backend PMT could be matched to the detector catalog ({0} PMTs)")]
    NoPmtMatched(usize),

    #[error("Replay table error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Runtime setup failed: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Backend returned event {returned} for requested event {requested}")]
    EventMismatch { requested: u32, returned: u32 },

    #[error("No run in progress")]
    NoActiveRun,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OffloadError>;
