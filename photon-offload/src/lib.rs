//! Offload of optical photon propagation to an external photon-transport
//! backend.
//!
//! A [`RunController`] collects the photons of an event, hands them to a
//! [`PhotonBackend`] (the live [`ProtocolClient`] or a [`ReplayReader`]),
//! maps the returned photoelectrons onto detector PMTs with a
//! [`ChannelMap`] and records one [`PmtHit`] per mapped photoelectron.
//!
//! Recoverable per-event problems (retry exhaustion, stale replies,
//! unmapped channels) are logged and counted. Everything in
//! [`OffloadError`] ends the run.

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod metrics;
pub mod replay;
pub mod run;

pub use backend::{PhotonBackend, PropagateOutcome};
pub use client::{ClientSettings, ClientState, ProtocolClient};
pub use config::OffloadConfig;
pub use context::OffloadContext;
pub use detector::{HitSink, IdealResponse, PmtCatalog, PmtHit, PmtInfo, PmtInfoTable, PmtResponse};
pub use error::{OffloadError, Result};
pub use geometry::{ChannelMap, GeometryError, MATCH_TOLERANCE};
pub use metrics::RunMetrics;
pub use replay::{ReplayError, ReplayReader, ReplayTable};
pub use run::{EventSummary, RunController, RunMode};
