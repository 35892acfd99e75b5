//! Source of photoelectrons for a run.

use serde::Serialize;

use photon_protocol::{PEBatch, PhotonBatch, Vec3};

use crate::error::Result;

/// How one event's propagation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagateOutcome {
    /// Photoelectrons were delivered (possibly none).
    Complete,
    /// The backend keeps the results; zero PE for this event.
    Deferred,
    /// Retries exhausted; zero PE for this event.
    Failed,
}

/// A backend that turns photon batches into photoelectron batches.
///
/// Implemented by the live [`ProtocolClient`](crate::client::ProtocolClient)
/// and by [`ReplayReader`](crate::replay::ReplayReader).
pub trait PhotonBackend {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    /// PMT positions indexed by backend channel id.
    fn backend_positions(&mut self) -> Result<Vec<Vec3>>;

    /// Produce the photoelectrons for `photons.event()` into `out`.
    ///
    /// Errors are fatal for the run; per-event failures are reported as an
    /// outcome instead.
    fn propagate(&mut self, photons: &PhotonBatch, out: &mut PEBatch) -> Result<PropagateOutcome>;

    fn end_run(&mut self);

    fn reconnects(&self) -> u64 {
        0
    }
}
