//! Shared transport context.
//!
//! Owns the I/O runtime every backend connection is driven by. One context
//! is created per [`RunController`](crate::run::RunController) and handed to
//! the constructors that need it; nothing is process-global.

use std::sync::Arc;

use log::debug;
use tokio::runtime::Runtime;

/// Transport context shared by the connections of one run.
#[derive(Clone)]
pub struct OffloadContext {
    runtime: Arc<Runtime>,
}

impl OffloadContext {
    /// Build a single-threaded context. No background threads are started.
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        debug!("Offload context created (current-thread runtime)");
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    pub(crate) fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.runtime)
    }
}

impl std::fmt::Debug for OffloadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadContext").finish_non_exhaustive()
    }
}
