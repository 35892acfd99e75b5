//! Run lifecycle: backend selection, geometry matching and hit production.

use log::{debug, info, warn};
use serde::Serialize;

use photon_protocol::{wavelength_to_energy, OriginProcess, PEBatch, PESample, PhotonBatch, Vec3};

use crate::backend::{PhotonBackend, PropagateOutcome};
use crate::client::ProtocolClient;
use crate::config::OffloadConfig;
use crate::context::OffloadContext;
use crate::detector::{HitSink, PmtCatalog, PmtHit, PmtResponse};
use crate::error::{OffloadError, Result};
use crate::geometry::ChannelMap;
use crate::metrics::RunMetrics;
use crate::replay::ReplayReader;

/// Where photoelectrons come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Ship photons to the backend over the network.
    Live,
    /// Read recorded photoelectrons from the configured replay file.
    Replay,
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub event_id: u32,
    pub photons: usize,
    pub photoelectrons: usize,
    pub hits: usize,
    /// Photoelectrons on backend channels with no detector PMT.
    pub dropped: usize,
    pub outcome: PropagateOutcome,
}

/// Drives one run at a time against a detector catalog.
pub struct RunController<C: PmtCatalog, R: PmtResponse> {
    ctx: OffloadContext,
    config: OffloadConfig,
    catalog: C,
    response: R,
    backend: Option<Box<dyn PhotonBackend>>,
    channel_map: ChannelMap,
    photons: PhotonBatch,
    pe: PEBatch,
    metrics: RunMetrics,
}

impl<C: PmtCatalog, R: PmtResponse> RunController<C, R> {
    pub fn new(config: OffloadConfig, catalog: C, response: R) -> Result<Self> {
        Ok(Self {
            ctx: OffloadContext::new()?,
            config,
            catalog,
            response,
            backend: None,
            channel_map: ChannelMap::default(),
            photons: PhotonBatch::new(),
            pe: PEBatch::new(),
            metrics: RunMetrics::new(),
        })
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_some()
    }

    /// Photons of the event being built.
    pub fn photons_mut(&mut self) -> &mut PhotonBatch {
        &mut self.photons
    }

    /// Open the backend for `mode` and match its geometry.
    pub fn begin_run(&mut self, mode: RunMode) -> Result<()> {
        let backend: Box<dyn PhotonBackend> = match mode {
            RunMode::Live => {
                let mut client = ProtocolClient::connect(&self.ctx, &self.config.client_settings())?;
                client.start()?;
                Box::new(client)
            }
            RunMode::Replay => Box::new(ReplayReader::open(&self.config.replay.table)?),
        };
        self.begin_run_with(backend)
    }

    /// Begin a run against an already constructed backend.
    pub fn begin_run_with(&mut self, mut backend: Box<dyn PhotonBackend>) -> Result<()> {
        if self.backend.is_some() {
            warn!("Run already in progress, ending it first");
            self.end_run();
        }

        let backend_positions = backend.backend_positions()?;
        let detector_positions = self.catalog.positions();
        let channel_map = ChannelMap::build(&backend_positions, &detector_positions)?;
        if channel_map.matched() == 0 {
            return Err(OffloadError::NoPmtMatched(backend_positions.len()));
        }

        info!(
            "Run started with {} backend: {}/{} PMTs matched",
            backend.name(),
            channel_map.matched(),
            channel_map.len()
        );
        self.channel_map = channel_map;
        self.photons.clear();
        self.pe.clear();
        self.metrics = RunMetrics::new();
        self.backend = Some(backend);
        Ok(())
    }

    /// Propagate the accumulated photons as `event_id` and record the hits.
    ///
    /// Both batches are empty afterwards. Replay errors and photoelectrons
    /// labelled with another event id are returned as errors; live failures
    /// yield an event with zero hits.
    pub fn process_event(&mut self, event_id: u32, sink: &mut dyn HitSink) -> Result<EventSummary> {
        let backend = self.backend.as_mut().ok_or(OffloadError::NoActiveRun)?;

        self.photons.set_event(event_id);
        let outcome = match backend.propagate(&self.photons, &mut self.pe) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.photons.clear();
                self.pe.clear();
                return Err(e);
            }
        };
        if self.pe.event() != event_id {
            let returned = self.pe.event();
            self.photons.clear();
            self.pe.clear();
            return Err(OffloadError::EventMismatch {
                requested: event_id,
                returned,
            });
        }

        let mut hits = 0;
        let mut dropped = 0;
        for sample in self.pe.iter() {
            match self.channel_map.get(sample.channel) {
                Some(pmt_id) => {
                    sink.record_hit(make_hit(&sample, pmt_id, &self.catalog, &mut self.response));
                    hits += 1;
                }
                None => {
                    debug!(
                        "Event {}: dropping PE on unmapped channel {}",
                        event_id, sample.channel
                    );
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            warn!("Event {}: dropped {} PE on unmapped channels", event_id, dropped);
        }

        let summary = EventSummary {
            event_id,
            photons: self.photons.len(),
            photoelectrons: self.pe.len(),
            hits,
            dropped,
            outcome,
        };
        self.metrics.record_event(&summary);
        self.photons.clear();
        self.pe.clear();
        Ok(summary)
    }

    /// Close the backend and log the run summary.
    pub fn end_run(&mut self) -> Option<RunMetrics> {
        let mut backend = self.backend.take()?;
        backend.end_run();
        self.metrics.reconnects = backend.reconnects();
        self.metrics.log_summary();
        Some(self.metrics.clone())
    }
}

impl<C: PmtCatalog, R: PmtResponse> Drop for RunController<C, R> {
    fn drop(&mut self) {
        if self.backend.is_some() {
            self.end_run();
        }
    }
}

fn make_hit<C: PmtCatalog, R: PmtResponse>(
    sample: &PESample,
    pmt_id: u32,
    catalog: &C,
    response: &mut R,
) -> PmtHit {
    let model = catalog.model(pmt_id);
    let wavelength = sample.wavelength as f64;
    let direction = Vec3::from_f32(sample.direction);
    let momentum = if wavelength > 0.0 {
        direction * wavelength_to_energy(wavelength)
    } else {
        Vec3::ZERO
    };
    let hit_time = sample.time as f64;

    PmtHit {
        pmt_id,
        pmt_type: catalog.pmt_type(pmt_id),
        wavelength,
        momentum,
        polarization: Vec3::from_f32(sample.polarization),
        position: catalog.position(pmt_id),
        hit_time,
        front_end_time: response.pick_time(model, hit_time),
        charge: catalog.charge_scale(pmt_id) * response.pick_charge(model),
        creator_process: OriginProcess::from_flags(sample.flags),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{IdealResponse, PmtInfoTable};
    use photon_protocol::{flags, HC_MEV_NM};

    /// Replies with a fixed list of (channel, flags) for every event.
    struct FixedBackend {
        positions: Vec<Vec3>,
        reply: Vec<(u32, u32)>,
        outcome: PropagateOutcome,
    }

    impl PhotonBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn backend_positions(&mut self) -> Result<Vec<Vec3>> {
            Ok(self.positions.clone())
        }

        fn propagate(&mut self, photons: &PhotonBatch, out: &mut PEBatch) -> Result<PropagateOutcome> {
            out.clear();
            out.set_event(photons.event());
            if self.outcome == PropagateOutcome::Complete {
                for &(channel, flags) in &self.reply {
                    out.push(PESample {
                        channel,
                        time: 20.0,
                        wavelength: 400.0,
                        direction: [0.0, 0.0, 1.0],
                        polarization: [1.0, 0.0, 0.0],
                        flags,
                    });
                }
            }
            Ok(self.outcome)
        }

        fn end_run(&mut self) {}
    }

    struct DoubleCharge;

    impl PmtResponse for DoubleCharge {
        fn pick_time(&mut self, _model: usize, hit_time: f64) -> f64 {
            hit_time + 1.5
        }

        fn pick_charge(&mut self, _model: usize) -> f64 {
            2.0
        }
    }

    fn positions() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
    }

    fn backend(reply: Vec<(u32, u32)>) -> Box<FixedBackend> {
        Box::new(FixedBackend {
            positions: positions(),
            reply,
            outcome: PropagateOutcome::Complete,
        })
    }

    fn controller<R: PmtResponse>(response: R) -> RunController<PmtInfoTable, R> {
        let catalog = PmtInfoTable::from_positions(&positions());
        RunController::new(OffloadConfig::default(), catalog, response).unwrap()
    }

    #[test]
    fn test_hits_for_mapped_channels() {
        let mut run = controller(IdealResponse);
        run.begin_run_with(backend(vec![
            (0, flags::CHERENKOV),
            (2, flags::SCINTILLATION | flags::BULK_REEMIT),
        ]))
        .unwrap();

        let mut hits: Vec<PmtHit> = Vec::new();
        let summary = run.process_event(0, &mut hits).unwrap();

        assert_eq!(summary.hits, 2);
        assert_eq!(summary.dropped, 0);
        assert_eq!(hits[0].pmt_id, 0);
        assert_eq!(hits[0].creator_process_name(), "Cerenkov");
        assert_eq!(hits[1].pmt_id, 2);
        assert_eq!(hits[1].creator_process_name(), "Reemission");
        assert_eq!(hits[1].position, Vec3::new(0.0, 1.0, 0.0));

        let energy = HC_MEV_NM / 400.0;
        assert!((hits[0].momentum.z - energy).abs() < 1e-12);
        assert_eq!(hits[0].charge, 1.0);
        assert_eq!(hits[0].front_end_time, hits[0].hit_time);
    }

    #[test]
    fn test_unmapped_channel_is_dropped() {
        let mut run = controller(IdealResponse);
        run.begin_run_with(backend(vec![(3, 0), (1, 0)])).unwrap();

        let mut hits: Vec<PmtHit> = Vec::new();
        let summary = run.process_event(0, &mut hits).unwrap();

        assert_eq!(summary.photoelectrons, 2);
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].creator_process_name(), "Unknown");
        assert_eq!(run.metrics().dropped_samples, 1);
    }

    #[test]
    fn test_response_and_charge_scale() {
        let mut catalog = PmtInfoTable::from_positions(&positions());
        catalog.pmts[1].charge_scale = 0.5;
        let mut run = RunController::new(OffloadConfig::default(), catalog, DoubleCharge).unwrap();
        run.begin_run_with(backend(vec![(1, 0)])).unwrap();

        let mut hits: Vec<PmtHit> = Vec::new();
        run.process_event(0, &mut hits).unwrap();
        assert_eq!(hits[0].charge, 1.0);
        assert_eq!(hits[0].front_end_time, 21.5);
    }

    #[test]
    fn test_batches_are_cleared() {
        let mut run = controller(IdealResponse);
        run.begin_run_with(backend(vec![(0, 0)])).unwrap();
        run.photons_mut().add_photon(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
            420.0,
            0.0,
            OriginProcess::Scintillation,
        );

        let mut hits: Vec<PmtHit> = Vec::new();
        let summary = run.process_event(4, &mut hits).unwrap();
        assert_eq!(summary.photons, 1);
        assert!(run.photons_mut().is_empty());
    }

    #[test]
    fn test_failed_event_has_no_hits() {
        let mut run = controller(IdealResponse);
        let mut failing = backend(vec![(0, 0)]);
        failing.outcome = PropagateOutcome::Failed;
        run.begin_run_with(failing).unwrap();

        let mut hits: Vec<PmtHit> = Vec::new();
        let summary = run.process_event(5, &mut hits).unwrap();
        assert_eq!(summary.outcome, PropagateOutcome::Failed);
        assert!(hits.is_empty());
        assert_eq!(run.metrics().failed_events, 1);
    }

    #[test]
    fn test_count_mismatch_is_fatal() {
        let mut run = controller(IdealResponse);
        let mut short = backend(Vec::new());
        short.positions.pop();
        assert!(matches!(
            run.begin_run_with(short),
            Err(OffloadError::Geometry(_))
        ));
        assert!(!run.is_running());
    }

    #[test]
    fn test_no_matches_is_fatal() {
        let mut run = controller(IdealResponse);
        let mut skewed = backend(Vec::new());
        skewed.positions = vec![
            Vec3::new(5.0, 0.0, 0.0),
            Vec3::new(-5.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
        ];
        assert!(matches!(
            run.begin_run_with(skewed),
            Err(OffloadError::NoPmtMatched(3))
        ));
    }

    #[test]
    fn test_foreign_event_id_is_fatal() {
        struct Relabel(FixedBackend);

        impl PhotonBackend for Relabel {
            fn name(&self) -> &'static str {
                "relabel"
            }

            fn backend_positions(&mut self) -> Result<Vec<Vec3>> {
                self.0.backend_positions()
            }

            fn propagate(&mut self, photons: &PhotonBatch, out: &mut PEBatch) -> Result<PropagateOutcome> {
                let outcome = self.0.propagate(photons, out)?;
                out.set_event(0);
                Ok(outcome)
            }

            fn end_run(&mut self) {}
        }

        let mut run = controller(IdealResponse);
        run.begin_run_with(Box::new(Relabel(*backend(vec![(0, 0)]))))
            .unwrap();

        let mut hits: Vec<PmtHit> = Vec::new();
        assert!(matches!(
            run.process_event(5, &mut hits),
            Err(OffloadError::EventMismatch {
                requested: 5,
                returned: 0
            })
        ));
        assert!(hits.is_empty());
        assert_eq!(run.metrics().events, 0);
    }

    #[test]
    fn test_process_without_run() {
        let mut run = controller(IdealResponse);
        let mut hits: Vec<PmtHit> = Vec::new();
        assert!(matches!(
            run.process_event(0, &mut hits),
            Err(OffloadError::NoActiveRun)
        ));
    }

    #[test]
    fn test_end_run() {
        let mut run = controller(IdealResponse);
        run.begin_run_with(backend(vec![(0, 0)])).unwrap();
        let mut hits: Vec<PmtHit> = Vec::new();
        run.process_event(0, &mut hits).unwrap();

        let metrics = run.end_run().unwrap();
        assert_eq!(metrics.events, 1);
        assert!(!run.is_running());
        assert!(run.end_run().is_none());
    }
}
