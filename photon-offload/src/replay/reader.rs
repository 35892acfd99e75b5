use std::path::Path;

use log::{debug, info};

use photon_protocol::{PEBatch, PhotonBatch, Vec3};

use super::{ReplayError, ReplayTable, Result};
use crate::backend::{PhotonBackend, PropagateOutcome};

/// Backend that replays recorded events in order, starting at event 0.
pub struct ReplayReader {
    table: ReplayTable,
    next_event: u32,
    positions: Option<Vec<Vec3>>,
}

impl ReplayReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let table = ReplayTable::open(path)?;
        info!(
            "Replaying {} events from {}",
            table.event_count()?,
            path.display()
        );
        Ok(Self::new(table))
    }

    pub fn new(table: ReplayTable) -> Self {
        Self {
            table,
            next_event: 0,
            positions: None,
        }
    }

    /// Id of the event the next read returns.
    pub fn next_event(&self) -> u32 {
        self.next_event
    }

    /// Read the next recorded event into `out` and return its id.
    pub fn read_next(&mut self, out: &mut PEBatch) -> Result<u32> {
        let event = self.next_event;
        self.table.load_event(event, out)?;
        self.next_event += 1;
        debug!("Replayed event {} ({} PE)", event, out.len());
        Ok(event)
    }

    /// Backend PMT positions, loaded on first use.
    pub fn pmt_positions(&mut self) -> Result<&[Vec3]> {
        if self.positions.is_none() {
            let positions = self.table.load_pmt_positions()?;
            debug!("Loaded {} backend PMT positions", positions.len());
            self.positions = Some(positions);
        }
        Ok(self.positions.as_deref().unwrap_or_default())
    }
}

impl PhotonBackend for ReplayReader {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn backend_positions(&mut self) -> crate::error::Result<Vec<Vec3>> {
        Ok(self.pmt_positions()?.to_vec())
    }

    fn propagate(
        &mut self,
        photons: &PhotonBatch,
        out: &mut PEBatch,
    ) -> crate::error::Result<PropagateOutcome> {
        if photons.event() != self.next_event {
            return Err(ReplayError::OutOfOrder {
                requested: photons.event(),
                next: self.next_event,
            }
            .into());
        }
        self.read_next(out)?;
        Ok(PropagateOutcome::Complete)
    }

    fn end_run(&mut self) {
        info!("Replay finished after {} events", self.next_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OffloadError;
    use photon_protocol::PESample;

    fn table_with_events(events: u32) -> ReplayTable {
        let table = ReplayTable::open_in_memory().unwrap();
        for event in 0..events {
            let mut batch = PEBatch::new();
            batch.set_event(event);
            for i in 0..=event {
                batch.push(PESample {
                    channel: i,
                    time: i as f32,
                    wavelength: 400.0,
                    direction: [0.0, 0.0, 1.0],
                    polarization: [0.0, 1.0, 0.0],
                    flags: 0,
                });
            }
            table.insert_event(&batch).unwrap();
        }
        table
            .insert_pmt_positions(&[Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)])
            .unwrap();
        table
    }

    #[test]
    fn test_reads_in_order() {
        let mut reader = ReplayReader::new(table_with_events(2));
        let mut out = PEBatch::new();

        assert_eq!(reader.read_next(&mut out).unwrap(), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(reader.read_next(&mut out).unwrap(), 1);
        assert_eq!(out.len(), 2);
        assert!(matches!(
            reader.read_next(&mut out),
            Err(ReplayError::MissingEvent(2))
        ));
    }

    #[test]
    fn test_positions_are_cached() {
        let mut reader = ReplayReader::new(table_with_events(1));
        assert_eq!(reader.pmt_positions().unwrap().len(), 2);
        assert_eq!(reader.backend_positions().unwrap().len(), 2);
    }

    #[test]
    fn test_backend_propagate_follows_event_ids() {
        let mut reader = ReplayReader::new(table_with_events(1));
        let mut photons = PhotonBatch::new();
        let mut out = PEBatch::new();

        let outcome = PhotonBackend::propagate(&mut reader, &photons, &mut out).unwrap();
        assert_eq!(outcome, PropagateOutcome::Complete);
        assert_eq!(out.event(), 0);

        photons.set_event(1);
        assert!(matches!(
            PhotonBackend::propagate(&mut reader, &photons, &mut out),
            Err(OffloadError::Replay(ReplayError::MissingEvent(1)))
        ));
    }

    #[test]
    fn test_out_of_order_request_is_fatal() {
        let mut reader = ReplayReader::new(table_with_events(2));
        let mut photons = PhotonBatch::new();
        photons.set_event(5);
        let mut out = PEBatch::new();

        assert!(matches!(
            PhotonBackend::propagate(&mut reader, &photons, &mut out),
            Err(OffloadError::Replay(ReplayError::OutOfOrder {
                requested: 5,
                next: 0
            }))
        ));
        assert!(out.is_empty());
        assert_eq!(reader.next_event(), 0);
    }
}
