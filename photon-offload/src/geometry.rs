//! Matching of backend PMT channels to detector PMT ids.
//!
//! The backend and the detector describe the same PMTs in frames that may
//! differ by a translation. Both lists are centred on their centroids and
//! each backend PMT takes the first detector PMT within [`MATCH_TOLERANCE`].
//! Rotated or scaled frames are not matched.

use log::{debug, info, warn};
use thiserror::Error;

use photon_protocol::Vec3;

/// Absolute matching tolerance in detector length units (mm).
pub const MATCH_TOLERANCE: f64 = 1e-2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("PMT count mismatch: backend reports {backend}, detector has {detector}")]
    CountMismatch { backend: usize, detector: usize },
}

/// Backend channel id to detector PMT id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    entries: Vec<Option<u32>>,
}

impl ChannelMap {
    pub fn build(backend: &[Vec3], detector: &[Vec3]) -> Result<Self, GeometryError> {
        Self::build_with_tolerance(backend, detector, MATCH_TOLERANCE)
    }

    pub fn build_with_tolerance(
        backend: &[Vec3],
        detector: &[Vec3],
        tolerance: f64,
    ) -> Result<Self, GeometryError> {
        if backend.len() != detector.len() {
            return Err(GeometryError::CountMismatch {
                backend: backend.len(),
                detector: detector.len(),
            });
        }

        let offset = match (Vec3::centroid(detector), Vec3::centroid(backend)) {
            (Some(d), Some(b)) => d - b,
            _ => Vec3::ZERO,
        };
        debug!(
            "Geometry offset ({:.4}, {:.4}, {:.4})",
            offset.x, offset.y, offset.z
        );

        let entries: Vec<Option<u32>> = backend
            .iter()
            .enumerate()
            .map(|(channel, pos)| {
                let shifted = *pos + offset;
                let found = detector
                    .iter()
                    .position(|d| d.distance(shifted) < tolerance)
                    .map(|id| id as u32);
                if found.is_none() {
                    warn!(
                        "Backend PMT {} at ({:.3}, {:.3}, {:.3}) has no detector counterpart",
                        channel, pos.x, pos.y, pos.z
                    );
                }
                found
            })
            .collect();

        let map = Self { entries };
        info!(
            "Matched {} of {} backend PMTs to the detector",
            map.matched(),
            map.len()
        );
        Ok(map)
    }

    /// Detector PMT id for `channel`, if matched.
    pub fn get(&self, channel: u32) -> Option<u32> {
        self.entries.get(channel as usize).copied().flatten()
    }

    /// Number of backend channels covered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matched(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn unmatched(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(channel, _)| channel as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
    }

    #[test]
    fn test_translated_frames_match() {
        let backend = ring();
        let detector: Vec<Vec3> = ring()
            .into_iter()
            .map(|p| p + Vec3::new(10.0, 10.0, 10.0))
            .collect();

        let map = ChannelMap::build(&backend, &detector).unwrap();
        assert_eq!(map.get(0), Some(0));
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), Some(2));
        assert_eq!(map.matched(), 3);
    }

    #[test]
    fn test_shifted_pair() {
        let backend = [Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0)];
        let detector = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(11.0, 0.0, 0.0)];

        let map = ChannelMap::build(&backend, &detector).unwrap();
        assert_eq!(map.get(0), Some(0));
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_permuted_detector_order() {
        let backend = ring();
        let detector = vec![backend[2], backend[0], backend[1]];

        let map = ChannelMap::build(&backend, &detector).unwrap();
        assert_eq!(map.get(0), Some(1));
        assert_eq!(map.get(1), Some(2));
        assert_eq!(map.get(2), Some(0));
    }

    #[test]
    fn test_identity_is_idempotent() {
        let positions = ring();
        let first = ChannelMap::build(&positions, &positions).unwrap();
        let second = ChannelMap::build(&positions, &positions).unwrap();
        assert_eq!(first, second);
        for channel in 0..3 {
            assert_eq!(first.get(channel), Some(channel));
        }
    }

    #[test]
    fn test_translation_invariance() {
        let backend = ring();
        let base = ChannelMap::build(&backend, &ring()).unwrap();
        let shift = Vec3::new(-250.5, 3.25, 1000.0);
        let moved: Vec<Vec3> = backend.iter().map(|p| *p + shift).collect();
        assert_eq!(ChannelMap::build(&moved, &ring()).unwrap(), base);
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let backend = ring();
        let detector = &ring()[..2];
        assert_eq!(
            ChannelMap::build(&backend, detector),
            Err(GeometryError::CountMismatch {
                backend: 3,
                detector: 2
            })
        );
    }

    #[test]
    fn test_unmatched_channel() {
        let backend = ring();
        let mut detector = ring();
        // Moves the centroid too; only the displaced PMT should fail.
        detector[2] = Vec3::new(0.0, 1.0, 0.6);

        let map = ChannelMap::build_with_tolerance(&backend, &detector, 0.25).unwrap();
        assert_eq!(map.get(0), Some(0));
        assert_eq!(map.get(1), Some(1));
        assert_eq!(map.get(2), None);
        assert_eq!(map.unmatched().collect::<Vec<_>>(), vec![2]);
        assert_eq!(map.get(99), None);
    }
}
