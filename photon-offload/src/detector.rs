//! Detector-side collaborators: the PMT catalog, the PMT response model and
//! the hit sink.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use photon_protocol::{OriginProcess, Vec3};

use crate::error::{OffloadError, Result};

/// Read-only PMT catalog. Detector PMT ids run from 0 to `len() - 1`.
pub trait PmtCatalog {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self, id: u32) -> Vec3;

    fn pmt_type(&self, id: u32) -> i32;

    /// Index of the PMT model, used to select response functions.
    fn model(&self, id: u32) -> usize;

    fn model_name(&self, model: usize) -> &str;

    /// Per-PMT gain correction applied to sampled charges.
    fn charge_scale(&self, _id: u32) -> f64 {
        1.0
    }

    fn positions(&self) -> Vec<Vec3> {
        (0..self.len()).map(|id| self.position(id as u32)).collect()
    }
}

/// Per-model PMT response.
pub trait PmtResponse {
    /// Front-end time for a photoelectron arriving at `hit_time` (ns).
    fn pick_time(&mut self, model: usize, hit_time: f64) -> f64;

    /// Charge of one photoelectron, in units of the mean single-PE charge.
    fn pick_charge(&mut self, model: usize) -> f64;
}

/// Zero transit-time spread and unit charge.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdealResponse;

impl PmtResponse for IdealResponse {
    fn pick_time(&mut self, _model: usize, hit_time: f64) -> f64 {
        hit_time
    }

    fn pick_charge(&mut self, _model: usize) -> f64 {
        1.0
    }
}

/// A photoelectron attributed to a detector PMT.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PmtHit {
    pub pmt_id: u32,
    pub pmt_type: i32,
    /// nm
    pub wavelength: f64,
    /// MeV
    pub momentum: Vec3,
    pub polarization: Vec3,
    /// Detection position taken from the catalog.
    pub position: Vec3,
    pub hit_time: f64,
    pub front_end_time: f64,
    pub charge: f64,
    pub creator_process: OriginProcess,
}

impl PmtHit {
    pub fn creator_process_name(&self) -> &'static str {
        self.creator_process.label()
    }
}

/// Receives the hits of the event being processed.
pub trait HitSink {
    fn record_hit(&mut self, hit: PmtHit);
}

impl HitSink for Vec<PmtHit> {
    fn record_hit(&mut self, hit: PmtHit) {
        self.push(hit);
    }
}

fn default_charge_scale() -> f64 {
    1.0
}

/// One catalog entry as stored in a JSON catalog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmtInfo {
    pub id: u32,
    pub position: Vec3,
    #[serde(default)]
    pub pmt_type: i32,
    #[serde(default)]
    pub model: usize,
    #[serde(default = "default_charge_scale")]
    pub charge_scale: f64,
}

/// In-memory catalog.
///
/// JSON layout: `{"models": ["r7081"], "pmts": [{"id": 0, "position":
/// {"x": 0.0, "y": 0.0, "z": 0.0}, "model": 0}, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PmtInfoTable {
    #[serde(default)]
    pub models: Vec<String>,
    pub pmts: Vec<PmtInfo>,
}

impl PmtInfoTable {
    /// Build a table, checking that ids are dense and models exist.
    pub fn new(models: Vec<String>, mut pmts: Vec<PmtInfo>) -> Result<Self> {
        pmts.sort_by_key(|p| p.id);
        for (index, pmt) in pmts.iter().enumerate() {
            if pmt.id as usize != index {
                return Err(OffloadError::Config(format!(
                    "PMT catalog ids must run from 0 without gaps (found {} at position {})",
                    pmt.id, index
                )));
            }
            if !models.is_empty() && pmt.model >= models.len() {
                return Err(OffloadError::Config(format!(
                    "PMT {} refers to unknown model {}",
                    pmt.id, pmt.model
                )));
            }
        }
        Ok(Self { models, pmts })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: PmtInfoTable = serde_json::from_str(text)
            .map_err(|e| OffloadError::Config(format!("Invalid PMT catalog: {}", e)))?;
        Self::new(raw.models, raw.pmts)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            OffloadError::Config(format!("Failed to read PMT catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Catalog with one model and unit charge scale at the given positions.
    pub fn from_positions(positions: &[Vec3]) -> Self {
        let pmts = positions
            .iter()
            .enumerate()
            .map(|(id, position)| PmtInfo {
                id: id as u32,
                position: *position,
                pmt_type: 1,
                model: 0,
                charge_scale: 1.0,
            })
            .collect();
        Self {
            models: vec!["default".to_string()],
            pmts,
        }
    }
}

impl PmtCatalog for PmtInfoTable {
    fn len(&self) -> usize {
        self.pmts.len()
    }

    fn position(&self, id: u32) -> Vec3 {
        self.pmts[id as usize].position
    }

    fn pmt_type(&self, id: u32) -> i32 {
        self.pmts[id as usize].pmt_type
    }

    fn model(&self, id: u32) -> usize {
        self.pmts[id as usize].model
    }

    fn model_name(&self, model: usize) -> &str {
        self.models.get(model).map(String::as_str).unwrap_or("unknown")
    }

    fn charge_scale(&self, id: u32) -> f64 {
        self.pmts[id as usize].charge_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_from_json() {
        let json = r#"{
            "models": ["r7081", "r11780"],
            "pmts": [
                {"id": 1, "position": {"x": 1.0, "y": 0.0, "z": 0.0}, "model": 1, "charge_scale": 0.8},
                {"id": 0, "position": {"x": 0.0, "y": 0.0, "z": 0.0}, "pmt_type": 2}
            ]
        }"#;
        let table = PmtInfoTable::from_json(json).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.position(1), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(table.pmt_type(0), 2);
        assert_eq!(table.model_name(table.model(1)), "r11780");
        assert_eq!(table.charge_scale(0), 1.0);
        assert_eq!(table.charge_scale(1), 0.8);
    }

    #[test]
    fn test_catalog_rejects_gaps() {
        let json = r#"{"pmts": [{"id": 0, "position": {"x": 0, "y": 0, "z": 0}},
                                {"id": 2, "position": {"x": 1, "y": 0, "z": 0}}]}"#;
        assert!(matches!(
            PmtInfoTable::from_json(json),
            Err(OffloadError::Config(_))
        ));
    }

    #[test]
    fn test_ideal_response() {
        let mut response = IdealResponse;
        assert_eq!(response.pick_time(3, 12.5), 12.5);
        assert_eq!(response.pick_charge(0), 1.0);
    }
}
