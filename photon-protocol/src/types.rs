//! Data model shared by the offload client and the photon-transport backend.

use std::fmt;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Magic bytes for the multipart envelope: "PHMP" (Photon Multipart).
pub const MAGIC: [u8; 4] = *b"PHMP";

/// Maximum number of parts in one multipart message.
pub const MAX_PARTS: u32 = 64;

/// Maximum size of one multipart message (1 GiB).
pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Planck constant times speed of light in MeV·nm.
pub const HC_MEV_NM: f64 = 1.239_841_984e-3;

/// Per-sample process flags, using the backend's bit assignments.
pub mod flags {
    pub const NO_HIT: u32 = 1 << 0;
    pub const BULK_ABSORB: u32 = 1 << 1;
    pub const SURFACE_DETECT: u32 = 1 << 2;
    pub const SURFACE_ABSORB: u32 = 1 << 3;
    pub const RAYLEIGH_SCATTER: u32 = 1 << 4;
    pub const REFLECT_DIFFUSE: u32 = 1 << 5;
    pub const REFLECT_SPECULAR: u32 = 1 << 6;
    pub const SURFACE_REEMIT: u32 = 1 << 7;
    pub const SURFACE_TRANSMIT: u32 = 1 << 8;
    pub const BULK_REEMIT: u32 = 1 << 9;
    pub const CHERENKOV: u32 = 1 << 10;
    pub const SCINTILLATION: u32 = 1 << 11;
    pub const NAN_ABORT: u32 = 1 << 31;

    /// Any bit marking a reemitted photon.
    pub const REEMIT: u32 = SURFACE_REEMIT | BULK_REEMIT;
}

/// Message tags, sent as the literal first frame of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Ping,
    Ack,
    RunBegin,
    RunEnd,
    DetectorInfo,
    PhotonData,
    SimComplete,
    SimCompleteAsync,
}

impl Tag {
    /// Wire spelling of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Ping => "PING",
            Tag::Ack => "ACK",
            Tag::RunBegin => "RUN_BEGIN",
            Tag::RunEnd => "RUN_END",
            Tag::DetectorInfo => "DETECTOR_INFO",
            Tag::PhotonData => "PHOTONDATA",
            Tag::SimComplete => "SIM_COMPLETE",
            Tag::SimCompleteAsync => "SIM_COMPLETE_ASYNC",
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl TryFrom<&[u8]> for Tag {
    type Error = String;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            b"PING" => Ok(Tag::Ping),
            b"ACK" => Ok(Tag::Ack),
            b"RUN_BEGIN" => Ok(Tag::RunBegin),
            b"RUN_END" => Ok(Tag::RunEnd),
            b"DETECTOR_INFO" => Ok(Tag::DetectorInfo),
            b"PHOTONDATA" => Ok(Tag::PhotonData),
            b"SIM_COMPLETE" => Ok(Tag::SimComplete),
            b"SIM_COMPLETE_ASYNC" => Ok(Tag::SimCompleteAsync),
            other => Err(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point or direction in detector space (mm for positions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_f32(v: [f32; 3]) -> Self {
        Self::new(v[0] as f64, v[1] as f64, v[2] as f64)
    }

    pub fn to_f32(self) -> [f32; 3] {
        [self.x as f32, self.y as f32, self.z as f32]
    }

    pub fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).norm()
    }

    /// Arithmetic mean of a set of points, or `None` for an empty set.
    pub fn centroid(points: &[Vec3]) -> Option<Vec3> {
        if points.is_empty() {
            return None;
        }
        let sum = points.iter().fold(Vec3::ZERO, |acc, p| acc + *p);
        Some(sum * (1.0 / points.len() as f64))
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Physical process that produced a photon.
///
/// Used both for tagging outgoing photons and for labelling detected
/// photoelectrons. When several bits are set the label follows the fixed
/// precedence reemission > Cherenkov > scintillation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OriginProcess {
    Reemission,
    Cherenkov,
    Scintillation,
    Unknown,
}

impl OriginProcess {
    /// Classify a flag bitmask.
    pub fn from_flags(bits: u32) -> Self {
        if bits & flags::REEMIT != 0 {
            OriginProcess::Reemission
        } else if bits & flags::CHERENKOV != 0 {
            OriginProcess::Cherenkov
        } else if bits & flags::SCINTILLATION != 0 {
            OriginProcess::Scintillation
        } else {
            OriginProcess::Unknown
        }
    }

    /// Classify a physics-engine process name ("Cerenkov", "Scintillation", ...).
    pub fn from_process_name(name: &str) -> Self {
        if name.contains("Reemission") {
            OriginProcess::Reemission
        } else if name.contains("Cerenkov") || name.contains("Cherenkov") {
            OriginProcess::Cherenkov
        } else if name.contains("Scintillation") {
            OriginProcess::Scintillation
        } else {
            OriginProcess::Unknown
        }
    }

    /// Flag bits carried on the wire for this origin.
    pub fn flag_bits(self) -> u32 {
        match self {
            OriginProcess::Reemission => flags::BULK_REEMIT,
            OriginProcess::Cherenkov => flags::CHERENKOV,
            OriginProcess::Scintillation => flags::SCINTILLATION,
            OriginProcess::Unknown => 0,
        }
    }

    /// Creator-process label stored on detector hits.
    pub fn label(self) -> &'static str {
        match self {
            OriginProcess::Reemission => "Reemission",
            OriginProcess::Cherenkov => "Cerenkov",
            OriginProcess::Scintillation => "Scintillation",
            OriginProcess::Unknown => "Unknown",
        }
    }
}

/// Convert a photon energy in MeV to its wavelength in nm.
pub fn energy_to_wavelength(energy_mev: f64) -> f64 {
    HC_MEV_NM / energy_mev
}

/// Convert a wavelength in nm to the photon energy in MeV.
pub fn wavelength_to_energy(wavelength_nm: f64) -> f64 {
    HC_MEV_NM / wavelength_nm
}

/// One optical photon handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotonSample {
    /// Position in mm.
    pub position: [f32; 3],
    /// Unit direction.
    pub direction: [f32; 3],
    /// Unit polarization.
    pub polarization: [f32; 3],
    /// Wavelength in nm.
    pub wavelength: f32,
    /// Emission time in ns.
    pub time: f32,
    /// Origin bitmask (see [`flags`]).
    pub flags: u32,
}

/// Photons collected for one event.
///
/// Stored column-wise, one vector per wire field, so every column always
/// holds the same number of elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotonBatch {
    pub(crate) event: u32,
    pub(crate) x: Vec<f32>,
    pub(crate) y: Vec<f32>,
    pub(crate) z: Vec<f32>,
    pub(crate) dx: Vec<f32>,
    pub(crate) dy: Vec<f32>,
    pub(crate) dz: Vec<f32>,
    pub(crate) polx: Vec<f32>,
    pub(crate) poly: Vec<f32>,
    pub(crate) polz: Vec<f32>,
    pub(crate) wavelength: Vec<f32>,
    pub(crate) t: Vec<f32>,
    pub(crate) flags: Vec<u32>,
}

impl PhotonBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&self) -> u32 {
        self.event
    }

    pub fn set_event(&mut self, event: u32) {
        self.event = event;
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Append one photon.
    pub fn push(&mut self, sample: PhotonSample) {
        self.x.push(sample.position[0]);
        self.y.push(sample.position[1]);
        self.z.push(sample.position[2]);
        self.dx.push(sample.direction[0]);
        self.dy.push(sample.direction[1]);
        self.dz.push(sample.direction[2]);
        self.polx.push(sample.polarization[0]);
        self.poly.push(sample.polarization[1]);
        self.polz.push(sample.polarization[2]);
        self.wavelength.push(sample.wavelength);
        self.t.push(sample.time);
        self.flags.push(sample.flags);
    }

    /// Append a photon as reported by the physics engine.
    ///
    /// Position in mm, wavelength in nm, time in ns.
    pub fn add_photon(
        &mut self,
        position: Vec3,
        direction: Vec3,
        polarization: Vec3,
        wavelength: f64,
        time: f64,
        origin: OriginProcess,
    ) {
        self.push(PhotonSample {
            position: position.to_f32(),
            direction: direction.to_f32(),
            polarization: polarization.to_f32(),
            wavelength: wavelength as f32,
            time: time as f32,
            flags: origin.flag_bits(),
        });
    }

    pub fn get(&self, index: usize) -> Option<PhotonSample> {
        if index >= self.len() {
            return None;
        }
        Some(PhotonSample {
            position: [self.x[index], self.y[index], self.z[index]],
            direction: [self.dx[index], self.dy[index], self.dz[index]],
            polarization: [self.polx[index], self.poly[index], self.polz[index]],
            wavelength: self.wavelength[index],
            time: self.t[index],
            flags: self.flags[index],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = PhotonSample> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Drop every photon, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
        self.z.clear();
        self.dx.clear();
        self.dy.clear();
        self.dz.clear();
        self.polx.clear();
        self.poly.clear();
        self.polz.clear();
        self.wavelength.clear();
        self.t.clear();
        self.flags.clear();
    }

    /// Payload size on the wire, excluding tags and the envelope.
    pub fn wire_size(&self) -> usize {
        8 + self.len() * (11 * std::mem::size_of::<f32>() + std::mem::size_of::<u32>())
    }
}

/// One photoelectron reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PESample {
    /// Backend-local PMT index.
    pub channel: u32,
    /// Arrival time in ns.
    pub time: f32,
    /// Wavelength in nm.
    pub wavelength: f32,
    /// Direction at detection.
    pub direction: [f32; 3],
    /// Polarization at detection.
    pub polarization: [f32; 3],
    /// Process bitmask (see [`flags`]).
    pub flags: u32,
}

/// Photoelectrons returned for one event, in response order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PEBatch {
    pub(crate) event: u32,
    pub(crate) channel: Vec<u32>,
    pub(crate) dx: Vec<f32>,
    pub(crate) dy: Vec<f32>,
    pub(crate) dz: Vec<f32>,
    pub(crate) polx: Vec<f32>,
    pub(crate) poly: Vec<f32>,
    pub(crate) polz: Vec<f32>,
    pub(crate) wavelength: Vec<f32>,
    pub(crate) time: Vec<f32>,
    pub(crate) flags: Vec<u32>,
}

impl PEBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&self) -> u32 {
        self.event
    }

    pub fn set_event(&mut self, event: u32) {
        self.event = event;
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn push(&mut self, sample: PESample) {
        self.channel.push(sample.channel);
        self.dx.push(sample.direction[0]);
        self.dy.push(sample.direction[1]);
        self.dz.push(sample.direction[2]);
        self.polx.push(sample.polarization[0]);
        self.poly.push(sample.polarization[1]);
        self.polz.push(sample.polarization[2]);
        self.wavelength.push(sample.wavelength);
        self.time.push(sample.time);
        self.flags.push(sample.flags);
    }

    pub fn get(&self, index: usize) -> Option<PESample> {
        if index >= self.len() {
            return None;
        }
        Some(PESample {
            channel: self.channel[index],
            time: self.time[index],
            wavelength: self.wavelength[index],
            direction: [self.dx[index], self.dy[index], self.dz[index]],
            polarization: [self.polx[index], self.poly[index], self.polz[index]],
            flags: self.flags[index],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = PESample> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn clear(&mut self) {
        self.channel.clear();
        self.dx.clear();
        self.dy.clear();
        self.dz.clear();
        self.polx.clear();
        self.poly.clear();
        self.polz.clear();
        self.wavelength.clear();
        self.time.clear();
        self.flags.clear();
    }

    /// Column views in wire order (after the channel ids).
    pub fn channels(&self) -> &[u32] {
        &self.channel
    }

    pub fn times(&self) -> &[f32] {
        &self.time
    }

    pub fn wavelengths(&self) -> &[f32] {
        &self.wavelength
    }

    pub fn directions(&self) -> [&[f32]; 3] {
        [&self.dx, &self.dy, &self.dz]
    }

    pub fn polarizations(&self) -> [&[f32]; 3] {
        [&self.polx, &self.poly, &self.polz]
    }

    pub fn flag_bits(&self) -> &[u32] {
        &self.flags
    }

    /// Replace the contents with already-validated columns.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_from_columns(
        &mut self,
        event: u32,
        channel: &[u32],
        direction: [&[f32]; 3],
        polarization: [&[f32]; 3],
        wavelength: &[f32],
        time: &[f32],
        flags: &[u32],
    ) {
        let n = channel.len();
        debug_assert!(direction.iter().chain(polarization.iter()).all(|c| c.len() == n));
        debug_assert!(wavelength.len() == n && time.len() == n && flags.len() == n);

        self.clear();
        self.event = event;
        self.channel.extend_from_slice(channel);
        self.dx.extend_from_slice(direction[0]);
        self.dy.extend_from_slice(direction[1]);
        self.dz.extend_from_slice(direction[2]);
        self.polx.extend_from_slice(polarization[0]);
        self.poly.extend_from_slice(polarization[1]);
        self.polz.extend_from_slice(polarization[2]);
        self.wavelength.extend_from_slice(wavelength);
        self.time.extend_from_slice(time);
        self.flags.extend_from_slice(flags);
    }
}

/// Backend PMT geometry as reported by `DETECTOR_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorInfo {
    /// Position of each backend PMT, indexed by channel id.
    pub positions: Vec<Vec3>,
    /// Backend PMT type code, indexed by channel id.
    pub types: Vec<u32>,
}

impl DetectorInfo {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_precedence() {
        assert_eq!(OriginProcess::from_flags(flags::BULK_REEMIT), OriginProcess::Reemission);
        assert_eq!(
            OriginProcess::from_flags(flags::SURFACE_REEMIT | flags::CHERENKOV),
            OriginProcess::Reemission
        );
        assert_eq!(
            OriginProcess::from_flags(flags::CHERENKOV | flags::SCINTILLATION),
            OriginProcess::Cherenkov
        );
        assert_eq!(OriginProcess::from_flags(flags::SCINTILLATION), OriginProcess::Scintillation);
        assert_eq!(OriginProcess::from_flags(flags::SURFACE_DETECT), OriginProcess::Unknown);
        assert_eq!(OriginProcess::from_flags(0).label(), "Unknown");
    }

    #[test]
    fn test_process_name_classification() {
        assert_eq!(OriginProcess::from_process_name("Cerenkov"), OriginProcess::Cherenkov);
        assert_eq!(OriginProcess::from_process_name("Scintillation"), OriginProcess::Scintillation);
        assert_eq!(OriginProcess::from_process_name("Reemission"), OriginProcess::Reemission);
        assert_eq!(OriginProcess::from_process_name("OpWLS"), OriginProcess::Unknown);
    }

    #[test]
    fn test_photon_batch_columns() {
        let mut batch = PhotonBatch::new();
        batch.set_event(3);
        batch.add_photon(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
            420.0,
            1.5,
            OriginProcess::Cherenkov,
        );
        assert_eq!(batch.len(), 1);
        let sample = batch.get(0).unwrap();
        assert_eq!(sample.position, [1.0, 2.0, 3.0]);
        assert_eq!(sample.flags, flags::CHERENKOV);
        assert!(batch.get(1).is_none());

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.event(), 3);
    }

    #[test]
    fn test_energy_wavelength() {
        let wl = energy_to_wavelength(2.952e-6);
        assert!((wl - 420.0).abs() < 0.1);
        assert!((wavelength_to_energy(wl) - 2.952e-6).abs() < 1e-12);
    }

    #[test]
    fn test_centroid() {
        assert!(Vec3::centroid(&[]).is_none());
        let c = Vec3::centroid(&[Vec3::new(0.0, 0.0, 0.0), Vec3::new(10.0, 2.0, -4.0)]).unwrap();
        assert_eq!(c, Vec3::new(5.0, 1.0, -2.0));
    }

    #[test]
    fn test_tag_parse() {
        assert_eq!(Tag::try_from(&b"SIM_COMPLETE_ASYNC"[..]), Ok(Tag::SimCompleteAsync));
        assert_eq!(Tag::try_from(&b"BOGUS"[..]), Err("BOGUS".to_string()));
    }
}
