//! Wire protocol and data model for offloading optical photons to an
//! external photon-transport backend.
//!
//! A message is an ordered list of frames: a literal tag, an event frame and
//! then flat native-endian arrays in a fixed order (see [`codec`]). Over a
//! byte stream each message travels inside a multipart envelope (see
//! [`frame`]).
//!
//! # Example
//!
//! ```rust
//! use photon_protocol::{
//!     decode_sim_reply, encode_photon_batch, encode_sim_complete, OriginProcess, PEBatch,
//!     PhotonBatch, SimReply, Vec3,
//! };
//!
//! let mut photons = PhotonBatch::new();
//! photons.set_event(7);
//! photons.add_photon(
//!     Vec3::new(0.0, 0.0, 0.0),
//!     Vec3::new(0.0, 0.0, 1.0),
//!     Vec3::new(1.0, 0.0, 0.0),
//!     420.0,
//!     0.0,
//!     OriginProcess::Cherenkov,
//! );
//! let request = encode_photon_batch(&photons);
//! assert_eq!(&request[0][..], b"PHOTONDATA");
//!
//! let mut reply_batch = PEBatch::new();
//! reply_batch.set_event(7);
//! let reply = encode_sim_complete(&reply_batch);
//!
//! let mut out = PEBatch::new();
//! assert_eq!(decode_sim_reply(&reply, 7, &mut out).unwrap(), SimReply::Complete);
//! assert!(decode_sim_reply(&reply, 8, &mut out).is_err());
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod types;

pub use codec::{
    decode_detector_info, decode_photon_batch, decode_request, decode_sim_reply,
    encode_ack, encode_detector_info, encode_detector_info_request, encode_photon_batch,
    encode_ping, encode_run_begin, encode_run_end, encode_sim_complete,
    encode_sim_complete_async, expect_ack, f32_frame, peek_tag, read_f32_frame,
    read_u32_frame, u32_frame, Request, SimReply,
};
pub use error::{ClientError, ProtocolError};
pub use frame::{decode_multipart, encode_multipart, Frames, HEADER_SIZE};
pub use types::{
    energy_to_wavelength, flags, wavelength_to_energy, DetectorInfo, OriginProcess, PESample,
    PEBatch, PhotonBatch, PhotonSample, Tag, Vec3, HC_MEV_NM, MAGIC, MAX_MESSAGE_SIZE,
    MAX_PARTS,
};
