//! Codec for the positional multipart messages exchanged with the backend.
//!
//! Every message is a list of frames. Frame 0 is a literal tag, frame 1
//! carries the event id (and, for photon data, the sample count), and the
//! remaining frames are flat native-endian arrays in a fixed field order:
//!
//! ```text
//! PHOTONDATA          | event, count | x y z dx dy dz polx poly polz wavelength t | flags
//! SIM_COMPLETE        | event        | channel | dx dy dz polx poly polz wavelength time | flags
//! SIM_COMPLETE_ASYNC  | event
//! DETECTOR_INFO       | x y z | type
//! ```
//!
//! The layout is not self-synchronizing, so every reply is checked against
//! the outstanding request's tag and event id before it is accepted.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::frame::Frames;
use crate::types::*;

/// Number of data frames following the event frame in `PHOTONDATA`.
pub const PHOTON_DATA_FRAMES: usize = 12;

/// Number of data frames following the event frame in `SIM_COMPLETE`.
pub const SIM_COMPLETE_FRAMES: usize = 10;

const ELEMENT_SIZE: usize = 4;

/// Outcome of decoding a reply to `PHOTONDATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimReply {
    /// Photoelectrons were written into the output batch.
    Complete,
    /// The backend will persist results out-of-band; no samples now.
    Deferred,
}

/// Requests a backend can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    RunBegin { filename: String },
    RunEnd,
    DetectorInfo,
    PhotonData(PhotonBatch),
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::Ping => Tag::Ping,
            Request::RunBegin { .. } => Tag::RunBegin,
            Request::RunEnd => Tag::RunEnd,
            Request::DetectorInfo => Tag::DetectorInfo,
            Request::PhotonData(_) => Tag::PhotonData,
        }
    }
}

fn tag_frame(tag: Tag) -> Bytes {
    Bytes::from_static(tag.as_bytes())
}

/// Flatten an `f32` column into a native-endian frame.
pub fn f32_frame(values: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * ELEMENT_SIZE);
    for v in values {
        buf.put_f32_ne(*v);
    }
    buf.freeze()
}

/// Flatten a `u32` column into a native-endian frame.
pub fn u32_frame(values: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * ELEMENT_SIZE);
    for v in values {
        buf.put_u32_ne(*v);
    }
    buf.freeze()
}

fn check_len(frame: &[u8], index: usize, count: usize) -> Result<(), ProtocolError> {
    let expected = count.checked_mul(ELEMENT_SIZE).ok_or_else(|| {
        ProtocolError::DecodeError(format!("frame {}: element count {} overflows", index, count))
    })?;
    if frame.len() != expected {
        return Err(ProtocolError::FrameLength {
            index,
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

fn extend_f32(out: &mut Vec<f32>, frame: &[u8]) {
    out.extend(
        frame
            .chunks_exact(ELEMENT_SIZE)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
    );
}

fn extend_u32(out: &mut Vec<u32>, frame: &[u8]) {
    out.extend(
        frame
            .chunks_exact(ELEMENT_SIZE)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
    );
}

/// Read a frame holding exactly `count` `f32` values.
pub fn read_f32_frame(frame: &[u8], index: usize, count: usize) -> Result<Vec<f32>, ProtocolError> {
    check_len(frame, index, count)?;
    let mut out = Vec::with_capacity(count);
    extend_f32(&mut out, frame);
    Ok(out)
}

/// Read a frame holding exactly `count` `u32` values.
pub fn read_u32_frame(frame: &[u8], index: usize, count: usize) -> Result<Vec<u32>, ProtocolError> {
    check_len(frame, index, count)?;
    let mut out = Vec::with_capacity(count);
    extend_u32(&mut out, frame);
    Ok(out)
}

fn element_count(frame: &[u8], index: usize) -> Result<usize, ProtocolError> {
    if frame.len() % ELEMENT_SIZE != 0 {
        return Err(ProtocolError::FrameLength {
            index,
            expected: frame.len() - frame.len() % ELEMENT_SIZE,
            actual: frame.len(),
        });
    }
    Ok(frame.len() / ELEMENT_SIZE)
}

fn read_u32_at(frame: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ])
}

/// Parse the leading tag of a message.
pub fn peek_tag(frames: &[Bytes]) -> Result<Tag, ProtocolError> {
    let first = frames.first().ok_or(ProtocolError::IncompleteFrame {
        expected: 1,
        actual: 0,
    })?;
    Tag::try_from(&first[..]).map_err(ProtocolError::UnknownTag)
}

fn expect_tag(frames: &[Bytes], expected: Tag) -> Result<(), ProtocolError> {
    let tag = peek_tag(frames)?;
    if tag != expected {
        return Err(ProtocolError::UnexpectedTag {
            expected: expected.as_str(),
            actual: tag.as_str().to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Client -> backend
// =============================================================================

pub fn encode_ping() -> Frames {
    vec![tag_frame(Tag::Ping)]
}

pub fn encode_run_begin(filename: &str) -> Frames {
    vec![
        tag_frame(Tag::RunBegin),
        Bytes::copy_from_slice(filename.as_bytes()),
    ]
}

pub fn encode_run_end() -> Frames {
    vec![tag_frame(Tag::RunEnd)]
}

pub fn encode_detector_info_request() -> Frames {
    vec![tag_frame(Tag::DetectorInfo)]
}

/// Encode one event's photons as a `PHOTONDATA` message.
///
/// # Panics
///
/// Panics if a column frame does not hold exactly `batch.len()` elements,
/// which would mean the batch's columns went out of step.
pub fn encode_photon_batch(batch: &PhotonBatch) -> Frames {
    let n = batch.len();

    let mut header = BytesMut::with_capacity(2 * ELEMENT_SIZE);
    header.put_u32_ne(batch.event);
    header.put_u32_ne(n as u32);

    let mut frames = Vec::with_capacity(2 + PHOTON_DATA_FRAMES);
    frames.push(tag_frame(Tag::PhotonData));
    frames.push(header.freeze());
    for column in [
        &batch.x,
        &batch.y,
        &batch.z,
        &batch.dx,
        &batch.dy,
        &batch.dz,
        &batch.polx,
        &batch.poly,
        &batch.polz,
        &batch.wavelength,
        &batch.t,
    ] {
        frames.push(f32_frame(column));
    }
    frames.push(u32_frame(&batch.flags));

    for (index, frame) in frames.iter().enumerate().skip(2) {
        assert_eq!(
            frame.len(),
            n * ELEMENT_SIZE,
            "PHOTONDATA frame {} does not match sample count {}",
            index,
            n
        );
    }

    frames
}

/// Decode a request as seen by a backend.
pub fn decode_request(frames: &[Bytes]) -> Result<Request, ProtocolError> {
    match peek_tag(frames)? {
        Tag::Ping => Ok(Request::Ping),
        Tag::RunEnd => Ok(Request::RunEnd),
        Tag::DetectorInfo => Ok(Request::DetectorInfo),
        Tag::RunBegin => {
            let name = frames.get(1).cloned().unwrap_or_default();
            let filename = String::from_utf8(name.to_vec())
                .map_err(|e| ProtocolError::DecodeError(e.to_string()))?;
            Ok(Request::RunBegin { filename })
        }
        Tag::PhotonData => decode_photon_batch(frames).map(Request::PhotonData),
        other => Err(ProtocolError::UnexpectedTag {
            expected: "request tag",
            actual: other.as_str().to_string(),
        }),
    }
}

/// Decode a `PHOTONDATA` message.
pub fn decode_photon_batch(frames: &[Bytes]) -> Result<PhotonBatch, ProtocolError> {
    expect_tag(frames, Tag::PhotonData)?;
    if frames.len() != 2 + PHOTON_DATA_FRAMES {
        return Err(ProtocolError::FrameCount {
            tag: Tag::PhotonData.as_str(),
            expected: 2 + PHOTON_DATA_FRAMES,
            actual: frames.len(),
        });
    }

    let header = &frames[1];
    if header.len() != 2 * ELEMENT_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: 2 * ELEMENT_SIZE,
            actual: header.len(),
        });
    }
    let event = read_u32_at(header, 0);
    let n = read_u32_at(header, ELEMENT_SIZE) as usize;

    for (index, frame) in frames.iter().enumerate().skip(2) {
        check_len(frame, index, n)?;
    }

    let mut batch = PhotonBatch::new();
    batch.event = event;
    let columns = [
        &mut batch.x,
        &mut batch.y,
        &mut batch.z,
        &mut batch.dx,
        &mut batch.dy,
        &mut batch.dz,
        &mut batch.polx,
        &mut batch.poly,
        &mut batch.polz,
        &mut batch.wavelength,
        &mut batch.t,
    ];
    for (column, frame) in columns.into_iter().zip(&frames[2..]) {
        extend_f32(column, frame);
    }
    extend_u32(&mut batch.flags, &frames[2 + PHOTON_DATA_FRAMES - 1]);

    Ok(batch)
}

// =============================================================================
// Backend -> client
// =============================================================================

pub fn encode_ack() -> Frames {
    vec![tag_frame(Tag::Ack)]
}

/// Check that a reply is `ACK`.
pub fn expect_ack(frames: &[Bytes]) -> Result<(), ProtocolError> {
    expect_tag(frames, Tag::Ack)
}

/// Encode a `SIM_COMPLETE` reply carrying `batch`.
pub fn encode_sim_complete(batch: &PEBatch) -> Frames {
    let mut frames = Vec::with_capacity(2 + SIM_COMPLETE_FRAMES);
    frames.push(tag_frame(Tag::SimComplete));
    frames.push(u32_frame(&[batch.event]));
    frames.push(u32_frame(&batch.channel));
    for column in [
        &batch.dx,
        &batch.dy,
        &batch.dz,
        &batch.polx,
        &batch.poly,
        &batch.polz,
        &batch.wavelength,
        &batch.time,
    ] {
        frames.push(f32_frame(column));
    }
    frames.push(u32_frame(&batch.flags));
    frames
}

/// Encode a `SIM_COMPLETE_ASYNC` reply.
pub fn encode_sim_complete_async(event: u32) -> Frames {
    vec![tag_frame(Tag::SimCompleteAsync), u32_frame(&[event])]
}

/// Decode the reply to a `PHOTONDATA` request for `expected_event`.
///
/// `out` is only modified when the reply is accepted: it receives the
/// samples on [`SimReply::Complete`] and is cleared on
/// [`SimReply::Deferred`]. Any error means the reply is invalid for this
/// request and must be discarded.
pub fn decode_sim_reply(
    frames: &[Bytes],
    expected_event: u32,
    out: &mut PEBatch,
) -> Result<SimReply, ProtocolError> {
    let tag = peek_tag(frames)?;
    if tag != Tag::SimComplete && tag != Tag::SimCompleteAsync {
        return Err(ProtocolError::UnexpectedTag {
            expected: Tag::SimComplete.as_str(),
            actual: tag.as_str().to_string(),
        });
    }

    let event_frame = frames.get(1).ok_or(ProtocolError::IncompleteFrame {
        expected: ELEMENT_SIZE,
        actual: 0,
    })?;
    if event_frame.len() != ELEMENT_SIZE && event_frame.len() != 2 * ELEMENT_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: ELEMENT_SIZE,
            actual: event_frame.len(),
        });
    }
    let event = read_u32_at(event_frame, 0);
    if event != expected_event {
        return Err(ProtocolError::EventMismatch {
            expected: expected_event,
            actual: event,
        });
    }

    if tag == Tag::SimCompleteAsync {
        out.clear();
        out.event = event;
        return Ok(SimReply::Deferred);
    }

    if frames.len() != 2 + SIM_COMPLETE_FRAMES {
        return Err(ProtocolError::FrameCount {
            tag: Tag::SimComplete.as_str(),
            expected: 2 + SIM_COMPLETE_FRAMES,
            actual: frames.len(),
        });
    }

    let n = element_count(&frames[2], 2)?;
    if event_frame.len() == 2 * ELEMENT_SIZE {
        let declared = read_u32_at(event_frame, ELEMENT_SIZE) as usize;
        if declared != n {
            return Err(ProtocolError::FrameLength {
                index: 2,
                expected: declared.saturating_mul(ELEMENT_SIZE),
                actual: frames[2].len(),
            });
        }
    }
    for (index, frame) in frames.iter().enumerate().skip(3) {
        check_len(frame, index, n)?;
    }

    out.clear();
    out.event = event;
    extend_u32(&mut out.channel, &frames[2]);
    let columns = [
        &mut out.dx,
        &mut out.dy,
        &mut out.dz,
        &mut out.polx,
        &mut out.poly,
        &mut out.polz,
        &mut out.wavelength,
        &mut out.time,
    ];
    for (column, frame) in columns.into_iter().zip(&frames[3..]) {
        extend_f32(column, frame);
    }
    extend_u32(&mut out.flags, &frames[2 + SIM_COMPLETE_FRAMES - 1]);

    Ok(SimReply::Complete)
}

/// Encode a `DETECTOR_INFO` reply.
pub fn encode_detector_info(info: &DetectorInfo) -> Frames {
    let xs: Vec<f32> = info.positions.iter().map(|p| p.x as f32).collect();
    let ys: Vec<f32> = info.positions.iter().map(|p| p.y as f32).collect();
    let zs: Vec<f32> = info.positions.iter().map(|p| p.z as f32).collect();
    vec![
        tag_frame(Tag::DetectorInfo),
        f32_frame(&xs),
        f32_frame(&ys),
        f32_frame(&zs),
        u32_frame(&info.types),
    ]
}

/// Decode a `DETECTOR_INFO` reply.
pub fn decode_detector_info(frames: &[Bytes]) -> Result<DetectorInfo, ProtocolError> {
    expect_tag(frames, Tag::DetectorInfo)?;
    if frames.len() != 5 {
        return Err(ProtocolError::FrameCount {
            tag: Tag::DetectorInfo.as_str(),
            expected: 5,
            actual: frames.len(),
        });
    }

    let n = element_count(&frames[1], 1)?;
    let xs = read_f32_frame(&frames[1], 1, n)?;
    let ys = read_f32_frame(&frames[2], 2, n)?;
    let zs = read_f32_frame(&frames[3], 3, n)?;
    let types = read_u32_frame(&frames[4], 4, n)?;

    let positions = xs
        .iter()
        .zip(&ys)
        .zip(&zs)
        .map(|((x, y), z)| Vec3::from_f32([*x, *y, *z]))
        .collect();

    Ok(DetectorInfo { positions, types })
}
