//! Request/reply client for the photon-transport backend.
//!
//! Every exchange goes through one retry loop: send, poll for a reply with
//! a timeout, and validate it. Replies that belong to another request are
//! discarded without spending the retry budget. A timeout or a dead peer
//! spends one attempt, and the connection is replaced before the resend.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};

use photon_protocol::{
    decode_detector_info, decode_sim_reply, encode_detector_info_request, encode_photon_batch,
    encode_ping, encode_run_begin, encode_run_end, expect_ack, ClientError, DetectorInfo,
    PEBatch, PhotonBatch, ProtocolError, SimReply, Vec3,
};

use crate::backend::{PhotonBackend, PropagateOutcome};
use crate::client::connection::{Connector, TcpConnector, Transport};
use crate::client::discovery::{normalize_endpoint, resolve_broker};
use crate::context::OffloadContext;
use crate::error::{OffloadError, Result};

/// Client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Ready,
    AwaitingDetectorInfo,
    AwaitingReply,
    Closed,
}

/// Connection and retry settings for one run.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// `tcp://host:port` or `host:port`.
    pub endpoint: String,
    /// Resolve `endpoint` as a broker name before connecting.
    pub use_broker: bool,
    /// Per-poll reply timeout.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum sends per exchange. Zero behaves as one.
    pub max_retries: u32,
    /// Sent with `RUN_BEGIN`.
    pub output_filename: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5554".to_string(),
            use_broker: false,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            output_filename: String::new(),
        }
    }
}

/// Result of validating one reply.
pub(crate) enum Verdict<T> {
    Accept(T),
    /// Stale or invalid for this request; keep waiting.
    Reject(ProtocolError),
    /// Structurally wrong message for a recognized tag.
    Abort(ProtocolError),
}

/// Why a single attempt ended without an accepted reply.
enum Failure {
    Transport(ClientError),
    Abort(ProtocolError),
}

fn ack_verdict(reply: &[Bytes]) -> Verdict<()> {
    match expect_ack(reply) {
        Ok(()) => Verdict::Accept(()),
        Err(e) => Verdict::Reject(e),
    }
}

fn detector_verdict(reply: &[Bytes]) -> Verdict<DetectorInfo> {
    match decode_detector_info(reply) {
        Ok(info) => Verdict::Accept(info),
        Err(e) if e.is_stale() || matches!(e, ProtocolError::UnknownTag(_)) => Verdict::Reject(e),
        Err(e) => Verdict::Abort(e),
    }
}

/// Synchronous client holding at most one connection to the backend.
pub struct ProtocolClient<C: Connector = TcpConnector> {
    connector: C,
    conn: Option<C::Transport>,
    timeout: Duration,
    max_retries: u32,
    output_filename: String,
    state: ClientState,
    detector: Option<DetectorInfo>,
    has_connected: bool,
    reconnects: u64,
    sends: u64,
}

impl ProtocolClient<TcpConnector> {
    /// Create a TCP client. Nothing is sent until [`start`](Self::start).
    ///
    /// With `use_broker` the endpoint is resolved here; a failed lookup is
    /// fatal.
    pub fn connect(ctx: &OffloadContext, settings: &ClientSettings) -> Result<Self> {
        let addr = if settings.use_broker {
            resolve_broker(&settings.endpoint)?.to_string()
        } else {
            normalize_endpoint(&settings.endpoint).to_string()
        };
        let connector = TcpConnector::new(ctx, addr, settings.connect_timeout);
        Ok(Self::with_connector(connector, settings))
    }
}

impl<C: Connector> ProtocolClient<C> {
    pub fn with_connector(connector: C, settings: &ClientSettings) -> Self {
        Self {
            connector,
            conn: None,
            timeout: settings.timeout,
            max_retries: settings.max_retries,
            output_filename: settings.output_filename.clone(),
            state: ClientState::Disconnected,
            detector: None,
            has_connected: false,
            reconnects: 0,
            sends: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn detector_info(&self) -> Option<&DetectorInfo> {
        self.detector.as_ref()
    }

    /// Connections opened after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Requests written so far, retries included.
    pub fn sends(&self) -> u64 {
        self.sends
    }

    /// Handshake with the backend and fetch its PMT geometry.
    pub fn start(&mut self) -> Result<&DetectorInfo> {
        self.state = ClientState::Handshaking;
        if let Err(e) = self.exchange("PING", &encode_ping(), ack_verdict) {
            self.state = ClientState::Disconnected;
            return Err(OffloadError::Handshake(e));
        }
        info!("Backend at {} answered PING", self.connector.endpoint());
        self.state = ClientState::Ready;

        let request = encode_run_begin(&self.output_filename);
        match self.exchange("RUN_BEGIN", &request, ack_verdict) {
            Ok(()) => debug!("RUN_BEGIN acknowledged"),
            Err(e) => warn!("RUN_BEGIN not acknowledged ({}), continuing", e),
        }

        self.state = ClientState::AwaitingDetectorInfo;
        let info = match self.exchange("DETECTOR_INFO", &encode_detector_info_request(), detector_verdict) {
            Ok(info) => info,
            Err(e) => {
                self.state = ClientState::Disconnected;
                return Err(OffloadError::DetectorInfo(e));
            }
        };
        info!("Backend reports {} PMTs", info.len());
        self.state = ClientState::Ready;
        Ok(self.detector.insert(info))
    }

    /// Ship one event's photons and collect the photoelectrons.
    ///
    /// `out` is empty unless the outcome is [`PropagateOutcome::Complete`].
    /// Nothing is sent unless [`start`](Self::start) succeeded.
    pub fn propagate(&mut self, photons: &PhotonBatch, out: &mut PEBatch) -> PropagateOutcome {
        let event = photons.event();
        if self.state != ClientState::Ready {
            warn!(
                "Event {}: client is {:?}, not ready for photons; recording zero PE",
                event, self.state
            );
            out.clear();
            out.set_event(event);
            return PropagateOutcome::Failed;
        }
        debug!(
            "Shipping off {} photons ({} KiB) for event {}",
            photons.len(),
            photons.wire_size() / 1024,
            event
        );

        let request = encode_photon_batch(photons);
        self.state = ClientState::AwaitingReply;
        let result = self.exchange("PHOTONDATA", &request, |reply| {
            match decode_sim_reply(reply, event, out) {
                Ok(r) => Verdict::Accept(r),
                Err(e) => Verdict::Reject(e),
            }
        });
        self.state = ClientState::Ready;

        match result {
            Ok(SimReply::Complete) => {
                debug!("Event {}: {} photoelectrons", event, out.len());
                PropagateOutcome::Complete
            }
            Ok(SimReply::Deferred) => {
                info!("Event {}: backend deferred the results, recording zero PE", event);
                PropagateOutcome::Deferred
            }
            Err(e) => {
                warn!("Event {}: propagation failed ({}), recording zero PE", event, e);
                out.clear();
                out.set_event(event);
                PropagateOutcome::Failed
            }
        }
    }

    /// Send `RUN_END` (best effort) and close the connection.
    pub fn stop(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        match self.exchange("RUN_END", &encode_run_end(), ack_verdict) {
            Ok(()) => info!("Backend acknowledged RUN_END"),
            Err(e) => warn!("RUN_END not acknowledged: {}", e),
        }
        self.conn = None;
        self.state = ClientState::Closed;
    }

    fn exchange<T, F>(&mut self, what: &str, request: &[Bytes], mut validate: F) -> std::result::Result<T, ClientError>
    where
        F: FnMut(&[Bytes]) -> Verdict<T>,
    {
        let attempts = self.max_retries.max(1);
        let mut remaining = attempts;
        loop {
            match self.attempt(request, &mut validate) {
                Ok(value) => return Ok(value),
                Err(Failure::Abort(e)) => return Err(ClientError::Malformed(e)),
                Err(Failure::Transport(e)) => {
                    self.conn = None;
                    remaining -= 1;
                    if remaining == 0 {
                        return Err(ClientError::RetriesExhausted { attempts });
                    }
                    warn!(
                        "{} attempt {}/{} failed: {}; reconnecting",
                        what,
                        attempts - remaining,
                        attempts,
                        e
                    );
                }
            }
        }
    }

    fn attempt<T, F>(&mut self, request: &[Bytes], validate: &mut F) -> std::result::Result<T, Failure>
    where
        F: FnMut(&[Bytes]) -> Verdict<T>,
    {
        let conn = match &mut self.conn {
            Some(conn) => conn,
            slot @ None => {
                let conn = self.connector.connect().map_err(Failure::Transport)?;
                if self.has_connected {
                    self.reconnects += 1;
                    info!("Reconnected to backend at {}", self.connector.endpoint());
                }
                self.has_connected = true;
                slot.insert(conn)
            }
        };

        conn.send(request).map_err(Failure::Transport)?;
        self.sends += 1;

        loop {
            let reply = match conn.poll(self.timeout).map_err(Failure::Transport)? {
                Some(reply) => reply,
                None => return Err(Failure::Transport(ClientError::Timeout)),
            };
            match validate(&reply) {
                Verdict::Accept(value) => return Ok(value),
                Verdict::Reject(e) => info!("Discarding reply: {}", e),
                Verdict::Abort(e) => return Err(Failure::Abort(e)),
            }
        }
    }
}

impl<C: Connector> PhotonBackend for ProtocolClient<C> {
    fn name(&self) -> &'static str {
        "live"
    }

    fn backend_positions(&mut self) -> Result<Vec<Vec3>> {
        match &self.detector {
            Some(info) => Ok(info.positions.clone()),
            None => Ok(self.start()?.positions.clone()),
        }
    }

    fn propagate(&mut self, photons: &PhotonBatch, out: &mut PEBatch) -> Result<PropagateOutcome> {
        Ok(ProtocolClient::propagate(self, photons, out))
    }

    fn end_run(&mut self) {
        self.stop();
    }

    fn reconnects(&self) -> u64 {
        self.reconnects
    }
}
