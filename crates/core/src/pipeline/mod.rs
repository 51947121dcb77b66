//! Boundary between a [`Stream`](crate::Stream) and the media pipeline.
//!
//! The pipeline payloads media into RTP, runs the RTP session (SSRC
//! tracking, RTCP generation) and consumes whatever clients send back. The
//! stream never looks inside. It only:
//!
//! - asks the [`MediaPipeline`] for an [`RtpSession`] with the stream's
//!   index when joining, and links the payloader output to it;
//! - registers a [`PacketHandler`] per [`Direction`] to be called with
//!   every produced packet (the fan-out entry point);
//! - obtains a [`PacketConsumer`] per direction to push client packets into;
//! - registers a [`SourceObserver`] for RTCP source events and a
//!   [`FormatObserver`] for format changes.
//!
//! Handlers are called from the pipeline's own threads. Implementations
//! must not call a handler synchronously from inside `attach_producer`,
//! `subscribe` or `link_payloader`: the stream holds its lock across those
//! calls. The stream links the payloader only after every handler is in
//! place, so no media flows into a half-wired session.

pub mod local;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::media::MediaFormat;

/// Which of the two RTP session channels a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rtp,
    Rtcp,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Rtp, Direction::Rtcp];

    /// Slot of this direction in per-direction arrays.
    pub fn index(self) -> usize {
        match self {
            Direction::Rtp => 0,
            Direction::Rtcp => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rtp => write!(f, "RTP"),
            Direction::Rtcp => write!(f, "RTCP"),
        }
    }
}

/// Identifier of a remote RTP source within a session (its SSRC).
pub type SourceId = u32;

/// What happened to a source, as reported by the RTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEventKind {
    NewSource,
    /// SDES items received.
    Sdes,
    /// The source sent RTP or RTCP within the last reporting interval.
    Active,
    Bye,
    /// A source that sent BYE has been removed.
    ByeTimeout,
    /// The source stopped sending and was timed out.
    Timeout,
}

/// Statistics snapshot attached to a source event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Origin of the last RTCP packet from this source, as `host:port`.
    pub rtcp_from: Option<String>,
    /// Origin of the last RTP packet from this source, as `host:port`.
    pub rtp_from: Option<String>,
    pub packets_received: u64,
    pub octets_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    pub kind: SourceEventKind,
    pub source: SourceId,
    pub stats: Option<SourceStats>,
}

/// Receives packets produced by the RTP session.
pub trait PacketHandler: Send + Sync {
    fn on_packet(&self, direction: Direction, packet: Bytes);
}

/// Input side of the RTP session for one direction.
pub trait PacketConsumer: Send + Sync {
    /// Feed a packet received from a client. `origin` is the sending
    /// socket address when known (UDP), `None` for interleaved data.
    fn push(&self, packet: Bytes, origin: Option<SocketAddr>) -> Result<()>;
}

pub trait SourceObserver: Send + Sync {
    fn on_source_event(&self, event: SourceEvent);
}

pub trait FormatObserver: Send + Sync {
    fn on_format(&self, format: MediaFormat);
}

/// Sequence number and timestamp the payloader will put on its next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTiming {
    pub seq: u16,
    pub rtptime: u32,
}

/// The RTP session the pipeline runs for one stream index.
pub trait RtpSession: Send + Sync {
    /// Stream index this session was created for.
    fn index(&self) -> u32;

    fn attach_producer(&self, direction: Direction, handler: Arc<dyn PacketHandler>) -> Result<()>;

    fn attach_consumer(&self, direction: Direction) -> Result<Arc<dyn PacketConsumer>>;

    fn subscribe(&self, observer: Arc<dyn SourceObserver>) -> Result<()>;

    /// Drop every handler and observer registered on this session.
    ///
    /// Must not return while a handler or observer call is still running;
    /// once it returns, no further calls are made.
    fn detach(&self);

    /// SSRC the session uses for its own packets.
    fn internal_ssrc(&self) -> Option<u32>;
}

/// The payloading side of the pipeline that a stream is attached to.
pub trait MediaPipeline: Send + Sync {
    /// Create the RTP session for stream `index`, replacing any earlier one
    /// for the same index.
    fn create_session(&self, index: u32) -> Result<Arc<dyn RtpSession>>;

    /// Link the payloader output to `session` and start reporting format
    /// changes to `observer`.
    fn link_payloader(
        &self,
        session: &Arc<dyn RtpSession>,
        observer: Arc<dyn FormatObserver>,
    ) -> Result<()>;

    /// Undo [`link_payloader`](Self::link_payloader). Stops format reports.
    fn unlink_payloader(&self, session: &Arc<dyn RtpSession>);

    /// `None` when the payloader does not expose sequence/timestamp state.
    fn payload_timing(&self) -> Option<PayloadTiming>;

    fn mtu(&self) -> u32;

    fn set_mtu(&self, mtu: u32);
}
