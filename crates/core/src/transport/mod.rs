//! Client transports and the network plumbing that feeds them.
//!
//! A [`StreamTransport`] describes one client receiving a stream: how it
//! wants the data delivered (its [`LowerTransport`]), where, and an
//! optional [`TransportSink`] the stream pushes every produced packet to.
//!
//! - **UDP** ([`udp`]): the stream's bound RTP/RTCP port pair, the
//!   per-direction destination lists packets are sent to, and the receive
//!   loops feeding client RTCP back into the RTP session.
//! - **TCP** ([`tcp`]): RTP/RTCP interleaved on the RTSP connection with
//!   `$` framing (RFC 2326 §10.12).
//! - **Queueing** ([`queue`]): a bounded per-transport queue so a slow
//!   client cannot stall fan-out to the others.

pub mod queue;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::Result;
use crate::pipeline::Direction;

pub use queue::QueuedSink;
pub use tcp::InterleavedSink;
pub use udp::{PortAllocator, PortBinder, UdpPortPair};

/// An inclusive `min-max` pair, as used for RTP/RTCP ports and
/// interleaved channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Whether `port` is one of the two ends of the range.
    pub fn has_end(&self, port: u16) -> bool {
        self.min == port || self.max == port
    }

    /// Port (or channel) used for `direction`: `min` for RTP, `max` for RTCP.
    pub fn for_direction(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Rtp => self.min,
            Direction::Rtcp => self.max,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// How packets reach a client (RFC 2326 §12.39 `Transport` header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    UdpUnicast,
    UdpMulticast,
    /// RTP/RTCP framed on the RTSP TCP connection.
    TcpInterleaved,
    /// Anything the negotiation layer could not map to the above.
    Unknown,
}

impl fmt::Display for LowerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UdpUnicast => write!(f, "UDP"),
            Self::UdpMulticast => write!(f, "UDP-multicast"),
            Self::TcpInterleaved => write!(f, "TCP"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Receiver of the packets fanned out to a transport.
///
/// Called with the stream lock held, so implementations should return
/// quickly (see [`QueuedSink`]).
pub trait TransportSink: Send + Sync {
    fn send(&self, direction: Direction, packet: &Bytes) -> Result<()>;
}

type KeepaliveCallback = Arc<dyn Fn() + Send + Sync>;

/// One client receiving a stream.
///
/// Created by the negotiation layer and registered with
/// [`Stream::add_transport`](crate::Stream::add_transport). The stream only
/// keeps a reference while registered; removing it never tears it down.
pub struct StreamTransport {
    lower: LowerTransport,
    destination: String,
    client_port: PortRange,
    /// Multicast port range (for [`LowerTransport::UdpMulticast`]).
    port: PortRange,
    ttl: u8,
    interleaved: PortRange,
    sink: Option<Arc<dyn TransportSink>>,
    timed_out: AtomicBool,
    last_keepalive: Mutex<Instant>,
    on_keepalive: Mutex<Option<KeepaliveCallback>>,
}

impl StreamTransport {
    fn new(lower: LowerTransport, destination: &str) -> Self {
        Self {
            lower,
            destination: destination.to_string(),
            client_port: PortRange::default(),
            port: PortRange::default(),
            ttl: 0,
            interleaved: PortRange::default(),
            sink: None,
            timed_out: AtomicBool::new(false),
            last_keepalive: Mutex::new(Instant::now()),
            on_keepalive: Mutex::new(None),
        }
    }

    /// Unicast UDP delivery to `destination:client_port`.
    pub fn udp_unicast(destination: &str, client_port: PortRange) -> Self {
        Self {
            client_port,
            ..Self::new(LowerTransport::UdpUnicast, destination)
        }
    }

    /// Multicast UDP delivery to group `destination` on `port`.
    pub fn udp_multicast(destination: &str, port: PortRange, ttl: u8) -> Self {
        Self {
            port,
            ttl,
            ..Self::new(LowerTransport::UdpMulticast, destination)
        }
    }

    /// Interleaved delivery on the client's RTSP connection. `destination`
    /// is the client host, used only to correlate RTCP.
    pub fn tcp_interleaved(
        destination: &str,
        channels: PortRange,
        sink: Arc<dyn TransportSink>,
    ) -> Self {
        Self {
            interleaved: channels,
            sink: Some(sink),
            ..Self::new(LowerTransport::TcpInterleaved, destination)
        }
    }

    /// A transport whose lower transport is not one of the supported ones.
    pub fn unknown(destination: &str) -> Self {
        Self::new(LowerTransport::Unknown, destination)
    }

    /// Client ports the client sends its own RTCP from.
    pub fn with_client_port(mut self, client_port: PortRange) -> Self {
        self.client_port = client_port;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TransportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn lower_transport(&self) -> LowerTransport {
        self.lower
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn client_port(&self) -> PortRange {
        self.client_port
    }

    pub fn port(&self) -> PortRange {
        self.port
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn interleaved(&self) -> PortRange {
        self.interleaved
    }

    /// Hand a fanned-out packet to the sink. UDP transports usually have
    /// none: their packets leave through the stream's destination lists.
    pub fn send(&self, direction: Direction, packet: &Bytes) -> Result<()> {
        match &self.sink {
            Some(sink) => sink.send(direction, packet),
            None => Ok(()),
        }
    }

    pub fn set_timed_out(&self, timed_out: bool) {
        self.timed_out.store(timed_out, Ordering::SeqCst);
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Called on every sign of life from the client.
    pub fn set_keepalive_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_keepalive.lock() = Some(Arc::new(callback));
    }

    /// Record that the client is alive and notify the keepalive callback.
    ///
    /// The callback runs without any transport lock held, so it may replace
    /// itself.
    pub fn keep_alive(&self) {
        *self.last_keepalive.lock() = Instant::now();
        let callback = self.on_keepalive.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Time since the last [`keep_alive`](Self::keep_alive) (or creation).
    pub fn idle_for(&self) -> Duration {
        self.last_keepalive.lock().elapsed()
    }
}

impl fmt::Display for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            LowerTransport::UdpMulticast => {
                write!(f, "{} {}:{} ttl={}", self.lower, self.destination, self.port, self.ttl)
            }
            LowerTransport::TcpInterleaved => {
                write!(f, "{} {} interleaved={}", self.lower, self.destination, self.interleaved)
            }
            _ => write!(f, "{} {}:{}", self.lower, self.destination, self.client_port),
        }
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("lower", &self.lower)
            .field("destination", &self.destination)
            .field("client_port", &self.client_port)
            .field("port", &self.port)
            .field("ttl", &self.ttl)
            .field("interleaved", &self.interleaved)
            .field("timed_out", &self.is_timed_out())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn port_range_ends() {
        let range = PortRange::new(5000, 5001);
        assert!(range.has_end(5000));
        assert!(range.has_end(5001));
        assert!(!range.has_end(5002));
        assert_eq!(range.for_direction(Direction::Rtp), 5000);
        assert_eq!(range.for_direction(Direction::Rtcp), 5001);
        assert_eq!(range.to_string(), "5000-5001");
    }

    #[test]
    fn keepalive_invokes_callback() {
        let transport = StreamTransport::udp_unicast("10.0.0.5", PortRange::new(5000, 5001));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        transport.set_keepalive_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.keep_alive();
        transport.keep_alive();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(transport.idle_for() < Duration::from_secs(5));
    }

    #[test]
    fn keepalive_callback_may_replace_itself() {
        let transport = Arc::new(StreamTransport::udp_unicast(
            "10.0.0.5",
            PortRange::new(5000, 5001),
        ));
        let replaced = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&transport);
        let counter = replaced.clone();
        transport.set_keepalive_callback(move || {
            let counter = counter.clone();
            if let Some(transport) = weak.upgrade() {
                transport.set_keepalive_callback(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        transport.keep_alive();
        assert_eq!(replaced.load(Ordering::SeqCst), 0);
        transport.keep_alive();
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timed_out_flag() {
        let transport = StreamTransport::udp_unicast("10.0.0.5", PortRange::new(5000, 5001));
        assert!(!transport.is_timed_out());
        transport.set_timed_out(true);
        assert!(transport.is_timed_out());
    }

    #[test]
    fn send_without_sink_is_noop() {
        let transport = StreamTransport::udp_unicast("10.0.0.5", PortRange::new(5000, 5001));
        assert!(
            transport
                .send(Direction::Rtp, &Bytes::from_static(b"x"))
                .is_ok()
        );
    }

    #[test]
    fn display() {
        let unicast = StreamTransport::udp_unicast("10.0.0.5", PortRange::new(5000, 5001));
        assert_eq!(unicast.to_string(), "UDP 10.0.0.5:5000-5001");
        let multicast = StreamTransport::udp_multicast("224.2.0.1", PortRange::new(6000, 6001), 4);
        assert_eq!(multicast.to_string(), "UDP-multicast 224.2.0.1:6000-6001 ttl=4");
    }
}
