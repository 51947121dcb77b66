//! The per-stream transport manager.
//!
//! A [`Stream`] ties one media stream of a pipeline to the network. Joining
//! binds an even/odd UDP port pair, wires the pipeline's RTP session for the
//! stream index to it, and starts fanning every produced packet out to the
//! registered [`StreamTransport`]s. RTCP coming back from clients is fed to
//! the session; the session's source reports are mapped back onto the
//! transports to keep them alive or mark them timed out.
//!
//! All state sits behind one lock. Pipeline callbacks only hold a weak
//! reference to it, and [`Stream::leave`] detaches them outside the lock so
//! an in-flight callback can always finish.

mod correlator;
mod registry;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::address::{Address, AddressFlags, AddressLease, AddressPool};
use crate::error::{Result, StreamError};
use crate::media::{MediaFormat, RtpInfo};
use crate::pipeline::{
    Direction, FormatObserver, MediaPipeline, PacketConsumer, PacketHandler, RtpSession,
    SourceEvent, SourceObserver,
};
use crate::transport::udp::{DEFAULT_PORT_RETRY_BUDGET, PortAllocator, UdpFanout, UdpReceiver};
use crate::transport::{PortRange, StreamTransport, UdpPortPair};

pub use correlator::{find_transport, split_origin};
use correlator::SsrcCorrelator;
use registry::TransportRegistry;

/// Per-stream network configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bind the port pair on the IPv6 wildcard address instead of IPv4.
    pub ipv6: bool,
    /// Send buffer for both UDP sockets. `None` keeps the OS default.
    pub send_buffer_size: Option<usize>,
    /// Port pairs tried before joining fails.
    pub port_retry_budget: u32,
    /// How often receive threads check whether they should stop.
    pub receive_poll_interval: Duration,
    /// Largest datagram accepted from clients.
    pub receive_buffer_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ipv6: false,
            send_buffer_size: Some(0x80000),
            port_retry_budget: DEFAULT_PORT_RETRY_BUDGET,
            receive_poll_interval: Duration::from_millis(50),
            receive_buffer_len: 65536,
        }
    }
}

/// One media stream and the clients receiving it.
///
/// `join` and `leave` must be serialized by the caller; every other
/// operation may be called from any thread at any time.
pub struct Stream {
    shared: Arc<Shared>,
}

struct Shared {
    index: u32,
    pipeline: Arc<dyn MediaPipeline>,
    config: StreamConfig,
    allocator: PortAllocator,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pool: Option<Arc<dyn AddressPool>>,
    address: Option<AddressLease>,
    joined: Option<Joined>,
    registry: TransportRegistry,
    correlator: SsrcCorrelator,
    format: Option<MediaFormat>,
}

/// Everything that exists only while joined.
struct Joined {
    ports: UdpPortPair,
    fanouts: [UdpFanout; 2],
    session: Arc<dyn RtpSession>,
    consumers: [Arc<dyn PacketConsumer>; 2],
    receivers: Vec<UdpReceiver>,
}

impl Joined {
    /// Stop callbacks, unlink the payloader, stop receiving. Must run
    /// without the stream lock: detaching waits for in-flight callbacks,
    /// and those take the lock.
    fn teardown(self, pipeline: &dyn MediaPipeline) {
        let range = self.ports.range();
        self.session.detach();
        pipeline.unlink_payloader(&self.session);
        drop(self.receivers);
        tracing::debug!(rtp_port = range.min, rtcp_port = range.max, "released server ports");
    }
}

/// Wiring done so far by a join that may still fail.
#[derive(Default)]
struct PartialJoin {
    session: Option<Arc<dyn RtpSession>>,
    linked: bool,
    receivers: Vec<UdpReceiver>,
}

impl PartialJoin {
    fn release(self, pipeline: &dyn MediaPipeline) {
        if let Some(session) = self.session {
            session.detach();
            if self.linked {
                pipeline.unlink_payloader(&session);
            }
        }
        drop(self.receivers);
    }
}

impl Stream {
    pub fn new(index: u32, pipeline: Arc<dyn MediaPipeline>) -> Self {
        Self::with_config(index, pipeline, StreamConfig::default())
    }

    pub fn with_config(index: u32, pipeline: Arc<dyn MediaPipeline>, config: StreamConfig) -> Self {
        let allocator = PortAllocator::new(config.ipv6)
            .with_retry_budget(config.port_retry_budget)
            .with_send_buffer_size(config.send_buffer_size);
        Self::with_port_allocator(index, pipeline, config, allocator)
    }

    /// Use a custom allocator, e.g. one whose binder simulates busy ports.
    pub fn with_port_allocator(
        index: u32,
        pipeline: Arc<dyn MediaPipeline>,
        config: StreamConfig,
        allocator: PortAllocator,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                index,
                pipeline,
                config,
                allocator,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn mtu(&self) -> u32 {
        self.shared.pipeline.mtu()
    }

    pub fn set_mtu(&self, mtu: u32) {
        tracing::info!(stream = self.index(), mtu, "setting MTU");
        self.shared.pipeline.set_mtu(mtu);
    }

    /// Replace the pool multicast addresses are taken from. An address
    /// already leased stays leased from the pool it came from.
    pub fn set_address_pool(&self, pool: Option<Arc<dyn AddressPool>>) {
        let old = std::mem::replace(&mut self.shared.state.lock().pool, pool);
        drop(old);
    }

    pub fn address_pool(&self) -> Option<Arc<dyn AddressPool>> {
        self.shared.state.lock().pool.clone()
    }

    /// The stream's multicast address, acquiring one from the pool on first
    /// use. Later calls return the same address.
    pub fn address(&self) -> Result<Address> {
        let mut state = self.shared.state.lock();
        if let Some(lease) = &state.address {
            return Ok(lease.address().clone());
        }

        let Some(pool) = state.pool.clone() else {
            tracing::error!(stream = self.index(), "no address pool specified");
            return Err(StreamError::NoPool);
        };
        let Some(address) = pool.acquire(AddressFlags::EVEN_PORT | AddressFlags::MULTICAST, 2)
        else {
            tracing::error!(stream = self.index(), "failed to acquire address from pool");
            return Err(StreamError::AllocationFailed(
                "no free multicast address".to_string(),
            ));
        };

        tracing::info!(stream = self.index(), %address, "acquired multicast address");
        state.address = Some(AddressLease::new(address.clone(), pool));
        Ok(address)
    }

    /// Reserve exactly `host:port` for this stream. Repeating the same
    /// reservation succeeds; any other one conflicts with the first.
    pub fn reserve_address(&self, host: &str, port: u16, n_ports: u16, ttl: u8) -> Result<Address> {
        if host.is_empty() || port == 0 || n_ports == 0 || ttl == 0 {
            tracing::error!(stream = self.index(), host, port, n_ports, ttl, "invalid address reservation");
            return Err(StreamError::PreconditionViolation(
                "address reservation needs a host, a port, a port count and a ttl",
            ));
        }

        let mut state = self.shared.state.lock();
        if let Some(lease) = &state.address {
            let reserved = lease.address();
            if reserved.matches(host, port, n_ports, ttl) {
                return Ok(reserved.clone());
            }
            let requested = format!("{host}:{port}/{n_ports} ttl={ttl}");
            tracing::error!(stream = self.index(), %requested, %reserved, "address already reserved");
            return Err(StreamError::ConflictingReservation {
                requested,
                reserved: reserved.to_string(),
            });
        }

        let Some(pool) = state.pool.clone() else {
            tracing::error!(stream = self.index(), "no address pool specified");
            return Err(StreamError::NoPool);
        };
        let Some(address) = pool.reserve(host, port, n_ports, ttl) else {
            tracing::error!(stream = self.index(), host, port, "failed to reserve address");
            return Err(StreamError::AllocationFailed(format!("{host}:{port}")));
        };

        tracing::info!(stream = self.index(), %address, "reserved multicast address");
        state.address = Some(AddressLease::new(address.clone(), pool));
        Ok(address)
    }

    pub fn is_joined(&self) -> bool {
        self.shared.state.lock().joined.is_some()
    }

    /// Bind the server ports and wire the RTP session to them.
    ///
    /// Does nothing if already joined. On failure every socket and partial
    /// wiring is released and the stream stays unjoined.
    pub fn join(&self) -> Result<()> {
        let index = self.index();
        let mut state = self.shared.state.lock();
        if state.joined.is_some() {
            tracing::debug!(stream = index, "already joined");
            return Ok(());
        }

        tracing::info!(stream = index, "joining stream");
        let ports = match self.shared.allocator.allocate() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(stream = index, error = %e, "could not allocate server ports");
                return Err(e);
            }
        };
        let range = ports.range();

        let mut partial = PartialJoin::default();
        match self.wire(ports, &mut partial) {
            Ok(joined) => {
                state.joined = Some(joined);
                tracing::info!(stream = index, rtp_port = range.min, rtcp_port = range.max, "joined stream");
                Ok(())
            }
            Err(e) => {
                drop(state);
                tracing::warn!(stream = index, error = %e, "failed to wire stream");
                partial.release(self.shared.pipeline.as_ref());
                Err(match e {
                    StreamError::BindFailed { .. } => e,
                    other => StreamError::BindFailed {
                        index,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Session handlers first and the payloader link last, so nothing is
    /// produced into a half-wired session.
    fn wire(&self, ports: UdpPortPair, partial: &mut PartialJoin) -> Result<Joined> {
        let shared = &self.shared;
        let link = Arc::new(StreamLink {
            shared: Arc::downgrade(shared),
        });

        let session = shared.pipeline.create_session(shared.index)?;
        partial.session = Some(session.clone());

        session.subscribe(link.clone())?;
        for direction in Direction::BOTH {
            session.attach_producer(direction, link.clone())?;
        }
        let consumers = [
            session.attach_consumer(Direction::Rtp)?,
            session.attach_consumer(Direction::Rtcp)?,
        ];
        let fanouts = [ports.fanout(Direction::Rtp)?, ports.fanout(Direction::Rtcp)?];

        shared.pipeline.link_payloader(&session, link)?;
        partial.linked = true;

        for direction in Direction::BOTH {
            let socket = ports.socket(direction).try_clone()?;
            partial.receivers.push(UdpReceiver::spawn(
                socket,
                direction,
                consumers[direction.index()].clone(),
                shared.config.receive_poll_interval,
                shared.config.receive_buffer_len,
            )?);
        }

        Ok(Joined {
            ports,
            fanouts,
            session,
            consumers,
            receivers: std::mem::take(&mut partial.receivers),
        })
    }

    /// Unwire the RTP session and release the server ports.
    ///
    /// Does nothing if not joined. Fails, changing nothing, while transports
    /// are still registered. Once this returns no pipeline callback refers
    /// to the stream any more.
    pub fn leave(&self) -> Result<()> {
        let index = self.index();
        let joined = {
            let mut state = self.shared.state.lock();
            if state.joined.is_none() {
                return Ok(());
            }
            if !state.registry.is_empty() {
                tracing::error!(
                    stream = index,
                    transports = state.registry.len(),
                    "cannot leave while transports are active"
                );
                return Err(StreamError::PreconditionViolation(
                    "transports still registered",
                ));
            }
            state.format = None;
            state.correlator.clear();
            state.joined.take()
        };

        tracing::info!(stream = index, "leaving stream");
        if let Some(joined) = joined {
            joined.teardown(self.shared.pipeline.as_ref());
        }
        Ok(())
    }

    /// The bound RTP/RTCP ports.
    pub fn server_port(&self) -> Result<PortRange> {
        let state = self.shared.state.lock();
        match &state.joined {
            Some(joined) => Ok(joined.ports.range()),
            None => {
                tracing::error!(stream = self.index(), "server port requested on unjoined stream");
                Err(StreamError::PreconditionViolation("stream not joined"))
            }
        }
    }

    /// SSRC of the stream's own RTP packets.
    pub fn ssrc(&self) -> Result<Option<u32>> {
        let session = self.session()?;
        Ok(session.internal_ssrc())
    }

    /// SSRC, timestamp and sequence number of the next packet, for the
    /// `RTP-Info` header. `None` if the payloader does not report them.
    pub fn rtp_info(&self) -> Result<Option<RtpInfo>> {
        let session = self.session()?;
        let Some(ssrc) = session.internal_ssrc() else {
            return Ok(None);
        };
        Ok(self.shared.pipeline.payload_timing().map(|timing| RtpInfo {
            ssrc,
            rtptime: timing.rtptime,
            seq: timing.seq,
        }))
    }

    /// Last format reported by the pipeline while joined.
    pub fn format(&self) -> Option<MediaFormat> {
        self.shared.state.lock().format.clone()
    }

    fn session(&self) -> Result<Arc<dyn RtpSession>> {
        let state = self.shared.state.lock();
        state
            .joined
            .as_ref()
            .map(|joined| joined.session.clone())
            .ok_or(StreamError::PreconditionViolation("stream not joined"))
    }

    /// Start delivering to `transport`. The stream keeps a reference until
    /// [`remove_transport`](Self::remove_transport).
    pub fn add_transport(&self, transport: &Arc<StreamTransport>) -> Result<()> {
        // Name resolution may block; keep it out of the lock fan-out takes.
        let route = registry::resolve_route(transport)?;

        let mut state = self.shared.state.lock();
        let State {
            joined, registry, ..
        } = &mut *state;
        let Some(joined) = joined.as_mut() else {
            tracing::error!(stream = self.index(), %transport, "transport added to unjoined stream");
            return Err(StreamError::PreconditionViolation("stream not joined"));
        };
        registry.add(transport.clone(), route, &mut joined.fanouts)?;
        tracing::debug!(stream = self.index(), %transport, transports = registry.len(), "transport added");
        Ok(())
    }

    /// Stop delivering to `transport`. Unknown transports are ignored.
    pub fn remove_transport(&self, transport: &Arc<StreamTransport>) -> Result<()> {
        let mut state = self.shared.state.lock();
        let State {
            joined,
            registry,
            correlator,
            ..
        } = &mut *state;
        let Some(joined) = joined.as_mut() else {
            tracing::error!(stream = self.index(), %transport, "transport removed from unjoined stream");
            return Err(StreamError::PreconditionViolation("stream not joined"));
        };
        if registry.remove(transport, &mut joined.fanouts) {
            correlator.forget(transport);
            tracing::debug!(stream = self.index(), %transport, transports = registry.len(), "transport removed");
        }
        Ok(())
    }

    pub fn transports(&self) -> Vec<Arc<StreamTransport>> {
        self.shared.state.lock().registry.snapshot()
    }

    pub fn transport_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Feed a packet received from a client into the RTP session.
    pub fn recv_packet(&self, direction: Direction, packet: Bytes) -> Result<()> {
        let consumer = {
            let state = self.shared.state.lock();
            let joined = state
                .joined
                .as_ref()
                .ok_or(StreamError::PreconditionViolation("stream not joined"))?;
            joined.consumers[direction.index()].clone()
        };
        tracing::trace!(stream = self.index(), %direction, len = packet.len(), "client packet");
        consumer.push(packet, None)
    }

    pub fn recv_rtp(&self, packet: Bytes) -> Result<()> {
        self.recv_packet(Direction::Rtp, packet)
    }

    pub fn recv_rtcp(&self, packet: Bytes) -> Result<()> {
        self.recv_packet(Direction::Rtcp, packet)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let joined = self.shared.state.lock().joined.take();
        if let Some(joined) = joined {
            tracing::warn!(stream = self.shared.index, "stream dropped while joined");
            joined.teardown(self.shared.pipeline.as_ref());
        }
    }
}

impl Shared {
    fn fan_out(&self, direction: Direction, packet: &Bytes) {
        let state = self.state.lock();
        let Some(joined) = &state.joined else {
            return;
        };
        let udp = joined.fanouts[direction.index()].send(packet);
        let sinks = state.registry.fan_out(direction, packet);
        tracing::trace!(stream = self.index, %direction, len = packet.len(), udp, sinks, "fanned out packet");
    }

    fn source_event(&self, event: SourceEvent) {
        let transport = {
            let mut state = self.state.lock();
            if state.joined.is_none() {
                return;
            }
            let State {
                registry,
                correlator,
                ..
            } = &mut *state;
            match correlator.correlate(&event, registry) {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::trace!(stream = self.index, source = event.source, error = %e, "unresolved source");
                    None
                }
            }
        };
        correlator::apply(self.index, &event, transport.as_deref());
    }

    fn format_changed(&self, format: MediaFormat) {
        let mut state = self.state.lock();
        if state.joined.is_none() {
            return;
        }
        tracing::info!(stream = self.index, %format, "stream format changed");
        state.format = Some(format);
    }
}

/// What the pipeline holds on to: a weak reference, so callbacks racing a
/// dropped stream see nothing.
struct StreamLink {
    shared: Weak<Shared>,
}

impl PacketHandler for StreamLink {
    fn on_packet(&self, direction: Direction, packet: Bytes) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fan_out(direction, &packet);
        }
    }
}

impl SourceObserver for StreamLink {
    fn on_source_event(&self, event: SourceEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.source_event(event);
        }
    }
}

impl FormatObserver for StreamLink {
    fn on_format(&self, format: MediaFormat) {
        if let Some(shared) = self.shared.upgrade() {
            shared.format_changed(format);
        }
    }
}
