use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;

use super::PortRange;
use crate::error::{Result, StreamError};
use crate::pipeline::{Direction, PacketConsumer};

/// Default number of pair attempts before giving up.
pub const DEFAULT_PORT_RETRY_BUDGET: u32 = 20;

/// Binds local UDP sockets. Swappable so port exhaustion can be simulated.
pub trait PortBinder: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// Binds real sockets through the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBinder;

impl PortBinder for SystemBinder {
    fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        UdpSocket::bind(addr)
    }
}

/// Finds an even RTP port with the next odd port free for RTCP.
///
/// Starts from an OS-chosen port. An odd port is released and its
/// successor requested explicitly; an even port whose successor is taken is
/// released and the scan continues two ports higher. Each attempt binds one
/// RTP candidate; after `retry_budget` attempts the allocation fails.
/// Sockets from failed attempts are closed before the next attempt.
pub struct PortAllocator {
    ipv6: bool,
    retry_budget: u32,
    send_buffer_size: Option<usize>,
    binder: Arc<dyn PortBinder>,
}

impl PortAllocator {
    pub fn new(ipv6: bool) -> Self {
        Self {
            ipv6,
            retry_budget: DEFAULT_PORT_RETRY_BUDGET,
            send_buffer_size: None,
            binder: Arc::new(SystemBinder),
        }
    }

    pub fn with_binder(mut self, binder: Arc<dyn PortBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Send buffer applied to both sockets; `None` keeps the OS default.
    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    fn local(&self, port: u16) -> SocketAddr {
        if self.ipv6 {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
        }
    }

    /// Bind an RTP/RTCP pair.
    pub fn allocate(&self) -> Result<UdpPortPair> {
        let mut candidate: u16 = 0;
        let mut attempts = 0;

        while attempts < self.retry_budget {
            attempts += 1;

            let rtp = match self.binder.bind(self.local(candidate)) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!(port = candidate, error = %e, "RTP port busy");
                    candidate = next_candidate(candidate, 2);
                    continue;
                }
            };

            let rtp_port = rtp
                .local_addr()
                .map_err(|_| StreamError::PreconditionViolation("bound UDP port not reported"))?
                .port();

            if rtp_port % 2 != 0 {
                tracing::trace!(port = rtp_port, "odd RTP port, retrying with next");
                drop(rtp);
                candidate = next_candidate(rtp_port, 1);
                continue;
            }

            let rtcp_port = rtp_port + 1;
            let rtcp = match self.binder.bind(self.local(rtcp_port)) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!(rtp_port, rtcp_port, error = %e, "RTCP port busy");
                    drop(rtp);
                    candidate = next_candidate(rtp_port, 2);
                    continue;
                }
            };

            let bound_rtcp = rtcp.local_addr().map(|a| a.port()).ok();
            if bound_rtcp != Some(rtcp_port) {
                tracing::warn!(rtp_port, rtcp_port, ?bound_rtcp, "RTCP bound to unexpected port");
                candidate = next_candidate(rtp_port, 2);
                continue;
            }

            tracing::debug!(rtp_port, rtcp_port, attempts, "allocated server ports");
            return UdpPortPair::new([rtp, rtcp], self.ipv6, self.send_buffer_size);
        }

        tracing::warn!(attempts, "no free RTP/RTCP port pair");
        Err(StreamError::PortAllocationFailed { attempts })
    }
}

/// Next port to try, falling back to an OS-chosen one past the top of the
/// range.
fn next_candidate(port: u16, step: u16) -> u16 {
    if port == 0 {
        return 0;
    }
    port.checked_add(step).unwrap_or(0)
}

/// A bound RTP/RTCP socket pair.
///
/// The same sockets receive client packets and send to the destination
/// lists, so clients see packets coming from the advertised server ports.
pub struct UdpPortPair {
    sockets: [UdpSocket; 2],
    range: PortRange,
}

impl UdpPortPair {
    fn new(sockets: [UdpSocket; 2], ipv6: bool, send_buffer_size: Option<usize>) -> Result<Self> {
        let rtp_port = sockets[0].local_addr()?.port();
        let rtcp_port = sockets[1].local_addr()?.port();

        for socket in &sockets {
            let sock = SockRef::from(socket);
            // Destinations are added explicitly; never loop our own packets back.
            let looped = if ipv6 {
                sock.set_multicast_loop_v6(false)
            } else {
                sock.set_multicast_loop_v4(false)
            };
            if let Err(e) = looped {
                tracing::warn!(error = %e, "could not disable multicast loopback");
            }
            if let Some(size) = send_buffer_size
                && let Err(e) = sock.set_send_buffer_size(size)
            {
                tracing::warn!(size, error = %e, "could not set UDP send buffer size");
            }
        }

        Ok(Self {
            sockets,
            range: PortRange::new(rtp_port, rtcp_port),
        })
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn socket(&self, direction: Direction) -> &UdpSocket {
        &self.sockets[direction.index()]
    }

    /// A destination list sending through the socket of `direction`.
    pub fn fanout(&self, direction: Direction) -> Result<UdpFanout> {
        Ok(UdpFanout::new(self.socket(direction).try_clone()?))
    }
}

struct Destination {
    addr: SocketAddr,
    refs: usize,
}

/// Destination list for one direction of a stream.
///
/// Adding a destination twice keeps one entry with two references, so each
/// packet goes out once per address.
pub struct UdpFanout {
    socket: UdpSocket,
    destinations: Vec<Destination>,
}

impl UdpFanout {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            destinations: Vec::new(),
        }
    }

    pub fn add(&mut self, addr: SocketAddr) {
        match self.destinations.iter_mut().find(|d| d.addr == addr) {
            Some(dest) => dest.refs += 1,
            None => self.destinations.push(Destination { addr, refs: 1 }),
        }
    }

    /// Drop one reference to `addr`. Unknown addresses are ignored.
    pub fn remove(&mut self, addr: SocketAddr) {
        if let Some(pos) = self.destinations.iter().position(|d| d.addr == addr) {
            self.destinations[pos].refs -= 1;
            if self.destinations[pos].refs == 0 {
                self.destinations.remove(pos);
            }
        }
    }

    pub fn destinations(&self) -> Vec<SocketAddr> {
        self.destinations.iter().map(|d| d.addr).collect()
    }

    /// The bound socket packets leave from.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn set_multicast_ttl(&self, ttl: u8) -> Result<()> {
        let sock = SockRef::from(&self.socket);
        if self.socket.local_addr()?.is_ipv6() {
            sock.set_multicast_hops_v6(ttl as u32)?;
        } else {
            sock.set_multicast_ttl_v4(ttl as u32)?;
        }
        Ok(())
    }

    /// Send `packet` to every destination. Returns how many sends succeeded.
    pub fn send(&self, packet: &[u8]) -> usize {
        let mut sent = 0;
        for dest in &self.destinations {
            match self.socket.send_to(packet, dest.addr) {
                Ok(_) => sent += 1,
                Err(e) => tracing::debug!(destination = %dest.addr, error = %e, "UDP send failed"),
            }
        }
        sent
    }
}

/// Resolve a transport destination host and port to a socket address.
pub fn resolve_destination(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        StreamError::Io(io::Error::new(
            ErrorKind::NotFound,
            format!("destination {host} did not resolve"),
        ))
    })
}

/// Receive loop feeding one bound socket into the RTP session.
///
/// Polls with a read timeout and checks its `running` flag between reads,
/// so [`stop`](Self::stop) returns promptly.
pub struct UdpReceiver {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpReceiver {
    pub fn spawn(
        socket: UdpSocket,
        direction: Direction,
        consumer: Arc<dyn PacketConsumer>,
        poll_interval: Duration,
        buffer_len: usize,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(poll_interval))?;
        let port = socket.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name(format!("udp-recv-{port}"))
            .spawn(move || receive_loop(socket, direction, consumer, flag, buffer_len))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("UDP receive thread panicked");
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    direction: Direction,
    consumer: Arc<dyn PacketConsumer>,
    running: Arc<AtomicBool>,
    buffer_len: usize,
) {
    let mut buf = vec![0u8; buffer_len];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                tracing::trace!(%direction, %peer, len, "received client packet");
                let packet = Bytes::copy_from_slice(&buf[..len]);
                if let Err(e) = consumer.push(packet, Some(peer)) {
                    tracing::debug!(%direction, error = %e, "RTP session rejected packet");
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::debug!(%direction, error = %e, "UDP receive error");
                }
            }
        }
    }
    tracing::debug!(%direction, "UDP receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    struct AlwaysBusy {
        calls: AtomicU32,
    }

    impl PortBinder for AlwaysBusy {
        fn bind(&self, _addr: SocketAddr) -> io::Result<UdpSocket> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(ErrorKind::AddrInUse, "busy"))
        }
    }

    /// Binds for real but treats every explicit odd port as taken, so no
    /// RTCP port can ever be obtained.
    #[derive(Default)]
    struct OddPortsBusy {
        bound: Mutex<Vec<u16>>,
    }

    impl PortBinder for OddPortsBusy {
        fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
            if addr.port() % 2 == 1 {
                return Err(io::Error::new(ErrorKind::AddrInUse, "busy"));
            }
            let socket = UdpSocket::bind(addr)?;
            self.bound.lock().push(socket.local_addr()?.port());
            Ok(socket)
        }
    }

    #[test]
    fn allocates_even_odd_pair() {
        let pair = PortAllocator::new(false).allocate().unwrap();
        let range = pair.range();
        assert_eq!(range.min % 2, 0);
        assert_eq!(range.max, range.min + 1);
        assert_eq!(
            pair.socket(Direction::Rtp).local_addr().unwrap().port(),
            range.min
        );
        assert_eq!(
            pair.socket(Direction::Rtcp).local_addr().unwrap().port(),
            range.max
        );
    }

    #[test]
    fn pair_sockets_have_loopback_off_and_sized_buffers() {
        let pair = PortAllocator::new(false)
            .with_send_buffer_size(Some(4096))
            .allocate()
            .unwrap();
        for direction in Direction::BOTH {
            let sock = SockRef::from(pair.socket(direction));
            assert!(!sock.multicast_loop_v4().unwrap());
            // Linux reports twice the requested size; the OS default is far larger.
            let size = sock.send_buffer_size().unwrap();
            assert!(size > 0 && size <= 2 * 4096, "send buffer {size}");
        }
    }

    #[test]
    fn fanouts_share_pair_ports() {
        let pair = PortAllocator::new(false).allocate().unwrap();
        let range = pair.range();
        let rtp = pair.fanout(Direction::Rtp).unwrap();
        let rtcp = pair.fanout(Direction::Rtcp).unwrap();
        assert_eq!(rtp.socket().local_addr().unwrap().port(), range.min);
        assert_eq!(rtcp.socket().local_addr().unwrap().port(), range.max);
        assert!(!SockRef::from(rtcp.socket()).multicast_loop_v4().unwrap());
    }

    #[test]
    fn exhaustion_stops_at_budget() {
        let binder = Arc::new(AlwaysBusy {
            calls: AtomicU32::new(0),
        });
        let err = PortAllocator::new(false)
            .with_binder(binder.clone())
            .allocate()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StreamError::PortAllocationFailed {
                attempts: DEFAULT_PORT_RETRY_BUDGET
            }
        ));
        assert_eq!(binder.calls.load(Ordering::SeqCst), DEFAULT_PORT_RETRY_BUDGET);
    }

    #[test]
    fn failed_attempts_release_their_sockets() {
        let binder = Arc::new(OddPortsBusy::default());
        let result = PortAllocator::new(false)
            .with_binder(binder.clone())
            .with_retry_budget(5)
            .allocate();
        assert!(matches!(
            result,
            Err(StreamError::PortAllocationFailed { attempts: 5 })
        ));

        let bound = binder.bound.lock();
        assert!(!bound.is_empty());
        for port in bound.iter() {
            // Rebinding only works if the allocator closed the socket.
            UdpSocket::bind(("0.0.0.0", *port)).unwrap();
        }
    }

    #[test]
    fn next_candidate_wraps_to_ephemeral() {
        assert_eq!(next_candidate(0, 2), 0);
        assert_eq!(next_candidate(5000, 2), 5002);
        assert_eq!(next_candidate(65534, 2), 0);
        assert_eq!(next_candidate(65535, 1), 0);
    }

    #[test]
    fn fanout_sends_once_per_destination() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut fanout = UdpFanout::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        fanout.add(dest);
        fanout.add(dest);
        assert_eq!(fanout.destinations(), vec![dest]);
        assert_eq!(fanout.send(b"hello"), 1);

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");

        fanout.remove(dest);
        assert_eq!(fanout.destinations(), vec![dest]);
        fanout.remove(dest);
        assert!(fanout.destinations().is_empty());
        fanout.remove(dest);
        assert_eq!(fanout.send(b"gone"), 0);
    }

    #[test]
    fn resolves_literal_addresses() {
        let addr = resolve_destination("10.0.0.5", 5000).unwrap();
        assert_eq!(addr, "10.0.0.5:5000".parse().unwrap());
    }

    struct Record(Mutex<Vec<(Bytes, Option<SocketAddr>)>>);

    impl PacketConsumer for Record {
        fn push(&self, packet: Bytes, origin: Option<SocketAddr>) -> Result<()> {
            self.0.lock().push((packet, origin));
            Ok(())
        }
    }

    #[test]
    fn receiver_forwards_datagrams() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = socket.local_addr().unwrap();
        let record = Arc::new(Record(Mutex::new(Vec::new())));
        let mut receiver = UdpReceiver::spawn(
            socket,
            Direction::Rtcp,
            record.clone(),
            Duration::from_millis(10),
            2048,
        )
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"rtcp", target).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while record.0.lock().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        receiver.stop();

        let got = record.0.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].0[..], b"rtcp");
        assert_eq!(got[0].1, Some(client.local_addr().unwrap()));
    }
}
