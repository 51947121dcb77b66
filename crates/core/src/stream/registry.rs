use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, StreamError};
use crate::pipeline::Direction;
use crate::transport::udp::{UdpFanout, resolve_destination};
use crate::transport::{LowerTransport, PortRange, StreamTransport};

/// Resolved RTP and RTCP destinations of a UDP transport.
pub(crate) type UdpRoute = [SocketAddr; 2];

/// Resolve where UDP packets for `transport` go. `None` for transports
/// that are not delivered over the stream's UDP sockets.
///
/// May block on name resolution, so it is called before taking the stream
/// lock.
pub(crate) fn resolve_route(transport: &StreamTransport) -> Result<Option<UdpRoute>> {
    let Some(range) = udp_ports(transport) else {
        return Ok(None);
    };
    let rtp = resolve_destination(transport.destination(), range.min)?;
    let rtcp = resolve_destination(transport.destination(), range.max)?;
    Ok(Some([rtp, rtcp]))
}

struct Entry {
    transport: Arc<StreamTransport>,
    route: Option<UdpRoute>,
}

/// The transports a joined stream delivers to, in registration order.
///
/// Lives inside the stream state, so every method runs under the stream
/// lock. UDP transports are also entered into the stream's per-direction
/// destination lists; interleaved ones are only kept here.
#[derive(Default)]
pub(crate) struct TransportRegistry {
    entries: Vec<Entry>,
}

impl TransportRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StreamTransport>> {
        self.entries.iter().map(|e| &e.transport)
    }

    pub fn snapshot(&self) -> Vec<Arc<StreamTransport>> {
        self.iter().cloned().collect()
    }

    fn position(&self, transport: &Arc<StreamTransport>) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.transport, transport))
    }

    /// Register `transport`. UDP transports need the `route` obtained from
    /// [`resolve_route`].
    pub fn add(
        &mut self,
        transport: Arc<StreamTransport>,
        route: Option<UdpRoute>,
        udp: &mut [UdpFanout; 2],
    ) -> Result<()> {
        match transport.lower_transport() {
            LowerTransport::UdpUnicast | LowerTransport::UdpMulticast => {
                let Some([rtp, rtcp]) = route else {
                    return Err(StreamError::PreconditionViolation(
                        "UDP transport added without resolved destinations",
                    ));
                };
                let ttl = transport.ttl();

                tracing::info!(destination = %transport.destination(), %rtp, %rtcp, "adding UDP transport");
                udp[Direction::Rtp.index()].add(rtp);
                udp[Direction::Rtcp.index()].add(rtcp);
                if transport.lower_transport() == LowerTransport::UdpMulticast && ttl > 0 {
                    tracing::info!(ttl, "setting multicast ttl");
                    for fanout in udp.iter() {
                        if let Err(e) = fanout.set_multicast_ttl(ttl) {
                            tracing::warn!(ttl, error = %e, "could not set multicast ttl");
                        }
                    }
                }
            }
            LowerTransport::TcpInterleaved => {
                tracing::info!(destination = %transport.destination(), "adding TCP transport");
            }
            LowerTransport::Unknown => {
                tracing::info!(%transport, "unknown lower transport");
                return Err(StreamError::UnsupportedTransport(transport.to_string()));
            }
        }
        self.entries.push(Entry { transport, route });
        Ok(())
    }

    /// Unregister `transport`, withdrawing the destinations it was added
    /// with. Returns `false` if it was not registered, in which case
    /// nothing changes.
    pub fn remove(&mut self, transport: &Arc<StreamTransport>, udp: &mut [UdpFanout; 2]) -> bool {
        let Some(pos) = self.position(transport) else {
            tracing::debug!(%transport, "removing transport that was never added");
            return false;
        };

        let entry = self.entries.remove(pos);
        match entry.route {
            Some([rtp, rtcp]) => {
                tracing::info!(destination = %transport.destination(), %rtp, %rtcp, "removing UDP transport");
                udp[Direction::Rtp.index()].remove(rtp);
                udp[Direction::Rtcp.index()].remove(rtcp);
            }
            None => {
                tracing::info!(destination = %transport.destination(), "removing TCP transport");
            }
        }
        true
    }

    /// Hand `packet` to every transport in registration order.
    ///
    /// A failing sink is logged and skipped. Returns how many sinks
    /// accepted the packet.
    pub fn fan_out(&self, direction: Direction, packet: &Bytes) -> usize {
        let mut delivered = 0;
        for transport in self.iter() {
            match transport.send(direction, packet) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(%transport, %direction, error = %e, "transport send failed")
                }
            }
        }
        delivered
    }
}

/// Ports UDP packets for `transport` go to.
fn udp_ports(transport: &StreamTransport) -> Option<PortRange> {
    match transport.lower_transport() {
        LowerTransport::UdpMulticast => Some(transport.port()),
        LowerTransport::UdpUnicast => Some(transport.client_port()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportSink;
    use parking_lot::Mutex;
    use socket2::SockRef;
    use std::net::UdpSocket;

    fn fanouts() -> [UdpFanout; 2] {
        [
            UdpFanout::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            UdpFanout::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
        ]
    }

    fn add(registry: &mut TransportRegistry, t: &Arc<StreamTransport>, udp: &mut [UdpFanout; 2]) -> Result<()> {
        let route = resolve_route(t)?;
        registry.add(t.clone(), route, udp)
    }

    struct Named(&'static str, Arc<Mutex<Vec<(&'static str, Bytes)>>>);

    impl TransportSink for Named {
        fn send(&self, _direction: Direction, packet: &Bytes) -> Result<()> {
            self.1.lock().push((self.0, packet.clone()));
            Ok(())
        }
    }

    struct Broken;

    impl TransportSink for Broken {
        fn send(&self, _direction: Direction, _packet: &Bytes) -> Result<()> {
            Err(StreamError::NotFound("client gone".to_string()))
        }
    }

    #[test]
    fn unicast_registers_destinations() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let t = Arc::new(StreamTransport::udp_unicast(
            "127.0.0.1",
            PortRange::new(6000, 6001),
        ));

        add(&mut registry, &t, &mut udp).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(udp[0].destinations(), vec!["127.0.0.1:6000".parse().unwrap()]);
        assert_eq!(udp[1].destinations(), vec!["127.0.0.1:6001".parse().unwrap()]);

        assert!(registry.remove(&t, &mut udp));
        assert!(registry.is_empty());
        assert!(udp[0].destinations().is_empty());
        assert!(udp[1].destinations().is_empty());
    }

    #[test]
    fn route_resolution() {
        let unicast = StreamTransport::udp_unicast("10.0.0.5", PortRange::new(5000, 5001));
        assert_eq!(
            resolve_route(&unicast).unwrap(),
            Some(["10.0.0.5:5000".parse().unwrap(), "10.0.0.5:5001".parse().unwrap()])
        );
        let tcp = StreamTransport::tcp_interleaved(
            "10.0.0.5",
            PortRange::new(0, 1),
            Arc::new(Broken),
        );
        assert_eq!(resolve_route(&tcp).unwrap(), None);
    }

    #[test]
    fn removal_withdraws_the_addresses_it_was_added_with() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let t = Arc::new(StreamTransport::udp_unicast(
            "client.example",
            PortRange::new(6000, 6001),
        ));
        let route = ["127.0.0.1:6000".parse().unwrap(), "127.0.0.1:6001".parse().unwrap()];
        registry.add(t.clone(), Some(route), &mut udp).unwrap();
        assert_eq!(udp[0].destinations(), vec![route[0]]);

        // No lookup of the destination name happens here.
        assert!(registry.remove(&t, &mut udp));
        assert!(udp[0].destinations().is_empty());
        assert!(udp[1].destinations().is_empty());
    }

    #[test]
    fn udp_without_route_rejected() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let t = Arc::new(StreamTransport::udp_unicast(
            "127.0.0.1",
            PortRange::new(6000, 6001),
        ));
        assert!(matches!(
            registry.add(t, None, &mut udp),
            Err(StreamError::PreconditionViolation(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn multicast_uses_group_ports_and_ttl() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let t = Arc::new(
            StreamTransport::udp_multicast("224.3.0.7", PortRange::new(7000, 7001), 3)
                .with_client_port(PortRange::new(9000, 9001)),
        );
        add(&mut registry, &t, &mut udp).unwrap();
        assert_eq!(udp[0].destinations(), vec!["224.3.0.7:7000".parse().unwrap()]);
        assert_eq!(udp[1].destinations(), vec!["224.3.0.7:7001".parse().unwrap()]);
        for fanout in &udp {
            assert_eq!(SockRef::from(fanout.socket()).multicast_ttl_v4().unwrap(), 3);
        }
    }

    #[test]
    fn unicast_leaves_ttl_alone() {
        let mut udp = fanouts();
        let before = SockRef::from(udp[0].socket()).multicast_ttl_v4().unwrap();
        let mut registry = TransportRegistry::default();
        let t = Arc::new(StreamTransport::udp_unicast(
            "127.0.0.1",
            PortRange::new(6000, 6001),
        ));
        add(&mut registry, &t, &mut udp).unwrap();
        assert_eq!(SockRef::from(udp[0].socket()).multicast_ttl_v4().unwrap(), before);
    }

    #[test]
    fn unknown_transport_rejected_without_change() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let err = add(
            &mut registry,
            &Arc::new(StreamTransport::unknown("10.0.0.1")),
            &mut udp,
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedTransport(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_unknown_transport_is_noop() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let added = Arc::new(StreamTransport::udp_unicast(
            "127.0.0.1",
            PortRange::new(6000, 6001),
        ));
        let stranger = Arc::new(StreamTransport::udp_unicast(
            "127.0.0.1",
            PortRange::new(6000, 6001),
        ));
        add(&mut registry, &added, &mut udp).unwrap();

        assert!(!registry.remove(&stranger, &mut udp));
        assert_eq!(registry.len(), 1);
        assert_eq!(udp[0].destinations().len(), 1);
    }

    #[test]
    fn fan_out_follows_registration_order_and_skips_failures() {
        let mut udp = fanouts();
        let mut registry = TransportRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sinks: Vec<(&str, Arc<dyn TransportSink>)> = vec![
            ("a", Arc::new(Named("a", log.clone()))),
            ("broken", Arc::new(Broken)),
            ("b", Arc::new(Named("b", log.clone()))),
        ];
        for (name, sink) in sinks {
            let t = Arc::new(StreamTransport::tcp_interleaved(name, PortRange::new(0, 1), sink));
            add(&mut registry, &t, &mut udp).unwrap();
        }

        assert_eq!(registry.fan_out(Direction::Rtp, &Bytes::from_static(b"p1")), 2);
        assert_eq!(registry.fan_out(Direction::Rtp, &Bytes::from_static(b"p2")), 2);

        let names: Vec<_> = log
            .lock()
            .iter()
            .map(|(n, p)| format!("{n}:{}", String::from_utf8_lossy(p)))
            .collect();
        assert_eq!(names, vec!["a:p1", "b:p1", "a:p2", "b:p2"]);
    }
}
