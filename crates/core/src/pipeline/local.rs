//! In-process pipeline for demos and tests.
//!
//! [`LocalPipeline`] stands in for a real media pipeline: callers hand it
//! encoded payloads, it frames them with an [`RtpHeader`] and pushes the
//! packets through the linked [`LocalSession`] to whatever handler the
//! stream attached. Packets fed back by clients are recorded per direction,
//! and RTCP from unknown SSRCs turns into source events the way a real RTP
//! session would report them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::{
    Direction, FormatObserver, MediaPipeline, PacketConsumer, PacketHandler, PayloadTiming,
    RtpSession, SourceEvent, SourceEventKind, SourceId, SourceObserver, SourceStats,
};
use crate::error::{Result, StreamError};
use crate::media::MediaFormat;
use crate::media::rtp::{self, RtpHeader};

const DEFAULT_MTU: u32 = 1400;

/// A pipeline that payloads whatever it is given, in process.
///
/// It has one payloader, so it links to one stream at a time.
pub struct LocalPipeline {
    header: Mutex<RtpHeader>,
    mtu: AtomicU32,
    sessions: Mutex<HashMap<u32, Arc<LocalSession>>>,
    linked: RwLock<Option<Linked>>,
    format: Mutex<Option<MediaFormat>>,
    refuse_links: AtomicBool,
    expose_timing: AtomicBool,
}

struct Linked {
    index: u32,
    observer: Arc<dyn FormatObserver>,
}

impl LocalPipeline {
    /// Payloader with the given payload type and a random SSRC.
    pub fn new(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt))
    }

    pub fn with_header(header: RtpHeader) -> Self {
        Self {
            header: Mutex::new(header),
            mtu: AtomicU32::new(DEFAULT_MTU),
            sessions: Mutex::new(HashMap::new()),
            linked: RwLock::new(None),
            format: Mutex::new(None),
            refuse_links: AtomicBool::new(false),
            expose_timing: AtomicBool::new(true),
        }
    }

    /// Make the next [`link_payloader`](MediaPipeline::link_payloader)
    /// calls fail, as a pipeline whose payloader pad cannot be linked.
    pub fn refuse_links(&self, refuse: bool) {
        self.refuse_links.store(refuse, Ordering::SeqCst);
    }

    /// Hide sequence/timestamp state, as payloaders without those
    /// properties do.
    pub fn expose_timing(&self, expose: bool) {
        self.expose_timing.store(expose, Ordering::SeqCst);
    }

    /// The session created for `index`, if any.
    pub fn session(&self, index: u32) -> Option<Arc<LocalSession>> {
        self.sessions.lock().get(&index).cloned()
    }

    fn linked_session(&self) -> Option<Arc<LocalSession>> {
        let index = self.linked.read().as_ref()?.index;
        self.session(index)
    }

    /// Frame `payload` as one RTP packet and push it to the linked session.
    ///
    /// Returns `false` when no session is linked (the packet is dropped).
    pub fn send_payload(&self, payload: &[u8], marker: bool, timestamp_increment: u32) -> bool {
        let packet = {
            let mut header = self.header.lock();
            let packet = header.packet(payload, marker);
            if marker {
                header.advance_timestamp(timestamp_increment);
            }
            packet
        };

        match self.linked_session() {
            Some(session) => {
                session.produce(Direction::Rtp, Bytes::from(packet));
                true
            }
            None => {
                tracing::trace!("no linked session, dropping payload");
                false
            }
        }
    }

    /// Push an already built RTCP packet out of the linked session.
    pub fn send_rtcp(&self, packet: Bytes) -> bool {
        match self.linked_session() {
            Some(session) => {
                session.produce(Direction::Rtcp, packet);
                true
            }
            None => false,
        }
    }

    /// Report a new negotiated format to the linked stream.
    pub fn announce_format(&self, format: MediaFormat) {
        *self.format.lock() = Some(format.clone());
        if let Some(linked) = self.linked.read().as_ref() {
            linked.observer.on_format(format);
        }
    }

    pub fn format(&self) -> Option<MediaFormat> {
        self.format.lock().clone()
    }
}

impl MediaPipeline for LocalPipeline {
    fn create_session(&self, index: u32) -> Result<Arc<dyn RtpSession>> {
        let ssrc = self.header.lock().ssrc;
        let session = LocalSession::new(index, ssrc);
        self.sessions.lock().insert(index, session.clone());
        tracing::debug!(index, "local RTP session created");
        Ok(session)
    }

    fn link_payloader(
        &self,
        session: &Arc<dyn RtpSession>,
        observer: Arc<dyn FormatObserver>,
    ) -> Result<()> {
        let index = session.index();
        if self.refuse_links.load(Ordering::SeqCst) {
            return Err(StreamError::BindFailed {
                index,
                reason: "payloader refused link".to_string(),
            });
        }
        *self.linked.write() = Some(Linked { index, observer });
        Ok(())
    }

    fn unlink_payloader(&self, session: &Arc<dyn RtpSession>) {
        let mut linked = self.linked.write();
        if linked.as_ref().is_some_and(|l| l.index == session.index()) {
            *linked = None;
        }
    }

    fn payload_timing(&self) -> Option<PayloadTiming> {
        if !self.expose_timing.load(Ordering::SeqCst) {
            return None;
        }
        let header = self.header.lock();
        Some(PayloadTiming {
            seq: header.sequence(),
            rtptime: header.rtptime(),
        })
    }

    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }

    fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }
}

/// RTP session of a [`LocalPipeline`].
pub struct LocalSession {
    index: u32,
    ssrc: u32,
    this: Weak<LocalSession>,
    producers: RwLock<[Option<Arc<dyn PacketHandler>>; 2]>,
    observers: RwLock<Vec<Arc<dyn SourceObserver>>>,
    received: Mutex<[Vec<Bytes>; 2]>,
    sources: Mutex<HashMap<SourceId, SourceStats>>,
}

impl LocalSession {
    fn new(index: u32, ssrc: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            index,
            ssrc,
            this: this.clone(),
            producers: RwLock::new([None, None]),
            observers: RwLock::new(Vec::new()),
            received: Mutex::new([Vec::new(), Vec::new()]),
            sources: Mutex::new(HashMap::new()),
        })
    }

    /// Hand a produced packet to the attached handler, if any.
    pub fn produce(&self, direction: Direction, packet: Bytes) {
        let producers = self.producers.read();
        if let Some(handler) = &producers[direction.index()] {
            handler.on_packet(direction, packet);
        }
    }

    /// Deliver a source event to every observer.
    pub fn emit(&self, event: SourceEvent) {
        let observers = self.observers.read();
        for observer in observers.iter() {
            observer.on_source_event(event.clone());
        }
    }

    /// Report `source` as timed out, with its last known statistics.
    pub fn time_out(&self, source: SourceId) {
        let stats = self.sources.lock().remove(&source);
        self.emit(SourceEvent {
            kind: SourceEventKind::Timeout,
            source,
            stats,
        });
    }

    /// Packets pushed into this session by clients, for one direction.
    pub fn received(&self, direction: Direction) -> Vec<Bytes> {
        self.received.lock()[direction.index()].clone()
    }

    fn receive(&self, direction: Direction, packet: Bytes, origin: Option<SocketAddr>) {
        let ssrc = match direction {
            Direction::Rtp => rtp::rtp_ssrc(&packet),
            Direction::Rtcp => rtp::rtcp_sender_ssrc(&packet),
        };
        let is_bye = direction == Direction::Rtcp && rtp::rtcp_is_bye(&packet);
        let len = packet.len() as u64;
        self.received.lock()[direction.index()].push(packet);

        let Some(ssrc) = ssrc else {
            return;
        };

        let (is_new, stats) = {
            let mut sources = self.sources.lock();
            let is_new = !sources.contains_key(&ssrc);
            let stats = sources.entry(ssrc).or_default();
            stats.packets_received += 1;
            stats.octets_received += len;
            if let Some(origin) = origin {
                match direction {
                    Direction::Rtp => stats.rtp_from = Some(origin.to_string()),
                    Direction::Rtcp => stats.rtcp_from = Some(origin.to_string()),
                }
            }
            (is_new, stats.clone())
        };

        if is_new {
            self.emit(SourceEvent {
                kind: SourceEventKind::NewSource,
                source: ssrc,
                stats: Some(stats.clone()),
            });
        }
        let kind = if is_bye {
            SourceEventKind::Bye
        } else {
            SourceEventKind::Active
        };
        self.emit(SourceEvent {
            kind,
            source: ssrc,
            stats: Some(stats),
        });
    }
}

impl RtpSession for LocalSession {
    fn index(&self) -> u32 {
        self.index
    }

    fn attach_producer(&self, direction: Direction, handler: Arc<dyn PacketHandler>) -> Result<()> {
        self.producers.write()[direction.index()] = Some(handler);
        Ok(())
    }

    fn attach_consumer(&self, direction: Direction) -> Result<Arc<dyn PacketConsumer>> {
        Ok(Arc::new(LocalConsumer {
            session: self.this.clone(),
            direction,
        }))
    }

    fn subscribe(&self, observer: Arc<dyn SourceObserver>) -> Result<()> {
        self.observers.write().push(observer);
        Ok(())
    }

    fn detach(&self) {
        // Write locks wait for in-flight handler calls holding read guards.
        *self.producers.write() = [None, None];
        self.observers.write().clear();
    }

    fn internal_ssrc(&self) -> Option<u32> {
        Some(self.ssrc)
    }
}

struct LocalConsumer {
    session: Weak<LocalSession>,
    direction: Direction,
}

impl PacketConsumer for LocalConsumer {
    fn push(&self, packet: Bytes, origin: Option<SocketAddr>) -> Result<()> {
        let session = self.session.upgrade().ok_or(StreamError::PreconditionViolation(
            "RTP session already released",
        ))?;
        session.receive(self.direction, packet, origin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        packets: Mutex<Vec<(Direction, Bytes)>>,
        events: Mutex<Vec<SourceEvent>>,
    }

    impl PacketHandler for Collect {
        fn on_packet(&self, direction: Direction, packet: Bytes) {
            self.packets.lock().push((direction, packet));
        }
    }

    impl SourceObserver for Collect {
        fn on_source_event(&self, event: SourceEvent) {
            self.events.lock().push(event);
        }
    }

    struct NoFormat;

    impl FormatObserver for NoFormat {
        fn on_format(&self, _format: MediaFormat) {}
    }

    fn linked_pipeline() -> (LocalPipeline, Arc<dyn RtpSession>, Arc<Collect>) {
        let pipeline = LocalPipeline::with_header(RtpHeader::new(96, 0x01020304));
        let session = pipeline.create_session(0).unwrap();
        pipeline
            .link_payloader(&session, Arc::new(NoFormat))
            .unwrap();
        let collect = Arc::new(Collect::default());
        session
            .attach_producer(Direction::Rtp, collect.clone())
            .unwrap();
        session.subscribe(collect.clone()).unwrap();
        (pipeline, session, collect)
    }

    #[test]
    fn payload_reaches_attached_handler() {
        let (pipeline, _session, collect) = linked_pipeline();
        assert!(pipeline.send_payload(&[0xAB; 10], true, 3000));

        let packets = collect.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, Direction::Rtp);
        assert_eq!(rtp::rtp_ssrc(&packets[0].1), Some(0x01020304));
        assert_eq!(&packets[0].1[rtp::RTP_HEADER_LEN..], &[0xAB; 10]);
    }

    #[test]
    fn timing_advances_with_packets() {
        let (pipeline, _session, _collect) = linked_pipeline();
        pipeline.send_payload(&[0], true, 3000);
        let timing = pipeline.payload_timing().unwrap();
        assert_eq!(timing.seq, 1);
        assert_eq!(timing.rtptime, 3000);

        pipeline.expose_timing(false);
        assert!(pipeline.payload_timing().is_none());
    }

    #[test]
    fn unlinked_pipeline_drops_payloads() {
        let (pipeline, session, collect) = linked_pipeline();
        pipeline.unlink_payloader(&session);
        assert!(!pipeline.send_payload(&[0], false, 0));
        assert!(collect.packets.lock().is_empty());
    }

    #[test]
    fn detach_stops_delivery() {
        let (pipeline, session, collect) = linked_pipeline();
        session.detach();
        pipeline.send_payload(&[0], false, 0);
        assert!(collect.packets.lock().is_empty());
    }

    #[test]
    fn rtcp_from_client_reports_source() {
        let (_pipeline, session, collect) = linked_pipeline();
        let consumer = session.attach_consumer(Direction::Rtcp).unwrap();
        let rr = Bytes::from_static(&[0x80, 201, 0x00, 0x01, 0, 0, 0x00, 0x2A]);
        let origin: SocketAddr = "10.0.0.5:5001".parse().unwrap();
        consumer.push(rr.clone(), Some(origin)).unwrap();
        consumer.push(rr, Some(origin)).unwrap();

        let events = collect.events.lock();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SourceEventKind::NewSource,
                SourceEventKind::Active,
                SourceEventKind::Active
            ]
        );
        let stats = events[2].stats.as_ref().unwrap();
        assert_eq!(stats.rtcp_from.as_deref(), Some("10.0.0.5:5001"));
        assert_eq!(stats.packets_received, 2);
        assert_eq!(events[0].source, 42);
    }

    #[test]
    fn link_refusal() {
        let pipeline = LocalPipeline::new(96);
        pipeline.refuse_links(true);
        let session = pipeline.create_session(3).unwrap();
        let err = pipeline
            .link_payloader(&session, Arc::new(NoFormat))
            .unwrap_err();
        assert!(matches!(err, StreamError::BindFailed { index: 3, .. }));
    }
}
