//! Mapping RTCP sources back to the transports they belong to.
//!
//! The RTP session reports sources by SSRC. To act on those reports (mark a
//! client alive, flag it as timed out) the stream needs the transport the
//! source is sending from. The session's statistics carry the origin of the
//! source's last RTCP packet; that `host:port` is matched against the
//! registered transports once and the result cached per SSRC.

use std::collections::HashMap;
use std::sync::Arc;

use super::registry::TransportRegistry;
use crate::error::{Result, StreamError};
use crate::pipeline::{SourceEvent, SourceEventKind, SourceId, SourceStats};
use crate::transport::StreamTransport;

/// Split an RTCP origin into host and port at the last `:`.
///
/// Brackets around IPv6 hosts are removed, so `[::1]:5001` gives `::1`.
pub fn split_origin(origin: &str) -> Option<(&str, u16)> {
    let (host, port) = origin.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

/// First transport whose destination is the origin's host and whose client
/// port range has the origin's port as either end.
pub fn find_transport<'a, I>(transports: I, rtcp_from: &str) -> Result<Arc<StreamTransport>>
where
    I: IntoIterator<Item = &'a Arc<StreamTransport>>,
{
    let (host, port) = split_origin(rtcp_from)
        .ok_or_else(|| StreamError::NotFound(format!("malformed RTCP origin {rtcp_from}")))?;

    transports
        .into_iter()
        .find(|t| t.destination() == host && t.client_port().has_end(port))
        .cloned()
        .ok_or_else(|| StreamError::NotFound(format!("no transport for {rtcp_from}")))
}

/// Per-stream SSRC to transport cache.
#[derive(Default)]
pub(crate) struct SsrcCorrelator {
    cache: HashMap<SourceId, Arc<StreamTransport>>,
}

impl SsrcCorrelator {
    /// Transport of `source`, from the cache or by matching the statistics'
    /// RTCP origin against `registry`. A successful match is cached.
    pub fn resolve(
        &mut self,
        source: SourceId,
        stats: Option<&SourceStats>,
        registry: &TransportRegistry,
    ) -> Result<Arc<StreamTransport>> {
        if let Some(transport) = self.cache.get(&source) {
            return Ok(transport.clone());
        }

        let rtcp_from = stats
            .and_then(|s| s.rtcp_from.as_deref())
            .ok_or_else(|| StreamError::NotFound(format!("no RTCP origin for source {source:#010x}")))?;

        let transport = find_transport(registry.iter(), rtcp_from)?;
        tracing::info!(source, rtcp_from, %transport, "found transport for source");
        self.cache.insert(source, transport.clone());
        Ok(transport)
    }

    /// Resolve the transport for `event`, if its kind is acted on.
    ///
    /// A source that timed out is gone from the session, so its cache
    /// entry goes with it.
    pub fn correlate(
        &mut self,
        event: &SourceEvent,
        registry: &TransportRegistry,
    ) -> Result<Option<Arc<StreamTransport>>> {
        if !needs_transport(event.kind) {
            return Ok(None);
        }
        let transport = self.resolve(event.source, event.stats.as_ref(), registry);
        if matches!(
            event.kind,
            SourceEventKind::Timeout | SourceEventKind::ByeTimeout
        ) {
            self.cache.remove(&event.source);
        }
        transport.map(Some)
    }

    /// Drop cache entries pointing at `transport`.
    pub fn forget(&mut self, transport: &Arc<StreamTransport>) {
        self.cache.retain(|_, t| !Arc::ptr_eq(t, transport));
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    #[cfg(test)]
    pub(super) fn cached(&self, source: SourceId) -> Option<&Arc<StreamTransport>> {
        self.cache.get(&source)
    }
}

/// Whether events of this kind are acted on through a transport.
fn needs_transport(kind: SourceEventKind) -> bool {
    !matches!(kind, SourceEventKind::Sdes | SourceEventKind::Bye)
}

/// React to a source event for the resolved `transport`.
///
/// Runs without the stream lock, since the keepalive callback may call
/// back into the stream.
pub(crate) fn apply(stream: u32, event: &SourceEvent, transport: Option<&StreamTransport>) {
    let source = event.source;
    match (event.kind, transport) {
        (SourceEventKind::NewSource, _) => tracing::info!(stream, source, "new source"),
        (SourceEventKind::Sdes, _) => {
            tracing::info!(stream, source, stats = ?event.stats, "source description")
        }
        (SourceEventKind::Bye, _) => tracing::info!(stream, source, "source sent BYE"),
        (SourceEventKind::Active, Some(transport)) => {
            tracing::trace!(stream, source, "source active");
            transport.keep_alive();
        }
        (SourceEventKind::ByeTimeout, Some(transport)) => {
            tracing::info!(stream, source, %transport, "source BYE timeout");
            transport.set_timed_out(true);
        }
        (SourceEventKind::Timeout, Some(transport)) => {
            tracing::info!(stream, source, %transport, "source timed out");
            transport.set_timed_out(true);
        }
        (kind, None) => tracing::trace!(stream, source, ?kind, "no transport for source event"),
    }
}
