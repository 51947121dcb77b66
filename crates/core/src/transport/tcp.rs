//! RTP/RTCP interleaved on the RTSP TCP connection (RFC 2326 §10.12).
//!
//! ```text
//! +-----+---------+----------------+---------------------+
//! | '$' | channel | length (16 BE) | RTP or RTCP packet  |
//! +-----+---------+----------------+---------------------+
//! ```
//!
//! The channel pair is negotiated in SETUP (`interleaved=0-1`): the first
//! channel carries RTP, the second RTCP.

use std::io::{self, ErrorKind, Read, Write};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{PortRange, TransportSink};
use crate::error::{Result, StreamError};
use crate::pipeline::Direction;
use crate::stream::Stream;

const FRAME_MAGIC: u8 = b'$';

/// Build one interleaved frame around `payload`.
pub fn encode_frame(channel: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} byte packet does not fit an interleaved frame", payload.len()),
        )
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(FRAME_MAGIC);
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// A frame read off the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Read the next frame. `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<InterleavedFrame>> {
    let mut magic = [0u8; 1];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if magic[0] != FRAME_MAGIC {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("expected '$', got {:#04x}", magic[0]),
        ));
    }

    let mut head = [0u8; 3];
    reader.read_exact(&mut head)?;
    let len = u16::from_be_bytes([head[1], head[2]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    Ok(Some(InterleavedFrame {
        channel: head[0],
        payload: Bytes::from(payload),
    }))
}

/// Channel carrying `direction` within the negotiated pair.
fn channel_for(channels: PortRange, direction: Direction) -> Result<u8> {
    let channel = channels.for_direction(direction);
    u8::try_from(channel)
        .map_err(|_| StreamError::UnsupportedTransport(format!("interleaved channel {channel}")))
}

/// Writes fanned-out packets as interleaved frames.
///
/// Typically wraps a clone of the client's RTSP `TcpStream`. A blocked
/// writer blocks fan-out, so slow clients should sit behind a
/// [`QueuedSink`](super::QueuedSink).
pub struct InterleavedSink<W> {
    writer: Mutex<W>,
    channels: PortRange,
}

impl<W: Write + Send> InterleavedSink<W> {
    pub fn new(writer: W, channels: PortRange) -> Self {
        Self {
            writer: Mutex::new(writer),
            channels,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> TransportSink for InterleavedSink<W> {
    fn send(&self, direction: Direction, packet: &Bytes) -> Result<()> {
        let frame = encode_frame(channel_for(self.channels, direction)?, packet)?;
        let mut writer = self.writer.lock();
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }
}

/// Feed frames read from a client connection into `stream` until the
/// connection closes. Frames on channels outside `channels` are skipped.
///
/// Returns the number of packets delivered.
pub fn pump_interleaved<R: Read>(mut reader: R, stream: &Stream, channels: PortRange) -> Result<usize> {
    let mut delivered = 0;
    while let Some(frame) = read_frame(&mut reader)? {
        let direction = if u16::from(frame.channel) == channels.min {
            Direction::Rtp
        } else if u16::from(frame.channel) == channels.max {
            Direction::Rtcp
        } else {
            tracing::trace!(channel = frame.channel, "skipping frame on foreign channel");
            continue;
        };
        stream.recv_packet(direction, frame.payload)?;
        delivered += 1;
    }
    tracing::debug!(stream = stream.index(), delivered, "interleaved connection closed");
    Ok(delivered)
}
