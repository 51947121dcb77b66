//! Media-level descriptors shared between the stream and its pipeline.
//!
//! The pipeline owns encoding and payloading. A stream only keeps the
//! latest negotiated [`MediaFormat`] around so the RTSP layer can build SDP
//! and `RTP-Info` headers, and it relays RTP/RTCP verbatim. [`rtp`] holds
//! the few header helpers needed to do that.

pub mod rtp;

use std::fmt;

/// Negotiated format of the payloaded stream, as announced by the pipeline.
///
/// Readers always get a clone; the stream replaces its copy whenever the
/// pipeline reports a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    /// `video`, `audio`, `application`...
    pub media: String,
    /// Encoding name for `a=rtpmap` (e.g. `H264`).
    pub encoding_name: String,
    pub payload_type: u8,
    /// RTP clock rate in Hz.
    pub clock_rate: u32,
    /// Extra format parameters in announcement order (`a=fmtp` material).
    pub parameters: Vec<(String, String)>,
}

impl MediaFormat {
    pub fn new(media: &str, encoding_name: &str, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            media: media.to_string(),
            encoding_name: encoding_name.to_string(),
            payload_type,
            clock_rate,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.push((name.to_string(), value.to_string()));
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} pt={}",
            self.media, self.encoding_name, self.clock_rate, self.payload_type
        )?;
        for (name, value) in &self.parameters {
            write!(f, ";{}={}", name, value)?;
        }
        Ok(())
    }
}

/// Values for the RTSP `RTP-Info` header of a PLAY response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpInfo {
    pub ssrc: u32,
    pub rtptime: u32,
    pub seq: u16,
}
