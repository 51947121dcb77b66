use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rtsp_stream::pipeline::local::LocalPipeline;
use rtsp_stream::{MediaFormat, PortRange, Stream, StreamConfig, StreamTransport};

#[derive(Parser)]
#[command(
    name = "stream-relay",
    about = "Relay a generated RTP stream to a UDP client"
)]
struct Args {
    /// Client RTP destination (host:port); RTCP goes to port + 1
    #[arg(long, short)]
    dest: String,

    /// Number of packets to send
    #[arg(long, short, default_value_t = 250)]
    count: u32,

    /// Delay between packets in milliseconds
    #[arg(long, default_value_t = 40)]
    interval_ms: u64,

    /// RTP payload type
    #[arg(long, default_value_t = 96)]
    pt: u8,

    /// Payload bytes per packet
    #[arg(long, default_value_t = 1000)]
    payload_size: usize,

    /// Bind the server ports on IPv6
    #[arg(long)]
    ipv6: bool,
}

/// RTP timestamp step per packet at a 90 kHz clock.
fn timestamp_step(interval_ms: u64) -> u32 {
    u32::try_from(interval_ms.saturating_mul(90)).unwrap_or(u32::MAX)
}

/// Repeating byte ramp starting at `seed`.
fn test_pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize + i) as u8).collect()
}

fn parse_dest(dest: &str) -> Option<(String, u16)> {
    let (host, port) = dest.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port.parse().ok()?))
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let Some((host, port)) = parse_dest(&args.dest) else {
        eprintln!("Invalid destination {}, expected host:port", args.dest);
        return;
    };

    let pipeline = Arc::new(LocalPipeline::new(args.pt));
    let config = StreamConfig {
        ipv6: args.ipv6,
        ..StreamConfig::default()
    };
    let stream = Stream::with_config(0, pipeline.clone(), config);

    if let Err(e) = stream.join() {
        eprintln!("Failed to join stream: {}", e);
        return;
    }
    pipeline.announce_format(MediaFormat::new("application", "X-TEST", args.pt, 90000));

    let transport = Arc::new(StreamTransport::udp_unicast(
        &host,
        PortRange::new(port, port.saturating_add(1)),
    ));
    if let Err(e) = stream.add_transport(&transport) {
        eprintln!("Failed to add transport: {}", e);
        let _ = stream.leave();
        return;
    }

    if let Ok(server) = stream.server_port() {
        println!("server_port={} destination={}", server, transport);
    }
    if let Ok(Some(info)) = stream.rtp_info() {
        println!("ssrc={:08x} seq={} rtptime={}", info.ssrc, info.seq, info.rtptime);
    }

    let step = timestamp_step(args.interval_ms);
    let interval = Duration::from_millis(args.interval_ms);
    for n in 0..args.count {
        pipeline.send_payload(&test_pattern(n, args.payload_size), true, step);
        thread::sleep(interval);
    }
    tracing::info!(packets = args.count, "relay finished");

    if let Err(e) = stream.remove_transport(&transport) {
        eprintln!("Failed to remove transport: {}", e);
    }
    if let Err(e) = stream.leave() {
        eprintln!("Failed to leave stream: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_forms() {
        assert_eq!(parse_dest("10.0.0.5:5000"), Some(("10.0.0.5".to_string(), 5000)));
        assert_eq!(parse_dest("[::1]:5000"), Some(("::1".to_string(), 5000)));
        assert_eq!(parse_dest("10.0.0.5"), None);
    }

    #[test]
    fn timestamp_follows_interval() {
        assert_eq!(timestamp_step(40), 3600);
        assert_eq!(timestamp_step(u64::MAX), u32::MAX);
    }

    #[test]
    fn pattern_wraps() {
        let pattern = test_pattern(254, 4);
        assert_eq!(pattern, vec![254, 255, 0, 1]);
    }
}
