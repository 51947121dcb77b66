pub mod address;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod stream;
pub mod transport;

pub use address::{Address, AddressFlags, AddressLease, AddressPool};
pub use error::{Result, StreamError};
pub use media::{MediaFormat, RtpInfo};
pub use pipeline::{Direction, MediaPipeline, RtpSession};
pub use stream::{Stream, StreamConfig};
pub use transport::{LowerTransport, PortRange, StreamTransport, TransportSink};
