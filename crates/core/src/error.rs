//! Error types for the stream transport manager.

/// Errors returned by [`Stream`](crate::Stream) operations and the
/// components it drives.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Addresses**: [`NoPool`](Self::NoPool),
///   [`AllocationFailed`](Self::AllocationFailed),
///   [`ConflictingReservation`](Self::ConflictingReservation).
/// - **Ports and wiring**: [`PortAllocationFailed`](Self::PortAllocationFailed),
///   [`BindFailed`](Self::BindFailed), [`Io`](Self::Io).
/// - **Transports**: [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`NotFound`](Self::NotFound).
/// - **Caller contract**: [`PreconditionViolation`](Self::PreconditionViolation).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying socket error outside of port allocation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A multicast address was requested but no address pool is configured.
    #[error("no address pool configured")]
    NoPool,

    /// The address pool could not satisfy the request.
    #[error("address allocation failed: {0}")]
    AllocationFailed(String),

    /// A different multicast address was already reserved for this stream.
    #[error("address {requested} conflicts with reserved address {reserved}")]
    ConflictingReservation { requested: String, reserved: String },

    /// No even/odd UDP port pair could be bound within the retry budget.
    #[error("failed to allocate an RTP/RTCP port pair after {attempts} attempts")]
    PortAllocationFailed { attempts: u32 },

    /// Ports were bound but the RTP session could not be wired to them.
    #[error("failed to wire stream {index}: {reason}")]
    BindFailed { index: u32, reason: String },

    /// The transport uses a lower transport this stream cannot deliver to.
    #[error("unsupported lower transport: {0}")]
    UnsupportedTransport(String),

    /// The operation was called in a state the caller must never reach.
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),

    /// No registered transport matches the given RTCP origin.
    #[error("no transport found for {0}")]
    NotFound(String),
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
