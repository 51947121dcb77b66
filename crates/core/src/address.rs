//! Multicast addresses and the pool they are checked out from.
//!
//! The pool itself lives outside this crate. A [`Stream`](crate::Stream)
//! only needs two things from it: hand out an address matching some
//! [`AddressFlags`], or reserve one exact `host/port/ttl` combination. What
//! comes back is held as an [`AddressLease`], which gives the address back
//! to the pool when dropped.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Constraints on an address requested from an [`AddressPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AddressFlags(u8);

impl AddressFlags {
    pub const NONE: Self = Self(0);
    pub const IPV4: Self = Self(1 << 0);
    pub const IPV6: Self = Self(1 << 1);
    /// The first port of the range must be even (RTP convention).
    pub const EVEN_PORT: Self = Self(1 << 2);
    pub const MULTICAST: Self = Self(1 << 3);
    pub const UNICAST: Self = Self(1 << 4);

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AddressFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A host plus a run of consecutive ports, as handed out by a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    /// First port of the range.
    pub port: u16,
    /// Number of consecutive ports starting at `port`.
    pub n_ports: u16,
    /// Multicast time-to-live.
    pub ttl: u8,
    pub flags: AddressFlags,
}

impl Address {
    pub fn is_multicast(&self) -> bool {
        self.flags.contains(AddressFlags::MULTICAST)
    }

    /// Whether this address is exactly what a reservation for
    /// `host:port` with `n_ports` ports and `ttl` would produce.
    pub fn matches(&self, host: &str, port: u16, n_ports: u16, ttl: u8) -> bool {
        self.host == host && self.port == port && self.n_ports == n_ports && self.ttl == ttl
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{} ttl={}",
            self.host, self.port, self.n_ports, self.ttl
        )
    }
}

/// Source of multicast addresses shared between streams.
///
/// Implementations must be thread-safe: several streams may acquire and
/// release concurrently.
pub trait AddressPool: Send + Sync {
    /// Take any free address satisfying `flags` with `n_ports` ports.
    fn acquire(&self, flags: AddressFlags, n_ports: u16) -> Option<Address>;

    /// Take exactly `host:port` (and the following `n_ports - 1` ports).
    fn reserve(&self, host: &str, port: u16, n_ports: u16, ttl: u8) -> Option<Address>;

    /// Return an address obtained from [`acquire`](Self::acquire) or
    /// [`reserve`](Self::reserve).
    fn release(&self, address: &Address);
}

/// An address checked out of a pool. Released back on drop.
pub struct AddressLease {
    address: Address,
    pool: Arc<dyn AddressPool>,
}

impl AddressLease {
    pub(crate) fn new(address: Address, pool: Arc<dyn AddressPool>) -> Self {
        Self { address, pool }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        tracing::debug!(address = %self.address, "releasing address back to pool");
        self.pool.release(&self.address);
    }
}

impl fmt::Debug for AddressLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressLease")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
