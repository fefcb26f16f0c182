//! Wire-level newtypes shared by every layer of the stack: addresses,
//! protocol enums, and the internal error type.
//!
//! Kept dependency-free and `std`-only-by-convenience (no `no_std` concerns
//! here — this stack runs as an ordinary userspace process) so every other
//! crate can depend on it without pulling in logging or threading.

mod addr;
mod error;
mod proto;

pub use addr::{DevIndex, Ipv4Addr, MacAddr, Port, SockAddr};
pub use error::NetError;
pub use proto::{EtherType, IpProtocol};

pub type NetResult<T> = Result<T, NetError>;
