//! Node configuration and address resolution.

use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::common::Id;

use super::DEFAULT_REQUEST_TIMEOUT;

/// Default base port for the deterministic id-to-port mapping.
pub const DEFAULT_BASE_PORT: u16 = 43544;

pub const DEFAULT_STABILIZE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FIX_FINGERS_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_CHECK_PREDECESSOR_INTERVAL: Duration = Duration::from_secs(3);

/// Maps a ring id to the address its node listens on.
///
/// The resolution must be consistent across every member of a ring.
pub trait ResolveAddress: Send + Sync + Debug {
    fn resolve(&self, id: Id) -> SocketAddrV4;
}

/// The deterministic `host : base_port + id` mapping.
///
/// Suitable for closed local rings only; a real deployment should implement
/// [ResolveAddress] against an explicit discovery registry instead.
#[derive(Debug, Clone)]
pub struct BasePortResolver {
    pub host: Ipv4Addr,
    pub base_port: u16,
}

impl BasePortResolver {
    pub fn new(host: Ipv4Addr, base_port: u16) -> BasePortResolver {
        BasePortResolver { host, base_port }
    }
}

impl Default for BasePortResolver {
    fn default() -> Self {
        BasePortResolver::new(Ipv4Addr::LOCALHOST, DEFAULT_BASE_PORT)
    }
}

impl ResolveAddress for BasePortResolver {
    fn resolve(&self, id: Id) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.base_port + id.as_u64() as u16)
    }
}

#[derive(Debug)]
/// Chord node configurations
pub struct Config {
    /// Maps ring ids to node addresses.
    ///
    /// Defaults to [BasePortResolver] on localhost.
    pub resolver: Box<dyn ResolveAddress>,
    /// RPC request timeout.
    ///
    /// The longer this duration is, the longer a lookup through a dead peer
    /// blocks before the walk falls back to its best guess.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Whether the background maintenance threads run.
    ///
    /// Defaults to true. Local test harnesses disable this and drive
    /// maintenance rounds deterministically instead.
    pub maintenance: bool,
    /// Period of the successor verification loop.
    ///
    /// Defaults to [DEFAULT_STABILIZE_INTERVAL]
    pub stabilize_interval: Duration,
    /// Period of the finger refresh loop.
    ///
    /// Defaults to [DEFAULT_FIX_FINGERS_INTERVAL]
    pub fix_fingers_interval: Duration,
    /// Period of the predecessor liveness loop.
    ///
    /// Defaults to [DEFAULT_CHECK_PREDECESSOR_INTERVAL]
    pub check_predecessor_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolver: Box::new(BasePortResolver::default()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            maintenance: true,
            stabilize_interval: DEFAULT_STABILIZE_INTERVAL,
            fix_fingers_interval: DEFAULT_FIX_FINGERS_INTERVAL,
            check_predecessor_interval: DEFAULT_CHECK_PREDECESSOR_INTERVAL,
        }
    }
}
