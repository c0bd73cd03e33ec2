use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Well-known port used by both sides unless overridden.
pub const DEFAULT_PORT: u16 = 31432;

/// Default packet length in bytes.
pub const DEFAULT_PACKET_LEN: usize = 512;

/// Largest packet length accepted by either side.
pub const MAX_PACKET_LEN: usize = 65536;

/// Fixed window a single UDP receive waits before it counts as a timeout.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time the client waits for the result report beyond one UDP timeout.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// IP version preference for the control connection.
///
/// `Auto` means "try IPv6 first, fall back to IPv4". Once a connection is
/// established only `V4` or `V6` is ever sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    Auto,
    V4,
    V6,
}

impl IpVersion {
    /// Wire code (`'4'` or `'6'`); `None` for `Auto`.
    pub fn code(self) -> Option<char> {
        match self {
            IpVersion::Auto => None,
            IpVersion::V4 => Some('4'),
            IpVersion::V6 => Some('6'),
        }
    }

    pub fn matches(self, addr: &IpAddr) -> bool {
        match self {
            IpVersion::Auto => true,
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::Auto => f.pad("auto"),
            IpVersion::V4 => f.pad("4"),
            IpVersion::V6 => f.pad("6"),
        }
    }
}

impl FromStr for IpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4" => Ok(IpVersion::V4),
            "6" => Ok(IpVersion::V6),
            "auto" => Ok(IpVersion::Auto),
            other => Err(Error::Config(format!("wrong value for version: {}", other))),
        }
    }
}

/// Transport protocol type for network testing.
///
/// TCP sessions carry data over the control connection itself, UDP
/// sessions over a separate datagram socket pair.
///
/// # Examples
///
/// ```
/// use attract::{Config, Protocol};
///
/// let config = Config::client("127.0.0.1".to_string(), 31432)
///     .with_protocol(Protocol::Udp);
/// assert_eq!(config.protocol, Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - provides reliable, ordered delivery
    Tcp,
    /// User Datagram Protocol - provides best-effort delivery with lower overhead
    Udp,
}

impl Protocol {
    /// Wire code: `'t'` or `'u'`.
    pub fn code(self) -> char {
        match self {
            Protocol::Tcp => 't',
            Protocol::Udp => 'u',
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.pad("tcp"),
            Protocol::Udp => f.pad("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "t" | "tcp" => Ok(Protocol::Tcp),
            "u" | "udp" => Ok(Protocol::Udp),
            other => Err(Error::Config(format!("wrong value for protocol: {}", other))),
        }
    }
}

/// Direction of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Client sends, server only receives
    Uni,
    /// Server echoes every packet back to the client
    Bi,
}

impl Direction {
    /// Wire code: `'u'` or `'b'`.
    pub fn code(self) -> char {
        match self {
            Direction::Uni => 'u',
            Direction::Bi => 'b',
        }
    }

    /// Number of times each packet crosses the network.
    pub fn factor(self) -> u64 {
        match self {
            Direction::Uni => 1,
            Direction::Bi => 2,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uni => f.pad("uni"),
            Direction::Bi => f.pad("bi"),
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "u" | "uni" => Ok(Direction::Uni),
            "b" | "bi" => Ok(Direction::Bi),
            other => Err(Error::Config(format!("wrong value for direction: {}", other))),
        }
    }
}

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming connections
    Server,
    /// Client mode - connects to a server and drives a measurement
    Client,
}

/// What ends the client's send loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop after this many packets have been sent.
    Count(u64),
    /// Stop once this much wall time has passed.
    Duration(Duration),
}

/// Configuration for an attract client session or server.
///
/// Built once before any networking and never mutated afterwards. Use the
/// builder methods to customize it, then call [`Config::validate`].
///
/// # Examples
///
/// ## Counted TCP run
///
/// ```
/// use attract::{Config, Termination};
///
/// let config = Config::client("192.168.1.100".to_string(), 31432)
///     .with_packet_len(1024)
///     .with_count(1000);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.termination(), Termination::Count(1000));
/// ```
///
/// ## Timed bidirectional UDP run
///
/// ```
/// use attract::{Config, Direction, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("server.example".to_string(), 31432)
///     .with_protocol(Protocol::Udp)
///     .with_direction(Direction::Bi)
///     .with_duration(Duration::from_secs(30));
/// ```
///
/// ## Server
///
/// ```
/// use attract::Config;
///
/// let config = Config::server(31432);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// IP version preference for the control connection
    pub ip_version: IpVersion,

    /// Protocol used for the data channel
    pub protocol: Protocol,

    /// Uni- or bidirectional transfer
    pub direction: Direction,

    /// Packet length in bytes
    pub packet_len: usize,

    /// Packet count; takes precedence over `duration` when set
    pub count: Option<u64>,

    /// Transfer time, used when no count is set
    pub duration: Duration,

    /// Control port; also the first port tried for UDP data sockets
    pub port: u16,

    /// Server host name or address (client mode)
    pub server_addr: Option<String>,

    /// Bind address (server mode); disables dual-stack fallback
    pub bind_addr: Option<IpAddr>,

    /// Window of a single UDP receive; both peers must agree on it
    pub udp_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            ip_version: IpVersion::Auto,
            protocol: Protocol::Tcp,
            direction: Direction::Uni,
            packet_len: DEFAULT_PACKET_LEN,
            count: None,
            duration: Duration::from_secs(10),
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
        }
    }
}

impl Config {
    /// Creates a new server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration targeting `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use attract::Config;
    ///
    /// let config = Config::client("192.168.1.100".to_string(), 31432);
    /// assert_eq!(config.packet_len, 512);
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_ip_version(mut self, ip_version: IpVersion) -> Self {
        self.ip_version = ip_version;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_packet_len(mut self, packet_len: usize) -> Self {
        self.packet_len = packet_len;
        self
    }

    /// Ends the transfer after `count` packets. Overrides any duration.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Ends the transfer after `duration`, unless a count is set.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_bind_addr(mut self, bind_addr: IpAddr) -> Self {
        self.bind_addr = Some(bind_addr);
        self
    }

    /// Overrides the UDP receive window. The peer must use the same value,
    /// otherwise the timeout correction in the statistics is wrong.
    pub fn with_udp_timeout(mut self, udp_timeout: Duration) -> Self {
        self.udp_timeout = udp_timeout;
        self
    }

    /// Returns the active termination criterion. A count wins over a duration.
    pub fn termination(&self) -> Termination {
        match self.count {
            Some(count) => Termination::Count(count),
            None => Termination::Duration(self.duration),
        }
    }

    /// How long the client waits for the result report after its last packet.
    pub fn drain_timeout(&self) -> Duration {
        self.udp_timeout + DRAIN_GRACE
    }

    /// Checks the invariants every session relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a packet length outside `1..=65536`,
    /// a zero count or duration, a zero UDP timeout, or a client without host.
    pub fn validate(&self) -> Result<()> {
        if self.packet_len == 0 || self.packet_len > MAX_PACKET_LEN {
            return Err(Error::Config(format!(
                "packet length must be between 1 and {}, got {}",
                MAX_PACKET_LEN, self.packet_len
            )));
        }

        match self.termination() {
            Termination::Count(0) => {
                return Err(Error::Config("packet count must be positive".to_string()));
            }
            Termination::Duration(d) if d.is_zero() => {
                return Err(Error::Config("transfer time must be positive".to_string()));
            }
            _ => {}
        }

        if self.udp_timeout.is_zero() {
            return Err(Error::Config("UDP timeout must be positive".to_string()));
        }

        if self.mode == Mode::Client
            && self
                .server_addr
                .as_deref()
                .map_or(true, |host| host.trim().is_empty())
        {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::client("localhost".to_string(), DEFAULT_PORT);
        assert_eq!(config.ip_version, IpVersion::Auto);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.direction, Direction::Uni);
        assert_eq!(config.packet_len, 512);
        assert_eq!(config.termination(), Termination::Duration(Duration::from_secs(10)));
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_count_takes_precedence() {
        let config = Config::client("localhost".to_string(), DEFAULT_PORT)
            .with_count(100)
            .with_duration(Duration::from_secs(3));
        assert_eq!(config.termination(), Termination::Count(100));
    }

    #[test]
    fn test_packet_len_bounds() {
        let base = Config::client("localhost".to_string(), DEFAULT_PORT);
        assert!(base.clone().with_packet_len(1).validate().is_ok());
        assert!(base.clone().with_packet_len(MAX_PACKET_LEN).validate().is_ok());
        assert!(matches!(
            base.clone().with_packet_len(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.with_packet_len(MAX_PACKET_LEN + 1).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_termination_rejected() {
        let base = Config::client("localhost".to_string(), DEFAULT_PORT);
        assert!(base.clone().with_count(0).validate().is_err());
        assert!(base.with_duration(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_client_requires_host() {
        let mut config = Config::client(" ".to_string(), DEFAULT_PORT);
        assert!(config.validate().is_err());
        config.server_addr = None;
        assert!(config.validate().is_err());
        assert!(Config::server(DEFAULT_PORT).validate().is_ok());
    }

    #[test]
    fn test_parse_flag_values() {
        assert_eq!("4".parse::<IpVersion>().unwrap(), IpVersion::V4);
        assert_eq!("6".parse::<IpVersion>().unwrap(), IpVersion::V6);
        assert!("5".parse::<IpVersion>().is_err());
        assert_eq!("u".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("t".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("x".parse::<Protocol>().is_err());
        assert_eq!("b".parse::<Direction>().unwrap(), Direction::Bi);
        assert_eq!("u".parse::<Direction>().unwrap(), Direction::Uni);
        assert!("z".parse::<Direction>().is_err());
    }

    #[test]
    fn test_ip_version_matches() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(IpVersion::V4.matches(&v4));
        assert!(!IpVersion::V4.matches(&v6));
        assert!(IpVersion::V6.matches(&v6));
        assert!(IpVersion::Auto.matches(&v4));
    }
}
