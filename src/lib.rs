//! attract - a two-endpoint network throughput tester
//!
//! A server accepts control connections and, per session, receives a stream
//! of fixed-size packets over TCP or UDP. A client drives the session, sends
//! packets until a count or a duration is reached, collects the server's
//! counters and computes throughput, packet loss and how much CPU both ends
//! burned doing it.
//!
//! # Features
//!
//! - TCP and UDP data transfer over IPv4 or IPv6
//! - Unidirectional or bidirectional (echoed) sessions
//! - Packet count or wall-clock duration as the stop criterion
//! - UDP loss accounting with a per-receive timeout window
//! - Concurrent sessions on one server, one task per client
//! - Human-readable, single-line raw or JSON output
//!
//! # Example
//!
//! ```no_run
//! use attract::{Client, Config, Protocol};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::client("127.0.0.1".to_string(), attract::DEFAULT_PORT)
//!     .with_protocol(Protocol::Udp)
//!     .with_count(1000);
//!
//! let report = Client::new(config)?.run().await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod measurements;
pub mod protocol;
pub mod server;
pub mod stats;

pub use client::Client;
pub use config::{Config, Direction, IpVersion, Mode, Protocol, Termination, DEFAULT_PORT};
pub use error::{Error, Result};
pub use server::Server;
pub use stats::{Report, Statistics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
