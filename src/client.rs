use crate::channel::DataChannel;
use crate::config::{Config, IpVersion, Protocol};
use crate::connector;
use crate::engine::{self, marker_packet};
use crate::measurements::MeasurementState;
use crate::protocol::{
    deserialize_message, write_message, HandshakeRequest, HandshakeResponse, ResultReport,
};
use crate::stats::{get_system_info, Report, Statistics, StatsInput};
use crate::{Error, Result};
use log::{debug, info};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

/// Measurement client.
///
/// Runs one session against one server: connect, handshake, packet loop,
/// wait for the server's result report, compute the statistics.
///
/// # Examples
///
/// ## Counted TCP run
///
/// ```no_run
/// use attract::{Client, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 31432)
///     .with_packet_len(512)
///     .with_count(10_000);
///
/// let report = Client::new(config)?.run().await?;
/// println!("{}", report);
/// # Ok(())
/// # }
/// ```
///
/// ## Timed bidirectional UDP run
///
/// ```no_run
/// use attract::{Client, Config, Direction, Protocol};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 31432)
///     .with_protocol(Protocol::Udp)
///     .with_direction(Direction::Bi)
///     .with_duration(Duration::from_secs(2));
///
/// let report = Client::new(config)?.run().await?;
/// println!("loss: {:.2}%", report.stats.loss_percent);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
}

impl Client {
    /// Creates a client after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration breaks any invariant,
    /// e.g. no server address or a packet length out of range.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the session to completion.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the server cannot be resolved or reached
    /// - [`Error::Protocol`] if the server's answers are malformed
    /// - [`Error::NoResponse`] if the server goes away before its result
    ///   report arrives, or the report does not arrive in time
    pub async fn run(&self) -> Result<Report> {
        let config = &self.config;
        let host = config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;

        info!("Connecting to attract server at {} port {}", host, config.port);
        let (mut stream, family) = connector::connect(host, config.port, config.ip_version).await?;
        let server = stream.peer_addr()?;
        info!("Connected to {} over IPv{}", server, family);

        let request = HandshakeRequest {
            ip_version: family,
            protocol: config.protocol,
            direction: config.direction,
            packet_len: config.packet_len,
        };
        write_message(&mut stream, &request).await?;

        let response: HandshakeResponse = match deserialize_message(&mut stream).await {
            Ok(response) => response,
            Err(Error::PeerClosed) => {
                return Err(Error::Connection(
                    "server closed the connection during the handshake".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };
        debug!("handshake done, UDP port {}", response.udp_port);

        let (state, report) = match config.protocol {
            Protocol::Tcp => {
                let mut state = MeasurementState::start();
                {
                    let mut channel = DataChannel::tcp(&mut stream);
                    engine::send_loop(&mut channel, config, &mut state)
                        .await
                        .map_err(server_gone)?;
                }
                let report = self.drain(&mut stream, None).await?;
                (state, report)
            }
            Protocol::Udp => {
                if response.udp_port == 0 {
                    return Err(Error::Protocol(
                        "server did not provide a UDP port".to_string(),
                    ));
                }
                let data_peer = SocketAddr::new(server.ip(), response.udp_port);
                let socket = connector::client_udp_socket(data_peer).await?;
                let mut channel = DataChannel::udp_client(socket, data_peer);

                let mut state = MeasurementState::start();
                engine::send_loop(&mut channel, config, &mut state).await?;
                let report = self.drain(&mut stream, Some(&mut channel)).await?;
                (state, report)
            }
        };

        Ok(self.finish(state, report, family))
    }

    /// Waits for the result report on the control channel.
    ///
    /// For UDP sessions the end-of-transfer datagram is sent again once per
    /// UDP timeout while waiting, in case the first one was lost.
    async fn drain(
        &self,
        stream: &mut TcpStream,
        mut resend: Option<&mut DataChannel<'_>>,
    ) -> Result<ResultReport> {
        let udp_timeout = self.config.udp_timeout;
        let marker = marker_packet(self.config.packet_len);

        let deadline = time::sleep(self.config.drain_timeout());
        let mut retransmit = time::interval_at(Instant::now() + udp_timeout, udp_timeout);
        let read = deserialize_message::<_, ResultReport>(stream);
        tokio::pin!(deadline, read);

        loop {
            tokio::select! {
                received = &mut read => {
                    return received.map_err(server_gone);
                }
                _ = &mut deadline => return Err(Error::NoResponse),
                _ = retransmit.tick(), if resend.is_some() => {
                    if let Some(channel) = resend.as_deref_mut() {
                        debug!("re-sending end-of-transfer datagram");
                        channel.send(&marker).await?;
                    }
                }
            }
        }
    }

    fn finish(&self, mut state: MeasurementState, report: ResultReport, family: IpVersion) -> Report {
        state.finish();

        let stats = Statistics::compute(&StatsInput {
            elapsed: state.elapsed(),
            client_cpu: state.cpu_used(),
            packets_sent: state.packets_sent,
            report,
            udp_timeout: self.config.udp_timeout,
            packet_len: self.config.packet_len,
            direction: self.config.direction,
        });

        info!(
            "Test completed: {} sent, {} received, {:.0} KiB/s",
            state.packets_sent, report.packets_received, stats.throughput_kib_per_sec
        );

        Report {
            ip_version: family,
            protocol: self.config.protocol,
            direction: self.config.direction,
            packet_len: self.config.packet_len,
            packets_sent: state.packets_sent,
            packets_received: report.packets_received,
            server_timeouts: report.timeouts,
            stats,
            system: get_system_info(),
        }
    }
}

/// Maps the ways a vanished server shows up on the control connection to
/// [`Error::NoResponse`].
fn server_gone(err: Error) -> Error {
    match err {
        Error::PeerClosed => Error::NoResponse,
        Error::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) =>
        {
            Error::NoResponse
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates() {
        assert!(Client::new(Config::client("localhost".to_string(), 31432)).is_ok());
        assert!(matches!(
            Client::new(Config::client("localhost".to_string(), 31432).with_packet_len(0)),
            Err(Error::Config(_))
        ));

        let mut config = Config::client("localhost".to_string(), 31432);
        config.server_addr = None;
        assert!(Client::new(config).is_err());
    }

    #[test]
    fn test_server_gone_mapping() {
        assert!(matches!(server_gone(Error::PeerClosed), Error::NoResponse));
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::BrokenPipe] {
            let err = Error::Io(io::Error::new(kind, "gone"));
            assert!(matches!(server_gone(err), Error::NoResponse));
        }
        let other = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(server_gone(other), Error::Io(_)));
        assert!(matches!(
            server_gone(Error::Protocol("bad".to_string())),
            Error::Protocol(_)
        ));
    }
}
