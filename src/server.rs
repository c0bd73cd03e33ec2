use crate::channel::DataChannel;
use crate::config::{Config, Protocol};
use crate::connector;
use crate::engine;
use crate::measurements::MeasurementState;
use crate::protocol::{
    deserialize_message, write_message, HandshakeRequest, HandshakeResponse, ResultReport,
};
use crate::stats::to_ticks;
use crate::Result;
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Measurement server.
///
/// The `Server` accepts control connections and hands each one to its own
/// task, which owns that connection for its whole life: handshake, UDP port
/// allocation, receive loop, result report, teardown. Tasks share nothing,
/// so any number of measurements can run at the same time.
///
/// # Examples
///
/// ```no_run
/// use attract::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(31432));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop when cancelled.
    ///
    /// Sessions already running are left to finish on their own.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use attract::{Config, Server};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let server = Server::new(Config::server(31432));
    /// let stop = server.cancellation_token().clone();
    ///
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(60)).await;
    ///     stop.cancel();
    /// });
    ///
    /// server.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Binds the control port and serves until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only if neither an IPv6 nor an IPv4 listener can be
    /// bound. Failures of individual sessions are logged and never stop the
    /// server.
    pub async fn run(&self) -> Result<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Binds the control listener: dual-stack IPv6 first, IPv4 as fallback.
    pub async fn listen(&self) -> Result<TcpListener> {
        connector::listen(self.config.bind_addr, self.config.port).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("attract server accepting on {}", listener.local_addr()?);

        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("server shutting down, {} session(s) still running", workers.len());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let config = self.config.clone();
                        workers.spawn(async move {
                            let outcome = handle_connection(stream, addr, config).await;
                            (addr, outcome)
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                },
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    reap(finished);
                }
            }
        }

        workers.detach_all();
        Ok(())
    }
}

fn reap(finished: std::result::Result<(SocketAddr, Result<ResultReport>), JoinError>) {
    match finished {
        Ok((addr, Ok(report))) => info!(
            "Session with {} completed: {} packets received, {} timeouts, {} cpu ticks",
            addr, report.packets_received, report.timeouts, report.server_cpu_ticks
        ),
        Ok((addr, Err(e))) => error!("Error handling client {}: {}", addr, e),
        Err(e) => error!("Session task failed: {}", e),
    }
}

/// Runs one session on an accepted control connection.
///
/// Returns the report that was sent to the client.
pub async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: Config,
) -> Result<ResultReport> {
    let request: HandshakeRequest = deserialize_message(&mut stream).await?;
    info!(
        "Client {} setup: IPv{} {} {}directional, {} bytes",
        addr, request.ip_version, request.protocol, request.direction, request.packet_len
    );

    let udp_socket = match request.protocol {
        Protocol::Udp => Some(connector::bind_udp_data(request.ip_version, config.port).await?),
        Protocol::Tcp => None,
    };
    let udp_port = match &udp_socket {
        Some(socket) => socket.local_addr()?.port(),
        None => 0,
    };
    write_message(&mut stream, &HandshakeResponse { udp_port }).await?;
    debug!("session with {} ready, UDP port {}", addr, udp_port);

    let mut state = MeasurementState::start();
    {
        let mut channel = match udp_socket {
            Some(socket) => DataChannel::udp_server(socket, &mut stream),
            None => DataChannel::tcp(&mut stream),
        };
        engine::receive_loop(&mut channel, &request, config.udp_timeout, &mut state).await?;
    }
    state.stop_clock();

    let report = ResultReport {
        packets_received: state.packets_received,
        timeouts: state.timeouts,
        server_cpu_ticks: to_ticks(state.cpu_used()),
    };
    write_message(&mut stream, &report).await?;
    state.finish();

    Ok(report)
}
