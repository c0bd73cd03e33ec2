//! Address resolution, dual-stack connect and listen, UDP port search.

use crate::config::IpVersion;
use crate::{Error, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};

/// Backlog of the control listener.
pub const LISTEN_BACKLOG: i32 = 128;

/// Opens the control connection to `host:port`.
///
/// With a pinned version only that family is tried. With
/// [`IpVersion::Auto`] IPv6 is tried first and IPv4 only if IPv6 fails,
/// either at resolution or at connect. There are no further retries.
///
/// Returns the stream together with the family actually used.
///
/// # Examples
///
/// ```no_run
/// use attract::connector::connect;
/// use attract::IpVersion;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (stream, family) = connect("localhost", 31432, IpVersion::Auto).await?;
/// println!("connected over IPv{}", family);
/// # Ok(())
/// # }
/// ```
pub async fn connect(host: &str, port: u16, version: IpVersion) -> Result<(TcpStream, IpVersion)> {
    match version {
        IpVersion::V4 | IpVersion::V6 => {
            let stream = connect_family(host, port, version).await?;
            Ok((stream, version))
        }
        IpVersion::Auto => match connect_family(host, port, IpVersion::V6).await {
            Ok(stream) => Ok((stream, IpVersion::V6)),
            Err(e) => {
                debug!("IPv6 attempt to {} failed ({}), falling back to IPv4", host, e);
                let stream = connect_family(host, port, IpVersion::V4).await?;
                Ok((stream, IpVersion::V4))
            }
        },
    }
}

async fn connect_family(host: &str, port: u16, family: IpVersion) -> Result<TcpStream> {
    let candidates: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::Connection(format!("host {}: {}", host, e)))?
        .filter(|addr| family.matches(&addr.ip()))
        .collect();

    if candidates.is_empty() {
        return Err(Error::Connection(format!(
            "host {}: no IPv{} address",
            host, family
        )));
    }

    let mut last_error = None;
    for addr in candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(Error::Connection(format!(
        "connect to {} port {} over IPv{}: {}",
        host,
        port,
        family,
        last_error.map_or_else(|| "no address".to_string(), |e| e.to_string())
    )))
}

/// Binds the server's control listener.
///
/// With an explicit `bind_addr` exactly that address is used. Otherwise an
/// IPv6 wildcard socket that also accepts IPv4-mapped peers is tried first,
/// and an IPv4 wildcard socket only if that bind fails.
pub async fn listen(bind_addr: Option<IpAddr>, port: u16) -> Result<TcpListener> {
    if let Some(ip) = bind_addr {
        let addr = SocketAddr::new(ip, port);
        return listen_on(addr)
            .map_err(|e| Error::Connection(format!("bind {}: {}", addr, e)));
    }

    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match listen_on(v6) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            warn!("IPv6 listen on port {} failed ({}), trying IPv4", port, e);
            let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            listen_on(v4).map_err(|e| Error::Connection(format!("bind {}: {}", v4, e)))
        }
    }
}

fn listen_on(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;

    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            debug!("IPv4-mapped addresses unavailable on {}: {}", addr, e);
        }
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Finds a free UDP port for one session.
///
/// Ports are tried one by one starting at `base_port`. A base port of `0`
/// lets the system pick.
pub async fn bind_udp_data(version: IpVersion, base_port: u16) -> Result<UdpSocket> {
    let ip = match version {
        IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpVersion::V6 | IpVersion::Auto => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let mut port = base_port;
    loop {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => {
                debug!("UDP data socket bound to {}", socket.local_addr()?);
                return Ok(socket);
            }
            Err(e) => debug!("UDP port {} unavailable: {}", port, e),
        }

        port = match port.checked_add(1) {
            Some(next) if base_port != 0 => next,
            _ => {
                return Err(Error::Connection(format!(
                    "no free UDP port at or above {}",
                    base_port
                )))
            }
        };
    }
}

/// Opens the client's UDP socket in the family of `server`.
pub async fn client_udp_socket(server: SocketAddr) -> Result<UdpSocket> {
    let local = match server {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    Ok(UdpSocket::bind(local).await?)
}
