//! Packet-sized send and receive over the session's data channel.
//!
//! TCP sessions use the control stream itself; UDP sessions use a dedicated
//! datagram socket. Either way the measurement loop sees one interface and
//! one set of outcomes.

use crate::{Error, Result};
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;

/// Result of a single receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A packet of this many bytes was received.
    Packet(usize),
    /// No datagram arrived within the timeout window (UDP only).
    TimedOut,
    /// The peer closed the stream on a packet boundary.
    Closed,
}

/// A UDP data socket plus whatever is needed to reach and watch the peer.
pub struct UdpChannel<'a> {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    learn_peer: bool,
    control: Option<&'a mut TcpStream>,
}

/// The data channel of one session.
pub enum DataChannel<'a> {
    Tcp(&'a mut TcpStream),
    Udp(UdpChannel<'a>),
}

impl<'a> DataChannel<'a> {
    /// Data flows over the control stream.
    pub fn tcp(stream: &'a mut TcpStream) -> Self {
        DataChannel::Tcp(stream)
    }

    /// Client side of a UDP session: every datagram goes to `server`.
    pub fn udp_client(socket: UdpSocket, server: SocketAddr) -> Self {
        DataChannel::Udp(UdpChannel {
            socket,
            peer: Some(server),
            learn_peer: false,
            control: None,
        })
    }

    /// Server side of a UDP session.
    ///
    /// The peer address is learned from incoming datagrams. While waiting for
    /// a datagram the control stream is watched, so a client that goes away
    /// ends the receive loop instead of leaving it waiting forever.
    pub fn udp_server(socket: UdpSocket, control: &'a mut TcpStream) -> Self {
        DataChannel::Udp(UdpChannel {
            socket,
            peer: None,
            learn_peer: true,
            control: Some(control),
        })
    }

    /// Sends one packet. Any error is fatal for the session.
    pub async fn send(&mut self, packet: &[u8]) -> Result<()> {
        match self {
            DataChannel::Tcp(stream) => {
                stream.write_all(packet).await?;
                Ok(())
            }
            DataChannel::Udp(udp) => {
                let peer = udp.peer.ok_or_else(|| {
                    Error::Protocol("no UDP peer known yet".to_string())
                })?;
                udp.socket.send_to(packet, peer).await?;
                Ok(())
            }
        }
    }

    /// Receives one packet into `buf`.
    ///
    /// TCP reads until `buf` is full and ignores `timeout`. A stream that ends
    /// part-way through a packet yields [`Error::PeerClosed`]; one that ends
    /// exactly on a packet boundary yields [`RecvOutcome::Closed`].
    ///
    /// UDP waits at most `timeout` for one datagram and reports
    /// [`RecvOutcome::TimedOut`] otherwise. The caller does the counting.
    pub async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<RecvOutcome> {
        match self {
            DataChannel::Tcp(stream) => recv_tcp(stream, buf).await,
            DataChannel::Udp(udp) => udp.recv(buf, timeout).await,
        }
    }
}

async fn recv_tcp(stream: &mut TcpStream, buf: &mut [u8]) -> Result<RecvOutcome> {
    let mut filled = 0;

    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(RecvOutcome::Closed);
            }
            debug!("stream ended after {} of {} bytes", filled, buf.len());
            return Err(Error::PeerClosed);
        }
        filled += n;
    }

    Ok(RecvOutcome::Packet(filled))
}

impl UdpChannel<'_> {
    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<RecvOutcome> {
        let UdpChannel {
            socket,
            peer,
            learn_peer,
            control,
        } = self;

        let datagram = time::timeout(timeout, socket.recv_from(buf));
        let hangup = async {
            let mut probe = [0u8; 1];
            match control.as_deref_mut() {
                Some(stream) => stream.read(&mut probe).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            received = datagram => match received {
                Ok(Ok((n, from))) => {
                    if *learn_peer {
                        *peer = Some(from);
                    }
                    Ok(RecvOutcome::Packet(n))
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Ok(RecvOutcome::TimedOut),
            },
            probed = hangup => match probed {
                Ok(0) | Err(_) => Ok(RecvOutcome::Closed),
                Ok(_) => Err(Error::Protocol(
                    "unexpected data on control channel during UDP transfer".to_string(),
                )),
            },
        }
    }
}
