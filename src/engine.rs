//! The packet loops on both ends of a session.
//!
//! The client sends packets until its termination criterion is met and
//! marks the last one with [`END_MARKER`]. The server receives until it
//! sees that marker or the client goes away, echoing every packet back for
//! bidirectional sessions.

use crate::channel::{DataChannel, RecvOutcome};
use crate::config::{Config, Direction, Termination};
use crate::measurements::MeasurementState;
use crate::protocol::HandshakeRequest;
use crate::{Error, Result};
use log::{debug, trace};
use std::time::Duration;

/// First byte of the final data packet.
pub const END_MARKER: u8 = b'E';

/// Filler for every other byte of an outgoing packet.
pub const FILL_BYTE: u8 = b'X';

/// A duration-bound loop only looks at the clock every this many packets.
pub const TIME_CHECK_INTERVAL: u64 = 32;

/// Builds the final packet of a transfer.
pub fn marker_packet(packet_len: usize) -> Vec<u8> {
    let mut packet = vec![FILL_BYTE; packet_len];
    if let Some(first) = packet.first_mut() {
        *first = END_MARKER;
    }
    packet
}

/// Whether the packet numbered `state.packets_sent` is the last one.
fn is_last_packet(termination: Termination, state: &MeasurementState) -> bool {
    match termination {
        Termination::Count(count) => state.packets_sent >= count,
        Termination::Duration(duration) => {
            state.packets_sent % TIME_CHECK_INTERVAL == 0 && state.started.elapsed() >= duration
        }
    }
}

/// Client send loop.
///
/// Runs until the marked packet has been sent (and, for bidirectional
/// sessions, its echo awaited), then moves `state` to draining. A UDP echo
/// that never arrives is counted in `state.timeouts` and treated as loss.
pub async fn send_loop(
    channel: &mut DataChannel<'_>,
    config: &Config,
    state: &mut MeasurementState,
) -> Result<()> {
    let termination = config.termination();
    let mut packet = vec![FILL_BYTE; config.packet_len];
    let mut echo = vec![0u8; config.packet_len];

    loop {
        state.packets_sent += 1;

        let last = is_last_packet(termination, state);
        if last {
            packet[0] = END_MARKER;
        }

        channel.send(&packet).await?;

        if config.direction == Direction::Bi {
            match channel.recv(&mut echo, config.udp_timeout).await? {
                RecvOutcome::Packet(_) => state.packets_received += 1,
                RecvOutcome::TimedOut => {
                    state.timeouts += 1;
                    trace!("echo of packet {} lost", state.packets_sent);
                }
                RecvOutcome::Closed => return Err(Error::PeerClosed),
            }
        }

        if last {
            break;
        }
    }

    state.begin_drain();
    debug!(
        "sent {} packets in {:.2}s",
        state.packets_sent,
        state.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Server receive loop.
///
/// Only the end-of-transfer marker or the client closing the connection
/// ends the loop. A UDP receive timeout is counted and the loop goes on,
/// since a lost datagram is not the end of the transfer.
pub async fn receive_loop(
    channel: &mut DataChannel<'_>,
    request: &HandshakeRequest,
    udp_timeout: Duration,
    state: &mut MeasurementState,
) -> Result<()> {
    let mut buf = vec![0u8; request.packet_len];

    loop {
        match channel.recv(&mut buf, udp_timeout).await? {
            RecvOutcome::Packet(n) => {
                state.packets_received += 1;

                if request.direction == Direction::Bi {
                    channel.send(&buf[..n]).await?;
                    state.packets_sent += 1;
                }

                if n > 0 && buf[0] == END_MARKER {
                    debug!("end of transfer after {} packets", state.packets_received);
                    break;
                }
            }
            RecvOutcome::TimedOut => {
                state.timeouts += 1;
                debug!("UDP receive timed out ({} so far)", state.timeouts);
            }
            RecvOutcome::Closed => {
                debug!("client closed after {} packets", state.packets_received);
                break;
            }
        }
    }

    state.begin_drain();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpVersion, Protocol};
    use crate::measurements::Phase;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn request(direction: Direction, packet_len: usize) -> HandshakeRequest {
        HandshakeRequest {
            ip_version: IpVersion::V4,
            protocol: Protocol::Tcp,
            direction,
            packet_len,
        }
    }

    #[test]
    fn test_marker_packet() {
        let packet = marker_packet(4);
        assert_eq!(packet, b"EXXX");
        assert_eq!(marker_packet(1), b"E");
        assert!(marker_packet(0).is_empty());
    }

    #[test]
    fn test_duration_checked_every_32_packets() {
        let mut state = MeasurementState::start();
        let expired = Termination::Duration(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(1));

        state.packets_sent = 31;
        assert!(!is_last_packet(expired, &state));
        state.packets_sent = 32;
        assert!(is_last_packet(expired, &state));
        state.packets_sent = 33;
        assert!(!is_last_packet(expired, &state));

        let pending = Termination::Duration(Duration::from_secs(3600));
        state.packets_sent = 64;
        assert!(!is_last_packet(pending, &state));
    }

    #[tokio::test]
    async fn test_send_loop_counted_marks_only_last() {
        let (mut client, mut server) = tcp_pair().await;
        let config = Config::client("127.0.0.1".to_string(), 0)
            .with_packet_len(16)
            .with_count(5);

        let reader = tokio::spawn(async move {
            let mut packets = Vec::new();
            let mut buf = [0u8; 16];
            while server.read_exact(&mut buf).await.is_ok() {
                packets.push(buf);
            }
            packets
        });

        let mut state = MeasurementState::start();
        let mut channel = DataChannel::tcp(&mut client);
        send_loop(&mut channel, &config, &mut state).await.unwrap();
        drop(channel);
        drop(client);

        assert_eq!(state.packets_sent, 5);
        assert_eq!(state.phase, Phase::Draining);

        let packets = reader.await.unwrap();
        assert_eq!(packets.len(), 5);
        for packet in &packets[..4] {
            assert_eq!(packet[0], FILL_BYTE);
        }
        assert_eq!(packets[4][0], END_MARKER);
    }

    #[tokio::test]
    async fn test_send_loop_timed_stops() {
        let (mut client, mut server) = tcp_pair().await;
        let config = Config::client("127.0.0.1".to_string(), 0)
            .with_packet_len(8)
            .with_duration(Duration::from_millis(50));

        let reader = tokio::spawn(async move {
            let mut sink = Vec::new();
            server.read_to_end(&mut sink).await.unwrap();
            sink.len()
        });

        let mut state = MeasurementState::start();
        let mut channel = DataChannel::tcp(&mut client);
        send_loop(&mut channel, &config, &mut state).await.unwrap();
        drop(channel);
        drop(client);

        assert_eq!(state.packets_sent % TIME_CHECK_INTERVAL, 0);
        assert!(state.elapsed() >= Duration::from_millis(50));
        assert_eq!(reader.await.unwrap() as u64, state.packets_sent * 8);
    }

    #[tokio::test]
    async fn test_receive_loop_stops_at_marker_and_echoes() {
        let (mut client, mut server) = tcp_pair().await;

        let peer = tokio::spawn(async move {
            let mut echoed = 0;
            let mut buf = [0u8; 4];
            for _ in 0..3 {
                client.write_all(b"XXXX").await.unwrap();
                client.read_exact(&mut buf).await.unwrap();
                echoed += 1;
            }
            client.write_all(b"EXXX").await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"EXXX");
            echoed + 1
        });

        let mut state = MeasurementState::start();
        let mut channel = DataChannel::tcp(&mut server);
        receive_loop(
            &mut channel,
            &request(Direction::Bi, 4),
            Duration::from_secs(1),
            &mut state,
        )
        .await
        .unwrap();

        assert_eq!(state.packets_received, 4);
        assert_eq!(state.packets_sent, 4);
        assert_eq!(state.timeouts, 0);
        assert_eq!(peer.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_receive_loop_ends_on_close() {
        let (mut client, mut server) = tcp_pair().await;
        client.write_all(b"XXXXXXXX").await.unwrap();
        drop(client);

        let mut state = MeasurementState::start();
        let mut channel = DataChannel::tcp(&mut server);
        receive_loop(
            &mut channel,
            &request(Direction::Uni, 4),
            Duration::from_secs(1),
            &mut state,
        )
        .await
        .unwrap();

        assert_eq!(state.packets_received, 2);
        assert_eq!(state.phase, Phase::Draining);
    }

    #[tokio::test]
    async fn test_receive_loop_fails_on_short_packet() {
        let (mut client, mut server) = tcp_pair().await;
        client.write_all(b"XXXXXX").await.unwrap();
        drop(client);

        let mut state = MeasurementState::start();
        let mut channel = DataChannel::tcp(&mut server);
        let result = receive_loop(
            &mut channel,
            &request(Direction::Uni, 4),
            Duration::from_secs(1),
            &mut state,
        )
        .await;

        assert!(matches!(result, Err(Error::PeerClosed)));
        assert_eq!(state.packets_received, 1);
    }
}
