//! Control channel messages.
//!
//! Every message is a short ASCII line terminated by a single NUL byte and
//! written in one buffer. Plain text keeps the exchange independent of the
//! byte order and word size of either host.
//!
//! # Protocol Flow
//!
//! 1. Client sends a [`HandshakeRequest`]: `"<ipver> <proto> <direction> <length>\n"`
//! 2. Server answers with a [`HandshakeResponse`]: the UDP data port, `0` for TCP
//! 3. Data packets flow (on the control stream for TCP, on UDP otherwise)
//! 4. Server sends a [`ResultReport`]: `"<received> <timeouts> <cpu_ticks>\n"`
//!
//! # Examples
//!
//! ```
//! use attract::protocol::{ControlMessage, HandshakeRequest};
//! use attract::{Direction, IpVersion, Protocol};
//!
//! let request = HandshakeRequest {
//!     ip_version: IpVersion::V6,
//!     protocol: Protocol::Tcp,
//!     direction: Direction::Uni,
//!     packet_len: 512,
//! };
//! assert_eq!(request.encode(), "6 t u 512\n");
//! assert_eq!(HandshakeRequest::decode("6 t u 512\n").unwrap(), request);
//! ```

use crate::config::{Direction, IpVersion, Protocol, MAX_PACKET_LEN};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Terminator written after every control message.
pub const MESSAGE_TERMINATOR: u8 = 0;

/// Upper bound on a control message; anything longer is a peer mismatch.
pub const MAX_MESSAGE_LEN: usize = 128;

/// A message that travels on the control channel as one NUL-terminated line.
pub trait ControlMessage: Sized {
    /// Text form, without the terminator.
    fn encode(&self) -> String;

    /// Parses the text form. Malformed fields are a [`Error::Protocol`].
    fn decode(text: &str) -> Result<Self>;
}

/// First message of a session, sent by the client right after connecting.
///
/// The server configures its side of the session from this line alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Family of the established control connection; never `Auto`
    pub ip_version: IpVersion,
    pub protocol: Protocol,
    pub direction: Direction,
    pub packet_len: usize,
}

/// Server answer to the handshake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// UDP data port the server bound for this session, `0` for TCP sessions
    pub udp_port: u16,
}

/// Counters the server reports once the transfer has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultReport {
    pub packets_received: u64,
    /// Number of UDP receives that ran into the timeout window
    pub timeouts: u64,
    /// Server CPU (user + system) spent in the loop, in hundredths of a second
    pub server_cpu_ticks: u64,
}

fn malformed(what: &str, text: &str) -> Error {
    Error::Protocol(format!("malformed {}: {:?}", what, text))
}

fn single_char(field: &str) -> Option<char> {
    let mut chars = field.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

impl ControlMessage for HandshakeRequest {
    fn encode(&self) -> String {
        // Auto never reaches the wire; the connector resolves it first.
        let ipver = self.ip_version.code().unwrap_or('6');
        format!(
            "{} {} {} {}\n",
            ipver,
            self.protocol.code(),
            self.direction.code(),
            self.packet_len
        )
    }

    fn decode(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(malformed("handshake request", text));
        }

        let ip_version = match single_char(fields[0]) {
            Some('4') => IpVersion::V4,
            Some('6') => IpVersion::V6,
            _ => return Err(malformed("handshake request", text)),
        };
        let protocol = match single_char(fields[1]) {
            Some('t') => Protocol::Tcp,
            Some('u') => Protocol::Udp,
            _ => return Err(malformed("handshake request", text)),
        };
        let direction = match single_char(fields[2]) {
            Some('u') => Direction::Uni,
            Some('b') => Direction::Bi,
            _ => return Err(malformed("handshake request", text)),
        };
        let packet_len: usize = fields[3]
            .parse()
            .map_err(|_| malformed("handshake request", text))?;
        if packet_len == 0 || packet_len > MAX_PACKET_LEN {
            return Err(Error::Protocol(format!(
                "packet length {} out of range",
                packet_len
            )));
        }

        Ok(HandshakeRequest {
            ip_version,
            protocol,
            direction,
            packet_len,
        })
    }
}

impl ControlMessage for HandshakeResponse {
    fn encode(&self) -> String {
        self.udp_port.to_string()
    }

    fn decode(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(HandshakeResponse { udp_port: 0 });
        }
        let udp_port = text
            .parse()
            .map_err(|_| malformed("handshake response", text))?;
        Ok(HandshakeResponse { udp_port })
    }
}

impl ControlMessage for ResultReport {
    fn encode(&self) -> String {
        format!(
            "{} {} {}\n",
            self.packets_received, self.timeouts, self.server_cpu_ticks
        )
    }

    fn decode(text: &str) -> Result<Self> {
        let values = text
            .split_whitespace()
            .map(|field| field.parse::<u64>())
            .collect::<std::result::Result<Vec<u64>, _>>()
            .map_err(|_| malformed("result report", text))?;

        match values.as_slice() {
            [packets_received, timeouts, server_cpu_ticks] => Ok(ResultReport {
                packets_received: *packets_received,
                timeouts: *timeouts,
                server_cpu_ticks: *server_cpu_ticks,
            }),
            _ => Err(malformed("result report", text)),
        }
    }
}

/// Serializes a control message into its on-wire bytes.
///
/// The result is the ASCII text followed by one NUL byte; there is no
/// length prefix.
///
/// # Examples
///
/// ```
/// use attract::protocol::{serialize_message, HandshakeResponse};
///
/// let bytes = serialize_message(&HandshakeResponse { udp_port: 31433 });
/// assert_eq!(bytes, b"31433\0");
/// ```
pub fn serialize_message<M: ControlMessage>(msg: &M) -> Vec<u8> {
    let text = msg.encode();
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(MESSAGE_TERMINATOR);
    bytes
}

/// Writes one control message in a single buffer.
pub async fn write_message<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: ControlMessage,
{
    let bytes = serialize_message(msg);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one NUL-terminated control message from an async reader.
///
/// Bytes are consumed one at a time so nothing past the terminator is taken
/// from the stream; for TCP sessions data packets follow on the same stream.
///
/// # Errors
///
/// - [`Error::PeerClosed`] if the stream ends before the terminator
/// - [`Error::Protocol`] for an oversized, non-UTF-8 or malformed message
pub async fn deserialize_message<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncRead + Unpin,
    M: ControlMessage,
{
    let mut bytes = Vec::with_capacity(32);

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::PeerClosed);
            }
            Err(e) => return Err(e.into()),
        };

        if byte == MESSAGE_TERMINATOR {
            break;
        }
        if bytes.len() >= MAX_MESSAGE_LEN {
            return Err(Error::Protocol(format!(
                "control message longer than {} bytes",
                MAX_MESSAGE_LEN
            )));
        }
        bytes.push(byte);
    }

    let text = std::str::from_utf8(&bytes)
        .map_err(|_| Error::Protocol("control message is not valid text".to_string()))?;
    M::decode(text)
}
