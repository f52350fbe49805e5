//! Mapping and serialization/deserialization of CA message types.
//!
//! Every CA message starts with a fixed 16-byte big-endian [`Header`]. Messages
//! whose payload does not fit the 16-bit size field use the extended form, where
//! the size field holds `0xFFFF` and two further 32-bit fields carry the real
//! payload size and element count.
//!
//! Each concrete message implements [`CAMessage`], which maps it to and from a
//! [`RawMessage`]. Messages the client receives are collected in
//! [`ClientMessage`], and messages the client sends in [`Message`]. Some command
//! IDs are shared between a request and its reply with different field meanings,
//! so which of the two enums to decode into depends on which side of the
//! connection is reading.

use std::{
    fmt::Display,
    io::{self, Write as IoWrite},
    net::Ipv4Addr,
};

use bytes::{Buf, BytesMut};
use nom::{
    IResult, Parser,
    number::complete::{be_f32, be_u16, be_u32},
};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::dbr::{DbrBasicType, DbrType};

/// The minor protocol version this client speaks
pub const CLIENT_MINOR_VERSION: u16 = 13;
/// Servers older than this cannot be talked to at all
pub const MINIMUM_MINOR_VERSION: u16 = 4;
/// First minor version that understands the extended (large payload) header
pub const EXTENDED_HEADER_MINOR_VERSION: u16 = 9;
/// First minor version that sends sequence numbers in beacons
pub const BEACON_SEQUENCE_MINOR_VERSION: u16 = 10;

pub const HEADER_SIZE: usize = 16;
pub const EXTENDED_HEADER_SIZE: usize = 24;
const EXTENDED_MARKER: u16 = 0xFFFF;

/// Status code carried by successful replies (`ECA_NORMAL`)
pub const ECA_NORMAL: u32 = 1;

/// Command IDs used on the wire
pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const WRITE: u16 = 4;
    pub const SEARCH: u16 = 6;
    pub const EVENTS_OFF: u16 = 8;
    pub const EVENTS_ON: u16 = 9;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const RSRV_IS_UP: u16 = 13;
    pub const NOT_FOUND: u16 = 14;
    pub const READ_NOTIFY: u16 = 15;
    pub const CREATE_CHAN: u16 = 18;
    pub const WRITE_NOTIFY: u16 = 19;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ACCESS_RIGHTS: u16 = 22;
    pub const ECHO: u16 = 23;
    pub const CREATE_CH_FAIL: u16 = 26;
    pub const SERVER_DISCONN: u16 = 27;
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Not enough data for a complete message")]
    Truncated,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Message command ID {actual} does not match expected {expected}")]
    IncorrectCommandId { expected: u16, actual: u16 },
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
}

/// The fixed message header, in its widest representation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
}

fn standard_header(input: &[u8]) -> IResult<&[u8], (u16, u16, u16, u16, u32, u32)> {
    (be_u16, be_u16, be_u16, be_u16, be_u32, be_u32).parse(input)
}

fn extended_sizes(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    (be_u32, be_u32).parse(input)
}

impl Header {
    pub fn new(
        command: u16,
        payload_size: u32,
        data_type: u16,
        data_count: u32,
        parameter_1: u32,
        parameter_2: u32,
    ) -> Self {
        Header {
            command,
            payload_size,
            data_type,
            data_count,
            parameter_1,
            parameter_2,
        }
    }

    /// Does this header need the large-payload form to be represented?
    pub fn is_extended(&self) -> bool {
        self.payload_size >= EXTENDED_MARKER as u32 || self.data_count > u16::MAX as u32
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    pub fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.command.to_be_bytes())?;
        if self.is_extended() {
            writer.write_all(&EXTENDED_MARKER.to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
            writer.write_all(&self.payload_size.to_be_bytes())?;
            writer.write_all(&self.data_count.to_be_bytes())?;
        } else {
            writer.write_all(&(self.payload_size as u16).to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&(self.data_count as u16).to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_len());
        // Writing into a Vec cannot fail
        let _ = self.write(&mut buffer);
        buffer
    }

    /// Decode a header from the front of `input`.
    ///
    /// Returns the header and the number of bytes it occupied. A header that
    /// declares a payload larger than `max_payload_size` is rejected as
    /// malformed before anything is allocated for it.
    pub fn decode(input: &[u8], max_payload_size: u32) -> Result<(Header, usize), MessageError> {
        if input.len() < HEADER_SIZE {
            return Err(MessageError::Truncated);
        }
        let (rest, (command, payload_size, data_type, data_count, parameter_1, parameter_2)) =
            standard_header(input).map_err(|_| MessageError::Truncated)?;

        let (header, used) = if payload_size == EXTENDED_MARKER {
            if input.len() < EXTENDED_HEADER_SIZE {
                return Err(MessageError::Truncated);
            }
            let (_, (payload_size, data_count)) =
                extended_sizes(rest).map_err(|_| MessageError::Truncated)?;
            (
                Header::new(
                    command,
                    payload_size,
                    data_type,
                    data_count,
                    parameter_1,
                    parameter_2,
                ),
                EXTENDED_HEADER_SIZE,
            )
        } else {
            (
                Header::new(
                    command,
                    payload_size as u32,
                    data_type,
                    data_count as u32,
                    parameter_1,
                    parameter_2,
                ),
                HEADER_SIZE,
            )
        };
        if header.payload_size > max_payload_size {
            return Err(MessageError::Malformed(format!(
                "Declared payload of {} bytes exceeds maximum of {max_payload_size}",
                header.payload_size
            )));
        }
        Ok((header, used))
    }
}

/// A basic trait to tie parseability to the struct without a plethora of named
/// functions. Also adds a common interface for writing a message struct.
pub trait CAMessage: Sized {
    const COMMAND: u16;

    fn from_raw(raw: RawMessage) -> Result<Self, MessageError>;
    fn to_raw(&self) -> RawMessage;

    /// Parse a single message of this type from the front of `input`
    fn parse(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (raw, used) = RawMessage::parse(input, u32::MAX)?;
        raw.expect_command(Self::COMMAND)?;
        Ok((&input[used..], Self::from_raw(raw)?))
    }

    fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}
impl<T> AsBytes for T
where
    T: CAMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().to_bytes()
    }
}

/// A complete message with an uninterpreted payload
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl RawMessage {
    fn new(command: u16) -> Self {
        RawMessage {
            header: Header {
                command,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }

    /// Parse one complete message, returning it and the number of bytes consumed
    pub fn parse(input: &[u8], max_payload_size: u32) -> Result<(RawMessage, usize), MessageError> {
        let (header, header_len) = Header::decode(input, max_payload_size)?;
        let total = header_len + header.payload_size as usize;
        let Some(payload) = input.get(header_len..total) else {
            return Err(MessageError::Truncated);
        };
        Ok((
            RawMessage {
                header,
                payload: payload.to_vec(),
            },
            total,
        ))
    }

    /// Write the message, padding the payload out to a multiple of eight bytes
    /// as the protocol requires.
    pub fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        let header = self.padded_header();
        header.write(writer)?;
        writer.write_all(&self.payload)?;
        let extra_bytes = header.payload_size as usize - self.payload.len();
        if extra_bytes > 0 {
            writer.write_all(&[0u8; 8][..extra_bytes])?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(EXTENDED_HEADER_SIZE + self.payload.len() + 8);
        let _ = self.write(&mut buffer);
        buffer
    }

    fn padded_header(&self) -> Header {
        Header {
            payload_size: (self.payload.len().div_ceil(8) * 8) as u32,
            ..self.header
        }
    }

    /// The size this message will occupy on the wire
    pub fn encoded_len(&self) -> usize {
        let header = self.padded_header();
        header.encoded_len() + header.payload_size as usize
    }

    /// Will this message be sent with the large-payload header?
    pub fn is_extended(&self) -> bool {
        self.padded_header().is_extended()
    }

    fn expect_command(&self, command: u16) -> Result<(), MessageError> {
        if self.header.command == command {
            Ok(())
        } else {
            Err(MessageError::IncorrectCommandId {
                expected: command,
                actual: self.header.command,
            })
        }
    }

    fn payload_as_string(&self) -> String {
        let strlen = self
            .payload
            .iter()
            .position(|&c| c == 0x00)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..strlen]).into_owned()
    }

    fn data_type(&self) -> Result<DbrType, MessageError> {
        DbrType::try_from(self.header.data_type).map_err(|_| {
            MessageError::Malformed(format!("Invalid DBR type {}", self.header.data_type))
        })
    }
}

/// NUL-terminate a string and pad it to a multiple of eight bytes
fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    let padded_len = (bytes.len() + 1).div_ceil(8) * 8;
    bytes.resize(padded_len, 0);
    bytes
}

fn optional_ip(value: u32, none_value: u32) -> Option<Ipv4Addr> {
    if value == none_value {
        None
    } else {
        Some(Ipv4Addr::from(value))
    }
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established. It is
/// also sent as the first message in UDP search messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}
impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: CLIENT_MINOR_VERSION,
        }
    }
}
impl Version {
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_MINOR_VERSION
    }
}
impl CAMessage for Version {
    const COMMAND: u16 = command::VERSION;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(Version {
            priority: raw.header.data_type,
            protocol_version: raw.header.data_count as u16,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.priority;
        raw.header.data_count = self.protocol_version as u32;
        raw
    }
}

/// Message CA_PROTO_RSRV_IS_UP.
///
/// Beacon sent by a server when it becomes available. Beacons are also
/// sent out periodically to announce the server is still alive. Another
/// function of beacons is to allow detection of changes in network
/// topology. Sent over UDP.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}
impl CAMessage for RsrvIsUp {
    const COMMAND: u16 = command::RSRV_IS_UP;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(RsrvIsUp {
            server_port: raw.header.data_count as u16,
            beacon_id: raw.header.parameter_1,
            server_ip: optional_ip(raw.header.parameter_2, 0),
            protocol_version: raw.header.data_type,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.protocol_version;
        raw.header.data_count = self.server_port as u32;
        raw.header.parameter_1 = self.beacon_id;
        raw.header.parameter_2 = self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0);
        raw
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. Sent over UDP or TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}
impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: CLIENT_MINOR_VERSION,
        }
    }
}
impl Search {
    /// Construct a search response. is_udp required because field is
    /// only present when the intended target is UDP.
    pub fn respond(
        &self,
        server_ip: Option<Ipv4Addr>,
        port_number: u16,
        is_udp: bool,
    ) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: if is_udp {
                Some(CLIENT_MINOR_VERSION)
            } else {
                None
            },
        }
    }
}
impl CAMessage for Search {
    const COMMAND: u16 = command::SEARCH;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(Search {
            should_reply: raw.header.data_type == 10,
            protocol_version: raw.header.data_count as u16,
            search_id: raw.header.parameter_1,
            channel_name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = if self.should_reply { 10 } else { 5 };
        raw.header.data_count = self.protocol_version as u32;
        raw.header.parameter_1 = self.search_id;
        raw.header.parameter_2 = self.search_id;
        raw.payload = pad_string(&self.channel_name);
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub port_number: u16,
    pub search_id: u32,
    /// Server to connect to, if different from the message sender
    pub server_ip: Option<Ipv4Addr>,
    /// Protocol version only present if this is being sent as UDP
    pub protocol_version: Option<u16>,
}
impl CAMessage for SearchResponse {
    const COMMAND: u16 = command::SEARCH;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        let protocol_version = if raw.payload.len() >= 2 {
            let (_, version) = be_u16::<&[u8], nom::error::Error<&[u8]>>(raw.payload.as_slice())
                .map_err(|_| MessageError::Truncated)?;
            Some(version)
        } else {
            None
        };
        Ok(SearchResponse {
            port_number: raw.header.data_type,
            server_ip: optional_ip(raw.header.parameter_1, u32::MAX),
            search_id: raw.header.parameter_2,
            protocol_version,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.port_number;
        raw.header.parameter_1 = self.server_ip.map(|ip| ip.to_bits()).unwrap_or(u32::MAX);
        raw.header.parameter_2 = self.search_id;
        if let Some(v) = self.protocol_version {
            raw.payload = v.to_be_bytes().to_vec();
        }
        raw
    }
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}
impl CAMessage for CreateChannel {
    const COMMAND: u16 = command::CREATE_CHAN;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannel {
            client_id: raw.header.parameter_1,
            protocol_version: raw.header.parameter_2,
            channel_name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.client_id;
        raw.header.parameter_2 = self.protocol_version;
        raw.payload = pad_string(&self.channel_name);
        raw
    }
}

/// Reply to a successful CA_PROTO_CREATE_CHAN: the claim acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub data_type: DbrBasicType,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}
impl CAMessage for CreateChannelResponse {
    const COMMAND: u16 = command::CREATE_CHAN;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannelResponse {
            data_type: DbrBasicType::try_from(raw.header.data_type).map_err(|_| {
                MessageError::Malformed(format!("Invalid native type {}", raw.header.data_type))
            })?,
            data_count: raw.header.data_count,
            client_id: raw.header.parameter_1,
            server_id: raw.header.parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.data_type as u16;
        raw.header.data_count = self.data_count;
        raw.header.parameter_1 = self.client_id;
        raw.header.parameter_2 = self.server_id;
        raw
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}
impl CAMessage for CreateChannelFailure {
    const COMMAND: u16 = command::CREATE_CH_FAIL;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannelFailure {
            client_id: raw.header.parameter_1,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.client_id;
        raw
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}
impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}
impl TryFrom<u32> for Access {
    type Error = MessageError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Access::None),
            1 => Ok(Access::Read),
            2 => Ok(Access::Write),
            3 => Ok(Access::ReadWrite),
            _ => Err(MessageError::Malformed(format!("Invalid access right {value}"))),
        }
    }
}
impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Access::None => "none",
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "read/write",
        };
        write!(f, "{text}")
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS
///
/// Notifies of access rights for a channel. This value is determined
/// based on host and client name and may change during runtime. Client
/// cannot change access rights nor can it explicitly query its value,
/// so last received value must be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}
impl CAMessage for AccessRights {
    const COMMAND: u16 = command::ACCESS_RIGHTS;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(AccessRights {
            client_id: raw.header.parameter_1,
            access_rights: raw.header.parameter_2.try_into()?,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.client_id;
        raw.header.parameter_2 = self.access_rights as u32;
        raw
    }
}

/// Define a message that carries nothing beyond its command ID
macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident, $command:expr) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name;
        impl CAMessage for $name {
            const COMMAND: u16 = $command;
            fn from_raw(_raw: RawMessage) -> Result<Self, MessageError> {
                Ok($name)
            }
            fn to_raw(&self) -> RawMessage {
                RawMessage::new(Self::COMMAND)
            }
        }
    };
}

empty_message!(
    /// Message CA_PROTO_ECHO, used as a liveness check in both directions.
    Echo,
    command::ECHO
);
empty_message!(
    /// Message CA_PROTO_EVENTS_OFF: ask the server to stop sending subscription updates.
    EventsOff,
    command::EVENTS_OFF
);
empty_message!(
    /// Message CA_PROTO_EVENTS_ON: resume subscription updates.
    EventsOn,
    command::EVENTS_ON
);

/// Define a message whose only content is a padded string payload
macro_rules! string_message {
    ($(#[$meta:meta])* $name:ident, $command:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub name: String,
        }
        impl CAMessage for $name {
            const COMMAND: u16 = $command;
            fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
                Ok($name {
                    name: raw.payload_as_string(),
                })
            }
            fn to_raw(&self) -> RawMessage {
                let mut raw = RawMessage::new(Self::COMMAND);
                raw.payload = pad_string(&self.name);
                raw
            }
        }
    };
}

string_message!(
    /// Message CA_PROTO_CLIENT_NAME: the user name the client runs as.
    ClientName,
    command::CLIENT_NAME
);
string_message!(
    /// Message CA_PROTO_HOST_NAME: the host the client runs on.
    HostName,
    command::HOST_NAME
);

/// Message CA_PROTO_SERVER_DISCONN: the server dropped a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}
impl CAMessage for ServerDisconnect {
    const COMMAND: u16 = command::SERVER_DISCONN;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ServerDisconnect {
            client_id: raw.header.parameter_1,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.client_id;
        raw
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL. The reply from the server mirrors the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}
impl CAMessage for ClearChannel {
    const COMMAND: u16 = command::CLEAR_CHANNEL;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ClearChannel {
            server_id: raw.header.parameter_1,
            client_id: raw.header.parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.server_id;
        raw.header.parameter_2 = self.client_id;
        raw
    }
}

/// Message CA_PROTO_READ_NOTIFY.
///
/// Read the value of a channel, with a reply correlated by `client_ioid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}
impl CAMessage for ReadNotify {
    const COMMAND: u16 = command::READ_NOTIFY;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ReadNotify {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            server_id: raw.header.parameter_1,
            client_ioid: raw.header.parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.data_type.into();
        raw.header.data_count = self.data_count;
        raw.header.parameter_1 = self.server_id;
        raw.header.parameter_2 = self.client_ioid;
        raw
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}
impl CAMessage for ReadNotifyResponse {
    const COMMAND: u16 = command::READ_NOTIFY;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ReadNotifyResponse {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            status_code: raw.header.parameter_1,
            client_ioid: raw.header.parameter_2,
            data: raw.payload,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header::new(
                Self::COMMAND,
                0,
                self.data_type.into(),
                self.data_count,
                self.status_code,
                self.client_ioid,
            ),
            payload: self.data.clone(),
        }
    }
}

/// Define the two value-carrying write requests, which share a layout
macro_rules! write_message {
    ($(#[$meta:meta])* $name:ident, $command:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            pub data_type: DbrType,
            pub data_count: u32,
            pub server_id: u32,
            pub client_ioid: u32,
            pub data: Vec<u8>,
        }
        impl CAMessage for $name {
            const COMMAND: u16 = $command;
            fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
                Ok($name {
                    data_type: raw.data_type()?,
                    data_count: raw.header.data_count,
                    server_id: raw.header.parameter_1,
                    client_ioid: raw.header.parameter_2,
                    data: raw.payload,
                })
            }
            fn to_raw(&self) -> RawMessage {
                RawMessage {
                    header: Header::new(
                        Self::COMMAND,
                        0,
                        self.data_type.into(),
                        self.data_count,
                        self.server_id,
                        self.client_ioid,
                    ),
                    payload: self.data.clone(),
                }
            }
        }
    };
}

write_message!(
    /// Message CA_PROTO_WRITE: write without any completion reply.
    Write,
    command::WRITE
);
write_message!(
    /// Message CA_PROTO_WRITE_NOTIFY: write, acknowledged once processing completes.
    WriteNotify,
    command::WRITE_NOTIFY
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
}
impl CAMessage for WriteNotifyResponse {
    const COMMAND: u16 = command::WRITE_NOTIFY;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(WriteNotifyResponse {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            status_code: raw.header.parameter_1,
            client_ioid: raw.header.parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header::new(
                Self::COMMAND,
                0,
                self.data_type.into(),
                self.data_count,
                self.status_code,
                self.client_ioid,
            ),
            payload: Vec::new(),
        }
    }
}

/// Which kinds of change trigger a subscription update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}
impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}
impl From<MonitorMask> for u16 {
    fn from(mask: MonitorMask) -> Self {
        (mask.value as u16) | (mask.log as u16) << 1 | (mask.alarm as u16) << 2
            | (mask.property as u16) << 3
    }
}
impl From<u16> for MonitorMask {
    fn from(bits: u16) -> Self {
        MonitorMask {
            value: bits & 0x1 != 0,
            log: bits & 0x2 != 0,
            alarm: bits & 0x4 != 0,
            property: bits & 0x8 != 0,
        }
    }
}

/// Message CA_PROTO_EVENT_ADD.
///
/// Create a subscription. The payload carries three obsolete deadband floats
/// followed by the event mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAdd {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}
impl CAMessage for EventAdd {
    const COMMAND: u16 = command::EVENT_ADD;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        let (_, (_, _, _, mask)) = (
            be_f32::<&[u8], nom::error::Error<&[u8]>>,
            be_f32,
            be_f32,
            be_u16,
        )
            .parse(raw.payload.as_slice())
            .map_err(|_| MessageError::Malformed("Short EVENT_ADD payload".to_string()))?;
        Ok(EventAdd {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            server_id: raw.header.parameter_1,
            subscription_id: raw.header.parameter_2,
            mask: mask.into(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(&u16::from(self.mask).to_be_bytes());
        payload.resize(16, 0);
        RawMessage {
            header: Header::new(
                Self::COMMAND,
                0,
                self.data_type.into(),
                self.data_count,
                self.server_id,
                self.subscription_id,
            ),
            payload,
        }
    }
}

/// A subscription update. An empty update is the server confirming cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}
impl EventAddResponse {
    pub fn is_cancel_confirmation(&self) -> bool {
        self.data.is_empty() && self.data_count == 0
    }
}
impl CAMessage for EventAddResponse {
    const COMMAND: u16 = command::EVENT_ADD;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(EventAddResponse {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            status_code: raw.header.parameter_1,
            subscription_id: raw.header.parameter_2,
            data: raw.payload,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: Header::new(
                Self::COMMAND,
                0,
                self.data_type.into(),
                self.data_count,
                self.status_code,
                self.subscription_id,
            ),
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_EVENT_CANCEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}
impl CAMessage for EventCancel {
    const COMMAND: u16 = command::EVENT_CANCEL;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(EventCancel {
            data_type: raw.data_type()?,
            data_count: raw.header.data_count,
            server_id: raw.header.parameter_1,
            subscription_id: raw.header.parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.data_type = self.data_type.into();
        raw.header.data_count = self.data_count;
        raw.header.parameter_1 = self.server_id;
        raw.header.parameter_2 = self.subscription_id;
        raw
    }
}

/// Message CA_PROTO_ERROR.
///
/// Sent by the server when a request fails. Carries a copy of the header of
/// the request that failed, so that it can be routed back to whatever issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ECAError {
    pub client_id: u32,
    pub status_code: u32,
    pub original_request: Header,
    pub error_message: String,
}
impl ECAError {
    pub fn condition(&self) -> Option<ErrorCondition> {
        ErrorCondition::from_status(self.status_code)
    }
}
impl CAMessage for ECAError {
    const COMMAND: u16 = command::ERROR;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        let (original_request, used) =
            Header::decode(&raw.payload, u32::MAX).map_err(|_| {
                MessageError::Malformed("Error message without original request".to_string())
            })?;
        let message = &raw.payload[used..];
        let strlen = message
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(message.len());
        Ok(ECAError {
            client_id: raw.header.parameter_1,
            status_code: raw.header.parameter_2,
            original_request,
            error_message: String::from_utf8_lossy(&message[..strlen]).into_owned(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut payload = self.original_request.to_bytes();
        payload.extend_from_slice(self.error_message.as_bytes());
        payload.push(0);
        let mut raw = RawMessage::new(Self::COMMAND);
        raw.header.parameter_1 = self.client_id;
        raw.header.parameter_2 = self.status_code;
        raw.payload = payload;
        raw
    }
}

/// Messages that can be sent from a client
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Version),
    Search(Search),
    CreateChannel(CreateChannel),
    ClientName(ClientName),
    HostName(HostName),
    ReadNotify(ReadNotify),
    Write(Write),
    WriteNotify(WriteNotify),
    EventAdd(EventAdd),
    EventCancel(EventCancel),
    ClearChannel(ClearChannel),
    EventsOff,
    EventsOn,
    Echo,
}

macro_rules! impl_message_from {
    ($enum:ident, $($variant:ident),*) => {
        $(
            impl From<$variant> for $enum {
                fn from(value: $variant) -> Self {
                    $enum::$variant(value)
                }
            }
        )*
    };
}
impl_message_from!(
    Message,
    Version,
    Search,
    CreateChannel,
    ClientName,
    HostName,
    ReadNotify,
    Write,
    WriteNotify,
    EventAdd,
    EventCancel,
    ClearChannel
);

impl Message {
    pub fn to_raw(&self) -> RawMessage {
        match self {
            Message::Version(msg) => msg.to_raw(),
            Message::Search(msg) => msg.to_raw(),
            Message::CreateChannel(msg) => msg.to_raw(),
            Message::ClientName(msg) => msg.to_raw(),
            Message::HostName(msg) => msg.to_raw(),
            Message::ReadNotify(msg) => msg.to_raw(),
            Message::Write(msg) => msg.to_raw(),
            Message::WriteNotify(msg) => msg.to_raw(),
            Message::EventAdd(msg) => msg.to_raw(),
            Message::EventCancel(msg) => msg.to_raw(),
            Message::ClearChannel(msg) => msg.to_raw(),
            Message::EventsOff => EventsOff.to_raw(),
            Message::EventsOn => EventsOn.to_raw(),
            Message::Echo => Echo.to_raw(),
        }
    }

    /// Interpret a raw message as something a client sent
    pub fn from_raw(raw: RawMessage) -> Result<Message, MessageError> {
        Ok(match raw.header.command {
            command::VERSION => Message::Version(Version::from_raw(raw)?),
            command::SEARCH => Message::Search(Search::from_raw(raw)?),
            command::CREATE_CHAN => Message::CreateChannel(CreateChannel::from_raw(raw)?),
            command::CLIENT_NAME => Message::ClientName(ClientName::from_raw(raw)?),
            command::HOST_NAME => Message::HostName(HostName::from_raw(raw)?),
            command::READ_NOTIFY => Message::ReadNotify(ReadNotify::from_raw(raw)?),
            command::WRITE => Message::Write(Write::from_raw(raw)?),
            command::WRITE_NOTIFY => Message::WriteNotify(WriteNotify::from_raw(raw)?),
            command::EVENT_ADD => Message::EventAdd(EventAdd::from_raw(raw)?),
            command::EVENT_CANCEL => Message::EventCancel(EventCancel::from_raw(raw)?),
            command::CLEAR_CHANNEL => Message::ClearChannel(ClearChannel::from_raw(raw)?),
            command::EVENTS_OFF => Message::EventsOff,
            command::EVENTS_ON => Message::EventsOn,
            command::ECHO => Message::Echo,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }

    pub fn write<W: IoWrite>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().to_bytes()
    }

    /// Parse a buffer holding a sequence of complete client messages
    pub fn parse_many(mut input: &[u8]) -> Result<Vec<Message>, MessageError> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (raw, used) = RawMessage::parse(input, u32::MAX)?;
            messages.push(Message::from_raw(raw)?);
            input = &input[used..];
        }
        Ok(messages)
    }
}

/// Messages that a client can receive, over TCP or UDP
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Version(Version),
    SearchResponse(SearchResponse),
    RsrvIsUp(RsrvIsUp),
    NotFound,
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAddResponse(EventAddResponse),
    ServerDisconnect(ServerDisconnect),
    ClearChannel(ClearChannel),
    ECAError(ECAError),
    Echo,
}

impl_message_from!(
    ClientMessage,
    Version,
    SearchResponse,
    RsrvIsUp,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ReadNotifyResponse,
    WriteNotifyResponse,
    EventAddResponse,
    ServerDisconnect,
    ClearChannel,
    ECAError
);

impl ClientMessage {
    /// Interpret a raw message as something a server sent
    pub fn from_raw(raw: RawMessage) -> Result<ClientMessage, MessageError> {
        Ok(match raw.header.command {
            command::VERSION => ClientMessage::Version(Version::from_raw(raw)?),
            command::SEARCH => ClientMessage::SearchResponse(SearchResponse::from_raw(raw)?),
            command::RSRV_IS_UP => ClientMessage::RsrvIsUp(RsrvIsUp::from_raw(raw)?),
            command::NOT_FOUND => ClientMessage::NotFound,
            command::CREATE_CHAN => {
                ClientMessage::CreateChannelResponse(CreateChannelResponse::from_raw(raw)?)
            }
            command::CREATE_CH_FAIL => {
                ClientMessage::CreateChannelFailure(CreateChannelFailure::from_raw(raw)?)
            }
            command::ACCESS_RIGHTS => ClientMessage::AccessRights(AccessRights::from_raw(raw)?),
            command::READ_NOTIFY => {
                ClientMessage::ReadNotifyResponse(ReadNotifyResponse::from_raw(raw)?)
            }
            command::WRITE_NOTIFY => {
                ClientMessage::WriteNotifyResponse(WriteNotifyResponse::from_raw(raw)?)
            }
            command::EVENT_ADD => ClientMessage::EventAddResponse(EventAddResponse::from_raw(raw)?),
            command::SERVER_DISCONN => {
                ClientMessage::ServerDisconnect(ServerDisconnect::from_raw(raw)?)
            }
            command::CLEAR_CHANNEL => ClientMessage::ClearChannel(ClearChannel::from_raw(raw)?),
            command::ERROR => ClientMessage::ECAError(ECAError::from_raw(raw)?),
            command::ECHO => ClientMessage::Echo,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }

    pub fn to_raw(&self) -> RawMessage {
        match self {
            ClientMessage::Version(msg) => msg.to_raw(),
            ClientMessage::SearchResponse(msg) => msg.to_raw(),
            ClientMessage::RsrvIsUp(msg) => msg.to_raw(),
            ClientMessage::NotFound => RawMessage::new(command::NOT_FOUND),
            ClientMessage::CreateChannelResponse(msg) => msg.to_raw(),
            ClientMessage::CreateChannelFailure(msg) => msg.to_raw(),
            ClientMessage::AccessRights(msg) => msg.to_raw(),
            ClientMessage::ReadNotifyResponse(msg) => msg.to_raw(),
            ClientMessage::WriteNotifyResponse(msg) => msg.to_raw(),
            ClientMessage::EventAddResponse(msg) => msg.to_raw(),
            ClientMessage::ServerDisconnect(msg) => msg.to_raw(),
            ClientMessage::ClearChannel(msg) => msg.to_raw(),
            ClientMessage::ECAError(msg) => msg.to_raw(),
            ClientMessage::Echo => Echo.to_raw(),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().to_bytes()
    }
}

/// Parse every message in a UDP datagram.
///
/// Unknown commands are skipped rather than failing the whole datagram; a
/// datagram that is cut short fails.
pub fn parse_datagram(mut input: &[u8]) -> Result<Vec<ClientMessage>, MessageError> {
    let mut messages = Vec::new();
    while !input.is_empty() {
        let (raw, used) = RawMessage::parse(input, input.len() as u32)?;
        input = &input[used..];
        match ClientMessage::from_raw(raw) {
            Ok(message) => messages.push(message),
            Err(MessageError::UnknownCommandId(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}

/// Frames the byte stream of a virtual circuit into [`ClientMessage`]s
#[derive(Debug, Clone)]
pub struct CircuitCodec {
    max_payload_size: u32,
}

impl CircuitCodec {
    pub fn new(max_payload_size: u32) -> Self {
        CircuitCodec { max_payload_size }
    }
}

impl Decoder for CircuitCodec {
    type Item = ClientMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match RawMessage::parse(src, self.max_payload_size) {
                Ok((raw, used)) => {
                    src.advance(used);
                    match ClientMessage::from_raw(raw) {
                        Err(MessageError::UnknownCommandId(id)) => {
                            trace!("Skipping message with unknown command {id}");
                            continue;
                        }
                        other => return other.map(Some),
                    }
                }
                Err(MessageError::Truncated) => {
                    // Make room for the rest of a message whose header we already have
                    if let Ok((header, header_len)) = Header::decode(src, self.max_payload_size) {
                        src.reserve(header_len + header.payload_size as usize - src.len());
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// Define the ECA error conditions with their severity and text in one table
macro_rules! error_conditions {
    ($($variant:ident = $number:literal, $severity:ident, $text:literal;)*) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum ErrorCondition {
            $($variant = $number,)*
        }

        impl ErrorCondition {
            pub fn get_severity(&self) -> ErrorSeverity {
                match self {
                    $(Self::$variant => ErrorSeverity::$severity,)*
                }
            }
            fn from_number(number: u32) -> Option<Self> {
                match number {
                    $($number => Some(Self::$variant),)*
                    _ => None,
                }
            }
            fn text(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)*
                }
            }
        }
    };
}

error_conditions! {
    Normal = 0, Success, "Normal successful completion";
    AllocMem = 6, Warning, "Unable to allocate additional dynamic memory";
    TooLarge = 9, Warning, "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES";
    Timeout = 10, Warning, "User specified timeout on IO operation expired";
    BadType = 14, Error, "The data type specified is invalid";
    Internal = 17, Severe, "Channel Access Internal Failure";
    DblClFail = 18, Warning, "The requested local DB operation failed";
    GetFail = 19, Warning, "Channel read request failed";
    PutFail = 20, Warning, "Channel write request failed";
    BadCount = 22, Warning, "Invalid element count requested";
    BadStr = 23, Error, "Invalid string";
    Disconn = 24, Warning, "Virtual circuit disconnect";
    EvDisallow = 26, Error, "Request inappropriate within subscription (monitor) update callback";
    BadMonId = 30, Error, "Bad event subscription (monitor) identifier";
    BadMask = 41, Error, "Invalid event selection mask";
    IoDone = 42, Info, "IO operations have completed";
    IoInProgress = 43, Info, "IO operations are in progress";
    BadSyncGrp = 44, Error, "Invalid synchronous group identifier";
    PutCbInProg = 45, Error, "Put callback timed out";
    NoRdAccess = 46, Warning, "Read access denied";
    NoWtAccess = 47, Warning, "Write access denied";
    Anachronism = 48, Error, "Requested feature is no longer supported";
    NoSearchAddr = 49, Warning, "Empty PV search address list";
    NoConvert = 50, Warning, "No reasonable data conversion between client and server types";
    BadChId = 51, Error, "Invalid channel identifier";
    BadFuncPtr = 52, Error, "Invalid function pointer";
    IsAttached = 53, Warning, "Thread is already attached to a client context";
    UnavailInServ = 54, Warning, "Not supported by attached service";
    ChanDestroy = 55, Warning, "User destroyed channel";
    BadPriority = 56, Error, "Invalid channel priority";
    NotThreaded = 57, Error, "Preemptive callback not enabled - additional threads may not join context";
    Array16kClient = 58, Warning, "Client's protocol revision does not support transfers exceeding 16k bytes";
    ConnSeqTmo = 59, Warning, "Virtual circuit connection sequence aborted";
    UnrespTmo = 60, Warning, "Virtual circuit unresponsive";
}

impl ErrorCondition {
    /// The full status code as carried on the wire: message number and severity
    pub fn status(&self) -> u32 {
        ((*self as u32) << 3) | self.get_severity() as u32
    }

    /// Interpret a status code received from a server
    pub fn from_status(code: u32) -> Option<Self> {
        Self::from_number((code & 0xFFF8) >> 3)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.get_severity(),
            ErrorSeverity::Success | ErrorSeverity::Info
        )
    }
}

impl Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

impl std::error::Error for ErrorCondition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DbrCategory;
    use proptest::prelude::*;

    #[test]
    fn parse_beacon() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (rest, beacon) = RsrvIsUp::parse(raw_beacon).unwrap();
        assert!(rest.is_empty());
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(beacon.protocol_version, 13);
        assert_eq!(
            beacon.server_ip,
            Some("172.23.124.207".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(beacon.as_bytes(), raw_beacon);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert_eq!(ver.protocol_version, 13);
        assert!(ver.is_compatible());
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (_, search) = Search::parse(raw).unwrap();
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        assert_eq!(search.as_bytes(), raw);
        // Check parsing something that isn't a search
        let raw = b"\x00\x00\x00\x00\x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01";
        assert!(matches!(
            Search::parse(raw),
            Err(MessageError::IncorrectCommandId { .. })
        ));
    }

    #[test]
    fn search_datagram_with_version() {
        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x73,
            0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let messages = Message::parse_many(&raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Version(_)));
        let Message::Search(search) = &messages[1] else {
            panic!("Expected a search message");
        };
        assert_eq!(search.channel_name, "some");
    }

    #[test]
    fn search_response_roundtrip_through_datagram() {
        let search = Search {
            search_id: 77,
            channel_name: "PV:NAME".to_string(),
            ..Default::default()
        };
        let mut datagram = Version::default().as_bytes();
        datagram.extend(search.respond(None, 6064, true).as_bytes());
        let messages = parse_datagram(&datagram).unwrap();
        assert_eq!(messages.len(), 2);
        let ClientMessage::SearchResponse(response) = &messages[1] else {
            panic!("Expected a search response");
        };
        assert_eq!(response.search_id, 77);
        assert_eq!(response.port_number, 6064);
        assert_eq!(response.server_ip, None);
        assert_eq!(response.protocol_version, Some(CLIENT_MINOR_VERSION));
    }

    #[test]
    fn header_extended_boundary() {
        let small = Header::new(1, 0xFFFE, 6, 1, 2, 3);
        assert!(!small.is_extended());
        assert_eq!(small.to_bytes().len(), HEADER_SIZE);
        let large = Header::new(1, 0xFFFF, 6, 1, 2, 3);
        assert!(large.is_extended());
        let bytes = large.to_bytes();
        assert_eq!(bytes.len(), EXTENDED_HEADER_SIZE);
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(Header::decode(&bytes, u32::MAX).unwrap(), (large, 24));
        assert_eq!(
            Header::decode(&small.to_bytes(), u32::MAX).unwrap(),
            (small, 16)
        );
        // A large element count alone also forces the extended form
        let counted = Header::new(1, 8, 6, 0x10000, 2, 3);
        assert_eq!(counted.to_bytes().len(), EXTENDED_HEADER_SIZE);
    }

    #[test]
    fn header_truncated_and_oversized() {
        let bytes = Header::new(15, 64, 6, 1, 2, 3).to_bytes();
        assert!(matches!(
            Header::decode(&bytes[..10], 1024),
            Err(MessageError::Truncated)
        ));
        assert!(matches!(
            Header::decode(&bytes, 32),
            Err(MessageError::Malformed(_))
        ));
        let extended = Header::new(15, 0x20000, 6, 1, 2, 3).to_bytes();
        assert!(matches!(
            Header::decode(&extended[..20], u32::MAX),
            Err(MessageError::Truncated)
        ));
        // Declared size beyond the maximum is refused without waiting for the payload
        assert!(matches!(
            RawMessage::parse(&extended, 0x1000),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn payload_is_padded() {
        let msg = CreateChannel {
            client_id: 4,
            protocol_version: 13,
            channel_name: "ABCDEFGH".to_string(),
        };
        let bytes = msg.as_bytes();
        // 8 characters plus terminator pads to 16
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 16);
        let (_, parsed) = CreateChannel::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn decoder_handles_split_stream() {
        let mut stream = Vec::new();
        stream.extend(Version::default().as_bytes());
        stream.extend(
            ReadNotifyResponse {
                data_type: DbrType {
                    basic_type: DbrBasicType::Double,
                    category: DbrCategory::Basic,
                },
                data_count: 1,
                status_code: ECA_NORMAL,
                client_ioid: 9,
                data: 3.5f64.to_be_bytes().to_vec(),
            }
            .as_bytes(),
        );
        let mut codec = CircuitCodec::new(16384);
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(5) {
            buffer.extend_from_slice(chunk);
            while let Some(msg) = codec.decode(&mut buffer).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded.len(), 2);
        let ClientMessage::ReadNotifyResponse(response) = &decoded[1] else {
            panic!("Expected read response");
        };
        assert_eq!(response.client_ioid, 9);
        assert_eq!(response.data, 3.5f64.to_be_bytes().to_vec());
        assert!(buffer.is_empty());
    }

    #[test]
    fn decoder_skips_unknown_command() {
        let mut buffer = BytesMut::from(&Header::new(99, 8, 0, 0, 0, 0).to_bytes()[..]);
        buffer.extend_from_slice(&[0xAA; 8]);
        buffer.extend_from_slice(&Version::default().as_bytes());
        let mut codec = CircuitCodec::new(1024);
        assert!(matches!(
            codec.decode(&mut buffer),
            Ok(Some(ClientMessage::Version(_)))
        ));
        assert!(buffer.is_empty());
        assert!(matches!(codec.decode(&mut buffer), Ok(None)));
    }

    #[test]
    fn error_message_carries_original_request() {
        let original = ReadNotify {
            data_type: DbrType {
                basic_type: DbrBasicType::Long,
                category: DbrCategory::Time,
            },
            data_count: 1,
            server_id: 3,
            client_ioid: 1234,
        }
        .to_raw()
        .header;
        let error = ECAError {
            client_id: 5,
            status_code: ErrorCondition::NoRdAccess.status(),
            original_request: original,
            error_message: "denied".to_string(),
        };
        let (_, parsed) = ECAError::parse(&error.as_bytes()).unwrap();
        assert_eq!(parsed.original_request.parameter_2, 1234);
        assert_eq!(parsed.condition(), Some(ErrorCondition::NoRdAccess));
        assert_eq!(parsed.error_message, "denied");
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorCondition::Normal.status(), ECA_NORMAL);
        assert_eq!(ErrorCondition::NoRdAccess.status(), 368);
        assert_eq!(
            ErrorCondition::from_status(ErrorCondition::PutFail.status()),
            Some(ErrorCondition::PutFail)
        );
        assert!(ErrorCondition::from_status(ECA_NORMAL).unwrap().is_success());
    }

    #[test]
    fn event_add_mask() {
        let add = EventAdd {
            data_type: DbrType {
                basic_type: DbrBasicType::Float,
                category: DbrCategory::Time,
            },
            data_count: 0,
            server_id: 8,
            subscription_id: 12,
            mask: MonitorMask {
                value: true,
                log: true,
                alarm: false,
                property: true,
            },
        };
        let bytes = add.as_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        let (_, parsed) = EventAdd::parse(&bytes).unwrap();
        assert_eq!(parsed, add);
    }

    proptest! {
        #[test]
        fn header_roundtrip(
            command in any::<u16>(),
            payload_size in prop_oneof![0u32..0x10000, any::<u32>()],
            data_type in any::<u16>(),
            data_count in prop_oneof![0u32..0x10000, any::<u32>()],
            parameter_1 in any::<u32>(),
            parameter_2 in any::<u32>(),
        ) {
            let header = Header::new(command, payload_size, data_type, data_count, parameter_1, parameter_2);
            let bytes = header.to_bytes();
            prop_assert_eq!(bytes.len(), header.encoded_len());
            let (decoded, used) = Header::decode(&bytes, u32::MAX).unwrap();
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(used, bytes.len());
        }
    }
}
