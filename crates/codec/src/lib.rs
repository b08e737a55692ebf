//! ## Clustered event bus wire codec
//!
//! Every record exchanged between peer nodes is a length-prefixed payload
//! (see [`framing`]) carrying one encoded [`message::ClusteredMessage`].
//! Two payload kinds share the framing and are told apart by the body
//! codec identity carried inside the payload: ordinary data messages, and
//! the keepalive PING. A PING is acknowledged with the single literal
//! [`PONG`] byte written outside the length framing.

pub mod framing;
pub mod message;

use std::{array::TryFromSliceError, str::Utf8Error};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug)]
pub enum Error {
    UnexpectedEnd,
    UnsupportedVersion(u8),
    UnknownBodyCodec(u8),
    RecordTooLarge(usize),
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// The acknowledgement byte for a PING payload.
///
/// It is written on the raw socket, outside the length framing, and an
/// outbound connection treats any inbound byte as such an acknowledgement.
pub const PONG: u8 = 0x01;

/// Identity table of the body codecs a node understands.
///
/// The identity travels on the wire, so the numeric values are part of the
/// protocol and must never be reassigned. `Ping` is reserved for the
/// keepalive payload and never carries a user body.
///
/// # Example
///
/// ```
/// use bus_server_codec::BodyCodec;
///
/// assert_eq!(BodyCodec::try_from(2u8).unwrap(), BodyCodec::Text);
/// assert_eq!(BodyCodec::from_name("json"), Some(BodyCodec::Json));
/// assert_eq!(BodyCodec::Raw.name(), "raw");
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum BodyCodec {
    Ping = 0,
    Raw = 1,
    Text = 2,
    Json = 3,
}

impl BodyCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Raw => "raw",
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ping" => Self::Ping,
            "raw" => Self::Raw,
            "text" => Self::Text,
            "json" => Self::Json,
            _ => return None,
        })
    }
}

/// Network coordinates of a peer's inbound listener.
///
/// Identity is structural: two nodes are the same peer exactly when host
/// and port are equal. The pair is stable for the lifetime of a node's
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
