//! Frames and the connection handshake

use crate::ProtocolError;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// A single message on a tunnel connection.
///
/// Head frames travel as text, bodies as binary. Ping/pong are control
/// traffic and never belong to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    Close,
}

impl Frame {
    /// Consume the frame as an exchange head, or fail with a protocol error.
    pub fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            Frame::Text(text) => Ok(text),
            _ => Err(ProtocolError::UnexpectedFrame {
                expected: "text head frame",
            }),
        }
    }

    /// Consume the frame as an exchange body, or fail with a protocol error.
    pub fn into_binary(self) -> Result<Bytes, ProtocolError> {
        match self {
            Frame::Binary(body) => Ok(body),
            _ => Err(ProtocolError::UnexpectedFrame {
                expected: "binary body frame",
            }),
        }
    }
}

/// Role a tunnel connection plays for the side that binds it.
///
/// An Executor receives forwarded requests and runs them against the local
/// upstream; a Dispatcher sends requests outward and awaits the response.
/// One physical connection is always an Executor on one side and a
/// Dispatcher on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Executor = 0,
    Dispatcher = 1,
}

impl Role {
    /// The role the remote side binds for the same physical connection.
    pub fn complement(self) -> Role {
        match self {
            Role::Executor => Role::Dispatcher,
            Role::Dispatcher => Role::Executor,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Executor),
            1 => Ok(Role::Dispatcher),
            other => Err(ProtocolError::InvalidRole(other)),
        }
    }
}

/// First message on a new tunnel connection: `"<idleSize>_<role>"`.
///
/// `idle_size` is the dialing side's desired idle pool size; `role` is the
/// role the *receiving* side binds the connection under. Peer identity is
/// never carried here — the receiving side derives it from the validated
/// credential on the transport handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub idle_size: usize,
    pub role: Role,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.idle_size, self.role.as_u8())
    }
}

impl FromStr for Handshake {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (idle, role) = s
            .split_once('_')
            .ok_or_else(|| ProtocolError::MalformedHandshake(s.to_string()))?;

        let idle_size = idle
            .parse::<usize>()
            .map_err(|_| ProtocolError::MalformedHandshake(s.to_string()))?;

        let role = role
            .parse::<u8>()
            .map_err(|_| ProtocolError::MalformedHandshake(s.to_string()))?;

        Ok(Handshake {
            idle_size,
            role: Role::try_from(role)?,
        })
    }
}
