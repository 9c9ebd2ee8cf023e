// JDWP protocol definitions and packet handling
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;

// All multi-byte values on the wire are big-endian

pub type JdwpResult<T> = Result<T, JdwpError>;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    /// The debuggee accepted the socket but did not finish the handshake in time.
    #[error("JDWP handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("JDWP error code {0}: {1}")]
    JdwpErrorCode(u16, String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl JdwpError {
    /// True for failures of the underlying socket (refused, reset, closed
    /// mid-handshake) as opposed to protocol-level outcomes.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            JdwpError::Io(_) | JdwpError::InvalidHandshake | JdwpError::ConnectionClosed
        )
    }
}

/// Handshake literal, sent by the debugger and echoed by the debuggee.
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00);
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }
}

impl ReplyPacket {
    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol("Reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(JdwpError::Protocol(format!("Invalid reply flag: {:#x}", flags)));
        }

        let error_code = buf.get_u16();

        Ok(Self {
            id,
            error_code,
            data: buf.to_vec(),
        })
    }

    pub fn check_error(&self) -> JdwpResult<()> {
        if self.error_code == 0 {
            return Ok(());
        }
        Err(JdwpError::JdwpErrorCode(
            self.error_code,
            error_name(self.error_code).to_string(),
        ))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Names for the error codes a dev-mode attach can realistically see.
/// Anything else is reported by number only.
pub fn error_name(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        13 => "THREAD_NOT_SUSPENDED",
        21 => "INVALID_CLASS",
        62 => "FAILS_VERIFICATION",
        63 => "ADD_METHOD_NOT_IMPLEMENTED",
        64 => "SCHEMA_CHANGE_NOT_IMPLEMENTED",
        66 => "HIERARCHY_CHANGE_NOT_IMPLEMENTED",
        67 => "DELETE_METHOD_NOT_IMPLEMENTED",
        68 => "UNSUPPORTED_VERSION",
        99 => "NOT_IMPLEMENTED",
        112 => "VM_DEAD",
        113 => "INTERNAL",
        _ => "UNKNOWN_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packet_encode() {
        let mut packet = CommandPacket::new(0x0102_0304, 1, 6);
        packet.data.push(0xAB);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), HEADER_SIZE + 1);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 12]);
        assert_eq!(&encoded[4..8], &[1, 2, 3, 4]);
        assert_eq!(encoded[8], 0x00);
        assert_eq!(encoded[9], 1);
        assert_eq!(encoded[10], 6);
        assert_eq!(encoded[11], 0xAB);
    }

    #[test]
    fn test_reply_packet_error_code() {
        let raw = vec![
            0, 0, 0, 11, // length
            0, 0, 0, 7, // id
            0x80, // reply flag
            0, 112, // VM_DEAD
        ];

        let packet = ReplyPacket::decode(&raw).unwrap();
        assert_eq!(packet.id, 7);
        match packet.check_error() {
            Err(JdwpError::JdwpErrorCode(112, name)) => assert_eq!(name, "VM_DEAD"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_packet_rejects_command_flag() {
        let raw = vec![0, 0, 0, 11, 0, 0, 0, 1, 0x00, 0, 0];
        assert!(matches!(
            ReplyPacket::decode(&raw),
            Err(JdwpError::Protocol(_))
        ));
    }

    #[test]
    fn test_transport_classification() {
        let refused = JdwpError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transport());
        assert!(JdwpError::InvalidHandshake.is_transport());
        assert!(!JdwpError::Timeout(Duration::from_secs(1)).is_transport());
    }
}
