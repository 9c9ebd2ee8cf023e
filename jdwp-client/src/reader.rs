// Helpers for pulling JDWP values out of reply and event payloads

use crate::protocol::{JdwpError, JdwpResult};
use bytes::Buf;

fn need(buf: &[u8], len: usize, what: &str) -> JdwpResult<()> {
    if buf.remaining() < len {
        return Err(JdwpError::Protocol(format!(
            "Not enough data for {}: expected {}, got {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> JdwpResult<String> {
    need(buf, 4, "string length")?;
    let len = buf.get_u32() as usize;
    need(buf, len, "string")?;

    let bytes = buf[..len].to_vec();
    buf.advance(len);

    String::from_utf8(bytes)
        .map_err(|e| JdwpError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

pub fn read_i32(buf: &mut &[u8]) -> JdwpResult<i32> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

pub fn read_u8(buf: &mut &[u8]) -> JdwpResult<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn read_u64(buf: &mut &[u8]) -> JdwpResult<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_string_and_advances() {
        let raw = [0u8, 0, 0, 3, b'j', b'v', b'm', 0xFF];
        let mut buf = &raw[..];
        assert_eq!(read_string(&mut buf).unwrap(), "jvm");
        assert_eq!(read_u8(&mut buf).unwrap(), 0xFF);
        assert!(buf.is_empty());
    }

    #[test]
    fn short_buffer_is_protocol_error() {
        let raw = [0u8, 0, 0, 9, b'x'];
        let mut buf = &raw[..];
        assert!(matches!(read_string(&mut buf), Err(JdwpError::Protocol(_))));
    }
}
