use bytes::{Buf, Bytes, BytesMut};

use super::types::RespValue;
use crate::error::{Error, Result};

/// Incremental RESP reply parser.
/// Returns `Ok(None)` until the buffer holds a complete reply.
pub struct Parser;

impl Parser {
    /// Parse a complete RESP value from buffer and advance past it.
    #[inline]
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match Self::parse_value(buf)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse value, returning (value, bytes_consumed) or None if incomplete
    fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            b'+' => Self::parse_line(buf, RespValue::SimpleString),
            b'-' => Self::parse_line(buf, RespValue::Error),
            b':' => Self::parse_integer(buf),
            b'$' => Self::parse_bulk_string(buf),
            b'*' => Self::parse_array(buf),
            other => Err(Error::Protocol(format!(
                "unexpected reply type byte '{}'",
                other.escape_ascii()
            ))),
        }
    }

    /// Find \r\n in buffer, return position of \r
    #[inline]
    fn find_crlf(buf: &[u8]) -> Option<usize> {
        let mut from = 0;
        while let Some(pos) = memchr::memchr(b'\r', &buf[from..]) {
            let pos = from + pos;
            if pos + 1 >= buf.len() {
                return None;
            }
            if buf[pos + 1] == b'\n' {
                return Some(pos);
            }
            from = pos + 1;
        }
        None
    }

    fn parse_line(
        buf: &[u8],
        make: fn(Bytes) -> RespValue,
    ) -> Result<Option<(RespValue, usize)>> {
        match Self::find_crlf(buf) {
            Some(pos) => {
                let s = Bytes::copy_from_slice(&buf[1..pos]);
                Ok(Some((make(s), pos + 2)))
            }
            None => Ok(None),
        }
    }

    fn parse_length(buf: &[u8], what: &str) -> Result<Option<(i64, usize)>> {
        let crlf_pos = match Self::find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let len = std::str::from_utf8(&buf[1..crlf_pos])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid {}", what)))?;
        Ok(Some((len, crlf_pos + 2)))
    }

    fn parse_integer(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        Ok(Self::parse_length(buf, "integer")?.map(|(n, used)| (RespValue::Integer(n), used)))
    }

    fn parse_bulk_string(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let (len, data_start) = match Self::parse_length(buf, "bulk length")? {
            Some(v) => v,
            None => return Ok(None),
        };

        if len < 0 {
            return Ok(Some((RespValue::Null, data_start)));
        }

        let data_end = data_start + len as usize;
        let total_len = data_end + 2;

        if buf.len() < total_len {
            return Ok(None);
        }
        if &buf[data_end..total_len] != b"\r\n" {
            return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
        Ok(Some((RespValue::BulkString(data), total_len)))
    }

    fn parse_array(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let (len, mut offset) = match Self::parse_length(buf, "array length")? {
            Some(v) => v,
            None => return Ok(None),
        };

        if len < 0 {
            return Ok(Some((RespValue::Null, offset)));
        }

        let mut items = Vec::with_capacity((len as usize).min(1024));
        for _ in 0..len {
            match Self::parse_value(&buf[offset..])? {
                Some((value, consumed)) => {
                    items.push(value);
                    offset += consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(items), offset)))
    }
}
