//! Get-DC mailslot datagrams.
//!
//! The broadcast discovery mechanism sends a get-DC query to the local
//! subnet and collects responses naming controllers willing to serve the
//! domain. Frames are little-endian: magic, opcode, a caller-chosen token
//! echoed in responses, then length-prefixed UTF-8 strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAGIC: u32 = 0x4744_4331; // "GDC1"

const OP_QUERY: u16 = 7;
const OP_RESPONSE: u16 = 19;

const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailslotError {
    #[error("datagram truncated")]
    Truncated,
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("name field too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("name field is not UTF-8")]
    BadName,
}

/// A get-DC query, broadcast by us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDcQuery {
    /// Echoed in responses so late replies from an earlier poll round can be
    /// told apart.
    pub token: u32,
    pub domain: String,
    /// Our own machine name, so responders know who asked.
    pub machine: String,
}

/// A controller's answer to a get-DC query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDcResponse {
    pub token: u32,
    pub domain: String,
    pub dc_name: String,
    pub dc_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailslotFrame {
    Query(GetDcQuery),
    Response(GetDcResponse),
}

pub fn encode(frame: &MailslotFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32_le(MAGIC);
    match frame {
        MailslotFrame::Query(q) => {
            buf.put_u16_le(OP_QUERY);
            buf.put_u32_le(q.token);
            put_name(&mut buf, &q.domain);
            put_name(&mut buf, &q.machine);
        }
        MailslotFrame::Response(r) => {
            buf.put_u16_le(OP_RESPONSE);
            buf.put_u32_le(r.token);
            put_name(&mut buf, &r.domain);
            put_name(&mut buf, &r.dc_name);
            put_name(&mut buf, &r.dc_host);
        }
    }
    buf.freeze()
}

pub fn decode(mut raw: &[u8]) -> Result<MailslotFrame, MailslotError> {
    if raw.remaining() < 10 {
        return Err(MailslotError::Truncated);
    }
    let magic = raw.get_u32_le();
    if magic != MAGIC {
        return Err(MailslotError::BadMagic(magic));
    }
    let opcode = raw.get_u16_le();
    let token = raw.get_u32_le();
    match opcode {
        OP_QUERY => Ok(MailslotFrame::Query(GetDcQuery {
            token,
            domain: get_name(&mut raw)?,
            machine: get_name(&mut raw)?,
        })),
        OP_RESPONSE => Ok(MailslotFrame::Response(GetDcResponse {
            token,
            domain: get_name(&mut raw)?,
            dc_name: get_name(&mut raw)?,
            dc_host: get_name(&mut raw)?,
        })),
        other => Err(MailslotError::UnknownOpcode(other)),
    }
}

fn put_name(buf: &mut BytesMut, name: &str) {
    let bytes = name.as_bytes();
    debug_assert!(bytes.len() <= MAX_NAME_LEN);
    buf.put_u8(bytes.len().min(MAX_NAME_LEN) as u8);
    buf.put_slice(&bytes[..bytes.len().min(MAX_NAME_LEN)]);
}

fn get_name(raw: &mut &[u8]) -> Result<String, MailslotError> {
    if raw.remaining() < 1 {
        return Err(MailslotError::Truncated);
    }
    let len = raw.get_u8() as usize;
    if raw.remaining() < len {
        return Err(MailslotError::Truncated);
    }
    let (head, rest) = raw.split_at(len);
    let name = std::str::from_utf8(head)
        .map_err(|_| MailslotError::BadName)?
        .to_string();
    *raw = rest;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let frame = MailslotFrame::Query(GetDcQuery {
            token: 0xdead_beef,
            domain: "CORP".into(),
            machine: "WS01".into(),
        });
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn response_roundtrip() {
        let frame = MailslotFrame::Response(GetDcResponse {
            token: 7,
            domain: "CORP".into(),
            dc_name: "DC01".into(),
            dc_host: "10.0.0.1".into(),
        });
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(decode(&[1, 2, 3]), Err(MailslotError::Truncated));
        let mut raw = encode(&MailslotFrame::Query(GetDcQuery {
            token: 1,
            domain: "CORP".into(),
            machine: "WS01".into(),
        }))
        .to_vec();
        raw[0] ^= 0xff;
        assert!(matches!(decode(&raw), Err(MailslotError::BadMagic(_))));
    }

    #[test]
    fn truncated_name_is_rejected() {
        let frame = MailslotFrame::Query(GetDcQuery {
            token: 1,
            domain: "CORP".into(),
            machine: "WS01".into(),
        });
        let raw = encode(&frame);
        assert_eq!(
            decode(&raw[..raw.len() - 2]),
            Err(MailslotError::Truncated)
        );
    }
}
