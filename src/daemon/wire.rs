//! Worker wire protocol.
//!
//! Requests to domain and mapper workers travel as framed bytes: a small
//! fixed header carrying the correlation id, then a CBOR body. Workers echo
//! the correlation id in their response frame; the state loop uses it to
//! find the parked continuation. Bodies are hand-encoded arrays with a
//! leading tag, so unknown tags fail loudly instead of half-decoding.

use bytes::{Buf, BufMut, BytesMut};
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{DomainInfo, IdKind, MapStatus, Mapping, Sid, TrustAttributes, TrustKind};

const MAGIC: u32 = 0x4457_4631; // "DWF1"
const FRAME_REQUEST: u8 = 0;
const FRAME_RESPONSE: u8 = 1;

pub const WIRE_VERSION: u8 = 1;

/// Hard cap on body size; a frame beyond this is a protocol bug, not data.
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    #[error("unexpected frame kind {0}")]
    BadFrameKind(u8),
    #[error("body too large ({0} bytes)")]
    Oversize(usize),
    #[error("unknown body tag {0}")]
    UnknownTag(u32),
    #[error("cbor: {0}")]
    Cbor(String),
    #[error("bad sid in frame: {0}")]
    BadSid(String),
}

impl From<minicbor::decode::Error> for WireError {
    fn from(e: minicbor::decode::Error) -> Self {
        WireError::Cbor(e.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for WireError {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        WireError::Cbor(e.to_string())
    }
}

/// What a worker can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    Ping,
    /// Re-run establishment. `bypass_offline` is set when a probe succeeded
    /// and the parent wants the real connection back despite the record
    /// still being offline.
    Reconnect { bypass_offline: bool },
    LookupName { name: String },
    LookupSid { sid: Sid },
    EnumTrusts,
    SequenceNumber,
    SidToId { sid: Sid },
    IdToSid { kind: IdKind, id: u32 },
    SetMapping { mapping: Mapping },
    RemoveMapping { mapping: Mapping },
    Allocate { sid: Sid, kind: IdKind },
}

/// What comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Pong,
    Connected { dc_name: String, dc_host: String },
    NameResolved { sid: Option<Sid> },
    SidResolved { name: Option<String> },
    Trusts { domains: Vec<DomainInfo> },
    Sequence { value: u64 },
    MappingResult { status: MapStatus, mapping: Option<Mapping> },
    Done,
    Allocated { mapping: Mapping },
    Fault { code: String, message: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub correlation: u64,
    pub body: WorkerRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation: u64,
    pub body: WorkerReply,
}

pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, WireError> {
    let body = encode_request_body(&frame.body)?;
    Ok(put_frame(FRAME_REQUEST, frame.correlation, &body))
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, WireError> {
    let body = encode_response_body(&frame.body)?;
    Ok(put_frame(FRAME_RESPONSE, frame.correlation, &body))
}

pub fn decode_request(raw: &[u8]) -> Result<RequestFrame, WireError> {
    let (correlation, body) = take_frame(raw, FRAME_REQUEST)?;
    Ok(RequestFrame {
        correlation,
        body: decode_request_body(body)?,
    })
}

pub fn decode_response(raw: &[u8]) -> Result<ResponseFrame, WireError> {
    let (correlation, body) = take_frame(raw, FRAME_RESPONSE)?;
    Ok(ResponseFrame {
        correlation,
        body: decode_response_body(body)?,
    })
}

fn put_frame(kind: u8, correlation: u64, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(18 + body.len());
    buf.put_u32_le(MAGIC);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(kind);
    buf.put_u64_le(correlation);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.to_vec()
}

fn take_frame(mut raw: &[u8], want_kind: u8) -> Result<(u64, &[u8]), WireError> {
    if raw.remaining() < 18 {
        return Err(WireError::Truncated);
    }
    let magic = raw.get_u32_le();
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = raw.get_u8();
    if version != WIRE_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let kind = raw.get_u8();
    if kind != want_kind {
        return Err(WireError::BadFrameKind(kind));
    }
    let correlation = raw.get_u64_le();
    let len = raw.get_u32_le() as usize;
    if len > MAX_BODY_BYTES {
        return Err(WireError::Oversize(len));
    }
    if raw.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok((correlation, &raw[..len]))
}

// Request body tags.
const REQ_PING: u32 = 0;
const REQ_RECONNECT: u32 = 1;
const REQ_LOOKUP_NAME: u32 = 2;
const REQ_LOOKUP_SID: u32 = 3;
const REQ_ENUM_TRUSTS: u32 = 4;
const REQ_SEQUENCE: u32 = 5;
const REQ_SID_TO_ID: u32 = 16;
const REQ_ID_TO_SID: u32 = 17;
const REQ_SET_MAPPING: u32 = 18;
const REQ_REMOVE_MAPPING: u32 = 19;
const REQ_ALLOCATE: u32 = 20;

// Response body tags.
const REP_PONG: u32 = 0;
const REP_CONNECTED: u32 = 1;
const REP_NAME_RESOLVED: u32 = 2;
const REP_SID_RESOLVED: u32 = 3;
const REP_TRUSTS: u32 = 4;
const REP_SEQUENCE: u32 = 5;
const REP_MAPPING: u32 = 16;
const REP_DONE: u32 = 17;
const REP_ALLOCATED: u32 = 18;
const REP_FAULT: u32 = 31;

fn encode_request_body(body: &WorkerRequest) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    let mut e = Encoder::new(&mut out);
    match body {
        WorkerRequest::Ping => {
            e.array(1)?.u32(REQ_PING)?;
        }
        WorkerRequest::Reconnect { bypass_offline } => {
            e.array(2)?.u32(REQ_RECONNECT)?.bool(*bypass_offline)?;
        }
        WorkerRequest::LookupName { name } => {
            e.array(2)?.u32(REQ_LOOKUP_NAME)?.str(name)?;
        }
        WorkerRequest::LookupSid { sid } => {
            e.array(2)?.u32(REQ_LOOKUP_SID)?.str(&sid.to_string())?;
        }
        WorkerRequest::EnumTrusts => {
            e.array(1)?.u32(REQ_ENUM_TRUSTS)?;
        }
        WorkerRequest::SequenceNumber => {
            e.array(1)?.u32(REQ_SEQUENCE)?;
        }
        WorkerRequest::SidToId { sid } => {
            e.array(2)?.u32(REQ_SID_TO_ID)?.str(&sid.to_string())?;
        }
        WorkerRequest::IdToSid { kind, id } => {
            e.array(3)?.u32(REQ_ID_TO_SID)?.u8(id_kind_code(*kind))?.u32(*id)?;
        }
        WorkerRequest::SetMapping { mapping } => {
            e.array(2)?.u32(REQ_SET_MAPPING)?;
            encode_mapping(&mut e, mapping)?;
        }
        WorkerRequest::RemoveMapping { mapping } => {
            e.array(2)?.u32(REQ_REMOVE_MAPPING)?;
            encode_mapping(&mut e, mapping)?;
        }
        WorkerRequest::Allocate { sid, kind } => {
            e.array(3)?
                .u32(REQ_ALLOCATE)?
                .str(&sid.to_string())?
                .u8(id_kind_code(*kind))?;
        }
    }
    Ok(out)
}

fn decode_request_body(raw: &[u8]) -> Result<WorkerRequest, WireError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let tag = d.u32()?;
    let body = match tag {
        REQ_PING => WorkerRequest::Ping,
        REQ_RECONNECT => WorkerRequest::Reconnect {
            bypass_offline: d.bool()?,
        },
        REQ_LOOKUP_NAME => WorkerRequest::LookupName {
            name: d.str()?.to_string(),
        },
        REQ_LOOKUP_SID => WorkerRequest::LookupSid {
            sid: decode_sid(&mut d)?,
        },
        REQ_ENUM_TRUSTS => WorkerRequest::EnumTrusts,
        REQ_SEQUENCE => WorkerRequest::SequenceNumber,
        REQ_SID_TO_ID => WorkerRequest::SidToId {
            sid: decode_sid(&mut d)?,
        },
        REQ_ID_TO_SID => WorkerRequest::IdToSid {
            kind: decode_id_kind(&mut d)?,
            id: d.u32()?,
        },
        REQ_SET_MAPPING => WorkerRequest::SetMapping {
            mapping: decode_mapping(&mut d)?,
        },
        REQ_REMOVE_MAPPING => WorkerRequest::RemoveMapping {
            mapping: decode_mapping(&mut d)?,
        },
        REQ_ALLOCATE => WorkerRequest::Allocate {
            sid: decode_sid(&mut d)?,
            kind: decode_id_kind(&mut d)?,
        },
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(body)
}

fn encode_response_body(body: &WorkerReply) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    let mut e = Encoder::new(&mut out);
    match body {
        WorkerReply::Pong => {
            e.array(1)?.u32(REP_PONG)?;
        }
        WorkerReply::Connected { dc_name, dc_host } => {
            e.array(3)?.u32(REP_CONNECTED)?.str(dc_name)?.str(dc_host)?;
        }
        WorkerReply::NameResolved { sid } => {
            e.array(2)?.u32(REP_NAME_RESOLVED)?;
            match sid {
                Some(sid) => e.str(&sid.to_string())?,
                None => e.null()?,
            };
        }
        WorkerReply::SidResolved { name } => {
            e.array(2)?.u32(REP_SID_RESOLVED)?;
            match name {
                Some(name) => e.str(name)?,
                None => e.null()?,
            };
        }
        WorkerReply::Trusts { domains } => {
            e.array(2)?.u32(REP_TRUSTS)?;
            e.array(domains.len() as u64)?;
            for domain in domains {
                encode_domain(&mut e, domain)?;
            }
        }
        WorkerReply::Sequence { value } => {
            e.array(2)?.u32(REP_SEQUENCE)?.u64(*value)?;
        }
        WorkerReply::MappingResult { status, mapping } => {
            e.array(3)?
                .u32(REP_MAPPING)?
                .u8(map_status_code(*status))?;
            match mapping {
                Some(mapping) => encode_mapping(&mut e, mapping)?,
                None => {
                    e.null()?;
                }
            }
        }
        WorkerReply::Done => {
            e.array(1)?.u32(REP_DONE)?;
        }
        WorkerReply::Allocated { mapping } => {
            e.array(2)?.u32(REP_ALLOCATED)?;
            encode_mapping(&mut e, mapping)?;
        }
        WorkerReply::Fault {
            code,
            message,
            retryable,
        } => {
            e.array(4)?
                .u32(REP_FAULT)?
                .str(code)?
                .str(message)?
                .bool(*retryable)?;
        }
    }
    Ok(out)
}

fn decode_response_body(raw: &[u8]) -> Result<WorkerReply, WireError> {
    let mut d = Decoder::new(raw);
    d.array()?;
    let tag = d.u32()?;
    let body = match tag {
        REP_PONG => WorkerReply::Pong,
        REP_CONNECTED => WorkerReply::Connected {
            dc_name: d.str()?.to_string(),
            dc_host: d.str()?.to_string(),
        },
        REP_NAME_RESOLVED => WorkerReply::NameResolved {
            sid: decode_optional_sid(&mut d)?,
        },
        REP_SID_RESOLVED => WorkerReply::SidResolved {
            name: decode_optional_str(&mut d)?,
        },
        REP_TRUSTS => {
            let len = d.array()?.ok_or_else(|| {
                WireError::Cbor("indefinite trust list".to_string())
            })?;
            let mut domains = Vec::with_capacity(len as usize);
            for _ in 0..len {
                domains.push(decode_domain(&mut d)?);
            }
            WorkerReply::Trusts { domains }
        }
        REP_SEQUENCE => WorkerReply::Sequence { value: d.u64()? },
        REP_MAPPING => {
            let status = decode_map_status(&mut d)?;
            let mapping = if d.datatype()? == Type::Null {
                d.null()?;
                None
            } else {
                Some(decode_mapping(&mut d)?)
            };
            WorkerReply::MappingResult { status, mapping }
        }
        REP_DONE => WorkerReply::Done,
        REP_ALLOCATED => WorkerReply::Allocated {
            mapping: decode_mapping(&mut d)?,
        },
        REP_FAULT => WorkerReply::Fault {
            code: d.str()?.to_string(),
            message: d.str()?.to_string(),
            retryable: d.bool()?,
        },
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(body)
}

fn id_kind_code(kind: IdKind) -> u8 {
    match kind {
        IdKind::Uid => 0,
        IdKind::Gid => 1,
    }
}

fn map_status_code(status: MapStatus) -> u8 {
    match status {
        MapStatus::Mapped => 0,
        MapStatus::Unmapped => 1,
        MapStatus::Unknown => 2,
    }
}

fn trust_kind_code(kind: TrustKind) -> u8 {
    match kind {
        TrustKind::Primary => 0,
        TrustKind::Internal => 1,
        TrustKind::InForest => 2,
        TrustKind::ForestTransitive => 3,
        TrustKind::External => 4,
    }
}

fn decode_id_kind(d: &mut Decoder<'_>) -> Result<IdKind, WireError> {
    match d.u8()? {
        0 => Ok(IdKind::Uid),
        1 => Ok(IdKind::Gid),
        other => Err(WireError::Cbor(format!("bad id kind {other}"))),
    }
}

fn decode_map_status(d: &mut Decoder<'_>) -> Result<MapStatus, WireError> {
    match d.u8()? {
        0 => Ok(MapStatus::Mapped),
        1 => Ok(MapStatus::Unmapped),
        2 => Ok(MapStatus::Unknown),
        other => Err(WireError::Cbor(format!("bad map status {other}"))),
    }
}

fn decode_trust_kind(d: &mut Decoder<'_>) -> Result<TrustKind, WireError> {
    match d.u8()? {
        0 => Ok(TrustKind::Primary),
        1 => Ok(TrustKind::Internal),
        2 => Ok(TrustKind::InForest),
        3 => Ok(TrustKind::ForestTransitive),
        4 => Ok(TrustKind::External),
        other => Err(WireError::Cbor(format!("bad trust kind {other}"))),
    }
}

fn decode_sid(d: &mut Decoder<'_>) -> Result<Sid, WireError> {
    let raw = d.str()?;
    Sid::parse(raw).map_err(|e| WireError::BadSid(e.to_string()))
}

fn decode_optional_sid(d: &mut Decoder<'_>) -> Result<Option<Sid>, WireError> {
    if d.datatype()? == Type::Null {
        d.null()?;
        return Ok(None);
    }
    decode_sid(d).map(Some)
}

fn decode_optional_str(d: &mut Decoder<'_>) -> Result<Option<String>, WireError> {
    if d.datatype()? == Type::Null {
        d.null()?;
        return Ok(None);
    }
    Ok(Some(d.str()?.to_string()))
}

fn encode_mapping<W: minicbor::encode::Write>(
    e: &mut Encoder<W>,
    mapping: &Mapping,
) -> Result<(), WireError>
where
    W::Error: std::fmt::Display,
{
    e.array(3)?
        .str(&mapping.sid.to_string())?
        .u8(id_kind_code(mapping.kind))?
        .u32(mapping.id)?;
    Ok(())
}

fn decode_mapping(d: &mut Decoder<'_>) -> Result<Mapping, WireError> {
    d.array()?;
    Ok(Mapping {
        sid: decode_sid(d)?,
        kind: decode_id_kind(d)?,
        id: d.u32()?,
    })
}

fn encode_domain<W: minicbor::encode::Write>(
    e: &mut Encoder<W>,
    domain: &DomainInfo,
) -> Result<(), WireError>
where
    W::Error: std::fmt::Display,
{
    e.array(5)?.str(&domain.name)?;
    match &domain.alt_name {
        Some(alt) => e.str(alt)?,
        None => e.null()?,
    };
    match &domain.sid {
        Some(sid) => e.str(&sid.to_string())?,
        None => e.null()?,
    };
    e.u8(trust_kind_code(domain.kind))?;
    let attrs = (domain.attributes.forest_transitive as u8)
        | ((domain.attributes.active_directory as u8) << 1)
        | ((domain.attributes.forest_root as u8) << 2);
    e.u8(attrs)?;
    Ok(())
}

fn decode_domain(d: &mut Decoder<'_>) -> Result<DomainInfo, WireError> {
    d.array()?;
    let name = d.str()?.to_string();
    let alt_name = decode_optional_str(d)?;
    let sid = decode_optional_sid(d)?;
    let kind = decode_trust_kind(d)?;
    let attrs = d.u8()?;
    let mut info = DomainInfo::new(name, kind).with_attributes(TrustAttributes {
        forest_transitive: attrs & 1 != 0,
        active_directory: attrs & 2 != 0,
        forest_root: attrs & 4 != 0,
    });
    if let Some(alt) = alt_name {
        info = info.with_alt_name(alt);
    }
    if let Some(sid) = sid {
        info = info.with_sid(sid);
    }
    Ok(info)
}
