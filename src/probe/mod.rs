//! The probe is the one and only message of the latency protocol. It has a fixed binary layout of
//!  [PROBE_SIZE] bytes, and it carries its complete timing trace: a returning probe can be
//!  evaluated without any local bookkeeping of probes in flight.

pub mod location;
pub mod timestamp;

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::probe::location::{Location, LOCATION_SIZE};
use crate::probe::timestamp::{Timestamp, TimestampError, TIMESTAMP_SIZE};

/// Identifies a node (or, on the sending side, the peer a probe is addressed to)
pub type NodeId = Uuid;

pub const PROBE_SIZE: usize = 142;

const SEQUENCE_SIZE: usize = 8;
const ID_SIZE: usize = 16;

const OFFS_SRC_ID: usize = SEQUENCE_SIZE;
const OFFS_SRC_TIMESTAMP: usize = OFFS_SRC_ID + ID_SIZE;
const OFFS_SRC_LOCATION: usize = OFFS_SRC_TIMESTAMP + TIMESTAMP_SIZE;
const OFFS_DST_ID: usize = OFFS_SRC_LOCATION + LOCATION_SIZE;
const OFFS_DST_TIMESTAMP: usize = OFFS_DST_ID + ID_SIZE;
const OFFS_DST_LOCATION: usize = OFFS_DST_TIMESTAMP + TIMESTAMP_SIZE;

const _: () = assert!(OFFS_DST_LOCATION + LOCATION_SIZE == PROBE_SIZE);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeField {
    SrcId,
    SrcTimestamp,
    DstId,
    DstTimestamp,
}
impl Display for ProbeField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProbeField::SrcId => "src_id",
            ProbeField::SrcTimestamp => "src_timestamp",
            ProbeField::DstId => "dst_id",
            ProbeField::DstTimestamp => "dst_timestamp",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProbeEncodeError {
    #[error("failed to encode probe: {field}: {source}")]
    Timestamp {
        field: ProbeField,
        source: TimestampError,
    },
}
impl ProbeEncodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeEncodeError::Timestamp { .. } => "encode_timestamp",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeDecodeError {
    #[error("failed to decode probe: invalid binary length: expected {PROBE_SIZE}, got {0}")]
    Length(usize),
    #[error("failed to decode probe: {field}: {source}")]
    Id {
        field: ProbeField,
        source: uuid::Error,
    },
    #[error("failed to decode probe: {field}: {source}")]
    Timestamp {
        field: ProbeField,
        source: TimestampError,
    },
}
impl ProbeDecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeDecodeError::Length(_) => "decode_length",
            ProbeDecodeError::Id { .. } => "decode_id",
            ProbeDecodeError::Timestamp { .. } => "decode_timestamp",
        }
    }

    pub fn field(&self) -> Option<ProbeField> {
        match self {
            ProbeDecodeError::Length(_) => None,
            ProbeDecodeError::Id { field, .. } => Some(*field),
            ProbeDecodeError::Timestamp { field, .. } => Some(*field),
        }
    }
}

/// Layout (offsets in bytes, the sequence number little-endian):
///
/// ```text
/// 0        8        24              39            75       91              106           142
/// +--------+--------+---------------+-------------+--------+---------------+-------------+
/// |sequence| src id | src timestamp | src location| dst id | dst timestamp | dst location|
/// +--------+--------+---------------+-------------+--------+---------------+-------------+
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Probe {
    /// per peer, for diagnostics only - it plays no part in matching a returning probe
    pub sequence: u64,
    pub src_id: NodeId,
    pub src_timestamp: Timestamp,
    pub src_location: Location,
    pub dst_id: NodeId,
    /// zero until the probe was stamped by the node it is addressed to
    pub dst_timestamp: Timestamp,
    pub dst_location: Location,
}

impl Probe {
    pub fn encode(&self) -> Result<Bytes, ProbeEncodeError> {
        let mut buf = BytesMut::with_capacity(PROBE_SIZE);

        buf.put_u64_le(self.sequence);
        buf.put_slice(self.src_id.as_bytes());
        self.src_timestamp.ser(&mut buf)
            .map_err(|source| ProbeEncodeError::Timestamp { field: ProbeField::SrcTimestamp, source })?;
        buf.put_slice(self.src_location.as_bytes());
        buf.put_slice(self.dst_id.as_bytes());
        self.dst_timestamp.ser(&mut buf)
            .map_err(|source| ProbeEncodeError::Timestamp { field: ProbeField::DstTimestamp, source })?;
        buf.put_slice(self.dst_location.as_bytes());

        debug_assert_eq!(buf.len(), PROBE_SIZE);
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Probe, ProbeDecodeError> {
        if buf.len() != PROBE_SIZE {
            return Err(ProbeDecodeError::Length(buf.len()));
        }

        let sequence = (&buf[..SEQUENCE_SIZE]).get_u64_le();

        let src_id = Self::decode_id(buf, OFFS_SRC_ID, ProbeField::SrcId)?;
        let src_timestamp = Self::decode_timestamp(buf, OFFS_SRC_TIMESTAMP, ProbeField::SrcTimestamp)?;
        let src_location = Self::decode_location(buf, OFFS_SRC_LOCATION);

        let dst_id = Self::decode_id(buf, OFFS_DST_ID, ProbeField::DstId)?;
        let dst_timestamp = Self::decode_timestamp(buf, OFFS_DST_TIMESTAMP, ProbeField::DstTimestamp)?;
        let dst_location = Self::decode_location(buf, OFFS_DST_LOCATION);

        Ok(Probe {
            sequence,
            src_id,
            src_timestamp,
            src_location,
            dst_id,
            dst_timestamp,
            dst_location,
        })
    }

    fn decode_id(buf: &[u8], offs: usize, field: ProbeField) -> Result<NodeId, ProbeDecodeError> {
        Uuid::from_slice(&buf[offs..offs + ID_SIZE])
            .map_err(|source| ProbeDecodeError::Id { field, source })
    }

    fn decode_timestamp(buf: &[u8], offs: usize, field: ProbeField) -> Result<Timestamp, ProbeDecodeError> {
        Timestamp::deser(&buf[offs..offs + TIMESTAMP_SIZE])
            .map_err(|source| ProbeDecodeError::Timestamp { field, source })
    }

    fn decode_location(buf: &[u8], offs: usize) -> Location {
        let mut bytes = [0u8; LOCATION_SIZE];
        bytes.copy_from_slice(&buf[offs..offs + LOCATION_SIZE]);
        Location::from_bytes(bytes)
    }
}
