//! Wire format serialization and deserialization.
//!
//! Every PDU is a one-byte tag followed by a fixed layout. Multi-byte integers
//! are little-endian, addresses included. Variable-length fields (entry name
//! and email) carry a one-byte length prefix.
//!
//! ## Layouts
//!
//! ```text
//! Alive (0) | GetExistingMember (1) | CloseConnection (5)
//! | RangeChangeResponse (8) | StunLookup (200)        tag only
//!
//! GetExistingMemberResponse (2)   addr (4) || port (2)
//! Join (3)                        prospect_addr (4) || prospect_port (2)
//!                                 || max_span (1) || max_addr (4) || max_port (2)
//! JoinResponse (4)                succ_addr (4) || succ_port (2) || start (1) || end (1)
//! RangeChange (6)                 start (1) || end (1)
//! Leaving (7)                     succ_addr (4) || succ_port (2)
//! Insert (100)
//! | LookupResponse (103)          key (12) || name_len (1) || name || email_len (1) || email
//! Remove (101)                    key (12)
//! Lookup (102)                    key (12) || addr (4) || port (2)
//! StunResponse (201)              addr (4)
//! ```
//!
//! A stream carries PDUs back to back with no outer framing; [`frame_len`]
//! walks the layout to find where the first one ends.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::types::{
    Entry, HashRange, Key, PeerAddr, KEY_LEN, MAX_FIELD_LEN, NET_ALIVE, NET_CLOSE_CONNECTION,
    NET_GET_NODE, NET_GET_NODE_RESPONSE, NET_JOIN, NET_JOIN_RESPONSE, NET_LEAVING, NET_NEW_RANGE,
    NET_NEW_RANGE_RESPONSE, STUN_LOOKUP, STUN_RESPONSE, VAL_INSERT, VAL_LOOKUP,
    VAL_LOOKUP_RESPONSE, VAL_REMOVE,
};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    /// Tag byte names no known PDU.
    #[error("unknown message tag {0}")]
    InvalidMessageType(u8),
    /// Range with start greater than end.
    #[error("range start {0} exceeds end {1}")]
    InvalidRange(u8, u8),
    /// Bytes left over after a complete PDU.
    #[error("trailing bytes after message")]
    InvalidLength,
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read bytes prefixed by a one-byte length.
    pub fn read_short_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    pub fn read_key(&mut self) -> Result<Key, DecodeError> {
        let bytes = self.read_bytes(KEY_LEN)?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(key)
    }

    pub fn read_ip(&mut self) -> Result<Ipv4Addr, DecodeError> {
        Ok(Ipv4Addr::from(self.read_u32_le()?))
    }

    /// Read an IPv4 address followed by a port.
    pub fn read_addr(&mut self) -> Result<PeerAddr, DecodeError> {
        let ip = self.read_ip()?;
        let port = self.read_u16_le()?;
        Ok(SocketAddrV4::new(ip, port))
    }

    /// Read a `start || end` pair, rejecting inverted ranges.
    pub fn read_range(&mut self) -> Result<HashRange, DecodeError> {
        let start = self.read_u8()?;
        let end = self.read_u8()?;
        HashRange::new(start, end).ok_or(DecodeError::InvalidRange(start, end))
    }

    pub fn read_entry(&mut self) -> Result<Entry, DecodeError> {
        let key = self.read_key()?;
        let name = self.read_short_bytes()?.to_vec();
        let email = self.read_short_bytes()?.to_vec();
        Ok(Entry { key, name, email })
    }
}

/// Writer for encoding messages.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Write bytes with a one-byte length prefix. `v` is at most
    /// [`MAX_FIELD_LEN`] bytes, as [`Entry::new`] guarantees.
    pub(crate) fn write_short_bytes(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= MAX_FIELD_LEN);
        self.write_u8(v.len() as u8);
        self.write_bytes(v);
    }

    pub fn write_ip(&mut self, ip: Ipv4Addr) {
        self.write_u32_le(u32::from(ip));
    }

    pub fn write_addr(&mut self, addr: &PeerAddr) {
        self.write_ip(*addr.ip());
        self.write_u16_le(addr.port());
    }

    pub fn write_range(&mut self, range: &HashRange) {
        self.write_u8(range.min());
        self.write_u8(range.max());
    }

    pub fn write_entry(&mut self, entry: &Entry) {
        self.write_bytes(&entry.key);
        self.write_short_bytes(&entry.name);
        self.write_short_bytes(&entry.email);
    }

    /// Finish writing and return the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    /// Encode this value to the writer.
    fn encode(&self, w: &mut Writer);

    /// Encode and return the bytes.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    /// Decode a value from the reader.
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice (strict: rejects trailing bytes).
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let result = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(result)
    }
}

/// A Join as it circulates the ring.
///
/// `max_span`/`max_addr` name the largest range seen so far (the challenger);
/// an unset `max_addr` means no member has claimed it yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    /// Listener endpoint of the node asking to join.
    pub prospect: PeerAddr,
    pub max_span: u8,
    pub max_addr: PeerAddr,
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pdu {
    Alive,
    GetExistingMember,
    /// An unset address means the tracker knows of no member.
    GetExistingMemberResponse { member: PeerAddr },
    Join(JoinRequest),
    JoinResponse { successor: PeerAddr, range: HashRange },
    CloseConnection,
    RangeChange { range: HashRange },
    Leaving { successor: PeerAddr },
    RangeChangeResponse,
    Insert(Entry),
    Remove { key: Key },
    Lookup { key: Key, requester: PeerAddr },
    LookupResponse(Entry),
    StunLookup,
    StunResponse { addr: Ipv4Addr },
}

impl Pdu {
    /// The tag byte this PDU is encoded with.
    pub fn tag(&self) -> u8 {
        match self {
            Pdu::Alive => NET_ALIVE,
            Pdu::GetExistingMember => NET_GET_NODE,
            Pdu::GetExistingMemberResponse { .. } => NET_GET_NODE_RESPONSE,
            Pdu::Join(_) => NET_JOIN,
            Pdu::JoinResponse { .. } => NET_JOIN_RESPONSE,
            Pdu::CloseConnection => NET_CLOSE_CONNECTION,
            Pdu::RangeChange { .. } => NET_NEW_RANGE,
            Pdu::Leaving { .. } => NET_LEAVING,
            Pdu::RangeChangeResponse => NET_NEW_RANGE_RESPONSE,
            Pdu::Insert(_) => VAL_INSERT,
            Pdu::Remove { .. } => VAL_REMOVE,
            Pdu::Lookup { .. } => VAL_LOOKUP,
            Pdu::LookupResponse(_) => VAL_LOOKUP_RESPONSE,
            Pdu::StunLookup => STUN_LOOKUP,
            Pdu::StunResponse { .. } => STUN_RESPONSE,
        }
    }
}

impl Encode for JoinRequest {
    fn encode(&self, w: &mut Writer) {
        w.write_addr(&self.prospect);
        w.write_u8(self.max_span);
        w.write_addr(&self.max_addr);
    }
}

impl Decode for JoinRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let prospect = r.read_addr()?;
        let max_span = r.read_u8()?;
        let max_addr = r.read_addr()?;
        Ok(JoinRequest {
            prospect,
            max_span,
            max_addr,
        })
    }
}

impl Encode for Pdu {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.tag());
        match self {
            Pdu::Alive
            | Pdu::GetExistingMember
            | Pdu::CloseConnection
            | Pdu::RangeChangeResponse
            | Pdu::StunLookup => {}
            Pdu::GetExistingMemberResponse { member } => w.write_addr(member),
            Pdu::Join(join) => join.encode(w),
            Pdu::JoinResponse { successor, range } => {
                w.write_addr(successor);
                w.write_range(range);
            }
            Pdu::RangeChange { range } => w.write_range(range),
            Pdu::Leaving { successor } => w.write_addr(successor),
            Pdu::Insert(entry) | Pdu::LookupResponse(entry) => w.write_entry(entry),
            Pdu::Remove { key } => w.write_bytes(key),
            Pdu::Lookup { key, requester } => {
                w.write_bytes(key);
                w.write_addr(requester);
            }
            Pdu::StunResponse { addr } => w.write_ip(*addr),
        }
    }
}

impl Decode for Pdu {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tag = r.read_u8()?;
        let pdu = match tag {
            NET_ALIVE => Pdu::Alive,
            NET_GET_NODE => Pdu::GetExistingMember,
            NET_GET_NODE_RESPONSE => Pdu::GetExistingMemberResponse {
                member: r.read_addr()?,
            },
            NET_JOIN => Pdu::Join(JoinRequest::decode(r)?),
            NET_JOIN_RESPONSE => {
                let successor = r.read_addr()?;
                let range = r.read_range()?;
                Pdu::JoinResponse { successor, range }
            }
            NET_CLOSE_CONNECTION => Pdu::CloseConnection,
            NET_NEW_RANGE => Pdu::RangeChange {
                range: r.read_range()?,
            },
            NET_LEAVING => Pdu::Leaving {
                successor: r.read_addr()?,
            },
            NET_NEW_RANGE_RESPONSE => Pdu::RangeChangeResponse,
            VAL_INSERT => Pdu::Insert(r.read_entry()?),
            VAL_REMOVE => Pdu::Remove { key: r.read_key()? },
            VAL_LOOKUP => {
                let key = r.read_key()?;
                let requester = r.read_addr()?;
                Pdu::Lookup { key, requester }
            }
            VAL_LOOKUP_RESPONSE => Pdu::LookupResponse(r.read_entry()?),
            STUN_LOOKUP => Pdu::StunLookup,
            STUN_RESPONSE => Pdu::StunResponse { addr: r.read_ip()? },
            other => return Err(DecodeError::InvalidMessageType(other)),
        };
        Ok(pdu)
    }
}

/// Decode the first PDU in `buf`, returning it with the number of bytes it used.
pub fn decode_prefix(buf: &[u8]) -> Result<(Pdu, usize), DecodeError> {
    let mut r = Reader::new(buf);
    let pdu = Pdu::decode(&mut r)?;
    Ok((pdu, r.position()))
}

/// Length of the first complete PDU in `buf`.
///
/// `Ok(None)` means the buffer holds only a prefix and more bytes are needed.
/// Any other decode failure is returned as is; the stream cannot be resynced.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    match decode_prefix(buf) {
        Ok((_, len)) => Ok(Some(len)),
        Err(DecodeError::UnexpectedEof) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Length of the longest run of complete PDUs at the start of `buf`.
///
/// Bytes that cannot be framed at all count as complete, so the receiver
/// surfaces the decode error instead of waiting forever for more input.
pub fn complete_prefix(buf: &[u8]) -> usize {
    let mut used = 0;
    loop {
        match frame_len(&buf[used..]) {
            Ok(Some(len)) => used += len,
            Ok(None) => return used,
            Err(_) => return buf.len(),
        }
    }
}
