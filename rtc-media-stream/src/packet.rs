//! Raw RTP/RTCP packet buffers and the bounded pool that recycles them.
//!
//! [`RawPacket`] keeps the wire bytes and exposes the fixed RTP header fields
//! in place, so stages that only touch a sequence number or an SSRC do not pay
//! for a full parse. RFC 8285 header extension elements are read and written
//! in place too; the block is only re-encoded when an element changes size.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rtp::header::{EXTENSION_PROFILE_ONE_BYTE, EXTENSION_PROFILE_TWO_BYTE};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};
use shared::util;

pub const RTP_FIXED_HEADER_LENGTH: usize = 12;
pub const RTCP_HEADER_LENGTH: usize = 8;

const VERSION_SHIFT: u8 = 6;
const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;
const CC_MASK: u8 = 0x0F;
const MARKER_BIT: u8 = 0x80;
const PT_MASK: u8 = 0x7F;

const SEQ_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 4;
const SSRC_OFFSET: usize = 8;
const RTCP_SENDER_SSRC_OFFSET: usize = 4;

const ONE_BYTE_ID_RESERVED: u8 = 15;
const TWO_BYTE_PROFILE_MASK: u16 = 0xFFF0;

/// Whether a buffer travels on the data (RTP) or control (RTCP) channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    /// Tells RTP from RTCP by the packet type octet (RFC 5761), for channels
    /// that carry both.
    pub fn classify(buf: &[u8]) -> Option<PacketKind> {
        if util::is_rtcp(buf) && util::match_rtp_or_rtcp(buf) {
            Some(PacketKind::Rtcp)
        } else if util::is_rtp(buf) {
            Some(PacketKind::Rtp)
        } else {
            None
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Rtp => write!(f, "rtp"),
            PacketKind::Rtcp => write!(f, "rtcp"),
        }
    }
}

/// An owned RTP or RTCP datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct RawPacket {
    buffer: BytesMut,
    /// Arrival time for inbound packets, creation time for outbound ones.
    pub now: Instant,
}

impl fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPacket")
            .field("len", &self.buffer.len())
            .field("ssrc", &self.ssrc())
            .field("seq", &self.sequence_number())
            .finish()
    }
}

impl Default for RawPacket {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            now: Instant::now(),
        }
    }
}

impl RawPacket {
    pub fn new(data: &[u8], now: Instant) -> Self {
        Self {
            buffer: BytesMut::from(data),
            now,
        }
    }

    pub fn from_bytes_mut(buffer: BytesMut, now: Instant) -> Self {
        Self { buffer, now }
    }

    /// Serializes an RTP packet into a raw buffer.
    pub fn from_rtp(packet: &rtp::Packet, now: Instant) -> Result<Self> {
        Ok(Self {
            buffer: packet.marshal()?,
            now,
        })
    }

    /// Serializes a compound RTCP packet into a raw buffer.
    pub fn from_rtcp(packets: &[Box<dyn rtcp::Packet>], now: Instant) -> Result<Self> {
        let raw = rtcp::packet::marshal(packets)?;
        Ok(Self {
            buffer: BytesMut::from(&raw[..]),
            now,
        })
    }

    pub fn to_rtp(&self) -> Result<rtp::Packet> {
        rtp::Packet::unmarshal(&mut self.buffer.clone().freeze())
    }

    pub fn to_rtcp(&self) -> Result<Vec<Box<dyn rtcp::Packet>>> {
        rtcp::packet::unmarshal(&mut self.buffer.clone().freeze())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Replaces the content, reusing the allocation when it is large enough.
    pub fn fill(&mut self, data: &[u8], now: Instant) {
        self.buffer.clear();
        self.buffer.extend_from_slice(data);
        self.now = now;
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// True when the buffer claims version 2 and is long enough to hold the
    /// header, CSRC list, extension block and padding it announces.
    pub fn is_valid_rtp(&self) -> bool {
        self.buffer.len() >= RTP_FIXED_HEADER_LENGTH
            && self.version() == 2
            && self.header_length() + self.padding_size() <= self.buffer.len()
    }

    pub fn version(&self) -> u8 {
        self.byte(0) >> VERSION_SHIFT
    }

    pub fn has_padding(&self) -> bool {
        self.byte(0) & PADDING_BIT != 0
    }

    pub fn has_extension(&self) -> bool {
        self.byte(0) & EXTENSION_BIT != 0
    }

    pub fn csrc_count(&self) -> usize {
        (self.byte(0) & CC_MASK) as usize
    }

    pub fn is_marker(&self) -> bool {
        self.byte(1) & MARKER_BIT != 0
    }

    pub fn set_marker(&mut self, marker: bool) {
        if let Some(b) = self.buffer.get_mut(1) {
            if marker {
                *b |= MARKER_BIT;
            } else {
                *b &= !MARKER_BIT;
            }
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.byte(1) & PT_MASK
    }

    pub fn set_payload_type(&mut self, pt: u8) {
        if let Some(b) = self.buffer.get_mut(1) {
            *b = (*b & MARKER_BIT) | (pt & PT_MASK);
        }
    }

    pub fn sequence_number(&self) -> u16 {
        self.read_u16(SEQ_OFFSET)
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.write_u16(SEQ_OFFSET, seq);
    }

    pub fn timestamp(&self) -> u32 {
        self.read_u32(TIMESTAMP_OFFSET)
    }

    pub fn set_timestamp(&mut self, ts: u32) {
        self.write_u32(TIMESTAMP_OFFSET, ts);
    }

    pub fn ssrc(&self) -> u32 {
        self.read_u32(SSRC_OFFSET)
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.write_u32(SSRC_OFFSET, ssrc);
    }

    /// Length of the fixed header, CSRC list and extension block.
    pub fn header_length(&self) -> usize {
        let mut len = RTP_FIXED_HEADER_LENGTH + 4 * self.csrc_count();
        if self.has_extension() {
            // 16-bit profile, 16-bit length in 32-bit words
            let words = self.read_u16(len + 2) as usize;
            len += 4 + 4 * words;
        }
        len
    }

    /// Number of trailing padding octets, zero when the padding bit is clear.
    pub fn padding_size(&self) -> usize {
        if !self.has_padding() || self.buffer.is_empty() {
            return 0;
        }
        self.buffer[self.buffer.len() - 1] as usize
    }

    /// Payload length excluding header and padding; zero for malformed packets.
    pub fn payload_length(&self) -> usize {
        self.buffer
            .len()
            .saturating_sub(self.header_length())
            .saturating_sub(self.padding_size())
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.header_length();
        let end = self.buffer.len().saturating_sub(self.padding_size());
        if start >= end {
            return &[];
        }
        &self.buffer[start..end]
    }

    /// Value of header extension element `id`, if present.
    pub fn header_extension(&self, id: u8) -> Option<&[u8]> {
        self.extension_elements()
            .find(|(element, _)| *element == id)
            .map(|(_, value)| &self.buffer[value])
    }

    /// Sets header extension element `id`. A value of the same length is
    /// overwritten in place, anything else re-encodes the extension block,
    /// switching to the two-byte form when the one-byte form cannot hold it.
    pub fn set_header_extension(&mut self, id: u8, value: &[u8]) -> Result<()> {
        let existing = self
            .extension_elements()
            .find(|(element, _)| *element == id)
            .map(|(_, range)| range);
        if let Some(range) = existing
            && range.len() == value.len()
        {
            self.buffer[range].copy_from_slice(value);
            return Ok(());
        }
        self.rewrite_extensions(id, Some(value))
    }

    /// Removes header extension element `id`, dropping the block when it was
    /// the last one. Returns whether the element was present.
    pub fn remove_header_extension(&mut self, id: u8) -> Result<bool> {
        if self.header_extension(id).is_none() {
            return Ok(false);
        }
        self.rewrite_extensions(id, None)?;
        Ok(true)
    }

    /// Drops trailing padding and clears the padding bit.
    pub fn strip_padding(&mut self) {
        if !self.has_padding() || !self.is_valid_rtp() {
            return;
        }
        let len = self.buffer.len() - self.padding_size();
        self.buffer.truncate(len);
        self.buffer[0] &= !PADDING_BIT;
    }

    /// Inserts `data` in front of the payload.
    pub fn prepend_payload(&mut self, data: &[u8]) {
        let start = self.header_length().min(self.buffer.len());
        self.splice(start..start, data);
    }

    /// Removes the first `len` payload octets. False when the payload is
    /// shorter.
    pub fn strip_payload_prefix(&mut self, len: usize) -> bool {
        if self.payload_length() < len {
            return false;
        }
        let start = self.header_length();
        self.splice(start..start + len, &[]);
        true
    }

    /// Packet type of the first RTCP packet in a compound.
    pub fn rtcp_packet_type(&self) -> u8 {
        self.byte(1)
    }

    /// Sender SSRC of the first RTCP packet in a compound.
    pub fn rtcp_sender_ssrc(&self) -> u32 {
        self.read_u32(RTCP_SENDER_SSRC_OFFSET)
    }

    /// Profile and value range of the extension block, when the X bit is set
    /// and the block fits the buffer.
    fn extension_block(&self) -> Option<(u16, Range<usize>)> {
        if !self.has_extension() {
            return None;
        }
        let offset = RTP_FIXED_HEADER_LENGTH + 4 * self.csrc_count();
        let start = offset + 4;
        let end = start + 4 * self.read_u16(offset + 2) as usize;
        if end > self.buffer.len() {
            return None;
        }
        Some((self.read_u16(offset), start..end))
    }

    fn extension_elements(&self) -> ExtensionElements<'_> {
        let (two_byte, range) = match self.extension_block() {
            Some((EXTENSION_PROFILE_ONE_BYTE, range)) => (false, range),
            Some((profile, range))
                if profile & TWO_BYTE_PROFILE_MASK == EXTENSION_PROFILE_TWO_BYTE =>
            {
                (true, range)
            }
            _ => (false, 0..0),
        };
        ExtensionElements {
            buf: &self.buffer,
            two_byte,
            pos: range.start,
            end: range.end,
        }
    }

    /// Re-encodes the extension block without element `id`, then with
    /// `value` appended under `id` when given.
    fn rewrite_extensions(&mut self, id: u8, value: Option<&[u8]>) -> Result<()> {
        let offset = RTP_FIXED_HEADER_LENGTH + 4 * self.csrc_count();
        let block = if self.has_extension() {
            match self.extension_block() {
                Some((EXTENSION_PROFILE_ONE_BYTE, range)) => offset..range.end,
                Some((profile, range))
                    if profile & TWO_BYTE_PROFILE_MASK == EXTENSION_PROFILE_TWO_BYTE =>
                {
                    offset..range.end
                }
                Some(_) => return Err(Error::ErrRfc3550HeaderIdRange),
                None => return Err(Error::ErrHeaderSizeInsufficientForExtension),
            }
        } else if self.buffer.len() >= offset {
            offset..offset
        } else {
            return Err(Error::ErrHeaderSizeInsufficient);
        };

        let kept: Vec<(u8, Range<usize>)> = self
            .extension_elements()
            .filter(|(element, _)| *element != id)
            .collect();
        let lengths = kept
            .iter()
            .map(|(element, range)| (*element, range.len()))
            .chain(value.map(|v| (id, v.len())));

        let mut one_byte = true;
        let mut size = 0;
        for (element, len) in lengths {
            if element == 0 {
                return Err(Error::ErrRfc8285TwoByteHeaderIdRange);
            }
            if len > u8::MAX as usize {
                return Err(Error::ErrRfc8285TwoByteHeaderSize);
            }
            one_byte &= (1..=14).contains(&element) && (1..=16).contains(&len);
            size += 2 + len;
        }

        if kept.is_empty() && value.is_none() {
            self.splice(block, &[]);
            self.buffer[0] &= !EXTENSION_BIT;
            return Ok(());
        }

        let words = size.div_ceil(4);
        let mut encoded = BytesMut::with_capacity(4 + 4 * words);
        encoded.put_u16(if one_byte {
            EXTENSION_PROFILE_ONE_BYTE
        } else {
            EXTENSION_PROFILE_TWO_BYTE
        });
        encoded.put_u16(0);
        let mut put = |element: u8, data: &[u8]| {
            if one_byte {
                encoded.put_u8((element << 4) | (data.len() - 1) as u8);
            } else {
                encoded.put_u8(element);
                encoded.put_u8(data.len() as u8);
            }
            encoded.put_slice(data);
        };
        for (element, range) in &kept {
            put(*element, &self.buffer[range.clone()]);
        }
        if let Some(v) = value {
            put(id, v);
        }
        while encoded.len() % 4 != 0 {
            encoded.put_u8(0);
        }
        let words = (encoded.len() - 4) / 4;
        BigEndian::write_u16(&mut encoded[2..4], words as u16);

        self.splice(block, &encoded);
        self.buffer[0] |= EXTENSION_BIT;
        Ok(())
    }

    fn splice(&mut self, range: Range<usize>, data: &[u8]) {
        let tail = self.buffer.split_off(range.end);
        self.buffer.truncate(range.start);
        self.buffer.extend_from_slice(data);
        self.buffer.unsplit(tail);
    }

    fn byte(&self, offset: usize) -> u8 {
        self.buffer.get(offset).copied().unwrap_or(0)
    }

    fn read_u16(&self, offset: usize) -> u16 {
        self.buffer
            .get(offset..offset + 2)
            .map(BigEndian::read_u16)
            .unwrap_or(0)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.buffer
            .get(offset..offset + 4)
            .map(BigEndian::read_u32)
            .unwrap_or(0)
    }

    fn write_u16(&mut self, offset: usize, v: u16) {
        if let Some(b) = self.buffer.get_mut(offset..offset + 2) {
            BigEndian::write_u16(b, v);
        }
    }

    fn write_u32(&mut self, offset: usize, v: u32) {
        if let Some(b) = self.buffer.get_mut(offset..offset + 4) {
            BigEndian::write_u32(b, v);
        }
    }
}

/// Walks the elements of an RFC 8285 extension block, yielding each id with
/// the range of its value.
struct ExtensionElements<'a> {
    buf: &'a [u8],
    two_byte: bool,
    pos: usize,
    end: usize,
}

impl Iterator for ExtensionElements<'_> {
    type Item = (u8, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.end {
            let b = self.buf[self.pos];
            self.pos += 1;
            if b == 0 {
                // padding
                continue;
            }

            let (id, len) = if self.two_byte {
                if self.pos >= self.end {
                    return None;
                }
                let len = self.buf[self.pos] as usize;
                self.pos += 1;
                (b, len)
            } else {
                if b >> 4 == ONE_BYTE_ID_RESERVED {
                    self.pos = self.end;
                    return None;
                }
                (b >> 4, (b & 0x0F) as usize + 1)
            };

            let value = self.pos..self.pos + len;
            if value.end > self.end {
                self.pos = self.end;
                return None;
            }
            self.pos = value.end;
            return Some((id, value));
        }
        None
    }
}

/// Bounded pool of receive buffers.
///
/// At most `capacity + 1` buffers are handed out at any time: `capacity`
/// parked in consumers plus the one being filled by the receive loop.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<RawPacket>>,
    live: AtomicUsize,
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("capacity", &self.inner.capacity)
            .field("live", &self.live())
            .field("free", &self.inner.free.lock().len())
            .finish()
    }
}

impl PacketPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ErrInvalidPoolCapacity);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
                live: AtomicUsize::new(0),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers currently handed out and not yet released.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Buffers parked in the pool, ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Hands out a recycled buffer, or a fresh one while below the bound.
    /// Returns `None` once `capacity + 1` buffers are live.
    pub fn acquire(&self) -> Option<RawPacket> {
        let limit = self.inner.capacity + 1;
        let mut live = self.inner.live.load(Ordering::Acquire);
        loop {
            if live >= limit {
                return None;
            }
            match self.inner.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }

        Some(self.inner.free.lock().pop().unwrap_or_default())
    }

    /// Returns a buffer previously obtained from [`PacketPool::acquire`].
    pub fn release(&self, mut pkt: RawPacket) {
        pkt.clear();
        let _ = self
            .inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));

        let mut free = self.inner.free.lock();
        if free.len() < self.inner.capacity {
            free.push(pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_rtp(seq: u16, ssrc: u32) -> Vec<u8> {
        let mut raw = vec![
            0x80, 0x60, 0x00, 0x00, // v=2, pt=96
            0x00, 0x00, 0x00, 0x10, // timestamp
            0x00, 0x00, 0x00, 0x00, // ssrc
            0xAA, 0xBB, 0xCC, // payload
        ];
        BigEndian::write_u16(&mut raw[2..4], seq);
        BigEndian::write_u32(&mut raw[8..12], ssrc);
        raw
    }

    #[test]
    fn test_packet_kind_classify() {
        let tests: Vec<(Vec<u8>, Option<PacketKind>)> = vec![
            (make_rtp(1, 2), Some(PacketKind::Rtp)),
            (vec![0x81, 201, 0x00, 0x01, 0, 0, 0, 1], Some(PacketKind::Rtcp)),
            (vec![0x16, 0xFE, 0xFD, 0x00], None),
            (vec![0x80], None),
        ];
        for (buf, expected) in tests {
            assert_eq!(PacketKind::classify(&buf), expected, "{buf:?}");
        }
    }

    #[test]
    fn test_raw_packet_header_accessors() {
        let mut pkt = RawPacket::new(&make_rtp(1000, 0x1234_5678), Instant::now());
        assert!(pkt.is_valid_rtp());
        assert_eq!(pkt.version(), 2);
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.sequence_number(), 1000);
        assert_eq!(pkt.timestamp(), 0x10);
        assert_eq!(pkt.ssrc(), 0x1234_5678);
        assert_eq!(pkt.header_length(), 12);
        assert_eq!(pkt.payload(), &[0xAA, 0xBB, 0xCC]);

        pkt.set_marker(true);
        pkt.set_payload_type(111);
        pkt.set_sequence_number(7);
        pkt.set_ssrc(42);
        assert!(pkt.is_marker());
        assert_eq!(pkt.payload_type(), 111);
        assert_eq!(pkt.sequence_number(), 7);
        assert_eq!(pkt.ssrc(), 42);

        let parsed = pkt.to_rtp().unwrap();
        assert!(parsed.header.marker);
        assert_eq!(parsed.header.payload_type, 111);
        assert_eq!(parsed.payload, Bytes::from_static(&[0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn test_raw_packet_truncated_header_is_invalid() {
        // CSRC count of 2 but no CSRC list
        let mut buf = make_rtp(1, 2);
        buf[0] |= 0x02;
        buf.truncate(12);
        assert!(!RawPacket::new(&buf, Instant::now()).is_valid_rtp());

        // extension bit set without an extension header
        let mut buf = make_rtp(1, 2);
        buf[0] |= 0x10;
        buf.truncate(12);
        assert!(!RawPacket::new(&buf, Instant::now()).is_valid_rtp());

        // padding longer than the packet
        let mut buf = make_rtp(1, 2);
        buf[0] |= 0x20;
        let last = buf.len() - 1;
        buf[last] = 200;
        assert!(!RawPacket::new(&buf, Instant::now()).is_valid_rtp());

        assert!(!RawPacket::new(&[0x40; 16], Instant::now()).is_valid_rtp());
    }

    #[test]
    fn test_raw_packet_short_buffer_is_harmless() {
        let mut pkt = RawPacket::new(&[0x80, 0x60], Instant::now());
        assert!(!pkt.is_valid_rtp());
        assert_eq!(pkt.sequence_number(), 0);
        assert_eq!(pkt.ssrc(), 0);
        pkt.set_ssrc(5);
        assert_eq!(pkt.len(), 2);
        assert!(pkt.payload().is_empty());
    }

    #[test]
    fn test_raw_packet_padding_and_extension() {
        let header = rtp::header::Header {
            version: 2,
            payload_type: 100,
            sequence_number: 3,
            ssrc: 9,
            ..Default::default()
        };
        let mut rtp_pkt = rtp::Packet {
            header,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
            padding_size: 3,
        };
        rtp_pkt.header.padding = true;
        rtp_pkt
            .header
            .set_extension(1, Bytes::from_static(&[0xAB]))
            .unwrap();

        let raw = RawPacket::from_rtp(&rtp_pkt, Instant::now()).unwrap();
        assert!(raw.has_extension());
        assert!(raw.has_padding());
        assert_eq!(raw.padding_size(), 3);
        assert_eq!(raw.header_length(), 12 + 4 + 4);
        assert_eq!(raw.payload(), &[1, 2, 3, 4, 5]);
        assert_eq!(raw.payload_length(), 5);
    }

    #[test]
    fn test_raw_packet_header_extension_elements() -> Result<()> {
        let orig = make_rtp(7, 0x1234);
        let mut pkt = RawPacket::new(&orig, Instant::now());
        assert_eq!(pkt.header_extension(3), None);
        assert!(!pkt.remove_header_extension(3)?);

        pkt.set_header_extension(3, &[1, 2, 3])?;
        assert!(pkt.has_extension());
        assert_eq!(pkt.header_length(), 12 + 4 + 4);
        assert_eq!(pkt.header_extension(3), Some(&[1, 2, 3][..]));
        assert_eq!(pkt.payload(), &[0xAA, 0xBB, 0xCC]);

        let len = pkt.len();
        pkt.set_header_extension(3, &[4, 5, 6])?;
        assert_eq!(pkt.len(), len, "same length value is written in place");
        pkt.set_header_extension(5, &[9])?;

        // too long for the one-byte form
        pkt.set_header_extension(20, &[7; 20])?;
        let rtp_pkt = pkt.to_rtp()?;
        assert_eq!(
            rtp_pkt.header.extension_profile,
            rtp::header::EXTENSION_PROFILE_TWO_BYTE
        );
        assert_eq!(rtp_pkt.header.get_extension(3).as_deref(), Some(&[4, 5, 6][..]));
        assert_eq!(rtp_pkt.header.get_extension(5).as_deref(), Some(&[9][..]));
        assert_eq!(rtp_pkt.header.get_extension(20).as_deref(), Some(&[7; 20][..]));
        assert_eq!(&rtp_pkt.payload[..], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(pkt.sequence_number(), 7);

        assert!(pkt.remove_header_extension(20)?);
        assert!(pkt.remove_header_extension(3)?);
        assert!(pkt.remove_header_extension(5)?);
        assert!(!pkt.has_extension());
        assert_eq!(pkt.as_slice(), &orig[..]);

        assert!(pkt.set_header_extension(0, &[1]).is_err());
        Ok(())
    }

    #[test]
    fn test_raw_packet_payload_prefix_and_padding() {
        let orig = make_rtp(7, 0x1234);
        let mut pkt = RawPacket::new(&orig, Instant::now());

        pkt.prepend_payload(&[0x00, 0x07]);
        assert_eq!(pkt.payload(), &[0x00, 0x07, 0xAA, 0xBB, 0xCC]);
        assert!(pkt.strip_payload_prefix(2));
        assert_eq!(pkt.as_slice(), &orig[..]);
        assert!(!pkt.strip_payload_prefix(4));

        let mut padded = orig.clone();
        padded[0] |= 0x20;
        padded.extend_from_slice(&[0, 0, 3]);
        let mut pkt = RawPacket::new(&padded, Instant::now());
        assert_eq!(pkt.padding_size(), 3);
        pkt.strip_padding();
        assert!(!pkt.has_padding());
        assert_eq!(pkt.as_slice(), &orig[..]);
    }

    #[test]
    fn test_packet_pool_bound() {
        let pool = PacketPool::new(2).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.live(), 3);
        assert!(pool.acquire().is_none(), "capacity + 1 is the hard bound");

        pool.release(a);
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.available(), 1);
        let d = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);

        pool.release(b);
        pool.release(c);
        pool.release(d);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.available(), 2, "pool keeps at most capacity buffers");
    }

    #[test]
    fn test_packet_pool_rejects_zero_capacity() {
        assert_eq!(PacketPool::new(0).err(), Some(Error::ErrInvalidPoolCapacity));
    }
}
