use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const PADDING_MASK: u8 = 0x1;
pub const EXTENSION_SHIFT: u8 = 4;
pub const EXTENSION_MASK: u8 = 0x1;
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
pub const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;
pub const EXTENSION_ID_RESERVED: u8 = 0xF;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const MARKER_MASK: u8 = 0x1;
pub const PT_MASK: u8 = 0x7F;
pub const SEQ_NUM_OFFSET: usize = 2;
pub const SEQ_NUM_LENGTH: usize = 2;
pub const TIMESTAMP_OFFSET: usize = 4;
pub const TIMESTAMP_LENGTH: usize = 4;
pub const SSRC_OFFSET: usize = 8;
pub const SSRC_LENGTH: usize = 4;
pub const CSRC_OFFSET: usize = 12;
pub const CSRC_LENGTH: usize = 4;
pub const MAX_CSRC_COUNT: usize = 15;

/// A single RTP header extension element.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

/// RTP fixed header (RFC 3550 section 5.1) with CSRC list and
/// RFC 8285 one-byte/two-byte header extensions.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extensions: Vec<Extension>,
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        /*
         *  0                   1                   2                   3
         *  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |V=2|P|X|  CC   |M|     PT      |       sequence number         |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |                           timestamp                           |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         * |           synchronization source (SSRC) identifier            |
         * +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
         * |            contributing source (CSRC) identifiers             |
         * |                             ....                              |
         * +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
         */
        let b0 = raw_packet.get_u8();
        let version = (b0 >> VERSION_SHIFT) & VERSION_MASK;
        let padding = ((b0 >> PADDING_SHIFT) & PADDING_MASK) > 0;
        let extension = ((b0 >> EXTENSION_SHIFT) & EXTENSION_MASK) > 0;
        let cc = (b0 & CC_MASK) as usize;

        let mut curr_offset = CSRC_OFFSET + (cc * CSRC_LENGTH);
        if raw_packet_len < curr_offset {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let b1 = raw_packet.get_u8();
        let marker = ((b1 >> MARKER_SHIFT) & MARKER_MASK) > 0;
        let payload_type = b1 & PT_MASK;

        let sequence_number = raw_packet.get_u16();
        let timestamp = raw_packet.get_u32();
        let ssrc = raw_packet.get_u32();

        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(raw_packet.get_u32());
        }

        let (extension_profile, extensions) = if extension {
            let expected = curr_offset + 4;
            if raw_packet_len < expected {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }
            let extension_profile = raw_packet.get_u16();
            let extension_length = raw_packet.get_u16() as usize * 4;
            curr_offset += 4;

            let end = curr_offset + extension_length;
            if raw_packet_len < end {
                return Err(Error::ErrHeaderSizeInsufficientForExtension);
            }

            let mut extensions = vec![];
            match extension_profile {
                // RFC 8285 RTP One Byte Header Extension
                EXTENSION_PROFILE_ONE_BYTE => {
                    while curr_offset < end {
                        let b = raw_packet.get_u8();
                        curr_offset += 1;
                        if b == 0x00 {
                            // padding
                            continue;
                        }

                        let extid = b >> 4;
                        if extid == EXTENSION_ID_RESERVED {
                            raw_packet.advance(end - curr_offset);
                            curr_offset = end;
                            break;
                        }

                        let len = ((b & 0x0F) + 1) as usize;
                        if curr_offset + len > end {
                            return Err(Error::ErrHeaderSizeInsufficientForExtension);
                        }
                        extensions.push(Extension {
                            id: extid,
                            payload: raw_packet.copy_to_bytes(len),
                        });
                        curr_offset += len;
                    }
                }
                // RFC 8285 RTP Two Byte Header Extension
                EXTENSION_PROFILE_TWO_BYTE => {
                    while curr_offset < end {
                        let b = raw_packet.get_u8();
                        curr_offset += 1;
                        if b == 0x00 {
                            // padding
                            continue;
                        }

                        if curr_offset >= end {
                            return Err(Error::ErrHeaderSizeInsufficientForExtension);
                        }
                        let len = raw_packet.get_u8() as usize;
                        curr_offset += 1;
                        if curr_offset + len > end {
                            return Err(Error::ErrHeaderSizeInsufficientForExtension);
                        }
                        extensions.push(Extension {
                            id: b,
                            payload: raw_packet.copy_to_bytes(len),
                        });
                        curr_offset += len;
                    }
                }
                // RFC3550 Extension
                _ => {
                    extensions.push(Extension {
                        id: 0,
                        payload: raw_packet.copy_to_bytes(extension_length),
                    });
                }
            };

            (extension_profile, extensions)
        } else {
            (0, vec![])
        };

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extensions,
        })
    }
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut head_size = 12 + (self.csrc.len() * CSRC_LENGTH);
        if self.extension {
            let extension_payload_len = self.get_extension_payload_len();
            let extension_payload_size = extension_payload_len.div_ceil(4);
            head_size += 4 + extension_payload_size * 4;
        }
        head_size
    }
}

impl Marshal for Header {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let remaining_before = buf.remaining_mut();
        if remaining_before < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        if self.csrc.len() > MAX_CSRC_COUNT {
            return Err(Error::ErrTooManyCsrcs);
        }

        // The first byte contains the version, padding bit, extension bit, and csrc size
        let mut b0 = (self.version << VERSION_SHIFT) | self.csrc.len() as u8;
        if self.padding {
            b0 |= 1 << PADDING_SHIFT;
        }
        if self.extension {
            b0 |= 1 << EXTENSION_SHIFT;
        }
        buf.put_u8(b0);

        // The second byte contains the marker bit and payload type.
        let mut b1 = self.payload_type & PT_MASK;
        if self.marker {
            b1 |= 1 << MARKER_SHIFT;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            buf.put_u16(self.extension_profile);

            // calculate extensions size and round to 4 bytes boundaries
            let extension_payload_len = self.get_extension_payload_len();
            if self.extension_profile != EXTENSION_PROFILE_ONE_BYTE
                && self.extension_profile != EXTENSION_PROFILE_TWO_BYTE
                && extension_payload_len % 4 != 0
            {
                return Err(Error::ErrHeaderExtensionPayloadNot32BitWords);
            }
            let extension_payload_size = extension_payload_len.div_ceil(4);
            buf.put_u16(extension_payload_size as u16);

            match self.extension_profile {
                // RFC 8285 RTP One Byte Header Extension
                EXTENSION_PROFILE_ONE_BYTE => {
                    for extension in &self.extensions {
                        let len = extension.payload.len().saturating_sub(1) as u8;
                        buf.put_u8((extension.id << 4) | (len & 0x0F));
                        buf.put_slice(&extension.payload);
                    }
                }
                // RFC 8285 RTP Two Byte Header Extension
                EXTENSION_PROFILE_TWO_BYTE => {
                    for extension in &self.extensions {
                        buf.put_u8(extension.id);
                        buf.put_u8(extension.payload.len() as u8);
                        buf.put_slice(&extension.payload);
                    }
                }
                // RFC3550 Extension
                _ => {
                    if self.extensions.len() != 1 {
                        return Err(Error::ErrRfc3550HeaderIdRange);
                    }
                    buf.put_slice(&self.extensions[0].payload);
                }
            };

            // add padding to reach 4 bytes boundaries
            for _ in extension_payload_len..extension_payload_size * 4 {
                buf.put_u8(0);
            }
        }

        Ok(remaining_before - buf.remaining_mut())
    }
}

impl Header {
    pub fn get_extension_payload_len(&self) -> usize {
        let payload_len: usize = self
            .extensions
            .iter()
            .map(|extension| extension.payload.len())
            .sum();

        let profile_len = self.extensions.len()
            * match self.extension_profile {
                EXTENSION_PROFILE_ONE_BYTE => 1,
                EXTENSION_PROFILE_TWO_BYTE => 2,
                _ => 0,
            };

        payload_len + profile_len
    }

    /// Sets an RTP header extension, switching from the one-byte to the
    /// two-byte profile when `id` or the payload does not fit one byte form.
    pub fn set_extension(&mut self, id: u8, payload: Bytes) -> Result<()> {
        let payload_len = payload.len();
        let fits_one_byte = (1..=14).contains(&id) && (1..=16).contains(&payload_len);

        if !self.extension {
            self.extension_profile = if fits_one_byte {
                EXTENSION_PROFILE_ONE_BYTE
            } else {
                EXTENSION_PROFILE_TWO_BYTE
            };
            self.extension = true;
        } else if self.extension_profile == EXTENSION_PROFILE_ONE_BYTE && !fits_one_byte {
            self.extension_profile = EXTENSION_PROFILE_TWO_BYTE;
        }

        match self.extension_profile {
            EXTENSION_PROFILE_ONE_BYTE => {
                if !(1..=14).contains(&id) {
                    return Err(Error::ErrRfc8285OneByteHeaderIdRange);
                }
                if payload_len > 16 {
                    return Err(Error::ErrRfc8285OneByteHeaderSize);
                }
            }
            EXTENSION_PROFILE_TWO_BYTE => {
                if id < 1 {
                    return Err(Error::ErrRfc8285TwoByteHeaderIdRange);
                }
                if payload_len > 255 {
                    return Err(Error::ErrRfc8285TwoByteHeaderSize);
                }
            }
            _ => {
                if id != 0 {
                    return Err(Error::ErrRfc3550HeaderIdRange);
                }
            }
        }

        // Update existing if it exists else add new extension
        if let Some(extension) = self.extensions.iter_mut().find(|ext| ext.id == id) {
            extension.payload = payload;
        } else {
            self.extensions.push(Extension { id, payload });
        }

        Ok(())
    }

    /// returns an extension id array
    pub fn get_extension_ids(&self) -> Vec<u8> {
        if self.extension {
            self.extensions.iter().map(|e| e.id).collect()
        } else {
            vec![]
        }
    }

    /// returns an RTP header extension
    pub fn get_extension(&self, id: u8) -> Option<Bytes> {
        if self.extension {
            self.extensions
                .iter()
                .find(|ext| ext.id == id)
                .map(|ext| ext.payload.clone())
        } else {
            None
        }
    }

    /// Removes an RTP Header extension. Dropping the last extension clears
    /// the extension bit so the header shrinks back to its plain form.
    pub fn del_extension(&mut self, id: u8) -> Result<()> {
        if !self.extension {
            return Err(Error::ErrHeaderExtensionsNotEnabled);
        }
        let index = self
            .extensions
            .iter()
            .position(|extension| extension.id == id)
            .ok_or(Error::ErrHeaderExtensionNotFound)?;
        self.extensions.remove(index);

        if self.extensions.is_empty() {
            self.extension = false;
            self.extension_profile = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_unmarshal_basic() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x80, 0xe0, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64, 0x27, 0x82,
        ]);
        let h = Header::unmarshal(&mut raw.clone())?;

        assert_eq!(h.version, 2);
        assert!(h.marker);
        assert_eq!(h.payload_type, 96);
        assert_eq!(h.sequence_number, 27023);
        assert_eq!(h.timestamp, 3653407706);
        assert_eq!(h.ssrc, 476325762);
        assert!(!h.extension);
        assert_eq!(h.marshal_size(), 12);
        assert_eq!(h.marshal()?.freeze(), raw);

        Ok(())
    }

    #[test]
    fn test_header_one_byte_extension() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x90, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0xBE, 0xDE,
            0x00, 0x01, 0x50, 0xAA, 0x00, 0x00,
        ]);
        let h = Header::unmarshal(&mut raw.clone())?;

        assert!(h.extension);
        assert_eq!(h.extension_profile, EXTENSION_PROFILE_ONE_BYTE);
        assert_eq!(h.get_extension(5), Some(Bytes::from_static(&[0xAA])));
        assert_eq!(h.marshal_size(), raw.len());
        assert_eq!(h.marshal()?.freeze(), raw);

        Ok(())
    }

    #[test]
    fn test_header_two_byte_extension() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x90, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x10, 0x00,
            0x00, 0x01, 0x20, 0x01, 0xBB, 0x00,
        ]);
        let h = Header::unmarshal(&mut raw.clone())?;

        assert_eq!(h.extension_profile, EXTENSION_PROFILE_TWO_BYTE);
        assert_eq!(h.get_extension(0x20), Some(Bytes::from_static(&[0xBB])));
        assert_eq!(h.marshal()?.freeze(), raw);

        Ok(())
    }

    #[test]
    fn test_header_reserved_id_stops_parsing() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x90, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0xBE, 0xDE,
            0x00, 0x01, 0x10, 0xAA, 0xF0, 0x11, 0xDE, 0xAD,
        ]);
        let mut buf = raw.clone();
        let h = Header::unmarshal(&mut buf)?;

        assert_eq!(h.extensions.len(), 1);
        assert_eq!(&buf[..], &[0xDE, 0xAD]);

        Ok(())
    }

    #[test]
    fn test_header_too_short() {
        let tests: Vec<(&str, &'static [u8], Error)> = vec![
            ("empty", &[], Error::ErrHeaderSizeInsufficient),
            (
                "csrc missing",
                &[0x81, 0x60, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3],
                Error::ErrHeaderSizeInsufficient,
            ),
            (
                "extension header missing",
                &[0x90, 0x60, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0xBE],
                Error::ErrHeaderSizeInsufficientForExtension,
            ),
            (
                "extension body missing",
                &[0x90, 0x60, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0xBE, 0xDE, 0, 2, 0x10, 0xAA],
                Error::ErrHeaderSizeInsufficientForExtension,
            ),
        ];

        for (name, raw, expected) in tests {
            let result = Header::unmarshal(&mut Bytes::from_static(raw));
            assert_eq!(result, Err(expected), "{name}");
        }
    }

    #[test]
    fn test_set_and_del_extension() -> Result<()> {
        let mut h = Header {
            version: 2,
            ssrc: 1,
            ..Default::default()
        };

        h.set_extension(3, Bytes::from_static(&[1, 2, 3]))?;
        assert_eq!(h.extension_profile, EXTENSION_PROFILE_ONE_BYTE);
        assert_eq!(h.marshal_size(), 12 + 4 + 4);

        h.set_extension(3, Bytes::from_static(&[9]))?;
        assert_eq!(h.extensions.len(), 1);
        assert_eq!(h.get_extension(3), Some(Bytes::from_static(&[9])));

        h.set_extension(20, Bytes::from_static(&[7, 7]))?;
        assert_eq!(h.extension_profile, EXTENSION_PROFILE_TWO_BYTE);
        assert_eq!(h.get_extension_ids(), vec![3, 20]);

        let mut buf = BytesMut::zeroed(h.marshal_size());
        h.marshal_to(&mut buf)?;
        let parsed = Header::unmarshal(&mut buf.freeze())?;
        assert_eq!(parsed, h);

        h.del_extension(3)?;
        h.del_extension(20)?;
        assert!(!h.extension);
        assert_eq!(h.marshal_size(), 12);
        assert_eq!(h.del_extension(3), Err(Error::ErrHeaderExtensionsNotEnabled));

        Ok(())
    }

    #[test]
    fn test_marshal_to_short_buffer() {
        let h = Header {
            version: 2,
            csrc: vec![1, 2],
            ..Default::default()
        };
        let mut buf = [0u8; 16];
        assert_eq!(h.marshal_to(&mut buf), Err(Error::ErrBufferTooSmall));
    }
}
