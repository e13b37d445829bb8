use bytes::{BufMut, BytesMut};

use super::Error;

pub const VERSION: u8 = 2;

/// Dynamic payload type conventionally used for RTP-MIDI.
pub const PAYLOAD_TYPE_MIDI: u8 = 0x61;

pub const HEADER_SIZE: usize = 12;
pub const MAX_CSRC_COUNT: usize = 15;

/// RTP header extension.
///
/// The length field on the wire counts 32-bit words, so `data` must be a
/// multiple of four bytes long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u16,
    pub data: Vec<u8>,
}

/// The fixed RTP header
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The version is not stored, only version 2 is accepted and produced. The
/// CC and X fields are derived from `csrc` and `extension`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<Extension>,
}

impl RtpHeader {
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    pub fn csrc_count(&self) -> u8 {
        self.csrc.len().min(MAX_CSRC_COUNT) as u8
    }

    /// Size of the header including CSRC list and extension.
    pub fn size(&self) -> usize {
        HEADER_SIZE
            + self.csrc_count() as usize * 4
            + self.extension.as_ref().map(|it| 4 + it.data.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::rtp::RtpPacket;
    ///
    /// let buffer = [
    ///     0x80, 0xe1, 0x12, 0x34, 0x00, 0x00, 0x27, 0x10, 0xde, 0xad, 0xbe, 0xef,
    ///     0x03, 0x90, 0x40, 0x7f,
    /// ];
    ///
    /// let packet = RtpPacket::decode(&buffer).unwrap();
    ///
    /// assert!(packet.header.marker);
    /// assert_eq!(packet.header.payload_type, 0x61);
    /// assert_eq!(packet.header.sequence_number, 0x1234);
    /// assert_eq!(packet.header.timestamp, 10000);
    /// assert_eq!(packet.header.ssrc, 0xdeadbeef);
    /// assert_eq!(packet.payload, &buffer[12..]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Truncated);
        }

        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let padding = bytes[0] & 0x20 != 0;
        let has_extension = bytes[0] & 0x10 != 0;
        let csrc_count = (bytes[0] & 0x0F) as usize;

        let mut header = RtpHeader {
            padding,
            marker: bytes[1] & 0x80 != 0,
            payload_type: bytes[1] & 0x7F,
            sequence_number: u16::from_be_bytes(bytes[2..4].try_into()?),
            timestamp: u32::from_be_bytes(bytes[4..8].try_into()?),
            ssrc: u32::from_be_bytes(bytes[8..12].try_into()?),
            csrc: Vec::with_capacity(csrc_count),
            extension: None,
        };

        let mut offset = HEADER_SIZE;
        if bytes.len() < offset + csrc_count * 4 {
            return Err(Error::Truncated);
        }

        for _ in 0..csrc_count {
            header
                .csrc
                .push(u32::from_be_bytes(bytes[offset..offset + 4].try_into()?));
            offset += 4;
        }

        if has_extension {
            if bytes.len() < offset + 4 {
                return Err(Error::Truncated);
            }

            let id = u16::from_be_bytes(bytes[offset..offset + 2].try_into()?);
            let words = u16::from_be_bytes(bytes[offset + 2..offset + 4].try_into()?) as usize;
            offset += 4;

            if bytes.len() < offset + words * 4 {
                return Err(Error::Truncated);
            }

            header.extension = Some(Extension {
                data: bytes[offset..offset + words * 4].to_vec(),
                id,
            });

            offset += words * 4;
        }

        // The last octet of a padded packet counts the padding octets,
        // itself included.
        let mut end = bytes.len();
        if padding {
            let size = bytes[end - 1] as usize;
            if size == 0 || size > end - offset {
                return Err(Error::InvalidInput);
            }

            end -= size;
        }

        Ok(Self {
            payload: &bytes[offset..end],
            header,
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtpmidi_codec::rtp::{RtpHeader, RtpPacket, PAYLOAD_TYPE_MIDI};
    ///
    /// let payload = [0x03, 0x90, 0x40, 0x7f];
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// RtpPacket {
    ///     header: RtpHeader {
    ///         payload_type: PAYLOAD_TYPE_MIDI,
    ///         sequence_number: 7,
    ///         timestamp: 42,
    ///         ssrc: 1,
    ///         ..Default::default()
    ///     },
    ///     payload: &payload[..],
    /// }
    /// .encode(&mut bytes)
    /// .unwrap();
    ///
    /// assert_eq!(&bytes[..12], &[0x80, 0x61, 0, 7, 0, 0, 0, 42, 0, 0, 0, 1]);
    /// assert_eq!(&bytes[12..], &payload);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        let header = &self.header;
        if header.csrc.len() > MAX_CSRC_COUNT || header.payload_type > 0x7F {
            return Err(Error::InvalidInput);
        }

        if let Some(extension) = &header.extension {
            if extension.data.len() % 4 != 0 {
                return Err(Error::InvalidInput);
            }

            if extension.data.len() / 4 > u16::MAX as usize {
                return Err(Error::PayloadTooLarge);
            }
        }

        bytes.clear();
        bytes.put_u8(
            (VERSION << 6)
                | if header.padding { 0x20 } else { 0 }
                | if header.has_extension() { 0x10 } else { 0 }
                | header.csrc_count(),
        );

        bytes.put_u8(if header.marker { 0x80 } else { 0 } | header.payload_type);
        bytes.put_u16(header.sequence_number);
        bytes.put_u32(header.timestamp);
        bytes.put_u32(header.ssrc);

        for csrc in &header.csrc {
            bytes.put_u32(*csrc);
        }

        if let Some(extension) = &header.extension {
            bytes.put_u16(extension.id);
            bytes.put_u16((extension.data.len() / 4) as u16);
            bytes.extend_from_slice(&extension.data);
        }

        bytes.extend_from_slice(self.payload);

        // pad to a 32 bit boundary, always at least the count octet.
        if header.padding {
            let size = 4 - (self.payload.len() % 4);
            bytes.put(&[0u8; 3][..size - 1]);
            bytes.put_u8(size as u8);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(header: RtpHeader, payload: &[u8]) {
        let mut bytes = BytesMut::new();
        let packet = RtpPacket { header, payload };
        packet.encode(&mut bytes).unwrap();

        assert_eq!(bytes.len(), packet.header.size() + payload.len() + if packet.header.padding {
            4 - payload.len() % 4
        } else {
            0
        });

        assert_eq!(RtpPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn csrc_extension_and_padding() {
        round_trip(
            RtpHeader {
                padding: true,
                marker: true,
                payload_type: PAYLOAD_TYPE_MIDI,
                sequence_number: 0xFFFF,
                timestamp: u32::MAX,
                ssrc: 0x0102_0304,
                csrc: vec![1, 2, 3],
                extension: Some(Extension {
                    id: 0xBEDE,
                    data: vec![1, 2, 3, 4, 5, 6, 7, 8],
                }),
            },
            &[0x02, 0xC0, 0x01],
        );

        round_trip(
            RtpHeader {
                payload_type: PAYLOAD_TYPE_MIDI,
                ..Default::default()
            },
            &[],
        );
    }

    #[test]
    fn rejects_short_and_foreign_packets() {
        assert!(matches!(RtpPacket::decode(&[0x80; 11]), Err(Error::Truncated)));
        assert!(matches!(
            RtpPacket::decode(&[0x40, 0x61, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::UnsupportedVersion(1))
        ));

        // two CSRC entries announced, none present
        assert!(matches!(
            RtpPacket::decode(&[0x82, 0x61, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::Truncated)
        ));

        // padding count larger than the packet body
        assert!(matches!(
            RtpPacket::decode(&[0xA0, 0x61, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x09]),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn too_many_csrc() {
        let packet = RtpPacket {
            header: RtpHeader {
                csrc: vec![0; 16],
                ..Default::default()
            },
            payload: &[],
        };

        assert!(matches!(packet.encode(&mut BytesMut::new()), Err(Error::InvalidInput)));
    }
}
