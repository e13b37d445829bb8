//! Recovery journal, parse only.
//!
//! [RFC6295 Section 5]: https://tools.ietf.org/html/rfc6295#section-5
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |S|Y|A|H|TOTCHAN|   Checkpoint Packet Seqnum    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The journal is followed by an optional system journal and `TOTCHAN + 1`
//! channel journals. Only headers and chapter bitmaps are extracted, the
//! chapter contents are skipped using the LENGTH fields.

use super::Error;

/// System journal chapter bits, as found in the first header octet.
pub mod system_chapter {
    pub const D: u8 = 0x40;
    pub const V: u8 = 0x20;
    pub const Q: u8 = 0x10;
    pub const F: u8 = 0x08;
    pub const X: u8 = 0x04;
}

/// Channel journal chapter bits, the third header octet.
pub mod channel_chapter {
    pub const P: u8 = 0x80;
    pub const C: u8 = 0x40;
    pub const M: u8 = 0x20;
    pub const W: u8 = 0x10;
    pub const N: u8 = 0x08;
    pub const E: u8 = 0x04;
    pub const T: u8 = 0x02;
    pub const A: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemJournal {
    pub single_packet_loss: bool,
    pub chapters: u8,
    /// Length in octets, header included.
    pub length: u16,
}

impl SystemJournal {
    pub fn has_chapter(&self, chapter: u8) -> bool {
        self.chapters & chapter != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelJournal {
    pub channel: u8,
    pub single_packet_loss: bool,
    pub enhanced: bool,
    pub chapters: u8,
    /// Length in octets, header included.
    pub length: u16,
}

impl ChannelJournal {
    pub fn has_chapter(&self, chapter: u8) -> bool {
        self.chapters & chapter != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryJournal {
    pub single_packet_loss: bool,
    pub enhanced: bool,
    pub checkpoint: u16,
    pub system: Option<SystemJournal>,
    pub channels: Vec<ChannelJournal>,
}

impl RecoveryJournal {
    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::journal::*;
    ///
    /// // A + TOTCHAN=0, checkpoint 0x0102, one channel journal for channel 3
    /// // carrying chapter N with two octets of chapter data.
    /// let buffer = [0x20, 0x01, 0x02, 0x18, 0x05, 0x08, 0x00, 0x00];
    ///
    /// let journal = RecoveryJournal::decode(&buffer).unwrap();
    ///
    /// assert_eq!(journal.checkpoint, 0x0102);
    /// assert!(journal.system.is_none());
    /// assert_eq!(journal.channels.len(), 1);
    /// assert_eq!(journal.channels[0].channel, 3);
    /// assert!(journal.channels[0].has_chapter(channel_chapter::N));
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 3 {
            return Err(Error::Truncated);
        }

        let header = bytes[0];
        let mut journal = Self {
            single_packet_loss: header & 0x80 != 0,
            enhanced: header & 0x10 != 0,
            checkpoint: u16::from_be_bytes(bytes[1..3].try_into()?),
            system: None,
            channels: Vec::new(),
        };

        let mut offset = 3;

        if header & 0x40 != 0 {
            if bytes.len() < offset + 2 {
                return Err(Error::Truncated);
            }

            let length = section_length(bytes[offset], bytes[offset + 1]);
            if (length as usize) < 2 || bytes.len() < offset + length as usize {
                return Err(Error::Truncated);
            }

            journal.system = Some(SystemJournal {
                single_packet_loss: bytes[offset] & 0x80 != 0,
                chapters: bytes[offset] & 0x7C,
                length,
            });

            offset += length as usize;
        }

        if header & 0x20 != 0 {
            let total = (header & 0x0F) as usize + 1;
            journal.channels.reserve(total);

            for _ in 0..total {
                if bytes.len() < offset + 3 {
                    return Err(Error::Truncated);
                }

                let length = section_length(bytes[offset], bytes[offset + 1]);
                if (length as usize) < 3 || bytes.len() < offset + length as usize {
                    return Err(Error::Truncated);
                }

                journal.channels.push(ChannelJournal {
                    single_packet_loss: bytes[offset] & 0x80 != 0,
                    channel: (bytes[offset] >> 3) & 0x0F,
                    enhanced: bytes[offset] & 0x04 != 0,
                    chapters: bytes[offset + 2],
                    length,
                });

                offset += length as usize;
            }
        }

        Ok(journal)
    }
}

/// 10 bit LENGTH field spread over the low bits of two octets.
fn section_length(high: u8, low: u8) -> u16 {
    (((high & 0x03) as u16) << 8) | low as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_and_channels() {
        let buffer = [
            // S Y A, TOTCHAN=1, checkpoint 9
            0xE1, 0x00, 0x09,
            // system journal: chapters D and X, 3 octets
            0x44, 0x03, 0xAA,
            // channel 0, chapter P, 4 octets
            0x00, 0x04, 0x80, 0x01,
            // channel 15, S and H, chapters C and A, 3 octets
            0xFC, 0x03, 0x41,
        ];

        let journal = RecoveryJournal::decode(&buffer).unwrap();
        assert!(journal.single_packet_loss);
        assert_eq!(journal.checkpoint, 9);

        let system = journal.system.unwrap();
        assert!(system.has_chapter(system_chapter::D));
        assert!(system.has_chapter(system_chapter::X));
        assert!(!system.has_chapter(system_chapter::V));
        assert_eq!(system.length, 3);

        assert_eq!(journal.channels.len(), 2);
        assert_eq!(journal.channels[0].channel, 0);
        assert!(journal.channels[0].has_chapter(channel_chapter::P));
        assert_eq!(journal.channels[1].channel, 15);
        assert!(journal.channels[1].single_packet_loss);
        assert!(journal.channels[1].enhanced);
        assert!(journal.channels[1].has_chapter(channel_chapter::C));
        assert!(journal.channels[1].has_chapter(channel_chapter::A));
    }

    #[test]
    fn lengths_past_the_buffer() {
        assert!(matches!(RecoveryJournal::decode(&[0x20, 0x00]), Err(Error::Truncated)));

        // channel journal claims 16 octets
        assert!(matches!(
            RecoveryJournal::decode(&[0x20, 0x00, 0x01, 0x00, 0x10, 0x80]),
            Err(Error::Truncated)
        ));

        // zero length would never advance
        assert!(matches!(
            RecoveryJournal::decode(&[0x40, 0x00, 0x01, 0x00, 0x00]),
            Err(Error::Truncated)
        ));
    }
}
