//! RTP-MIDI command list.
//!
//! [RFC6295 Section 3]: https://tools.ietf.org/html/rfc6295#section-3
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |B|J|Z|P|LEN... |  MIDI list ...                                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! With B set LEN is 12 bits wide and takes the following octet as well.
//! The MIDI list is a sequence of `[delta time] [status] data`, where the
//! first delta time is only present when Z is set and the status octet is
//! left out when it repeats the previous channel message status.

use bytes::{BufMut, BytesMut};

use super::{Error, journal::RecoveryJournal};

pub const FLAG_BIG_LENGTH: u8 = 0x80;
pub const FLAG_JOURNAL: u8 = 0x40;
pub const FLAG_FIRST_HAS_DELTA_TIME: u8 = 0x20;
pub const FLAG_PHANTOM: u8 = 0x10;

pub const MAX_SHORT_LENGTH: usize = 0x0F;
pub const MAX_LENGTH: usize = 0x0FFF;

/// Largest value a four octet delta time can carry.
pub const MAX_DELTA_TIME: u32 = 0x0FFF_FFFF;

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Number of data octets implied by a status octet.
///
/// `None` means the length is variable (SysEx, terminated by 0xF7).
///
/// # Test
///
/// ```
/// use rtpmidi_codec::midi::data_length;
///
/// assert_eq!(data_length(0x93), Some(2));
/// assert_eq!(data_length(0xC5), Some(1));
/// assert_eq!(data_length(0xF2), Some(2));
/// assert_eq!(data_length(0xF8), Some(0));
/// assert_eq!(data_length(0xF0), None);
/// ```
pub fn data_length(status: u8) -> Option<usize> {
    Some(match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
        0xC0 | 0xD0 => 1,
        _ => match status {
            SYSEX_START => return None,
            0xF1 | 0xF3 => 1,
            0xF2 => 2,
            // 0xF6, realtime and the undefined system codes
            _ => 0,
        },
    })
}

/// Running status after a command with `status`.
///
/// Channel messages set it, system common messages clear it and realtime
/// messages leave it alone.
fn next_running_status(current: Option<u8>, status: u8) -> Option<u8> {
    match status {
        0x80..=0xEF => Some(status),
        0xF0..=0xF7 => None,
        _ => current,
    }
}

/// Read a big-endian variable length quantity.
///
/// Returns the value and the number of octets consumed.
///
/// # Test
///
/// ```
/// use rtpmidi_codec::midi::read_delta_time;
///
/// assert_eq!(read_delta_time(&[0x00]).unwrap(), (0, 1));
/// assert_eq!(read_delta_time(&[0x81, 0x00, 0x90]).unwrap(), (128, 2));
/// assert_eq!(read_delta_time(&[0xFF, 0xFF, 0x7F]).unwrap(), (0x1FFFFF, 3));
/// ```
pub fn read_delta_time(bytes: &[u8]) -> Result<(u32, usize), Error> {
    let mut value = 0u32;

    for (i, octet) in bytes.iter().take(4).enumerate() {
        value = (value << 7) | (octet & 0x7F) as u32;
        if octet & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    // four octets with the continuation bit still set is not a valid
    // delta time, fewer means the buffer ended early.
    Err(if bytes.len() >= 4 {
        Error::InvalidInput
    } else {
        Error::Truncated
    })
}

/// Write a big-endian variable length quantity using the fewest octets.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use rtpmidi_codec::midi::write_delta_time;
///
/// let mut bytes = BytesMut::new();
/// write_delta_time(0x1FFFFF, &mut bytes).unwrap();
///
/// assert_eq!(&bytes[..], &[0xFF, 0xFF, 0x7F]);
/// ```
pub fn write_delta_time(value: u32, bytes: &mut BytesMut) -> Result<(), Error> {
    if value > MAX_DELTA_TIME {
        return Err(Error::InvalidInput);
    }

    let mut shift = 21;
    while shift > 0 && value >> shift == 0 {
        shift -= 7;
    }

    while shift > 0 {
        bytes.put_u8(0x80 | ((value >> shift) & 0x7F) as u8);
        shift -= 7;
    }

    bytes.put_u8((value & 0x7F) as u8);
    Ok(())
}

/// A single MIDI command in a command list.
///
/// `delta_time` counts RTP timestamp ticks since the previous command (or
/// since the RTP timestamp for the first one). `data` never includes the
/// status octet, but a SysEx body includes its terminating 0xF7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiCommand {
    pub delta_time: u32,
    pub status: u8,
    pub data: Vec<u8>,
}

impl MidiCommand {
    /// Build a command from raw MIDI octets, status first.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::midi::MidiCommand;
    ///
    /// let command = MidiCommand::new(0, &[0x90, 0x40, 0x7f]).unwrap();
    /// assert_eq!(command.status, 0x90);
    /// assert_eq!(command.data, vec![0x40, 0x7f]);
    ///
    /// assert!(MidiCommand::new(0, &[0x90, 0x40]).is_err());
    /// assert!(MidiCommand::new(0, &[0x40]).is_err());
    /// assert!(MidiCommand::new(0, &[0xf0, 0x7e, 0x01]).is_err());
    /// ```
    pub fn new(delta_time: u32, bytes: &[u8]) -> Result<Self, Error> {
        let (status, data) = bytes.split_first().ok_or(Error::InvalidCommand)?;
        let command = Self {
            data: data.to_vec(),
            status: *status,
            delta_time,
        };

        if !command.is_valid() {
            return Err(Error::InvalidCommand);
        }

        Ok(command)
    }

    /// Whether the data matches what the status octet implies.
    pub fn is_valid(&self) -> bool {
        if self.status & 0x80 == 0 || self.delta_time > MAX_DELTA_TIME {
            return false;
        }

        match data_length(self.status) {
            Some(size) => {
                self.data.len() == size && self.data.iter().all(|it| it & 0x80 == 0)
            }
            None => match self.data.split_last() {
                Some((&SYSEX_END, body)) => body.iter().all(|it| it & 0x80 == 0),
                _ => false,
            },
        }
    }

    /// Raw MIDI octets, status first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 1);
        bytes.push(self.status);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiPayload {
    /// The P flag, tells that the first command status was elided in the
    /// original MIDI stream.
    pub phantom: bool,
    pub commands: Vec<MidiCommand>,
    /// Only ever filled in by `decode`. Encoding never writes a journal.
    pub journal: Option<RecoveryJournal>,
}

impl MidiPayload {
    pub fn new(commands: Vec<MidiCommand>) -> Self {
        Self {
            commands,
            ..Default::default()
        }
    }

    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::midi::MidiPayload;
    ///
    /// // note on, then a running status note off 0x10 ticks later
    /// let buffer = [0x06, 0x90, 0x40, 0x7f, 0x10, 0x40, 0x00];
    ///
    /// let payload = MidiPayload::decode(&buffer).unwrap();
    ///
    /// assert_eq!(payload.commands.len(), 2);
    /// assert_eq!(payload.commands[1].delta_time, 0x10);
    /// assert_eq!(payload.commands[1].status, 0x90);
    /// assert_eq!(payload.commands[1].data, vec![0x40, 0x00]);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let header = *bytes.first().ok_or(Error::Truncated)?;

        let (length, offset) = if header & FLAG_BIG_LENGTH != 0 {
            let low = *bytes.get(1).ok_or(Error::Truncated)?;
            ((((header & 0x0F) as usize) << 8) | low as usize, 2)
        } else {
            ((header & 0x0F) as usize, 1)
        };

        let end = offset + length;
        if bytes.len() < end {
            return Err(Error::Truncated);
        }

        let list = &bytes[offset..end];
        let first_has_delta_time = header & FLAG_FIRST_HAS_DELTA_TIME != 0;

        let mut commands = Vec::new();
        let mut running_status = None;
        let mut index = 0;

        while index < list.len() {
            let mut delta_time = 0;
            if first_has_delta_time || !commands.is_empty() {
                let (value, size) = read_delta_time(&list[index..])?;
                delta_time = value;
                index += size;
            }

            let status = match list.get(index) {
                None => return Err(Error::Truncated),
                Some(it) if it & 0x80 != 0 => {
                    index += 1;
                    *it
                }
                // a data octet with nothing to run from
                Some(_) => running_status.ok_or(Error::InvalidInput)?,
            };

            running_status = next_running_status(running_status, status);

            let size = match data_length(status) {
                Some(size) => size,
                None => list[index..]
                    .iter()
                    .position(|it| *it == SYSEX_END)
                    .map(|it| it + 1)
                    .ok_or(Error::Truncated)?,
            };

            if list.len() < index + size {
                return Err(Error::Truncated);
            }

            commands.push(MidiCommand {
                data: list[index..index + size].to_vec(),
                delta_time,
                status,
            });

            index += size;
        }

        // The journal is advisory. A damaged one does not invalidate the
        // command list in front of it.
        let journal = if header & FLAG_JOURNAL != 0 {
            RecoveryJournal::decode(&bytes[end..]).ok()
        } else {
            None
        };

        Ok(Self {
            phantom: header & FLAG_PHANTOM != 0,
            commands,
            journal,
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtpmidi_codec::midi::{MidiCommand, MidiPayload};
    ///
    /// let payload = MidiPayload::new(vec![
    ///     MidiCommand::new(0, &[0x90, 0x40, 0x7f]).unwrap(),
    ///     MidiCommand::new(0x10, &[0x90, 0x40, 0x00]).unwrap(),
    /// ]);
    ///
    /// let mut bytes = BytesMut::new();
    /// payload.encode(&mut bytes).unwrap();
    ///
    /// assert_eq!(&bytes[..], &[0x06, 0x90, 0x40, 0x7f, 0x10, 0x40, 0x00]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) -> Result<(), Error> {
        let mut list = BytesMut::with_capacity(self.commands.len() * 4);
        let mut running_status = None;

        for (i, command) in self.commands.iter().enumerate() {
            if !command.is_valid() {
                return Err(Error::InvalidCommand);
            }

            if i > 0 || command.delta_time != 0 {
                write_delta_time(command.delta_time, &mut list)?;
            }

            if running_status != Some(command.status) {
                list.put_u8(command.status);
            }

            running_status = next_running_status(running_status, command.status);
            list.extend_from_slice(&command.data);
        }

        if list.len() > MAX_LENGTH {
            return Err(Error::PayloadTooLarge);
        }

        let mut flags = 0;
        if self.phantom {
            flags |= FLAG_PHANTOM;
        }

        if self.commands.first().map(|it| it.delta_time != 0).unwrap_or(false) {
            flags |= FLAG_FIRST_HAS_DELTA_TIME;
        }

        bytes.clear();
        if list.len() > MAX_SHORT_LENGTH {
            bytes.put_u8(FLAG_BIG_LENGTH | flags | (list.len() >> 8) as u8);
            bytes.put_u8((list.len() & 0xFF) as u8);
        } else {
            bytes.put_u8(flags | list.len() as u8);
        }

        bytes.extend_from_slice(&list);
        Ok(())
    }
}
