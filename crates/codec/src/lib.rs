//! ## RTP-MIDI wire format
//!
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//! [RFC6295]: https://tools.ietf.org/html/rfc6295
//!
//! An RTP-MIDI session moves two kinds of datagrams over a pair of UDP
//! ports. AppleMIDI control messages (invitation, synchronization, end,
//! receiver feedback) always start with the `0xFFFF` marker, which can never
//! be the first two bytes of a version 2 RTP packet. Everything else is an
//! RTP packet [RFC3550] whose payload is an RTP-MIDI command list [RFC6295]:
//! a small header, a stream of delta-timed MIDI commands using running
//! status, and an optional recovery journal.
//!
//! This crate only deals with bytes. It performs no I/O and keeps no state
//! between datagrams.

pub mod control;
pub mod journal;
pub mod midi;
pub mod rtp;

use self::{control::ControlMessage, midi::MidiPayload, rtp::RtpPacket};

use std::{array::TryFromSliceError, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    Truncated,
    NotControlMessage,
    UnknownCommand(u16),
    UnsupportedVersion(u8),
    PayloadTooLarge,
    InvalidCommand,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// An RTP packet carrying an RTP-MIDI command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiMessage<'a> {
    pub rtp: RtpPacket<'a>,
    pub payload: MidiPayload,
}

#[derive(Debug)]
pub enum DecodeResult<'a> {
    Control(ControlMessage),
    Midi(MidiMessage<'a>),
}

pub struct Decoder;

impl Decoder {
    /// Decode a datagram received on either channel of a session.
    ///
    /// The first two bytes decide the interpretation: `0xFFFF` is an
    /// AppleMIDI control message, anything else is an RTP packet whose
    /// payload is decoded as a MIDI command list.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::{Decoder, DecodeResult};
    /// use rtpmidi_codec::control::ControlMessage;
    ///
    /// let end = [
    ///     0xff, 0xff, 0x42, 0x59, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01,
    ///     0x00, 0x00, 0x00, 0x02,
    /// ];
    ///
    /// match Decoder::decode(&end).unwrap() {
    ///     DecodeResult::Control(ControlMessage::End(it)) => assert_eq!(it.token, 1),
    ///     _ => panic!("expected an end message"),
    /// }
    ///
    /// let midi = [
    ///     0x80, 0x61, 0x00, 0x01, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00, 0x02,
    ///     0x03, 0x90, 0x40, 0x7f,
    /// ];
    ///
    /// match Decoder::decode(&midi).unwrap() {
    ///     DecodeResult::Midi(it) => {
    ///         assert_eq!(it.rtp.header.ssrc, 2);
    ///         assert_eq!(it.payload.commands[0].status, 0x90);
    ///     }
    ///     _ => panic!("expected a midi message"),
    /// }
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<DecodeResult<'_>, Error> {
        if Self::is_control(bytes) {
            return Ok(DecodeResult::Control(ControlMessage::decode(bytes)?));
        }

        let rtp = RtpPacket::decode(bytes)?;
        let payload = MidiPayload::decode(rtp.payload)?;
        Ok(DecodeResult::Midi(MidiMessage { rtp, payload }))
    }

    /// Whether the buffer carries the AppleMIDI control marker.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::Decoder;
    ///
    /// assert!(Decoder::is_control(&[0xff, 0xff, 0x49, 0x4e]));
    /// assert!(!Decoder::is_control(&[0x80, 0x61, 0x00, 0x01]));
    /// assert!(!Decoder::is_control(&[0xff]));
    /// ```
    pub fn is_control(bytes: &[u8]) -> bool {
        bytes.len() >= 2 && u16::from_be_bytes([bytes[0], bytes[1]]) == control::START_MARKER
    }
}
