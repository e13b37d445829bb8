use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use super::Error;

/// First two octets of every AppleMIDI control message.
pub const START_MARKER: u16 = 0xFFFF;

/// Protocol version carried by the invitation family.
pub const PROTOCOL_VERSION: u32 = 2;

pub const SYNCHRONIZATION_SIZE: usize = 36;
pub const RECEIVER_FEEDBACK_SIZE: usize = 12;
pub const BITRATE_RECEIVE_LIMIT_SIZE: usize = 12;

/// AppleMIDI command codes.
///
/// The codes are two ASCII characters:
///
/// 0x494E: "IN" invitation
/// 0x4F4B: "OK" invitation accepted
/// 0x4E4F: "NO" invitation rejected
/// 0x4259: "BY" end session
/// 0x434B: "CK" synchronization
/// 0x5253: "RS" receiver feedback
/// 0x524C: "RL" bitrate receive limit
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum ControlCommand {
    Invitation = 0x494E,
    InvitationAccepted = 0x4F4B,
    InvitationRejected = 0x4E4F,
    End = 0x4259,
    Synchronization = 0x434B,
    ReceiverFeedback = 0x5253,
    BitrateReceiveLimit = 0x524C,
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::InvitationAccepted => "invitation_accepted",
            Self::InvitationRejected => "invitation_rejected",
            Self::End => "end",
            Self::Synchronization => "synchronization",
            Self::ReceiverFeedback => "receiver_feedback",
            Self::BitrateReceiveLimit => "bitrate_receive_limit",
        }
    }
}

/// Body shared by invitation, accept, reject and end.
///
/// ```text
/// | 0xFFFF | command | version | token | ssrc | name ... 0x00 |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub version: u32,
    pub token: u32,
    pub ssrc: u32,
    pub name: String,
}

impl Invitation {
    pub fn new(token: u32, ssrc: u32, name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            name: name.to_string(),
            token,
            ssrc,
        }
    }
}

/// Clock synchronization (CK0/CK1/CK2).
///
/// `count` tells which of the three timestamps was written last. Each
/// timestamp is 64 bits on the wire; only tick values are ever stored in
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Synchronization {
    pub ssrc: u32,
    pub count: u8,
    pub timestamps: [u64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverFeedback {
    pub ssrc: u32,
    pub sequence_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateReceiveLimit {
    pub ssrc: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Invitation(Invitation),
    InvitationAccepted(Invitation),
    InvitationRejected(Invitation),
    End(Invitation),
    Synchronization(Synchronization),
    ReceiverFeedback(ReceiverFeedback),
    BitrateReceiveLimit(BitrateReceiveLimit),
}

impl ControlMessage {
    pub fn command(&self) -> ControlCommand {
        match self {
            Self::Invitation(_) => ControlCommand::Invitation,
            Self::InvitationAccepted(_) => ControlCommand::InvitationAccepted,
            Self::InvitationRejected(_) => ControlCommand::InvitationRejected,
            Self::End(_) => ControlCommand::End,
            Self::Synchronization(_) => ControlCommand::Synchronization,
            Self::ReceiverFeedback(_) => ControlCommand::ReceiverFeedback,
            Self::BitrateReceiveLimit(_) => ControlCommand::BitrateReceiveLimit,
        }
    }

    /// SSRC of the sender.
    pub fn ssrc(&self) -> u32 {
        match self {
            Self::Invitation(it)
            | Self::InvitationAccepted(it)
            | Self::InvitationRejected(it)
            | Self::End(it) => it.ssrc,
            Self::Synchronization(it) => it.ssrc,
            Self::ReceiverFeedback(it) => it.ssrc,
            Self::BitrateReceiveLimit(it) => it.ssrc,
        }
    }

    /// Initiator token, only carried by the invitation family.
    pub fn token(&self) -> Option<u32> {
        match self {
            Self::Invitation(it)
            | Self::InvitationAccepted(it)
            | Self::InvitationRejected(it)
            | Self::End(it) => Some(it.token),
            _ => None,
        }
    }

    /// # Test
    ///
    /// ```
    /// use rtpmidi_codec::control::*;
    ///
    /// let buffer = [
    ///     0xff, 0xff, 0x49, 0x4e, 0x00, 0x00, 0x00, 0x02, 0x12, 0x34, 0x56, 0x78,
    ///     0x00, 0x00, 0x00, 0x2a, 0x70, 0x61, 0x6e, 0x64, 0x61, 0x00,
    /// ];
    ///
    /// let message = ControlMessage::decode(&buffer).unwrap();
    ///
    /// assert_eq!(message.command(), ControlCommand::Invitation);
    /// assert_eq!(message.token(), Some(0x12345678));
    /// assert_eq!(message.ssrc(), 42);
    ///
    /// if let ControlMessage::Invitation(it) = message {
    ///     assert_eq!(it.name, "panda");
    /// }
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::NotControlMessage);
        }

        if u16::from_be_bytes(bytes[..2].try_into()?) != START_MARKER {
            return Err(Error::NotControlMessage);
        }

        let code = u16::from_be_bytes(bytes[2..4].try_into()?);
        let command =
            ControlCommand::try_from(code).map_err(|_| Error::UnknownCommand(code))?;

        Ok(match command {
            ControlCommand::Invitation => Self::Invitation(decode_invitation(bytes)?),
            ControlCommand::InvitationAccepted => {
                Self::InvitationAccepted(decode_invitation(bytes)?)
            }
            ControlCommand::InvitationRejected => {
                Self::InvitationRejected(decode_invitation(bytes)?)
            }
            ControlCommand::End => Self::End(decode_invitation(bytes)?),
            ControlCommand::Synchronization => {
                if bytes.len() < SYNCHRONIZATION_SIZE {
                    return Err(Error::Truncated);
                }

                let mut timestamps = [0u64; 3];
                for (i, timestamp) in timestamps.iter_mut().enumerate() {
                    let offset = 12 + i * 8;
                    *timestamp = u64::from_be_bytes(bytes[offset..offset + 8].try_into()?);
                }

                Self::Synchronization(Synchronization {
                    ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
                    count: bytes[8],
                    timestamps,
                })
            }
            ControlCommand::ReceiverFeedback => {
                // Some peers omit the trailing reserved half word.
                if bytes.len() < RECEIVER_FEEDBACK_SIZE - 2 {
                    return Err(Error::Truncated);
                }

                Self::ReceiverFeedback(ReceiverFeedback {
                    ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
                    sequence_number: u16::from_be_bytes(bytes[8..10].try_into()?),
                })
            }
            ControlCommand::BitrateReceiveLimit => {
                if bytes.len() < BITRATE_RECEIVE_LIMIT_SIZE {
                    return Err(Error::Truncated);
                }

                Self::BitrateReceiveLimit(BitrateReceiveLimit {
                    ssrc: u32::from_be_bytes(bytes[4..8].try_into()?),
                    limit: u32::from_be_bytes(bytes[8..12].try_into()?),
                })
            }
        })
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtpmidi_codec::control::*;
    ///
    /// let mut bytes = BytesMut::with_capacity(64);
    ///
    /// ControlMessage::Synchronization(Synchronization {
    ///     ssrc: 1,
    ///     count: 0,
    ///     timestamps: [100, 0, 0],
    /// })
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(bytes.len(), SYNCHRONIZATION_SIZE);
    /// assert_eq!(&bytes[..4], &[0xff, 0xff, 0x43, 0x4b]);
    /// assert_eq!(bytes[8], 0);
    /// assert_eq!(&bytes[12..20], &[0, 0, 0, 0, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(START_MARKER);
        bytes.put_u16(self.command() as u16);

        match self {
            Self::Invitation(it) | Self::InvitationAccepted(it) | Self::InvitationRejected(it) => {
                encode_invitation(it, bytes);
                bytes.put_u8(0);
            }
            Self::End(it) => encode_invitation(it, bytes),
            Self::Synchronization(it) => {
                bytes.put_u32(it.ssrc);
                bytes.put_u8(it.count);
                bytes.put_u8(0);
                bytes.put_u16(0);

                for timestamp in it.timestamps {
                    bytes.put_u64(timestamp);
                }
            }
            Self::ReceiverFeedback(it) => {
                bytes.put_u32(it.ssrc);
                bytes.put_u16(it.sequence_number);
                bytes.put_u16(0);
            }
            Self::BitrateReceiveLimit(it) => {
                bytes.put_u32(it.ssrc);
                bytes.put_u32(it.limit);
            }
        }
    }
}

fn decode_invitation(bytes: &[u8]) -> Result<Invitation, Error> {
    if bytes.len() < 16 {
        return Err(Error::Truncated);
    }

    // the name runs up to the first NUL, or to the end of the datagram.
    let name = &bytes[16..];
    let name = match name.iter().position(|it| *it == 0) {
        Some(end) => &name[..end],
        None => name,
    };

    Ok(Invitation {
        version: u32::from_be_bytes(bytes[4..8].try_into()?),
        token: u32::from_be_bytes(bytes[8..12].try_into()?),
        ssrc: u32::from_be_bytes(bytes[12..16].try_into()?),
        name: std::str::from_utf8(name)?.to_string(),
    })
}

fn encode_invitation(invitation: &Invitation, bytes: &mut BytesMut) {
    bytes.put_u32(invitation.version);
    bytes.put_u32(invitation.token);
    bytes.put_u32(invitation.ssrc);
    bytes.extend_from_slice(invitation.name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: ControlMessage) -> BytesMut {
        let mut bytes = BytesMut::new();
        message.encode(&mut bytes);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), message);
        bytes
    }

    #[test]
    fn invitation_family() {
        let invitation = Invitation::new(0xCAFE, 7, "Session 1");

        let bytes = round_trip(ControlMessage::Invitation(invitation.clone()));
        assert_eq!(bytes.len(), 16 + 9 + 1);
        assert_eq!(bytes[bytes.len() - 1], 0);

        round_trip(ControlMessage::InvitationAccepted(invitation.clone()));
        round_trip(ControlMessage::InvitationRejected(invitation.clone()));

        // end carries no terminator
        let bytes = round_trip(ControlMessage::End(invitation));
        assert_eq!(bytes.len(), 16 + 9);
    }

    #[test]
    fn unnamed_invitation() {
        let mut bytes = BytesMut::new();
        ControlMessage::End(Invitation::new(1, 2, "")).encode(&mut bytes);
        assert_eq!(bytes.len(), 16);

        let ControlMessage::End(it) = ControlMessage::decode(&bytes).unwrap() else {
            panic!("expected end");
        };

        assert_eq!(it.name, "");
        assert_eq!(it.version, PROTOCOL_VERSION);
    }

    #[test]
    fn synchronization_and_feedback() {
        let bytes = round_trip(ControlMessage::Synchronization(Synchronization {
            ssrc: 0xAABBCCDD,
            count: 2,
            timestamps: [100, 150, 250],
        }));

        assert_eq!(bytes.len(), SYNCHRONIZATION_SIZE);

        let bytes = round_trip(ControlMessage::ReceiverFeedback(ReceiverFeedback {
            ssrc: 3,
            sequence_number: 0xFFFE,
        }));

        assert_eq!(bytes.len(), RECEIVER_FEEDBACK_SIZE);

        round_trip(ControlMessage::BitrateReceiveLimit(BitrateReceiveLimit {
            ssrc: 3,
            limit: 1_000_000,
        }));
    }

    #[test]
    fn rejects_non_control_and_unknown() {
        assert!(matches!(
            ControlMessage::decode(&[0x80, 0x61, 0x00, 0x01]),
            Err(Error::NotControlMessage)
        ));

        assert!(matches!(
            ControlMessage::decode(&[0xff, 0xff, 0x00, 0x01]),
            Err(Error::UnknownCommand(1))
        ));

        assert!(matches!(
            ControlMessage::decode(&[0xff, 0xff, 0x43, 0x4b, 0, 0, 0, 1]),
            Err(Error::Truncated)
        ));

        assert!(matches!(
            ControlMessage::decode(&[0xff, 0xff, 0x49, 0x4e, 0, 0, 0, 2]),
            Err(Error::Truncated)
        ));
    }
}
