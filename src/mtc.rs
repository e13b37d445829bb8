use std::fmt;

use serde::Serialize;

/// SMPTE frame rate, as encoded in the hours field of a time code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameRate {
    #[default]
    Fps24,
    Fps25,
    Fps30DropFrame,
    Fps30,
}

impl From<u8> for FrameRate {
    fn from(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Fps24,
            1 => Self::Fps25,
            2 => Self::Fps30DropFrame,
            _ => Self::Fps30,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeCode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub rate: FrameRate,
}

impl fmt::Display for TimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

/// Follows MIDI time code and song position from a message stream.
///
/// ```text
/// quarter frame   F1 0ppp vvvv           piece p of 8, value nibble v
/// full frame      F0 7F dev 01 01 hr mn sc fr F7
/// song position   F2 lsb msb
/// ```
#[derive(Debug, Default, Clone)]
pub struct MtcTracker {
    time_code: TimeCode,
    song_position: u16,
}

impl MtcTracker {
    pub fn time_code(&self) -> TimeCode {
        self.time_code
    }

    /// Song position in MIDI beats (sixteenth notes).
    pub fn song_position(&self) -> u16 {
        self.song_position
    }

    /// Apply one MIDI message, returns whether the position changed.
    ///
    /// Quarter frames update the time code piece by piece and report a
    /// change once the last piece of a frame arrives. Anything that is not
    /// time code or song position is ignored.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_server::mtc::MtcTracker;
    ///
    /// let mut mtc = MtcTracker::default();
    ///
    /// assert!(mtc.handle(&[0xf0, 0x7f, 0x7f, 0x01, 0x01, 0x21, 0x02, 0x03, 0x04, 0xf7]));
    /// assert_eq!(mtc.time_code().to_string(), "01:02:03:04");
    ///
    /// assert!(!mtc.handle(&[0x90, 0x40, 0x7f]));
    /// ```
    pub fn handle(&mut self, message: &[u8]) -> bool {
        match message {
            [0xF1, data, ..] => self.apply_quarter_frame(*data),
            [0xF0, 0x7F, _, 0x01, 0x01, hours, minutes, seconds, frames, ..] => {
                let before = self.time_code;
                self.time_code = TimeCode {
                    rate: FrameRate::from(hours >> 5),
                    hours: hours & 0x1F,
                    minutes: *minutes,
                    seconds: *seconds,
                    frames: *frames,
                };

                self.time_code != before
            }
            [0xF2, lsb, msb, ..] => {
                let before = self.song_position;
                self.song_position = (*msb as u16) << 7 | *lsb as u16;
                self.song_position != before
            }
            _ => false,
        }
    }

    fn apply_quarter_frame(&mut self, data: u8) -> bool {
        let piece = (data >> 4) & 0x07;
        let nibble = data & 0x0F;

        // Even pieces carry the low nibble of a field, odd pieces the high one.
        let set = |field: u8| {
            if piece % 2 == 0 {
                field & 0xF0 | nibble
            } else {
                field & 0x0F | nibble << 4
            }
        };

        let time = &mut self.time_code;
        match piece {
            0 | 1 => time.frames = set(time.frames),
            2 | 3 => time.seconds = set(time.seconds),
            4 | 5 => time.minutes = set(time.minutes),
            6 => time.hours = set(time.hours),
            _ => {
                time.rate = FrameRate::from(nibble >> 1);
                time.hours = time.hours & 0x0F | (nibble & 0x01) << 4;
                return true;
            }
        }

        false
    }
}
