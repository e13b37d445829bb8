use codec::midi::{MAX_DELTA_TIME, MidiCommand};

/// An outbound command waiting for the next flush.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Session tick at which the command should take effect.
    pub comex_time: u32,
    pub command: MidiCommand,
}

/// Commands queued for bundling into a single packet.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: Vec<Entry>,
}

impl OutboundQueue {
    pub fn push(&mut self, comex_time: u32, command: MidiCommand) {
        self.entries.push(Entry {
            comex_time,
            command,
        });
    }

    /// Empty the queue into a command list stamped at `now`.
    ///
    /// Commands are ordered by execution time. Anything already due is sent
    /// as due at `now`; the first command gets its distance from `now` as
    /// delta time and every later command its distance from the previous
    /// one.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_service::queue::OutboundQueue;
    /// use rtpmidi_service::codec::midi::MidiCommand;
    ///
    /// let mut queue = OutboundQueue::default();
    /// queue.push(1300, MidiCommand::new(0, &[0x80, 0x40, 0x00]).unwrap());
    /// queue.push(1000, MidiCommand::new(0, &[0x90, 0x40, 0x7f]).unwrap());
    ///
    /// let commands = queue.drain(1000);
    /// assert_eq!(commands[0].status, 0x90);
    /// assert_eq!(commands[0].delta_time, 0);
    /// assert_eq!(commands[1].status, 0x80);
    /// assert_eq!(commands[1].delta_time, 300);
    /// assert!(queue.is_empty());
    /// ```
    pub fn drain(&mut self, now: u32) -> Vec<MidiCommand> {
        // Offsets are signed relative to `now` so that ordering survives a
        // wrap of the tick counter.
        let mut entries = self
            .entries
            .drain(..)
            .map(|it| (it.comex_time.wrapping_sub(now) as i32, it.command))
            .collect::<Vec<_>>();

        entries.sort_by_key(|(offset, _)| *offset);

        let mut previous = 0;
        entries
            .into_iter()
            .map(|(offset, mut command)| {
                let offset = offset.max(0) as u32;
                command.delta_time = (offset - previous).min(MAX_DELTA_TIME);
                previous = offset;
                command
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
