use std::time::{Duration, Instant};

use codec::control::Synchronization;

/// Session clock rate, ticks per second.
pub const TICK_RATE: u64 = 10_000;

/// Number of synchronizations sent right after a stream is established.
pub const SYNC_BURST_COUNT: u32 = 10;

/// Spacing of the initial synchronization burst.
pub const SYNC_BURST_INTERVAL: Duration = Duration::from_millis(1500);

/// Spacing of synchronizations once the burst is over.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Monotonic 10 kHz tick counter, wrapping at 2^32.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new(origin: Instant) -> Self {
        Self { origin }
    }

    /// Ticks elapsed since the clock was created.
    ///
    /// # Test
    ///
    /// ```
    /// use std::time::{Duration, Instant};
    /// use rtpmidi_service::clock::Clock;
    ///
    /// let origin = Instant::now();
    /// let clock = Clock::new(origin);
    ///
    /// assert_eq!(clock.ticks(origin), 0);
    /// assert_eq!(clock.ticks(origin + Duration::from_millis(1)), 10);
    /// assert_eq!(clock.ticks(origin + Duration::from_secs(2)), 20_000);
    /// ```
    pub fn ticks(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_micros() / (1_000_000 / TICK_RATE as u128)) as u32
    }
}

/// Clock offset estimate for one peer, built from CK exchanges.
///
/// ```text
/// initiator              responder
///     | CK0 [ts1, 0, 0]      |
///     |--------------------->|
///     |    CK1 [ts1, ts2, 0] |
///     |<---------------------|
///     | CK2 [ts1, ts2, ts3]  |
///     |--------------------->|
/// ```
///
/// Both sides finish an exchange with all three timestamps and derive
/// `latency = ts3 - ts1` and `time_difference = (ts3 - ts2) - latency`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockSync {
    latency: Option<i64>,
    time_difference: Option<i64>,
    exchanges: u32,
}

impl ClockSync {
    /// First message of an exchange.
    pub fn start_exchange(ssrc: u32, now: u32) -> Synchronization {
        Synchronization {
            timestamps: [now as u64, 0, 0],
            count: 0,
            ssrc,
        }
    }

    /// Answer a received synchronization.
    ///
    /// Returns the next message of the exchange if there is one to send.
    /// Receiving CK1 or CK2 completes the exchange on this side.
    ///
    /// # Test
    ///
    /// ```
    /// use rtpmidi_service::clock::ClockSync;
    ///
    /// let mut initiator = ClockSync::default();
    /// let mut responder = ClockSync::default();
    ///
    /// let ck0 = ClockSync::start_exchange(1, 100);
    /// let ck1 = responder.respond(2, &ck0, 150).unwrap();
    /// let ck2 = initiator.respond(1, &ck1, 250).unwrap();
    /// assert!(responder.respond(2, &ck2, 300).is_none());
    ///
    /// assert_eq!(initiator.latency(), Some(150));
    /// assert_eq!(initiator.time_difference(), Some(-50));
    /// assert_eq!(responder.latency(), Some(150));
    /// assert!(responder.is_synchronized());
    /// ```
    pub fn respond(&mut self, ssrc: u32, message: &Synchronization, now: u32) -> Option<Synchronization> {
        let [ts1, ts2, _] = message.timestamps;
        match message.count {
            0 => Some(Synchronization {
                timestamps: [ts1, now as u64, 0],
                count: 1,
                ssrc,
            }),
            1 => {
                let timestamps = [ts1, ts2, now as u64];
                self.complete(timestamps);

                Some(Synchronization {
                    count: 2,
                    timestamps,
                    ssrc,
                })
            }
            2 => {
                self.complete(message.timestamps);
                None
            }
            _ => None,
        }
    }

    fn complete(&mut self, [ts1, ts2, ts3]: [u64; 3]) {
        // Tick values only ever occupy the low 32 bits.
        let (ts1, ts2, ts3) = (ts1 as u32, ts2 as u32, ts3 as u32);
        let latency = ts3.wrapping_sub(ts1) as i64;

        self.time_difference = Some(ts3.wrapping_sub(ts2) as i32 as i64 - latency);
        self.latency = Some(latency);
        self.exchanges += 1;
    }

    pub fn latency(&self) -> Option<i64> {
        self.latency
    }

    pub fn time_difference(&self) -> Option<i64> {
        self.time_difference
    }

    /// Completed exchanges so far.
    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }

    /// Outbound MIDI is only sent once this holds.
    pub fn is_synchronized(&self) -> bool {
        self.latency.is_some() && self.time_difference.is_some()
    }
}

/// Delay before the next CK0, given how many were already sent.
pub fn sync_interval(sent: u32) -> Duration {
    if sent < SYNC_BURST_COUNT {
        SYNC_BURST_INTERVAL
    } else {
        SYNC_INTERVAL
    }
}
