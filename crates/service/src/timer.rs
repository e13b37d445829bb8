use std::{collections::BTreeMap, time::Instant};

use ahash::HashMap;

/// Handle of a scheduled task, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Deadline ordered task queue.
///
/// Tasks with the same deadline fire in the order they were scheduled.
pub struct Timers<T> {
    entries: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
    sequence: u64,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::default(),
            sequence: 0,
        }
    }
}

impl<T> Timers<T> {
    /// Schedule `task` to fire at `at`.
    ///
    /// # Test
    ///
    /// ```
    /// use std::time::{Duration, Instant};
    /// use rtpmidi_service::timer::Timers;
    ///
    /// let now = Instant::now();
    /// let mut timers = Timers::default();
    ///
    /// timers.schedule(now + Duration::from_secs(2), "late");
    /// let token = timers.schedule(now + Duration::from_secs(1), "early");
    /// assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
    ///
    /// assert_eq!(timers.cancel(token), Some("early"));
    /// assert_eq!(timers.pop_expired(now + Duration::from_secs(1)), None);
    /// assert_eq!(timers.pop_expired(now + Duration::from_secs(2)), Some("late"));
    /// assert!(timers.is_empty());
    /// ```
    pub fn schedule(&mut self, at: Instant, task: T) -> TimerToken {
        self.sequence += 1;
        self.entries.insert((at, self.sequence), task);
        self.deadlines.insert(self.sequence, at);
        TimerToken(self.sequence)
    }

    /// Cancel a task, returns it if it had not fired yet.
    pub fn cancel(&mut self, token: TimerToken) -> Option<T> {
        let at = self.deadlines.remove(&token.0)?;
        self.entries.remove(&(at, token.0))
    }

    pub fn is_scheduled(&self, token: TimerToken) -> bool {
        self.deadlines.contains_key(&token.0)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest task due at `now`.
    ///
    /// Only one task is returned per call, so that a task can schedule
    /// follow ups that are themselves already due.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        let entry = self.entries.first_entry()?;
        if entry.key().0 > now {
            return None;
        }

        let (_, sequence) = *entry.key();
        self.deadlines.remove(&sequence);
        Some(entry.remove())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_deadline_is_fifo() {
        let now = Instant::now();
        let mut timers = Timers::default();
        for it in 0..5 {
            timers.schedule(now, it);
        }

        let fired = std::iter::from_fn(|| timers.pop_expired(now)).collect::<Vec<_>>();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let now = Instant::now();
        let mut timers = Timers::default();
        let token = timers.schedule(now, 1);

        assert!(timers.is_scheduled(token));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(1)), Some(1));
        assert!(!timers.is_scheduled(token));
        assert_eq!(timers.cancel(token), None);
        assert_eq!(timers.next_deadline(), None);
    }
}
