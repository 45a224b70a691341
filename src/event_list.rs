//! Timed callbacks, kept sorted by fire time.
//!
//! Used by the server for notification-acknowledgement timeouts and
//! periodic housekeeping. The list is generic over the context the
//! callbacks mutate, so it never needs shared ownership of server state.
//!
//! A callback returns the next time it wants to run. It is reinserted only
//! if that time is strictly after the current time; otherwise it is dropped
//! and its cleanup hook (if any) runs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Handle for cancelling or moving a scheduled event.
pub type EventId = u64;

type Callback<C> = Box<dyn FnMut(&mut C, Instant) -> Option<Instant> + Send>;
type Cleanup<C> = Box<dyn FnOnce(&mut C) + Send>;

struct Event<C> {
    id: EventId,
    fire_at: Instant,
    callback: Callback<C>,
    cleanup: Option<Cleanup<C>>,
}

pub struct EventList<C> {
    events: VecDeque<Event<C>>,
    next_id: EventId,
}

impl<C> EventList<C> {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// When the earliest event is due.
    pub fn next_fire_time(&self) -> Option<Instant> {
        self.events.front().map(|e| e.fire_at)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.iter().any(|e| e.id == id)
    }

    /// Fire time of a scheduled event.
    pub fn fire_time(&self, id: EventId) -> Option<Instant> {
        self.events.iter().find(|e| e.id == id).map(|e| e.fire_at)
    }

    /// Schedule `callback` at an absolute time.
    pub fn schedule<F>(&mut self, at: Instant, callback: F) -> EventId
    where
        F: FnMut(&mut C, Instant) -> Option<Instant> + Send + 'static,
    {
        self.push(at, Box::new(callback), None)
    }

    /// Schedule `callback` at `now + delay`.
    pub fn schedule_after<F>(&mut self, now: Instant, delay: Duration, callback: F) -> EventId
    where
        F: FnMut(&mut C, Instant) -> Option<Instant> + Send + 'static,
    {
        self.schedule(now + delay, callback)
    }

    /// Schedule with a hook that runs once the event is finally discarded
    /// after firing. Cancelling does not run it.
    pub fn schedule_with_cleanup<F, G>(&mut self, at: Instant, callback: F, cleanup: G) -> EventId
    where
        F: FnMut(&mut C, Instant) -> Option<Instant> + Send + 'static,
        G: FnOnce(&mut C) + Send + 'static,
    {
        self.push(at, Box::new(callback), Some(Box::new(cleanup)))
    }

    fn push(&mut self, at: Instant, callback: Callback<C>, cleanup: Option<Cleanup<C>>) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.insert(Event {
            id,
            fire_at: at,
            callback,
            cleanup,
        });
        id
    }

    /// Linear insertion after every event due at the same time or earlier.
    fn insert(&mut self, event: Event<C>) {
        let pos = self
            .events
            .iter()
            .position(|e| e.fire_at > event.fire_at)
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
    }

    fn take(&mut self, id: EventId) -> Option<Event<C>> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        self.events.remove(pos)
    }

    /// Move an event to a new absolute time.
    pub fn reschedule(&mut self, id: EventId, at: Instant) -> bool {
        match self.take(id) {
            Some(mut event) => {
                event.fire_at = at;
                self.insert(event);
                true
            }
            None => false,
        }
    }

    /// Push an event back by `delay`.
    pub fn postpone(&mut self, id: EventId, delay: Duration) -> bool {
        match self.fire_time(id) {
            Some(at) => self.reschedule(id, at + delay),
            None => false,
        }
    }

    /// Remove an event without firing it.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.take(id).is_some()
    }

    /// Fire every event due at or before `now`, earliest first.
    ///
    /// Returns the number of callbacks invoked.
    pub fn execute_events(&mut self, ctx: &mut C, now: Instant) -> usize {
        let mut fired = 0;
        while self.events.front().is_some_and(|e| e.fire_at <= now) {
            let Some(mut event) = self.events.pop_front() else {
                break;
            };
            fired += 1;
            match (event.callback)(ctx, now) {
                Some(next) if next > now => {
                    event.fire_at = next;
                    self.insert(event);
                }
                _ => {
                    if let Some(cleanup) = event.cleanup.take() {
                        cleanup(ctx);
                    }
                }
            }
        }
        fired
    }
}

impl<C> Default for EventList<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for EventList<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventList")
            .field("len", &self.events.len())
            .field("next_fire_time", &self.next_fire_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fires_in_time_order() {
        let base = Instant::now();
        let mut list: EventList<Vec<u32>> = EventList::new();
        list.schedule(base + ms(30), |log, _| {
            log.push(3);
            None
        });
        list.schedule(base + ms(10), |log, _| {
            log.push(1);
            None
        });
        list.schedule(base + ms(20), |log, _| {
            log.push(2);
            None
        });

        let mut log = Vec::new();
        assert_eq!(list.execute_events(&mut log, base + ms(25)), 2);
        assert_eq!(log, vec![1, 2]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.next_fire_time(), Some(base + ms(30)));
    }

    #[test]
    fn test_equal_times_keep_insertion_order() {
        let base = Instant::now();
        let mut list: EventList<Vec<u32>> = EventList::new();
        for i in 0..4 {
            list.schedule(base, move |log, _| {
                log.push(i);
                None
            });
        }
        let mut log = Vec::new();
        list.execute_events(&mut log, base);
        assert_eq!(log, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_periodic_event_reinserted() {
        let base = Instant::now();
        let mut list: EventList<u32> = EventList::new();
        list.schedule(base + ms(10), |count, now| {
            *count += 1;
            Some(now + ms(10))
        });

        let mut count = 0;
        list.execute_events(&mut count, base + ms(10));
        list.execute_events(&mut count, base + ms(20));
        assert_eq!(count, 2);
        assert_eq!(list.next_fire_time(), Some(base + ms(30)));
    }

    #[test]
    fn test_non_future_return_discards_and_cleans_up() {
        let base = Instant::now();
        let mut list: EventList<Vec<&'static str>> = EventList::new();
        list.schedule_with_cleanup(
            base,
            |log, now| {
                log.push("fired");
                Some(now)
            },
            |log| log.push("cleanup"),
        );

        let mut log = Vec::new();
        assert_eq!(list.execute_events(&mut log, base), 1);
        assert_eq!(log, vec!["fired", "cleanup"]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_cancel_skips_cleanup() {
        let base = Instant::now();
        let mut list: EventList<Vec<&'static str>> = EventList::new();
        let id = list.schedule_with_cleanup(base, |_, _| None, |log| log.push("cleanup"));

        assert!(list.cancel(id));
        assert!(!list.cancel(id));
        let mut log = Vec::new();
        list.execute_events(&mut log, base + ms(100));
        assert!(log.is_empty());
    }

    #[test]
    fn test_reschedule_and_postpone_preserve_order() {
        let base = Instant::now();
        let mut list: EventList<Vec<u32>> = EventList::new();
        let a = list.schedule(base + ms(10), |log, _| {
            log.push(1);
            None
        });
        list.schedule(base + ms(20), |log, _| {
            log.push(2);
            None
        });

        assert!(list.postpone(a, ms(15)));
        assert_eq!(list.fire_time(a), Some(base + ms(25)));

        let mut log = Vec::new();
        list.execute_events(&mut log, base + ms(30));
        assert_eq!(log, vec![2, 1]);

        assert!(!list.reschedule(a, base));
    }

    #[test]
    fn test_nothing_due() {
        let base = Instant::now();
        let mut list: EventList<()> = EventList::new();
        list.schedule(base + ms(5), |_, _| None);
        assert_eq!(list.execute_events(&mut (), base), 0);
        assert_eq!(list.len(), 1);
    }
}
