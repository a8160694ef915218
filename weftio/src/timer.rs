//! An ordered set of timers keyed by deadline, with condition timers whose
//! callback only fires while some externally-owned witness is still alive
//! (used by the reactor to cancel an I/O timeout once its fd context has
//! already gone away).

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

fn now_ms() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    recurring_ms: Option<u64>,
    callback: Callback,
    condition: Option<Weak<dyn Any + Send + Sync>>,
}

struct State {
    by_deadline: BTreeMap<(u64, u64), Entry>,
    index: std::collections::HashMap<u64, u64>,
    next_id: u64,
    tickled: bool,
}

/// A thread-safe timer set. Construct one per [`crate::reactor::Reactor`],
/// passing a callback invoked whenever an inserted timer becomes the
/// earliest pending one, so the reactor can recompute how long its next
/// `epoll_wait` may block for.
pub struct TimerHeap {
    state: Mutex<State>,
    on_front_change: Box<dyn Fn() + Send + Sync>,
}

impl TimerHeap {
    pub fn new(on_front_change: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                by_deadline: BTreeMap::new(),
                index: std::collections::HashMap::new(),
                next_id: 1,
                tickled: false,
            }),
            on_front_change: Box::new(on_front_change),
        }
    }

    /// Schedules `callback` to run `delay_ms` from now. If `recurring`, it
    /// reschedules itself `delay_ms` after every firing.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        recurring: bool,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> TimerId {
        self.insert(
            delay_ms,
            recurring.then_some(delay_ms),
            Arc::new(callback),
            None,
        )
    }

    /// As [`add_timer`](TimerHeap::add_timer), but `callback` only fires if
    /// `witness` can still be upgraded at the deadline — letting a caller
    /// tie a timeout's lifetime to some other refcounted state without an
    /// explicit cancel.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<dyn Any + Send + Sync>,
    ) -> TimerId {
        self.insert(delay_ms, None, Arc::new(callback), Some(witness))
    }

    fn insert(
        &self,
        delay_ms: u64,
        recurring_ms: Option<u64>,
        callback: Callback,
        condition: Option<Weak<dyn Any + Send + Sync>>,
    ) -> TimerId {
        let deadline = now_ms() + delay_ms;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        state.index.insert(id, deadline);
        state.by_deadline.insert(
            (deadline, id),
            Entry {
                recurring_ms,
                callback,
                condition,
            },
        );

        let became_front = matches!(state.by_deadline.keys().next(), Some(&(d, i)) if d == deadline && i == id);
        let mut should_notify = false;
        if became_front && !state.tickled {
            state.tickled = true;
            should_notify = true;
        }
        drop(state);
        if should_notify {
            (self.on_front_change)();
        }
        TimerId(id)
    }

    /// Removes a pending timer. Returns `false` if it already fired (or
    /// never existed).
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.index.remove(&id.0) {
            Some(deadline) => {
                state.by_deadline.remove(&(deadline, id.0));
                true
            }
            None => false,
        }
    }

    /// Pushes a recurring timer's next firing back out by its full
    /// interval, as though it had just fired. Returns `false` if `id` isn't
    /// a pending recurring timer.
    pub fn refresh(&self, id: TimerId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(&old_deadline) = state.index.get(&id.0) else {
            return false;
        };
        let Some(entry) = state.by_deadline.remove(&(old_deadline, id.0)) else {
            return false;
        };
        let Some(interval) = entry.recurring_ms else {
            state.by_deadline.insert((old_deadline, id.0), entry);
            return false;
        };

        let new_deadline = now_ms() + interval;
        state.index.insert(id.0, new_deadline);
        state.by_deadline.insert((new_deadline, id.0), entry);
        let became_front =
            matches!(state.by_deadline.keys().next(), Some(&(d, i)) if d == new_deadline && i == id.0);
        let should_notify = became_front && !state.tickled;
        if should_notify {
            state.tickled = true;
        }
        drop(state);
        if should_notify {
            (self.on_front_change)();
        }
        true
    }

    /// Reschedules `id` to fire `new_delay_ms` from now (`from_now`) or
    /// from its original deadline minus its interval (used to implement a
    /// "reset the whole timer" semantics rather than "reset just the next
    /// firing"). Returns `false` if `id` is not pending.
    pub fn reset(&self, id: TimerId, new_delay_ms: u64, from_now: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(&old_deadline) = state.index.get(&id.0) else {
            return false;
        };
        let Some(entry) = state.by_deadline.remove(&(old_deadline, id.0)) else {
            return false;
        };

        let base = if from_now {
            now_ms()
        } else {
            old_deadline.saturating_sub(entry.recurring_ms.unwrap_or(0))
        };
        let new_deadline = base + new_delay_ms;
        state.index.insert(id.0, new_deadline);
        state.by_deadline.insert((new_deadline, id.0), entry);
        let became_front =
            matches!(state.by_deadline.keys().next(), Some(&(d, i)) if d == new_deadline && i == id.0);
        let should_notify = became_front && !state.tickled;
        if should_notify {
            state.tickled = true;
        }
        drop(state);
        if should_notify {
            (self.on_front_change)();
        }
        true
    }

    /// Milliseconds until the earliest pending timer, `0` if one has
    /// already expired, or `None` if no timers are pending. Clears
    /// `tickled`: calling this is how the reactor "consumes" the current
    /// front deadline, so a timer that becomes the new front afterward
    /// notifies again.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let (&(deadline, _), _) = state.by_deadline.iter().next()?;
        state.tickled = false;
        let now = now_ms();
        Some(deadline.saturating_sub(now))
    }

    /// Whether any timer, expired or not, is still pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().by_deadline.is_empty()
    }

    /// Pops and returns every timer whose deadline has passed, rearming
    /// recurring ones. Condition timers whose witness has already been
    /// dropped are popped but not returned.
    pub fn collect_expired(&self) -> Vec<Callback> {
        let now = now_ms();
        let mut state = self.state.lock().unwrap();

        let mut expired = Vec::new();
        loop {
            let Some((&(deadline, id), _)) = state.by_deadline.iter().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            let (_, entry) = state.by_deadline.remove_entry(&(deadline, id)).unwrap();
            state.index.remove(&id);

            if let Some(witness) = &entry.condition {
                if witness.upgrade().is_none() {
                    continue;
                }
            }

            if let Some(interval) = entry.recurring_ms {
                let new_deadline = now + interval;
                state.index.insert(id, new_deadline);
                state.by_deadline.insert(
                    (new_deadline, id),
                    Entry {
                        recurring_ms: Some(interval),
                        callback: entry.callback.clone(),
                        condition: entry.condition.clone(),
                    },
                );
            }

            expired.push(entry.callback);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_its_delay_and_not_before() {
        let notified = Arc::new(AtomicUsize::new(0));
        let notified2 = notified.clone();
        let timers = TimerHeap::new(move || {
            notified2.fetch_add(1, Ordering::SeqCst);
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        timers.add_timer(20, false, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(notified.load(Ordering::SeqCst) >= 1);
        assert!(timers.collect_expired().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(40));
        assert_eq!(timers.collect_expired().len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_timer_rearms_itself() {
        let timers = TimerHeap::new(|| {});
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        timers.add_timer(10, true, move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(25));
        timers.collect_expired();
        assert!(timers.next_deadline_ms().is_some());
    }

    #[test]
    fn cancel_prevents_firing() {
        let timers = TimerHeap::new(|| {});
        let id = timers.add_timer(5, false, || panic!("should never fire"));
        assert!(timers.cancel(id));
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(timers.collect_expired().is_empty());
    }

    #[test]
    fn condition_timer_skips_firing_once_witness_drops() {
        let timers = TimerHeap::new(|| {});
        let witness: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        timers.add_condition_timer(5, || panic!("should never fire"), Arc::downgrade(&witness));
        drop(witness);
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(timers.collect_expired().is_empty());
    }
}
