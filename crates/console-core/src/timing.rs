//! Deterministic cycle-based event scheduler.
//!
//! Events are kept in a binary min-heap keyed by `(fire_cycle, sequence)`, so
//! delivery is ordered by cycle and FIFO among equal cycles. Cancellation only
//! removes the handle from the live set; dead heap entries are skipped when
//! they surface and compacted when they dominate the heap. The head of the
//! heap is always a live event.
//!
//! The scheduler never advances time on its own: the CPU execution manager
//! calls [`EventScheduler::advance`] with its retired cycle count.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{self, AssertUnwindSafe};

use crate::diag::FaultCounters;
use crate::FaultCode;

/// Dead heap entries tolerated before a compaction pass.
const COMPACTION_SLACK: usize = 64;

/// Identifier of a registered event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(u32);

/// Handle to one scheduled event, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(u64);

impl EventHandle {
    /// Raw sequence number; handles are issued in scheduling order.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

/// Arguments passed to an event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventArgs {
    /// Handle the event was scheduled under.
    pub handle: EventHandle,
    /// Type the event was scheduled with, for callbacks that re-arm themselves.
    pub event_type: EventType,
    /// Opaque value supplied at scheduling time.
    pub user_data: u64,
    /// Cycle the event was due.
    pub fire_cycle: u64,
    /// How far past `fire_cycle` the advancing cycle count was.
    pub cycles_late: u64,
}

/// Callback invoked when an event of a registered type fires.
///
/// The scheduler is passed back in so callbacks can schedule or cancel
/// further events.
pub type EventCallback<C> = Box<dyn FnMut(&mut C, &mut EventScheduler<C>, EventArgs) + Send>;

struct EventTypeEntry<C> {
    name: &'static str,
    callback: Option<EventCallback<C>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEvent {
    fire_cycle: u64,
    sequence: u64,
    event_type: EventType,
    user_data: u64,
}

impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap surfaces the earliest cycle, then the lowest sequence.
        other
            .fire_cycle
            .cmp(&self.fire_cycle)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Global ordered queue of cycle-timestamped callbacks.
///
/// `C` is the context handed to every callback (the session uses the address
/// space).
pub struct EventScheduler<C> {
    types: Vec<EventTypeEntry<C>>,
    queue: BinaryHeap<PendingEvent>,
    live: HashSet<u64>,
    now: u64,
    next_sequence: u64,
    fired: u64,
    advancing: bool,
    faults: FaultCounters,
}

impl<C> Default for EventScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for EventScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventScheduler")
            .field("now", &self.now)
            .field("pending", &self.live.len())
            .field("event_types", &self.types.len())
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

impl<C> EventScheduler<C> {
    /// Creates an empty scheduler at cycle zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            now: 0,
            next_sequence: 0,
            fired: 0,
            advancing: false,
            faults: FaultCounters::default(),
        }
    }

    /// Registers a named callback. Events are scheduled against the returned type.
    pub fn register_event_type<F>(&mut self, name: &'static str, callback: F) -> EventType
    where
        F: FnMut(&mut C, &mut Self, EventArgs) + Send + 'static,
    {
        if self.types.iter().any(|entry| entry.name == name) {
            log::warn!("timing: event type `{name}` registered more than once");
        }
        let id = u32::try_from(self.types.len()).unwrap_or(u32::MAX);
        self.types.push(EventTypeEntry {
            name,
            callback: Some(Box::new(callback)),
        });
        EventType(id)
    }

    /// Name an event type was registered under.
    #[must_use]
    pub fn event_type_name(&self, event_type: EventType) -> Option<&'static str> {
        self.types
            .get(event_type.0 as usize)
            .map(|entry| entry.name)
    }

    /// Schedules `event_type` to fire `delay_cycles` after [`Self::now`].
    pub fn schedule(
        &mut self,
        delay_cycles: u64,
        event_type: EventType,
        user_data: u64,
    ) -> EventHandle {
        self.insert(self.now.saturating_add(delay_cycles), event_type, user_data)
    }

    /// Schedules `event_type` at an absolute cycle; past cycles are clamped to now.
    pub fn schedule_at(
        &mut self,
        fire_cycle: u64,
        event_type: EventType,
        user_data: u64,
    ) -> EventHandle {
        self.insert(fire_cycle.max(self.now), event_type, user_data)
    }

    /// Cancels a pending event.
    ///
    /// Returns `false` (and counts a scheduler misuse) when the handle already
    /// fired, was cancelled, or was never issued.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        if self.live.remove(&handle.0) {
            self.prune_head();
            self.compact_if_sparse();
            return true;
        }
        self.faults.record(FaultCode::SchedulerMisuse);
        log::debug!("timing: cancel of unknown or expired handle {}", handle.0);
        false
    }

    /// Cancels every pending event of `event_type`. Returns how many were removed.
    pub fn remove_all(&mut self, event_type: EventType) -> usize {
        let mut removed = 0;
        for event in &self.queue {
            if event.event_type == event_type && self.live.remove(&event.sequence) {
                removed += 1;
            }
        }
        self.prune_head();
        self.compact_if_sparse();
        removed
    }

    /// Fires every pending event with `fire_cycle <= current_cycle`.
    ///
    /// While a callback runs, [`Self::now`] reads that event's `fire_cycle`;
    /// events it schedules that are due by `current_cycle` fire in this same
    /// call. Returns the number of callbacks invoked. A `current_cycle` behind
    /// [`Self::now`], or a nested call from inside a callback, is ignored.
    ///
    /// # Panics
    ///
    /// A panicking callback is propagated once the scheduler is consistent
    /// again: the callback stays registered, [`Self::now`] stays at the
    /// panicking event's cycle and later events remain pending.
    pub fn advance(&mut self, current_cycle: u64, ctx: &mut C) -> usize {
        if self.advancing {
            log::warn!("timing: nested advance to {current_cycle} ignored");
            return 0;
        }
        if current_cycle < self.now {
            log::warn!(
                "timing: advance to {current_cycle} is behind current cycle {}",
                self.now
            );
            return 0;
        }

        self.advancing = true;
        let mut fired = 0;
        while self
            .queue
            .peek()
            .is_some_and(|next| next.fire_cycle <= current_cycle)
        {
            let Some(event) = self.queue.pop() else {
                break;
            };
            if !self.live.remove(&event.sequence) {
                continue;
            }
            self.now = event.fire_cycle;
            let args = EventArgs {
                handle: EventHandle(event.sequence),
                event_type: event.event_type,
                user_data: event.user_data,
                fire_cycle: event.fire_cycle,
                cycles_late: current_cycle - event.fire_cycle,
            };
            let index = event.event_type.0 as usize;
            let Some(mut callback) = self
                .types
                .get_mut(index)
                .and_then(|entry| entry.callback.take())
            else {
                log::warn!("timing: event of unregistered type {index} dropped");
                continue;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(ctx, self, args)));
            if let Some(entry) = self.types.get_mut(index) {
                entry.callback = Some(callback);
            }
            fired += 1;
            if let Err(payload) = outcome {
                // Leave the scheduler usable at the panicking event's cycle.
                self.fired = self.fired.saturating_add(fired as u64);
                self.advancing = false;
                self.prune_head();
                panic::resume_unwind(payload);
            }
        }
        self.now = current_cycle;
        self.fired = self.fired.saturating_add(fired as u64);
        self.advancing = false;
        self.prune_head();
        fired
    }

    /// Current scheduler time.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Number of pending (not yet fired, not cancelled) events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Returns `true` while `handle` is still waiting to fire.
    #[must_use]
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Cycle of the earliest pending event.
    #[must_use]
    pub fn next_fire_cycle(&self) -> Option<u64> {
        self.queue.peek().map(|event| event.fire_cycle)
    }

    /// Cycles from now until the earliest pending event fires.
    #[must_use]
    pub fn cycles_until_next(&self) -> Option<u64> {
        self.next_fire_cycle()
            .map(|cycle| cycle.saturating_sub(self.now))
    }

    /// Total callbacks invoked.
    #[must_use]
    pub const fn fired(&self) -> u64 {
        self.fired
    }

    /// Scheduler misuse counters.
    #[must_use]
    pub const fn faults(&self) -> &FaultCounters {
        &self.faults
    }

    /// Drops every pending event without invoking callbacks.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.live.clear();
    }

    /// Drops pending events and registered callbacks.
    pub(crate) fn release(&mut self) {
        self.clear();
        self.types.clear();
    }

    fn insert(&mut self, fire_cycle: u64, event_type: EventType, user_data: u64) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push(PendingEvent {
            fire_cycle,
            sequence,
            event_type,
            user_data,
        });
        self.live.insert(sequence);
        EventHandle(sequence)
    }

    fn prune_head(&mut self) {
        while self
            .queue
            .peek()
            .is_some_and(|head| !self.live.contains(&head.sequence))
        {
            self.queue.pop();
        }
    }

    fn compact_if_sparse(&mut self) {
        if self.queue.len() > 2 * self.live.len() + COMPACTION_SLACK {
            let live = &self.live;
            self.queue.retain(|event| live.contains(&event.sequence));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EventArgs, EventScheduler};

    type Log = Vec<(u64, u64)>;

    fn record(log: &mut Log, _: &mut EventScheduler<Log>, args: EventArgs) {
        log.push((args.user_data, args.fire_cycle));
    }

    #[test]
    fn events_fire_in_cycle_order() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        scheduler.schedule(30, ty, 3);
        scheduler.schedule(10, ty, 1);
        scheduler.schedule(20, ty, 2);

        let mut log = Log::new();
        assert_eq!(scheduler.advance(100, &mut log), 3);
        assert_eq!(log, vec![(1, 10), (2, 20), (3, 30)]);
        assert_eq!(scheduler.now(), 100);
    }

    #[test]
    fn equal_cycles_fire_in_scheduling_order() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        for user_data in 0..8 {
            scheduler.schedule(5, ty, user_data);
        }

        let mut log = Log::new();
        scheduler.advance(5, &mut log);
        let order: Vec<u64> = log.iter().map(|(data, _)| *data).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn events_after_current_cycle_stay_pending() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        scheduler.schedule(10, ty, 1);
        let late = scheduler.schedule(11, ty, 2);

        let mut log = Log::new();
        assert_eq!(scheduler.advance(10, &mut log), 1);
        assert!(scheduler.is_pending(late));
        assert_eq!(scheduler.cycles_until_next(), Some(1));
    }

    #[test]
    fn cancelled_event_never_fires_and_second_cancel_is_noop() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        let handle = scheduler.schedule(10, ty, 1);
        scheduler.schedule(20, ty, 2);

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        assert_eq!(scheduler.next_fire_cycle(), Some(20));

        let mut log = Log::new();
        scheduler.advance(50, &mut log);
        assert_eq!(log, vec![(2, 20)]);
        assert_eq!(
            scheduler.faults().count(crate::FaultCode::SchedulerMisuse),
            1
        );
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        let handle = scheduler.schedule(1, ty, 1);
        let mut log = Log::new();
        scheduler.advance(1, &mut log);

        assert!(!scheduler.cancel(handle));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn callbacks_scheduling_due_events_are_delivered_in_same_advance() {
        let mut scheduler = EventScheduler::<Log>::new();
        let chain = scheduler.register_event_type("chain", |log: &mut Log, sched, args| {
            log.push((args.user_data, args.fire_cycle));
            if args.user_data < 4 {
                sched.schedule(10, args.event_type, args.user_data + 1);
            }
        });
        scheduler.schedule(10, chain, 0);

        let mut log = Log::new();
        scheduler.advance(35, &mut log);
        assert_eq!(log, vec![(0, 10), (1, 20), (2, 30)]);
        assert_eq!(scheduler.next_fire_cycle(), Some(40));

        scheduler.advance(100, &mut log);
        assert_eq!(log.len(), 5);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn remove_all_only_touches_named_type() {
        let mut scheduler = EventScheduler::<Log>::new();
        let a = scheduler.register_event_type("a", record);
        let b = scheduler.register_event_type("b", record);
        scheduler.schedule(1, a, 1);
        scheduler.schedule(2, b, 2);
        scheduler.schedule(3, a, 3);

        assert_eq!(scheduler.remove_all(a), 2);
        let mut log = Log::new();
        scheduler.advance(10, &mut log);
        assert_eq!(log, vec![(2, 2)]);
    }

    #[test]
    fn clear_drops_events_without_invoking_them() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        scheduler.schedule(1, ty, 1);
        scheduler.clear();

        let mut log = Log::new();
        assert_eq!(scheduler.advance(10, &mut log), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn time_never_runs_backwards() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        let mut log = Log::new();
        scheduler.advance(100, &mut log);

        assert_eq!(scheduler.advance(50, &mut log), 0);
        assert_eq!(scheduler.now(), 100);

        scheduler.schedule_at(10, ty, 7);
        scheduler.advance(100, &mut log);
        assert_eq!(log, vec![(7, 100)]);
    }

    #[test]
    fn cancelled_entries_are_compacted() {
        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("record", record);
        scheduler.schedule(0, ty, 0);
        for n in 0..1_000 {
            let handle = scheduler.schedule(1_000 + n, ty, n);
            scheduler.cancel(handle);
        }
        assert_eq!(scheduler.pending(), 1);
        assert!(scheduler.queue.len() <= 2 + super::COMPACTION_SLACK);
    }

    #[test]
    fn cycles_late_reports_overshoot() {
        let mut scheduler = EventScheduler::<Vec<u64>>::new();
        let ty = scheduler.register_event_type("late", |log: &mut Vec<u64>, _, args| {
            log.push(args.cycles_late);
        });
        scheduler.schedule(10, ty, 0);
        let mut log = Vec::new();
        scheduler.advance(17, &mut log);
        assert_eq!(log, vec![7]);
    }

    #[test]
    fn panicking_callback_leaves_scheduler_usable() {
        use std::panic::{self, AssertUnwindSafe};

        let mut scheduler = EventScheduler::<Log>::new();
        let ty = scheduler.register_event_type("fragile", |log: &mut Log, _, args| {
            assert_ne!(args.user_data, 1, "fragile event");
            log.push((args.user_data, args.fire_cycle));
        });
        scheduler.schedule(10, ty, 1);
        scheduler.schedule(20, ty, 2);

        let mut log = Log::new();
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| scheduler.advance(50, &mut log)));
        assert!(unwound.is_err());
        assert_eq!(scheduler.now(), 10);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.fired(), 1);

        scheduler.schedule(5, ty, 3);
        assert_eq!(scheduler.advance(50, &mut log), 2);
        assert_eq!(log, vec![(3, 15), (2, 20)]);
    }
}
