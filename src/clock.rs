//! The compositor clock
//!
//! A [`Clock`] runs either on the host clocks (`ClockMode::Real`) or on a fake
//! time that only moves when asked to (`ClockMode::Fake`). Timers registered
//! through the clock work the same in both modes; in fake mode their callbacks
//! are dispatched from idle callbacks on the event loop so that:
//!
//! - due timers fire in ascending trigger order,
//! - during each callback the clock reads exactly that timer's trigger time,
//! - the advanced-to time only becomes visible after every due timer fired.
//!
//! Callbacks are free to re-arm timers or queue idle work of their own. Every
//! mutation and every dispatch re-runs the due-timer scan and pushes the
//! final-time task back to the end of the idle queue, which is what keeps the
//! ordering intact when callbacks schedule more callbacks.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{Idle, LoopHandle};
use rustix::time::{ClockId, Timespec};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    error::ClockError,
    event_loop::{LoopTimers, TimerCallback, TimerHandle},
    time::{is_emulated, real_gettime, timespec_from_duration},
    timer_list::{FakeTimer, TimerList},
};

/// Where the clock takes its time from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    #[default]
    Real,
    Fake,
}

/// Shared handle to the compositor clock.
///
/// Cloning is cheap and every clone refers to the same clock. `D` is the
/// event loop's user data, handed to timer callbacks.
pub struct Clock<D: 'static> {
    inner: Rc<RefCell<ClockInner<D>>>,
}

impl<D: 'static> Clone for Clock<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: 'static> std::fmt::Debug for Clock<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        let mut debug = f.debug_struct("Clock");
        debug.field("mode", &inner.mode());
        if let TimeSource::Fake(fake) = &inner.source {
            debug
                .field("now", &fake.now)
                .field("timers", &fake.timers.len())
                .field("final_time", &fake.final_time.as_ref().map(|f| f.target));
        }
        debug.finish()
    }
}

struct ClockInner<D: 'static> {
    event_loop: Option<LoopTimers<D>>,
    source: TimeSource<D>,
    /// Handed to idle callbacks so they can find their way back
    this: Weak<RefCell<ClockInner<D>>>,
}

enum TimeSource<D: 'static> {
    Real,
    Fake(FakeTime<D>),
}

struct FakeTime<D: 'static> {
    now: Duration,
    timers: TimerList<D>,
    final_time: Option<FinalTime>,
}

/// Scheduled application of an advance
struct FinalTime {
    target: Duration,
    idle: Idle<'static>,
}

impl<D: 'static> FakeTime<D> {
    fn new() -> Self {
        Self {
            now: Duration::ZERO,
            timers: TimerList::new(),
            final_time: None,
        }
    }

    /// Time that scans run against: the pending advance if there is one.
    fn target(&self) -> Duration {
        self.final_time
            .as_ref()
            .map(|f| f.target)
            .unwrap_or(self.now)
    }
}

impl<D: 'static> ClockInner<D> {
    fn mode(&self) -> ClockMode {
        match self.source {
            TimeSource::Real => ClockMode::Real,
            TimeSource::Fake(_) => ClockMode::Fake,
        }
    }

    /// (Re)schedule a dispatch for every armed timer due by `target`.
    ///
    /// Pending dispatches are cancelled and queued again so they end up after
    /// any idle work queued since they were first scheduled.
    fn schedule_due_timers(&mut self, target: Duration) {
        let (Some(event_loop), TimeSource::Fake(fake)) = (&self.event_loop, &mut self.source)
        else {
            return;
        };

        for timer in fake.timers.due_mut(target) {
            timer.cancel_pending();
            let this = self.this.clone();
            let handle = timer.handle;
            timer.pending = Some(
                event_loop.insert_idle(move |data: &mut D| dispatch_timer(&this, handle, data)),
            );
        }
    }

    /// (Re)schedule the task making `target` the current fake time.
    fn schedule_final_time(&mut self, target: Duration) {
        let TimeSource::Fake(fake) = &mut self.source else {
            return;
        };
        if let Some(previous) = fake.final_time.take() {
            previous.idle.cancel();
        }

        let Some(event_loop) = &self.event_loop else {
            fake.now = target;
            return;
        };

        let this = self.this.clone();
        let idle = event_loop.insert_idle(move |data: &mut D| apply_final_time(&this, data));
        fake.final_time = Some(FinalTime { target, idle });
    }

    fn reschedule(&mut self) {
        let TimeSource::Fake(fake) = &self.source else {
            return;
        };
        let target = fake.target();
        self.schedule_due_timers(target);
        self.schedule_final_time(target);
    }
}

/// Idle body running one fake timer.
fn dispatch_timer<D: 'static>(
    this: &Weak<RefCell<ClockInner<D>>>,
    handle: TimerHandle,
    data: &mut D,
) {
    let Some(inner) = this.upgrade() else {
        return;
    };

    let callback = {
        let mut guard = inner.borrow_mut();
        let TimeSource::Fake(fake) = &mut guard.source else {
            return;
        };
        let Some(timer) = fake.timers.get_mut(handle) else {
            return;
        };
        // This is the idle being run right now, it must not be cancelled.
        timer.pending = None;
        let Some(trigger) = timer.trigger else {
            return;
        };

        fake.now = trigger;
        let Some(timer) = fake.timers.set_trigger(handle, None) else {
            return;
        };
        timer.callback.clone()
    };

    trace!("Fake timer {:?} fired", handle);
    (callback.borrow_mut())(data);

    inner.borrow_mut().reschedule();
}

/// Idle body applying the target of the last advance.
fn apply_final_time<D: 'static>(this: &Weak<RefCell<ClockInner<D>>>, _data: &mut D) {
    let Some(inner) = this.upgrade() else {
        return;
    };
    let mut guard = inner.borrow_mut();

    let TimeSource::Fake(fake) = &mut guard.source else {
        return;
    };
    // Dropping without cancel: this is the idle being run.
    let Some(FinalTime { target, .. }) = fake.final_time.take() else {
        return;
    };
    fake.now = target;
    trace!("Fake time applied: {:?}", target);

    // Timer updates from other idle callbacks may have landed in between.
    // Their dispatches move the time back to their triggers, so the target
    // is queued again behind them.
    guard.schedule_due_timers(target);
    let requeue = match &guard.source {
        TimeSource::Fake(fake) => fake.timers.has_pending(),
        TimeSource::Real => false,
    };
    if requeue {
        guard.schedule_final_time(target);
    }
}

impl<D: 'static> Clock<D> {
    /// Create a clock. Without an event loop the clock is a pure time source:
    /// timers cannot be added and fake advances apply immediately.
    pub fn new(mode: ClockMode, event_loop: Option<LoopHandle<'static, D>>) -> Self {
        let source = match mode {
            ClockMode::Real => TimeSource::Real,
            ClockMode::Fake => TimeSource::Fake(FakeTime::new()),
        };
        debug!(
            "Clock created: {:?} (event loop: {})",
            mode,
            event_loop.is_some()
        );

        let inner = Rc::new_cyclic(|this| {
            RefCell::new(ClockInner {
                event_loop: event_loop.map(LoopTimers::new),
                source,
                this: this.clone(),
            })
        });
        Self { inner }
    }

    /// Tear the clock down.
    ///
    /// # Panics
    ///
    /// Every timer must have been removed first.
    pub fn destroy(self) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        if let Some(event_loop) = &inner.event_loop {
            assert!(
                event_loop.is_empty(),
                "clock destroyed with {} timers still registered",
                event_loop.len()
            );
        }
        if let TimeSource::Fake(fake) = &mut inner.source {
            assert!(
                fake.timers.is_empty(),
                "clock destroyed with {} fake timers still registered",
                fake.timers.len()
            );
            if let Some(final_time) = fake.final_time.take() {
                final_time.idle.cancel();
            }
        }
        debug!("Clock destroyed");
    }

    pub fn mode(&self) -> ClockMode {
        self.inner.borrow().mode()
    }

    /// Current time for `clock_id`.
    ///
    /// On a fake clock all emulated ids read the same fake time; other ids
    /// are rejected.
    pub fn gettime(&self, clock_id: ClockId) -> Result<Timespec, ClockError> {
        match &self.inner.borrow().source {
            TimeSource::Real => Ok(real_gettime(clock_id)),
            TimeSource::Fake(fake) => {
                if !is_emulated(clock_id) {
                    return Err(ClockError::UnsupportedClockId(clock_id));
                }
                Ok(timespec_from_duration(fake.now))
            }
        }
    }

    /// Move fake time forward by `delta`.
    ///
    /// The new time is the current fake time plus `delta`. Due timers are
    /// queued on the event loop and the new time is applied once they have
    /// all run. Advancing again before that replaces the pending advance.
    pub fn advance_time(&self, delta: Duration) -> Result<(), ClockError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let TimeSource::Fake(fake) = &mut inner.source else {
            warn!("Refusing to advance a real-time clock by {:?}", delta);
            return Err(ClockError::RealTimeAdvance);
        };
        let target = fake
            .now
            .checked_add(delta)
            .ok_or(ClockError::TimeOverflow)?;
        debug!("Advancing fake time by {:?} to {:?}", delta, target);

        // A replaced advance may have queued timers past the new target.
        fake.timers.cancel_after(target);
        inner.schedule_due_timers(target);
        inner.schedule_final_time(target);
        Ok(())
    }

    /// Register a disarmed timer. Arm it with [`Clock::timer_update`].
    pub fn add_timer<F>(&self, callback: F) -> Result<TimerHandle, ClockError>
    where
        F: FnMut(&mut D) + 'static,
    {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let Some(event_loop) = inner.event_loop.as_mut() else {
            return Err(ClockError::NoEventLoop);
        };
        let callback: TimerCallback<D> = Rc::new(RefCell::new(callback));
        let handle = event_loop.add(callback.clone());

        if let TimeSource::Fake(fake) = &mut inner.source {
            fake.timers.insert(FakeTimer::new(handle, callback));
        }
        debug!("Timer {:?} added", handle);
        Ok(handle)
    }

    /// Arm `handle` to fire in `delay_ms` milliseconds, or disarm it when
    /// `delay_ms <= 0`.
    ///
    /// # Panics
    ///
    /// If `handle` was not returned by this clock or was already removed.
    pub fn timer_update(&self, handle: TimerHandle, delay_ms: i32) -> Result<(), ClockError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let fake = match &mut inner.source {
            TimeSource::Real => {
                let Some(event_loop) = &inner.event_loop else {
                    panic!("timer {:?} updated on a clock without event loop", handle);
                };
                return event_loop.update(handle, delay_ms);
            }
            TimeSource::Fake(fake) => fake,
        };

        let trigger = match u64::try_from(delay_ms) {
            Ok(delay) if delay > 0 => Some(
                fake.now
                    .checked_add(Duration::from_millis(delay))
                    .ok_or(ClockError::TimeOverflow)?,
            ),
            _ => None,
        };

        let Some(timer) = fake.timers.set_trigger(handle, trigger) else {
            panic!("timer {:?} is not registered with this clock", handle);
        };
        // The rescan below queues it again if it is still due.
        timer.cancel_pending();
        trace!("Fake timer {:?} updated, trigger {:?}", handle, trigger);

        inner.reschedule();
        Ok(())
    }

    /// Unregister `handle`, cancelling a dispatch that may still be queued.
    ///
    /// # Panics
    ///
    /// If `handle` was not returned by this clock or was already removed.
    pub fn timer_remove(&self, handle: TimerHandle) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;

        let Some(event_loop) = &inner.event_loop else {
            panic!("timer {:?} removed from a clock without event loop", handle);
        };
        event_loop.remove(handle);

        if let TimeSource::Fake(fake) = &mut inner.source {
            let Some(mut timer) = fake.timers.remove(handle) else {
                panic!("timer {:?} is not registered with this clock", handle);
            };
            timer.cancel_pending();
        }
        debug!("Timer {:?} removed", handle);
    }

    /// Whether fake timer dispatches or an advance are still queued on the
    /// event loop. Always false for real clocks.
    pub fn has_pending_dispatch(&self) -> bool {
        match &self.inner.borrow().source {
            TimeSource::Real => false,
            TimeSource::Fake(fake) => fake.final_time.is_some() || fake.timers.has_pending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::EventLoop;

    use crate::time::timespec_to_duration;

    /// Loop data: the clock plus a log of which timer fired at what time.
    struct Recorder {
        clock: Clock<Recorder>,
        fired: Vec<(&'static str, Duration)>,
    }

    impl Recorder {
        fn now(&self) -> Duration {
            timespec_to_duration(self.clock.gettime(ClockId::Monotonic).unwrap())
        }

        fn names(&self) -> Vec<&'static str> {
            self.fired.iter().map(|(name, _)| *name).collect()
        }
    }

    fn fake_clock() -> (EventLoop<'static, Recorder>, Recorder) {
        let event_loop = EventLoop::try_new().unwrap();
        let clock = Clock::new(ClockMode::Fake, Some(event_loop.handle()));
        let recorder = Recorder {
            clock,
            fired: Vec::new(),
        };
        (event_loop, recorder)
    }

    fn record(name: &'static str) -> impl FnMut(&mut Recorder) + 'static {
        move |rec: &mut Recorder| {
            let now = rec.now();
            rec.fired.push((name, now));
        }
    }

    fn dispatch_once(event_loop: &mut EventLoop<'static, Recorder>, rec: &mut Recorder) {
        event_loop.dispatch(Some(Duration::ZERO), rec).unwrap();
    }

    /// Dispatch until the clock has nothing queued anymore.
    fn settle(event_loop: &mut EventLoop<'static, Recorder>, rec: &mut Recorder) {
        for _ in 0..64 {
            if !rec.clock.has_pending_dispatch() {
                return;
            }
            dispatch_once(event_loop, rec);
        }
        panic!("clock did not settle");
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    const EMULATED: &[ClockId] = &[
        ClockId::Realtime,
        ClockId::Monotonic,
        ClockId::MonotonicRaw,
        ClockId::RealtimeCoarse,
        ClockId::MonotonicCoarse,
        #[cfg(target_os = "linux")]
        ClockId::Boottime,
    ];

    #[test]
    fn test_fake_clock_starts_at_zero() {
        let (_event_loop, rec) = fake_clock();
        for id in EMULATED {
            let ts = rec.clock.gettime(*id).unwrap();
            assert_eq!((ts.tv_sec, ts.tv_nsec), (0, 0), "{:?}", id);
        }
        rec.clock.destroy();
    }

    #[test]
    fn test_all_clock_ids_share_fake_time() {
        let (mut event_loop, mut rec) = fake_clock();
        rec.clock.advance_time(Duration::new(1, 500)).unwrap();
        settle(&mut event_loop, &mut rec);

        for id in EMULATED {
            let ts = rec.clock.gettime(*id).unwrap();
            assert_eq!(timespec_to_duration(ts), Duration::new(1, 500), "{:?}", id);
        }
    }

    #[test]
    fn test_unsupported_clock_id() {
        let (_event_loop, rec) = fake_clock();
        let err = rec.clock.gettime(ClockId::ProcessCPUTime).unwrap_err();
        assert!(matches!(err, ClockError::UnsupportedClockId(ClockId::ProcessCPUTime)));
    }

    #[test]
    fn test_real_clock_rejects_advance() {
        let event_loop: EventLoop<'static, Recorder> = EventLoop::try_new().unwrap();
        let clock = Clock::new(ClockMode::Real, Some(event_loop.handle()));
        assert!(matches!(
            clock.advance_time(ms(5)),
            Err(ClockError::RealTimeAdvance)
        ));
        assert!(clock.gettime(ClockId::Monotonic).is_ok());
        assert!(!clock.has_pending_dispatch());
        clock.destroy();
    }

    #[test]
    fn test_advance_is_deferred_until_dispatch() {
        let (mut event_loop, mut rec) = fake_clock();
        rec.clock.advance_time(ms(7)).unwrap();
        assert_eq!(rec.now(), Duration::ZERO);
        assert!(rec.clock.has_pending_dispatch());

        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.now(), ms(7));
    }

    #[test]
    fn test_second_advance_replaces_pending_one() {
        let (mut event_loop, mut rec) = fake_clock();
        rec.clock.advance_time(ms(2)).unwrap();
        rec.clock.advance_time(ms(3)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.now(), ms(3));
    }

    #[test]
    fn test_advance_from_callback_starts_at_trigger() {
        let (mut event_loop, mut rec) = fake_clock();
        let late = rec.clock.add_timer(record("late")).unwrap();
        let early = rec
            .clock
            .add_timer(move |rec: &mut Recorder| {
                let now = rec.now();
                rec.fired.push(("early", now));
                rec.clock.advance_time(ms(1)).unwrap();
            })
            .unwrap();
        rec.clock.timer_update(early, 2).unwrap();
        rec.clock.timer_update(late, 5).unwrap();

        // Both are queued by this advance, the callback's advance drops "late"
        rec.clock.advance_time(ms(8)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("early", ms(2))]);
        assert_eq!(rec.now(), ms(3));

        rec.clock.advance_time(ms(2)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("early", ms(2)), ("late", ms(5))]);
        assert_eq!(rec.now(), ms(5));

        rec.clock.timer_remove(early);
        rec.clock.timer_remove(late);
    }

    #[test]
    fn test_without_loop_time_applies_immediately() {
        let clock: Clock<()> = Clock::new(ClockMode::Fake, None);
        clock.advance_time(ms(4)).unwrap();
        let now = timespec_to_duration(clock.gettime(ClockId::Realtime).unwrap());
        assert_eq!(now, ms(4));
        assert!(!clock.has_pending_dispatch());
        assert!(matches!(
            clock.add_timer(|_: &mut ()| {}),
            Err(ClockError::NoEventLoop)
        ));
        clock.destroy();
    }

    #[test]
    fn test_unarmed_timer_never_fires() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("idle")).unwrap();

        rec.clock.advance_time(Duration::from_secs(3600)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_timer_fires_at_its_trigger_time() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 3).unwrap();

        rec.clock.advance_time(ms(2)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());
        assert_eq!(rec.now(), ms(2));

        rec.clock.advance_time(ms(1)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(3))]);

        rec.clock.timer_remove(timer);
        rec.clock.clone().destroy();
    }

    #[test]
    fn test_callback_sees_trigger_not_target() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 3).unwrap();

        rec.clock.advance_time(ms(10)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(3))]);
        assert_eq!(rec.now(), ms(10));

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_timer_fires_once() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 1).unwrap();

        for _ in 0..3 {
            rec.clock.advance_time(ms(5)).unwrap();
            settle(&mut event_loop, &mut rec);
        }
        assert_eq!(rec.fired, vec![("t", ms(1))]);

        // Re-arming is relative to the current fake time
        rec.clock.timer_update(timer, 2).unwrap();
        rec.clock.advance_time(ms(2)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(1)), ("t", ms(17))]);

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_timers_fire_in_trigger_order() {
        let (mut event_loop, mut rec) = fake_clock();
        let c = rec.clock.add_timer(record("c")).unwrap();
        let a = rec.clock.add_timer(record("a")).unwrap();
        let b = rec.clock.add_timer(record("b")).unwrap();
        rec.clock.timer_update(c, 3).unwrap();
        rec.clock.timer_update(a, 1).unwrap();
        rec.clock.timer_update(b, 2).unwrap();

        rec.clock.advance_time(ms(5)).unwrap();
        settle(&mut event_loop, &mut rec);

        assert_eq!(rec.fired, vec![("a", ms(1)), ("b", ms(2)), ("c", ms(3))]);
        assert_eq!(rec.now(), ms(5));

        for timer in [a, b, c] {
            rec.clock.timer_remove(timer);
        }
        rec.clock.clone().destroy();
    }

    #[test]
    fn test_disarm_prevents_fire() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 2).unwrap();

        rec.clock.advance_time(ms(5)).unwrap();
        // The dispatch is queued already, disarming must still win
        rec.clock.timer_update(timer, 0).unwrap();
        settle(&mut event_loop, &mut rec);

        assert!(rec.fired.is_empty());
        assert_eq!(rec.now(), ms(5));
        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_negative_delay_disarms() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 2).unwrap();
        rec.clock.timer_update(timer, -1).unwrap();

        rec.clock.advance_time(ms(5)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());

        rec.clock.timer_update(timer, 1).unwrap();
        rec.clock.advance_time(ms(5)).unwrap();
        rec.clock.timer_update(timer, i32::MIN).unwrap();
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());
        assert_eq!(rec.now(), ms(10));

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_rearm_past_target_drops_queued_dispatch() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 2).unwrap();

        rec.clock.advance_time(ms(5)).unwrap();
        rec.clock.timer_update(timer, 8).unwrap();
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());
        assert_eq!(rec.now(), ms(5));

        rec.clock.advance_time(ms(3)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(8))]);
        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_remove_with_dispatch_queued() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_update(timer, 3).unwrap();

        rec.clock.advance_time(ms(3)).unwrap();
        rec.clock.timer_remove(timer);
        settle(&mut event_loop, &mut rec);

        assert!(rec.fired.is_empty());
        assert_eq!(rec.now(), ms(3));
        rec.clock.clone().destroy();
    }

    #[test]
    fn test_callback_removing_later_timer() {
        let (mut event_loop, mut rec) = fake_clock();
        let late = rec.clock.add_timer(record("late")).unwrap();
        let early = rec
            .clock
            .add_timer(move |rec: &mut Recorder| {
                let now = rec.now();
                rec.fired.push(("early", now));
                rec.clock.timer_remove(late);
            })
            .unwrap();
        rec.clock.timer_update(early, 1).unwrap();
        rec.clock.timer_update(late, 2).unwrap();

        rec.clock.advance_time(ms(5)).unwrap();
        settle(&mut event_loop, &mut rec);

        assert_eq!(rec.names(), vec!["early"]);
        rec.clock.timer_remove(early);
    }

    #[test]
    fn test_nested_timer_fires_before_target() {
        let (mut event_loop, mut rec) = fake_clock();
        let nested = rec.clock.add_timer(record("nested")).unwrap();
        let outer = rec
            .clock
            .add_timer(move |rec: &mut Recorder| {
                let now = rec.now();
                rec.fired.push(("outer", now));
                rec.clock.timer_update(nested, 2).unwrap();
            })
            .unwrap();
        rec.clock.timer_update(outer, 3).unwrap();

        rec.clock.advance_time(ms(10)).unwrap();
        settle(&mut event_loop, &mut rec);

        assert_eq!(rec.fired, vec![("outer", ms(3)), ("nested", ms(5))]);
        assert_eq!(rec.now(), ms(10));

        rec.clock.timer_remove(outer);
        rec.clock.timer_remove(nested);
    }

    #[test]
    fn test_nested_chain_stops_at_target() {
        let (mut event_loop, mut rec) = fake_clock();
        let chain = Rc::new(RefCell::new(None::<TimerHandle>));
        let chain_cb = chain.clone();
        let timer = rec
            .clock
            .add_timer(move |rec: &mut Recorder| {
                let now = rec.now();
                rec.fired.push(("tick", now));
                if let Some(timer) = *chain_cb.borrow() {
                    rec.clock.timer_update(timer, 4).unwrap();
                }
            })
            .unwrap();
        *chain.borrow_mut() = Some(timer);
        rec.clock.timer_update(timer, 4).unwrap();

        rec.clock.advance_time(ms(10)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("tick", ms(4)), ("tick", ms(8))]);
        assert_eq!(rec.now(), ms(10));

        rec.clock.advance_time(ms(2)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired.last(), Some(&("tick", ms(12))));

        *chain.borrow_mut() = None;
        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_idle_armed_timer_fires_at_simulated_time() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();

        rec.clock.advance_time(ms(1)).unwrap();
        settle(&mut event_loop, &mut rec);

        event_loop.handle().insert_idle(move |rec: &mut Recorder| {
            rec.clock.timer_update(timer, 3).unwrap();
        });
        dispatch_once(&mut event_loop, &mut rec);
        settle(&mut event_loop, &mut rec);
        assert!(rec.fired.is_empty());

        rec.clock.advance_time(ms(5)).unwrap();
        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(4))]);
        assert_eq!(rec.now(), ms(6));

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_idle_queued_by_callback_runs_before_target() {
        let (mut event_loop, mut rec) = fake_clock();
        let loop_handle = event_loop.handle();
        let timer = rec
            .clock
            .add_timer(move |rec: &mut Recorder| {
                let now = rec.now();
                rec.fired.push(("timer", now));
                loop_handle.insert_idle(|rec: &mut Recorder| {
                    let now = rec.now();
                    rec.fired.push(("idle", now));
                });
            })
            .unwrap();
        rec.clock.timer_update(timer, 2).unwrap();

        rec.clock.advance_time(ms(6)).unwrap();
        settle(&mut event_loop, &mut rec);

        assert_eq!(rec.fired, vec![("timer", ms(2)), ("idle", ms(2))]);
        assert_eq!(rec.now(), ms(6));
        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_final_time_requeued_behind_late_dispatch() {
        let (mut event_loop, mut rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.advance_time(ms(5)).unwrap();

        // Arm behind the clock's back so only the final-time rescan sees it
        {
            let mut inner = rec.clock.inner.borrow_mut();
            let TimeSource::Fake(fake) = &mut inner.source else {
                unreachable!();
            };
            assert!(fake.timers.set_trigger(timer, Some(ms(3))).is_some());
        }

        settle(&mut event_loop, &mut rec);
        assert_eq!(rec.fired, vec![("t", ms(3))]);
        assert_eq!(rec.now(), ms(5));

        rec.clock.timer_remove(timer);
    }

    #[test]
    fn test_real_clock_timer_passthrough() {
        let mut event_loop: EventLoop<'static, Recorder> = EventLoop::try_new().unwrap();
        let clock = Clock::new(ClockMode::Real, Some(event_loop.handle()));
        let mut rec = Recorder {
            clock: clock.clone(),
            fired: Vec::new(),
        };

        let timer = clock.add_timer(record("real")).unwrap();
        clock.timer_update(timer, 1).unwrap();
        for _ in 0..100 {
            if !rec.fired.is_empty() {
                break;
            }
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut rec)
                .unwrap();
        }
        assert_eq!(rec.names(), vec!["real"]);

        clock.timer_remove(timer);
        clock.destroy();
    }

    #[test]
    #[should_panic(expected = "still registered")]
    fn test_destroy_with_live_timer_panics() {
        let (_event_loop, rec) = fake_clock();
        let _timer = rec.clock.add_timer(record("leak")).unwrap();
        rec.clock.clone().destroy();
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_update_after_remove_panics() {
        let (_event_loop, rec) = fake_clock();
        let timer = rec.clock.add_timer(record("t")).unwrap();
        rec.clock.timer_remove(timer);
        let _ = rec.clock.timer_update(timer, 1);
    }
}
