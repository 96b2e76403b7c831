//! Fake-time timer records, kept sorted by trigger time

use std::time::Duration;

use calloop::Idle;

use crate::event_loop::{TimerCallback, TimerHandle};

/// A timer living on fake time.
pub(crate) struct FakeTimer<D: 'static> {
    pub handle: TimerHandle,
    pub callback: TimerCallback<D>,
    /// Absolute fake time the timer is due at, `None` while disarmed
    pub trigger: Option<Duration>,
    /// Idle dispatch scheduled for this timer, not yet run
    pub pending: Option<Idle<'static>>,
}

impl<D: 'static> FakeTimer<D> {
    pub fn new(handle: TimerHandle, callback: TimerCallback<D>) -> Self {
        Self {
            handle,
            callback,
            trigger: None,
            pending: None,
        }
    }

    /// Drop the scheduled dispatch, if any, so it never runs.
    pub fn cancel_pending(&mut self) {
        if let Some(idle) = self.pending.take() {
            idle.cancel();
        }
    }
}

/// Timers ordered by trigger time.
///
/// Disarmed timers (`None`) sort first, armed timers follow in ascending
/// trigger order. Timers with equal triggers keep the order in which they
/// reached that trigger.
pub(crate) struct TimerList<D: 'static> {
    timers: Vec<FakeTimer<D>>,
}

impl<D: 'static> TimerList<D> {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn insert(&mut self, timer: FakeTimer<D>) -> &mut FakeTimer<D> {
        let trigger = timer.trigger;
        let index = self.timers.partition_point(|t| t.trigger <= trigger);
        self.timers.insert(index, timer);
        &mut self.timers[index]
    }

    pub fn get_mut(&mut self, handle: TimerHandle) -> Option<&mut FakeTimer<D>> {
        self.timers.iter_mut().find(|t| t.handle == handle)
    }

    pub fn remove(&mut self, handle: TimerHandle) -> Option<FakeTimer<D>> {
        let index = self.timers.iter().position(|t| t.handle == handle)?;
        Some(self.timers.remove(index))
    }

    /// Move a timer to its new trigger time, `None` for unknown handles.
    pub fn set_trigger(
        &mut self,
        handle: TimerHandle,
        trigger: Option<Duration>,
    ) -> Option<&mut FakeTimer<D>> {
        let mut timer = self.remove(handle)?;
        timer.trigger = trigger;
        Some(self.insert(timer))
    }

    /// Drop queued dispatches of timers that are no longer due by `target`.
    pub fn cancel_after(&mut self, target: Duration) {
        for timer in &mut self.timers {
            if timer.trigger.is_some_and(|trigger| trigger > target) {
                timer.cancel_pending();
            }
        }
    }

    /// Armed timers due at or before `target`, in firing order.
    pub fn due_mut(&mut self, target: Duration) -> impl Iterator<Item = &mut FakeTimer<D>> {
        self.timers
            .iter_mut()
            .skip_while(|t| t.trigger.is_none())
            .take_while(move |t| t.trigger.is_some_and(|trigger| trigger <= target))
    }

    pub fn has_pending(&self) -> bool {
        self.iter().any(|t| t.pending.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FakeTimer<D>> {
        self.timers.iter()
    }
}
