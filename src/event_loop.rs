//! Re-armable timers on top of calloop
//!
//! calloop timers are one-shot sources: once inserted they fire and go away
//! unless their callback reschedules them. The clock wants the opposite
//! contract, a stable handle that callers arm, disarm and remove at will, so
//! `LoopTimers` keeps the callback under a handle and swaps the underlying
//! timer source on every update.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
    time::Duration,
};

use calloop::{
    timer::{TimeoutAction, Timer},
    Idle, LoopHandle, RegistrationToken,
};

use crate::error::ClockError;

/// Callback shared between the loop timer and the fake timer record.
pub(crate) type TimerCallback<D> = Rc<RefCell<dyn FnMut(&mut D)>>;

/// Stable handle for a timer registered through a [`Clock`](crate::Clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct LoopTimer<D> {
    callback: TimerCallback<D>,
    /// Registered calloop source while armed
    token: Option<RegistrationToken>,
}

type TimerTable<D> = Rc<RefCell<HashMap<TimerHandle, LoopTimer<D>>>>;

pub(crate) struct LoopTimers<D: 'static> {
    handle: LoopHandle<'static, D>,
    timers: TimerTable<D>,
    next_id: u64,
}

impl<D: 'static> LoopTimers<D> {
    pub(crate) fn new(handle: LoopHandle<'static, D>) -> Self {
        Self {
            handle,
            timers: Rc::new(RefCell::new(HashMap::new())),
            next_id: 0,
        }
    }

    /// Register a disarmed timer.
    pub(crate) fn add(&mut self, callback: TimerCallback<D>) -> TimerHandle {
        let timer = TimerHandle(self.next_id);
        self.next_id += 1;
        self.timers.borrow_mut().insert(
            timer,
            LoopTimer {
                callback,
                token: None,
            },
        );
        timer
    }

    /// Arm the timer to fire after `delay_ms`, or disarm it when `delay_ms <= 0`.
    pub(crate) fn update(&self, timer: TimerHandle, delay_ms: i32) -> Result<(), ClockError> {
        let mut timers = self.timers.borrow_mut();
        let Some(entry) = timers.get_mut(&timer) else {
            panic!("timer {:?} is not registered with this event loop", timer);
        };

        if let Some(token) = entry.token.take() {
            self.handle.remove(token);
        }

        let Ok(delay_ms) = u64::try_from(delay_ms) else {
            return Ok(());
        };
        if delay_ms == 0 {
            return Ok(());
        }

        let table = Rc::downgrade(&self.timers);
        let token = self
            .handle
            .insert_source(
                Timer::from_duration(Duration::from_millis(delay_ms)),
                move |_deadline, _, data| {
                    fire(&table, timer, data);
                    TimeoutAction::Drop
                },
            )
            .map_err(|e| ClockError::EventLoop(e.error))?;
        entry.token = Some(token);

        Ok(())
    }

    pub(crate) fn remove(&self, timer: TimerHandle) {
        let removed = self.timers.borrow_mut().remove(&timer);
        match removed {
            Some(LoopTimer {
                token: Some(token), ..
            }) => self.handle.remove(token),
            Some(_) => {}
            None => panic!("timer {:?} is not registered with this event loop", timer),
        }
    }

    pub(crate) fn insert_idle<F>(&self, callback: F) -> Idle<'static>
    where
        F: FnOnce(&mut D) + 'static,
    {
        self.handle.insert_idle(callback)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of an expired calloop timer source.
fn fire<D>(
    table: &Weak<RefCell<HashMap<TimerHandle, LoopTimer<D>>>>,
    timer: TimerHandle,
    data: &mut D,
) {
    let Some(table) = table.upgrade() else {
        return;
    };

    // The source is dropped by calloop after this returns, forget its token
    // first so a re-arm from inside the callback registers a fresh one.
    let callback = {
        let mut timers = table.borrow_mut();
        let Some(entry) = timers.get_mut(&timer) else {
            return;
        };
        entry.token = None;
        entry.callback.clone()
    };

    tracing::trace!("Loop timer {:?} expired", timer);
    (callback.borrow_mut())(data);
}
