//! Flick compositor clock
//!
//! Lets the compositor's calloop event loop run on either the host clocks or
//! a fake clock that only moves when told to. Tests use the fake clock to make
//! timer-driven behavior reproducible:
//!
//! ```no_run
//! use std::time::Duration;
//! use calloop::EventLoop;
//! use flick_clock::{Clock, ClockMode};
//!
//! let mut event_loop: EventLoop<'static, ()> = EventLoop::try_new().unwrap();
//! let clock = Clock::new(ClockMode::Fake, Some(event_loop.handle()));
//!
//! let timer = clock.add_timer(|_| println!("fired")).unwrap();
//! clock.timer_update(timer, 3).unwrap();
//! clock.advance_time(Duration::from_millis(3)).unwrap();
//! while clock.has_pending_dispatch() {
//!     event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
//! }
//!
//! clock.timer_remove(timer);
//! clock.destroy();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod protocol;
pub mod time;
mod timer_list;

pub use clock::{Clock, ClockMode};
pub use config::ClockConfig;
pub use error::ClockError;
pub use event_loop::TimerHandle;
pub use protocol::{handle_advance_time, AdvanceTimeRequest};
pub use rustix::time::{ClockId, Timespec};
