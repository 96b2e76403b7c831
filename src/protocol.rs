//! Advance-time request from test clients
//!
//! Automated tests drive a fake-clock compositor by asking it to move time
//! forward. On the wire the duration travels like a presentation timestamp:
//! seconds split into high and low 32-bit words plus a nanosecond field.

use std::time::Duration;

use crate::{clock::Clock, error::ClockError};

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// Wire form of an advance-time request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceTimeRequest {
    pub tv_sec_hi: u32,
    pub tv_sec_lo: u32,
    pub tv_nsec: u32,
}

impl AdvanceTimeRequest {
    pub fn from_duration(duration: Duration) -> Self {
        let secs = duration.as_secs();
        Self {
            tv_sec_hi: (secs >> 32) as u32,
            tv_sec_lo: (secs & 0xFFFF_FFFF) as u32,
            tv_nsec: duration.subsec_nanos(),
        }
    }

    pub fn to_duration(self) -> Result<Duration, ClockError> {
        if self.tv_nsec >= NANOS_PER_SECOND {
            return Err(ClockError::InvalidNanoseconds(self.tv_nsec));
        }
        let secs = (u64::from(self.tv_sec_hi) << 32) | u64::from(self.tv_sec_lo);
        Ok(Duration::new(secs, self.tv_nsec))
    }
}

/// Compositor side of the request: decode and forward to the clock.
///
/// Errors are returned untouched so the protocol layer can post them to the
/// client instead of bringing the compositor down.
pub fn handle_advance_time<D: 'static>(
    clock: &Clock<D>,
    request: AdvanceTimeRequest,
) -> Result<(), ClockError> {
    let result = request
        .to_duration()
        .and_then(|delta| clock.advance_time(delta));
    match &result {
        Ok(()) => tracing::debug!("Advance time request accepted: {:?}", request),
        Err(e) => tracing::warn!("Advance time request {:?} rejected: {}", request, e),
    }
    result
}
