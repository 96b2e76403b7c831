//! Clock ids and timespec conversions

use std::time::Duration;

use rustix::time::{clock_gettime, ClockId, Timespec};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Whether the fake clock answers queries for this clock id.
///
/// Every emulated id reports the same fake time; CPU-time clocks and the
/// alarm/TAI variants are not emulated.
pub fn is_emulated(clock_id: ClockId) -> bool {
    match clock_id {
        ClockId::Realtime
        | ClockId::Monotonic
        | ClockId::MonotonicRaw
        | ClockId::RealtimeCoarse
        | ClockId::MonotonicCoarse => true,
        #[cfg(target_os = "linux")]
        ClockId::Boottime => true,
        _ => false,
    }
}

/// Read the host clock directly.
pub(crate) fn real_gettime(clock_id: ClockId) -> Timespec {
    clock_gettime(clock_id)
}

pub fn timespec_from_duration(duration: Duration) -> Timespec {
    Timespec {
        tv_sec: i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
        tv_nsec: i64::from(duration.subsec_nanos()),
    }
}

/// Negative timestamps clamp to zero.
pub fn timespec_to_duration(timespec: Timespec) -> Duration {
    let seconds = u64::try_from(timespec.tv_sec).unwrap_or(0);
    let nanos = u32::try_from(timespec.tv_nsec.clamp(0, NANOS_PER_SECOND - 1)).unwrap_or(0);
    Duration::new(seconds, nanos)
}
