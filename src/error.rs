//! Error types for the compositor clock

use std::path::PathBuf;

use rustix::time::ClockId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("clock id {0:?} is not emulated by the fake clock")]
    UnsupportedClockId(ClockId),

    #[error("cannot advance a clock running on real time")]
    RealTimeAdvance,

    #[error("clock has no event loop to run timers on")]
    NoEventLoop,

    #[error("fake time overflowed")]
    TimeOverflow,

    #[error("nanosecond field out of range: {0}")]
    InvalidNanoseconds(u32),

    #[error("event loop error: {0}")]
    EventLoop(#[source] calloop::Error),

    #[error("failed to read clock config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid clock config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown clock mode {0:?} (expected \"real\" or \"fake\")")]
    UnknownMode(String),
}
