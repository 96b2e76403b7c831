//! flick-clock - replay a timer timeline against the Flick compositor clock
//!
//! Arms a set of named timers, then either steps fake time forward or lets
//! real time run, logging every firing with the time the callback observed.
//!
//!     flick-clock --mode fake --timer blink=3 --timer fade=5 --advance 2 --advance 4

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use calloop::EventLoop;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flick_clock::{
    time::timespec_to_duration, Clock, ClockConfig, ClockId, ClockMode, TimerHandle,
};

/// Upper bound on loop dispatches while waiting for a fake step to settle
const MAX_SETTLE_DISPATCHES: usize = 1024;

/// How long real timers may run late before the replay gives up
const REAL_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "flick-clock")]
#[command(about = "Replay timers against the Flick compositor clock", long_about = None)]
struct Args {
    /// Clock mode, overrides the config file
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Read clock config from this file instead of the default location
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Timer to arm, as NAME=MILLISECONDS
    #[arg(short, long = "timer", value_parser = parse_timer)]
    timers: Vec<(String, i32)>,

    /// Fake time step in milliseconds, applied in order
    #[arg(short, long = "advance")]
    advances: Vec<u64>,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Real,
    Fake,
}

impl From<ModeArg> for ClockMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Real => ClockMode::Real,
            ModeArg::Fake => ClockMode::Fake,
        }
    }
}

fn parse_timer(value: &str) -> Result<(String, i32), String> {
    let (name, delay) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=MILLISECONDS, got {:?}", value))?;
    let delay = delay
        .trim()
        .parse()
        .map_err(|e| format!("bad delay for timer {:?}: {}", name, e))?;
    Ok((name.trim().to_string(), delay))
}

/// Event loop data for the replay
struct Replay {
    clock: Clock<Replay>,
    fired: Vec<(String, Duration)>,
}

impl Replay {
    fn now(&self) -> Duration {
        self.clock
            .gettime(ClockId::Monotonic)
            .map(timespec_to_duration)
            .unwrap_or_default()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up log directory (~/.local/state/flick or /tmp/flick)
    let log_dir = std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("flick");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = rolling::daily(&log_dir, "clock.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if args.debug {
        "debug,flick_clock=trace"
    } else {
        "warn,flick_clock=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = match &args.config {
        Some(path) => ClockConfig::from_file(path)?,
        None => ClockConfig::load(),
    };
    let mode = args.mode.map(ClockMode::from).unwrap_or(config.mode);
    info!("flick-clock starting in {:?} mode", mode);
    info!("Logging to {:?}", log_dir);

    let mut event_loop: EventLoop<'static, Replay> =
        EventLoop::try_new().context("Failed to create event loop")?;
    let clock = Clock::new(mode, Some(event_loop.handle()));
    let mut replay = Replay {
        clock: clock.clone(),
        fired: Vec::new(),
    };

    let mut handles: Vec<TimerHandle> = Vec::new();
    for (name, delay_ms) in &args.timers {
        let label = name.clone();
        let handle = clock.add_timer(move |replay: &mut Replay| {
            let now = replay.now();
            info!("Timer {} fired at {:?}", label, now);
            replay.fired.push((label.clone(), now));
        })?;
        clock.timer_update(handle, *delay_ms)?;
        handles.push(handle);
    }

    match mode {
        ClockMode::Fake => run_fake(&mut event_loop, &mut replay, &args.advances)?,
        ClockMode::Real => {
            if !args.advances.is_empty() {
                warn!("--advance has no effect on a real clock");
            }
            run_real(&mut event_loop, &mut replay, &args.timers)?;
        }
    }

    for (name, at) in &replay.fired {
        println!("{:.3?}\t{}", at, name);
    }

    for handle in handles {
        clock.timer_remove(handle);
    }
    clock.destroy();
    Ok(())
}

fn run_fake(
    event_loop: &mut EventLoop<'static, Replay>,
    replay: &mut Replay,
    advances: &[u64],
) -> Result<()> {
    for step in advances {
        replay.clock.advance_time(Duration::from_millis(*step))?;
        settle(event_loop, replay)?;
        info!("Fake time step applied, now {:?}", replay.now());
    }
    Ok(())
}

fn settle(event_loop: &mut EventLoop<'static, Replay>, replay: &mut Replay) -> Result<()> {
    for _ in 0..MAX_SETTLE_DISPATCHES {
        if !replay.clock.has_pending_dispatch() {
            return Ok(());
        }
        event_loop
            .dispatch(Some(Duration::ZERO), replay)
            .context("Event loop dispatch error")?;
    }
    bail!("fake clock did not settle after {} dispatches", MAX_SETTLE_DISPATCHES)
}

/// Dispatch until every armed timer fired, or give up once the longest
/// delay has passed by a grace period.
fn run_real(
    event_loop: &mut EventLoop<'static, Replay>,
    replay: &mut Replay,
    timers: &[(String, i32)],
) -> Result<()> {
    let armed: Vec<u64> = timers
        .iter()
        .filter_map(|(_, delay)| u64::try_from(*delay).ok().filter(|d| *d > 0))
        .collect();
    let longest = armed.iter().copied().max().unwrap_or(0);
    let deadline = replay.now() + Duration::from_millis(longest) + REAL_GRACE;

    while replay.fired.len() < armed.len() {
        if replay.now() > deadline {
            warn!(
                "Giving up waiting for real timers ({} of {} fired)",
                replay.fired.len(),
                armed.len()
            );
            break;
        }
        event_loop
            .dispatch(Some(Duration::from_millis(50)), replay)
            .context("Event loop dispatch error")?;
    }
    Ok(())
}
