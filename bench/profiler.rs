//! One-timer-at-a-time benchmark profiler.
//!
//! The profiler brackets a named operation with [`BenchmarkProfiler::start_benchmark`]
//! and [`BenchmarkProfiler::end_benchmark`]. Only one timer is ever open: a second
//! start while running is ignored, so nested or duplicated starts can never corrupt
//! the measurement in flight. Each completed pair becomes a [`ResultEntry`] that is
//! offered to every configured [`ResultSink`] before `end_benchmark` returns.

use crate::genotype::Realize;
use crate::sinks::ResultSink;
use chrono::{DateTime, TimeDelta, Utc};
use log::{error, info};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A single timed measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultEntry {
    pub run_number: u32,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub exec_time: Duration,
}

/// Time source for the profiler: a wall-clock timestamp for the record and a
/// monotonic reading for the elapsed time.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Clones share the same reading.
#[derive(Clone, Default)]
pub struct ManualClock {
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }

    fn offset(&self) -> Duration {
        self.offset.lock().map(|o| *o).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = TimeDelta::from_std(self.offset()).unwrap_or(TimeDelta::MAX);
        DateTime::<Utc>::UNIX_EPOCH + offset
    }

    fn monotonic(&self) -> Duration {
        self.offset()
    }
}

struct OpenTimer {
    operation_name: String,
    start_time: DateTime<Utc>,
    started_at: Duration,
}

pub struct BenchmarkProfiler {
    clock: Box<dyn Clock>,
    sinks: Vec<Box<dyn ResultSink>>,
    run_number: u32,
    current: Option<OpenTimer>,
    last_entry: Option<ResultEntry>,
    recorded: usize,
}

impl BenchmarkProfiler {
    pub fn new(sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self::with_clock(Box::new(SystemClock::default()), sinks)
    }

    pub fn with_clock(clock: Box<dyn Clock>, sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self {
            clock,
            sinks,
            run_number: 0,
            current: None,
            last_entry: None,
            recorded: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn last_entry(&self) -> Option<&ResultEntry> {
        self.last_entry.as_ref()
    }

    /// Number of entries completed since construction.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Ignored while a timer is open so the tag never changes mid-measurement.
    pub fn set_run_number(&mut self, run_number: u32) {
        if !self.is_running() {
            self.run_number = run_number;
        }
    }

    pub fn start_benchmark(&mut self, operation_name: &str) {
        if self.is_running() {
            return;
        }
        info!("Running benchmark: {operation_name}");
        self.current = Some(OpenTimer {
            operation_name: operation_name.to_string(),
            start_time: self.clock.now(),
            started_at: self.clock.monotonic(),
        });
    }

    pub fn end_benchmark(&mut self) {
        let Some(timer) = self.current.take() else {
            return;
        };
        let exec_time = self.clock.monotonic().saturating_sub(timer.started_at);
        info!("  - Done in {:.6}s", exec_time.as_secs_f64());

        let entry = ResultEntry {
            run_number: self.run_number,
            operation_name: timer.operation_name,
            start_time: timer.start_time,
            exec_time,
        };
        self.record(&entry);
        self.recorded += 1;
        self.last_entry = Some(entry);
    }

    /// Drops the open timer, if any, without producing an entry.
    pub fn cancel_benchmark(&mut self) {
        if let Some(timer) = self.current.take() {
            info!("  - Abandoned {}", timer.operation_name);
        }
    }

    /// Offers `entry` to every sink. A failing sink is reported and skipped.
    pub fn record(&mut self, entry: &ResultEntry) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.write(entry) {
                error!(
                    "Failed to record '{}' to the {} sink: {e}",
                    entry.operation_name,
                    sink.name()
                );
            }
        }
    }

    /// Times `op` as `operation_name`. An error cancels the timer so the
    /// incomplete measurement is never written.
    pub fn time<T, E>(
        &mut self,
        operation_name: &str,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        self.start_benchmark(operation_name);
        match op() {
            Ok(value) => {
                self.end_benchmark();
                Ok(value)
            }
            Err(e) => {
                self.cancel_benchmark();
                Err(e)
            }
        }
    }

    /// Times a backend operation, realizing its result inside the timed region.
    pub fn measure<A, T, E>(
        &mut self,
        operation_name: &str,
        target: &A,
        op: impl FnOnce(&A) -> A::Pending<Result<T, E>>,
    ) -> Result<T, E>
    where
        A: Realize,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.time(operation_name, || target.realize::<Result<T, E>>(op(target)))
    }
}
