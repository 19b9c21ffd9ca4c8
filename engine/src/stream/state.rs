//! Flags and counters shared between a stream's control thread and its
//! realtime loop.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;
use crate::hw::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopPhase {
    Stopped = 0,
    Priming = 1,
    Running = 2,
    Draining = 3,
    Aborting = 4,
}

impl LoopPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Priming,
            2 => Self::Running,
            3 => Self::Draining,
            4 => Self::Aborting,
            _ => Self::Stopped,
        }
    }
}

/// Cumulative xrun diagnostics. Counters only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct XrunStats {
    pub overruns: u64,
    pub underruns: u64,
    pub overrun_seconds: f64,
    pub underrun_seconds: f64,
}

#[derive(Debug, Default)]
struct Finish {
    finished: bool,
    terminal: Option<Error>,
}

#[derive(Debug)]
pub struct SharedState {
    active: AtomicBool,
    callback_finished: AtomicBool,
    abort_requested: AtomicBool,
    stop_requested: AtomicBool,
    phase: AtomicU8,
    overruns: AtomicU64,
    underruns: AtomicU64,
    overrun_nanos: AtomicU64,
    underrun_nanos: AtomicU64,
    cpu_load: AtomicU64,
    finish: Mutex<Finish>,
    finished: Condvar,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            callback_finished: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            phase: AtomicU8::new(LoopPhase::Stopped as u8),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overrun_nanos: AtomicU64::new(0),
            underrun_nanos: AtomicU64::new(0),
            cpu_load: AtomicU64::new(0f64.to_bits()),
            finish: Mutex::new(Finish::default()),
            finished: Condvar::new(),
        }
    }

    /// Clears the per-run flags before a new start. Counters are kept.
    pub fn arm(&self) {
        self.abort_requested.store(false, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        self.callback_finished.store(false, Ordering::Release);
        if let Ok(mut finish) = self.finish.lock() {
            finish.finished = false;
        }
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn callback_finished(&self) -> bool {
        self.callback_finished.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> LoopPhase {
        LoopPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: LoopPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Marks the loop as exited and wakes anyone in [`wait_finished`].
    ///
    /// [`wait_finished`]: SharedState::wait_finished
    pub fn finish(&self, terminal: Option<Error>) {
        let mut finish = match self.finish.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        finish.finished = true;
        if terminal.is_some() {
            finish.terminal = terminal;
        }
        self.set_phase(LoopPhase::Stopped);
        self.callback_finished.store(true, Ordering::Release);
        self.finished.notify_all();
    }

    /// Waits up to `timeout` for the loop to finish. Returns whether it did.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.finish.lock() else {
            return self.callback_finished();
        };
        match self
            .finished
            .wait_timeout_while(guard, timeout, |finish| !finish.finished)
        {
            Ok((finish, _)) => finish.finished,
            Err(_) => self.callback_finished(),
        }
    }

    pub fn take_terminal(&self) -> Option<Error> {
        self.finish.lock().ok().and_then(|mut finish| finish.terminal.take())
    }

    pub fn record_xrun(&self, direction: Direction, lost: Duration) {
        let nanos = u64::try_from(lost.as_nanos()).unwrap_or(u64::MAX);
        let (count, total) = match direction {
            Direction::Capture => (&self.overruns, &self.overrun_nanos),
            Direction::Playback => (&self.underruns, &self.underrun_nanos),
        };
        count.fetch_add(1, Ordering::AcqRel);
        total.fetch_add(nanos, Ordering::AcqRel);
    }

    pub fn xrun_stats(&self) -> XrunStats {
        let seconds = |nanos: &AtomicU64| nanos.load(Ordering::Acquire) as f64 / 1e9;
        XrunStats {
            overruns: self.overruns.load(Ordering::Acquire),
            underruns: self.underruns.load(Ordering::Acquire),
            overrun_seconds: seconds(&self.overrun_nanos),
            underrun_seconds: seconds(&self.underrun_nanos),
        }
    }

    pub fn cpu_load(&self) -> f64 {
        f64::from_bits(self.cpu_load.load(Ordering::Relaxed))
    }

    pub fn set_cpu_load(&self, load: f64) {
        self.cpu_load.store(load.to_bits(), Ordering::Relaxed);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn finish_wakes_waiter_and_keeps_terminal_error() {
        let state = Arc::new(SharedState::new());
        state.arm();
        let remote = state.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.finish(Some(Error::TimedOut("poll".into())));
        });
        assert!(state.wait_finished(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(state.callback_finished());
        assert_eq!(state.phase(), LoopPhase::Stopped);
        assert!(matches!(state.take_terminal(), Some(Error::TimedOut(_))));
        assert!(state.take_terminal().is_none());
    }

    #[test]
    fn wait_times_out_without_finish() {
        let state = SharedState::new();
        state.arm();
        assert!(!state.wait_finished(Duration::from_millis(10)));
    }

    #[test]
    fn xrun_counters_accumulate_per_direction() {
        let state = SharedState::new();
        state.record_xrun(Direction::Capture, Duration::from_millis(5));
        state.record_xrun(Direction::Capture, Duration::from_millis(5));
        state.record_xrun(Direction::Playback, Duration::from_millis(1));
        let stats = state.xrun_stats();
        assert_eq!(stats.overruns, 2);
        assert_eq!(stats.underruns, 1);
        assert!((stats.overrun_seconds - 0.01).abs() < 1e-9);
    }

    #[test]
    fn arm_resets_flags_but_not_counters() {
        let state = SharedState::new();
        state.record_xrun(Direction::Playback, Duration::ZERO);
        state.request_abort();
        state.finish(None);
        state.arm();
        assert!(!state.abort_requested());
        assert!(!state.callback_finished());
        assert!(state.is_active());
        assert_eq!(state.xrun_stats().underruns, 1);
    }
}
