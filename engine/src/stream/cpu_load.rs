use std::time::{Duration, Instant};

use nix::libc;

/// Smoothed fraction of the buffer duration spent inside the callback.
#[derive(Debug)]
pub struct CpuLoadMeter {
    started: Option<Instant>,
    load: f64,
}

impl CpuLoadMeter {
    const HISTORY: f64 = 0.9;

    pub fn new() -> Self {
        Self {
            started: None,
            load: 0.0,
        }
    }

    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Closes a measurement of `frames` frames at `sample_rate` and returns
    /// the updated load.
    pub fn end(&mut self, frames: usize, sample_rate: f64) -> f64 {
        let Some(started) = self.started.take() else {
            return self.load;
        };
        self.update(started.elapsed(), frames, sample_rate)
    }

    fn update(&mut self, spent: Duration, frames: usize, sample_rate: f64) -> f64 {
        if frames == 0 || sample_rate <= 0.0 {
            return self.load;
        }
        let budget = frames as f64 / sample_rate;
        let sample = spent.as_secs_f64() / budget;
        self.load = Self::HISTORY * self.load + (1.0 - Self::HISTORY) * sample;
        self.load
    }

    pub fn load(&self) -> f64 {
        self.load
    }
}

impl Default for CpuLoadMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic stream clock in seconds.
pub fn monotonic_seconds() -> f64 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ok = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) == 0 };
    if !ok {
        return 0.0;
    }
    now.tv_sec as f64 + now.tv_nsec as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_converges_towards_ratio() {
        let mut meter = CpuLoadMeter::new();
        for _ in 0..200 {
            meter.update(Duration::from_micros(2500), 480, 48000.0);
        }
        assert!((meter.load() - 0.25).abs() < 1e-3);
    }

    #[test]
    fn first_sample_is_damped() {
        let mut meter = CpuLoadMeter::new();
        let load = meter.update(Duration::from_millis(10), 480, 48000.0);
        assert!((load - 0.1).abs() < 1e-9);
    }

    #[test]
    fn end_without_begin_keeps_value() {
        let mut meter = CpuLoadMeter::new();
        assert_eq!(meter.end(256, 48000.0), 0.0);
    }

    #[test]
    fn clock_moves_forward() {
        let a = monotonic_seconds();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_seconds() > a);
    }
}
