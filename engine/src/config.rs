use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hw::RetryPolicy;

pub const NUM_PERIODS_ENV: &str = "MAOLAN_PCM_NUM_PERIODS";
pub const BUSY_RETRIES_ENV: &str = "MAOLAN_PCM_BUSY_RETRIES";
pub const LIBRARY_ENV: &str = "MAOLAN_PCM_LIBRARY";
pub const BLOCKING_PROBE_ENV: &str = "MAOLAN_PCM_BLOCKING_PROBE";
pub const FORCE_PLUG_ENV: &str = "MAOLAN_PCM_FORCE_PLUG";

fn parse_flag(value: &str) -> bool {
    let s = value.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}

/// Buffer and period sizes, in frames, used to derive a default latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHint {
    pub buffer_frames: u32,
    pub period_frames: u32,
}

impl LatencyHint {
    pub const fn new(buffer_frames: u32, period_frames: u32) -> Self {
        Self {
            buffer_frames,
            period_frames,
        }
    }

    pub fn seconds(&self, sample_rate: f64) -> f64 {
        crate::stream::latency::buffered_latency(
            i64::from(self.buffer_frames),
            i64::from(self.period_frames),
            sample_rate,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub num_periods: u32,
    pub busy_retries: u32,
    pub busy_retry_delay_ms: u64,
    pub library_path: Option<PathBuf>,
    pub blocking_probe: bool,
    pub force_plug: bool,
    pub rate_deviation_ratio: u32,
    pub max_xrun_recoveries: u32,
    pub realtime_priority: Option<i32>,
    pub join_timeout_ms: u64,
    pub low_latency: LatencyHint,
    pub high_latency: LatencyHint,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            num_periods: 4,
            busy_retries: 100,
            busy_retry_delay_ms: 10,
            library_path: None,
            blocking_probe: false,
            force_plug: false,
            rate_deviation_ratio: 100,
            max_xrun_recoveries: 3,
            realtime_priority: None,
            join_timeout_ms: 5000,
            low_latency: LatencyHint::new(512, 128),
            high_latency: LatencyHint::new(2048, 512),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read '{}': {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `MAOLAN_PCM_*` overrides using `lookup` to read variables.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(NUM_PERIODS_ENV) {
            self.num_periods = parse_number(NUM_PERIODS_ENV, &v)?;
        }
        if let Some(v) = lookup(BUSY_RETRIES_ENV) {
            self.busy_retries = parse_number(BUSY_RETRIES_ENV, &v)?;
        }
        if let Some(v) = lookup(LIBRARY_ENV).filter(|v| !v.trim().is_empty()) {
            self.library_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = lookup(BLOCKING_PROBE_ENV) {
            self.blocking_probe = parse_flag(&v);
        }
        if let Some(v) = lookup(FORCE_PLUG_ENV) {
            self.force_plug = parse_flag(&v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_periods < 2 {
            return Err(Error::Config(format!(
                "num_periods must be at least 2, got {}",
                self.num_periods
            )));
        }
        if self.rate_deviation_ratio == 0 {
            return Err(Error::Config("rate_deviation_ratio must be positive".into()));
        }
        for (label, hint) in [("low_latency", self.low_latency), ("high_latency", self.high_latency)] {
            let too_small = hint
                .period_frames
                .checked_mul(2)
                .is_none_or(|min| hint.buffer_frames < min);
            if hint.period_frames == 0 || too_small {
                return Err(Error::Config(format!(
                    "{label} needs a non-zero period and at least two periods per buffer"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.busy_retries,
            Duration::from_millis(self.busy_retry_delay_ms),
        )
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Maximum relative deviation between requested and achieved rate.
    pub fn rate_tolerance(&self) -> f64 {
        1.0 / f64::from(self.rate_deviation_ratio)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}='{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let config = HostConfig::default();
        assert_eq!(config.num_periods, 4);
        assert_eq!(config.busy_retries, 100);
        assert_eq!(config.retry_policy().retry_delay(), Duration::from_millis(10));
        assert!((config.rate_tolerance() - 0.01).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = HostConfig::from_toml_str(
            r#"
            num_periods = 3
            force_plug = true

            [low_latency]
            buffer_frames = 256
            period_frames = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.num_periods, 3);
        assert!(config.force_plug);
        assert_eq!(config.low_latency, LatencyHint::new(256, 64));
        assert_eq!(config.busy_retries, 100);
    }

    #[test]
    fn rejects_single_period() {
        let err = HostConfig::from_toml_str("num_periods = 1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn oversized_latency_hint_is_rejected() {
        let err = HostConfig::from_toml_str(
            r#"
            [low_latency]
            buffer_frames = 4000000000
            period_frames = 3000000000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_style_overrides() {
        let config = HostConfig::default()
            .with_overrides(|key| match key {
                NUM_PERIODS_ENV => Some("8".into()),
                LIBRARY_ENV => Some("/opt/alsa/libasound.so.2".into()),
                BLOCKING_PROBE_ENV => Some("yes".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.num_periods, 8);
        assert!(config.blocking_probe);
        assert_eq!(
            config.library_path.as_deref(),
            Some(Path::new("/opt/alsa/libasound.so.2"))
        );
    }

    #[test]
    fn bad_number_is_reported() {
        let err = HostConfig::default()
            .with_overrides(|key| (key == BUSY_RETRIES_ENV).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(BUSY_RETRIES_ENV));
    }

    #[test]
    fn latency_hint_seconds() {
        let hint = LatencyHint::new(2048, 512);
        assert!((hint.seconds(48000.0) - 1536.0 / 48000.0).abs() < 1e-12);
    }
}
