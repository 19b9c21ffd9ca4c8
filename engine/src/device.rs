//! Device capability descriptors, stream open parameters and probing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::format::SampleFormat;
use crate::hw::{DeviceOpener, Direction, Pcm};
use crate::stream::latency::buffered_latency;
use crate::stream::rate::{exact_rate, set_approximate_rate};

const PLUG_MAX_CHANNELS: u32 = 128;
const FALLBACK_RATE: u32 = 44100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionCaps {
    pub min_channels: u32,
    pub max_channels: u32,
    /// Seconds.
    pub default_low_latency: f64,
    pub default_high_latency: f64,
}

/// What one named PCM can do, per direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_plug: bool,
    pub capture: Option<DirectionCaps>,
    pub playback: Option<DirectionCaps>,
    pub default_sample_rate: f64,
}

impl DeviceInfo {
    pub fn caps(&self, direction: Direction) -> Option<&DirectionCaps> {
        match direction {
            Direction::Capture => self.capture.as_ref(),
            Direction::Playback => self.playback.as_ref(),
        }
    }

    pub fn max_channels(&self, direction: Direction) -> u32 {
        self.caps(direction).map_or(0, |c| c.max_channels)
    }

    pub fn min_channels(&self, direction: Direction) -> Option<u32> {
        self.caps(direction).map(|c| c.min_channels)
    }
}

/// Names a device directly instead of by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpecificStreamInfo {
    pub size: usize,
    pub version: u32,
    pub device_string: String,
}

impl HostSpecificStreamInfo {
    pub const VERSION: u32 = 1;

    pub fn new(device_string: impl Into<String>) -> Self {
        Self {
            size: std::mem::size_of::<Self>(),
            version: Self::VERSION,
            device_string: device_string.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size != std::mem::size_of::<Self>() || self.version != Self::VERSION {
            return Err(Error::BadIODeviceCombination(format!(
                "host-specific stream info has size {} version {}, expected {} version {}",
                self.size,
                self.version,
                std::mem::size_of::<Self>(),
                Self::VERSION
            )));
        }
        if self.device_string.trim().is_empty() {
            return Err(Error::InvalidDevice("empty device string".into()));
        }
        Ok(())
    }

    pub fn is_plug(&self) -> bool {
        !self.device_string.starts_with("hw:")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Index(usize),
    HostSpecific(HostSpecificStreamInfo),
}

/// One direction of a stream open request.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParameters {
    pub device: DeviceSpec,
    pub channel_count: u32,
    pub sample_format: SampleFormat,
    pub non_interleaved: bool,
    /// Seconds; `None` takes the device's default low latency.
    pub suggested_latency: Option<f64>,
}

impl StreamParameters {
    pub fn new(device: DeviceSpec, channel_count: u32, sample_format: SampleFormat) -> Self {
        Self {
            device,
            channel_count,
            sample_format,
            non_interleaved: false,
            suggested_latency: None,
        }
    }

    pub fn non_interleaved(mut self) -> Self {
        self.non_interleaved = true;
        self
    }

    pub fn with_latency(mut self, seconds: f64) -> Self {
        self.suggested_latency = Some(seconds);
        self
    }
}

/// The plug pass-through name for a `hw:` device; other names are returned
/// unchanged.
pub fn plug_name(name: &str) -> String {
    match name.strip_prefix("hw:") {
        Some(rest) => format!("plughw:{rest}"),
        None => name.to_string(),
    }
}

fn probe_direction(
    pcm: &mut dyn Pcm,
    config: &HostConfig,
    is_plug: bool,
    default_rate: Option<f64>,
) -> Result<(DirectionCaps, f64)> {
    let tolerance = config.rate_tolerance();
    pcm.hw_any().map_err(Error::host)?;
    let carried = default_rate.and_then(|rate| match set_approximate_rate(pcm, rate, tolerance) {
        Ok(achieved) => Some(achieved),
        Err(err) => {
            debug!("'{}' rejects {rate} Hz, probing again: {err}", pcm.name());
            None
        }
    });
    let rate = match carried {
        Some(rate) => rate,
        None => {
            pcm.hw_any().map_err(Error::host)?;
            if let Err(err) = pcm.hw_set_rate_resample(false) {
                debug!("'{}' keeps resampling on: {err}", pcm.name());
            }
            pcm.hw_set_rate_near(FALLBACK_RATE).map_err(Error::host)?;
            exact_rate(pcm)?
        }
    };

    let (min_channels, mut max_channels) = pcm.hw_channels_range().map_err(Error::host)?;
    if is_plug && max_channels > PLUG_MAX_CHANNELS {
        debug!("'{}': limiting plugin channels to {PLUG_MAX_CHANNELS}", pcm.name());
        max_channels = PLUG_MAX_CHANNELS;
    }

    let low = config.low_latency;
    let buffer = pcm
        .hw_set_buffer_size_near(i64::from(low.buffer_frames))
        .map_err(Error::host)?;
    let period = pcm
        .hw_set_period_size_near(i64::from(low.period_frames))
        .map_err(Error::host)?;
    let default_low_latency = buffered_latency(buffer, period, rate);

    let high = config.high_latency;
    pcm.hw_any().map_err(Error::host)?;
    set_approximate_rate(pcm, rate, tolerance)?;
    let buffer = pcm
        .hw_set_buffer_size_near(i64::from(high.buffer_frames))
        .map_err(Error::host)?;
    let period = pcm
        .hw_set_period_size_near(i64::from(high.period_frames))
        .map_err(Error::host)?;
    let default_high_latency = buffered_latency(buffer, period, rate);

    Ok((
        DirectionCaps {
            min_channels,
            max_channels,
            default_low_latency,
            default_high_latency,
        },
        rate,
    ))
}

/// Opens `name` in each direction it supports and records its
/// capabilities. Capture is probed first; its default rate is tried again
/// for playback.
pub fn probe(opener: &DeviceOpener<'_>, config: &HostConfig, name: &str, is_plug: bool) -> Result<DeviceInfo> {
    let nonblock = !config.blocking_probe;
    let mut default_rate = None;
    let mut caps = [None, None];
    for (slot, direction) in [Direction::Capture, Direction::Playback].into_iter().enumerate() {
        let mut pcm = match opener.open(name, direction, nonblock, false) {
            Ok(pcm) => pcm,
            Err(err) => {
                debug!("'{name}' has no usable {direction}: {err}");
                continue;
            }
        };
        match probe_direction(pcm.as_mut(), config, is_plug, default_rate) {
            Ok((found, rate)) => {
                caps[slot] = Some(found);
                default_rate = Some(rate);
            }
            Err(err) => debug!("probing {direction} of '{name}' failed: {err}"),
        }
    }
    let [capture, playback] = caps;
    let Some(default_sample_rate) = default_rate else {
        return Err(Error::InvalidDevice(format!(
            "'{name}' supports neither capture nor playback"
        )));
    };
    debug!("probed '{name}': capture {capture:?}, playback {playback:?}, {default_sample_rate} Hz");
    Ok(DeviceInfo {
        name: name.to_string(),
        is_plug,
        capture,
        playback,
        default_sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimDeviceConfig, SimProvider, SimRates};
    use crate::hw::RetryPolicy;
    use std::time::Duration;

    fn opener(provider: &SimProvider) -> DeviceOpener<'_> {
        DeviceOpener::new(provider, RetryPolicy::new(0, Duration::ZERO))
    }

    #[test]
    fn plug_name_rewrites_hw_only() {
        assert_eq!(plug_name("hw:1,0"), "plughw:1,0");
        assert_eq!(plug_name("default"), "default");
    }

    #[test]
    fn host_specific_info_is_validated() {
        assert!(HostSpecificStreamInfo::new("hw:0").validate().is_ok());
        assert!(!HostSpecificStreamInfo::new("hw:0").is_plug());
        let mut stale = HostSpecificStreamInfo::new("hw:0");
        stale.version = 0;
        assert!(matches!(stale.validate(), Err(Error::BadIODeviceCombination(_))));
        assert!(matches!(
            HostSpecificStreamInfo::new(" ").validate(),
            Err(Error::InvalidDevice(_))
        ));
    }

    #[test]
    fn probe_reports_both_directions_and_latencies() {
        let provider = SimProvider::new();
        provider.add_device(
            SimDeviceConfig::duplex("hw:0")
                .with_rates(SimRates::List(vec![44100, 48000]))
                .with_channels(Direction::Playback, 2, 8),
        );
        let info = probe(&opener(&provider), &HostConfig::default(), "hw:0", false).unwrap();
        assert_eq!(info.default_sample_rate, 44100.0);
        assert_eq!(info.max_channels(Direction::Playback), 8);
        assert_eq!(info.min_channels(Direction::Capture), Some(1));
        let playback = info.playback.unwrap();
        assert!((playback.default_low_latency - 384.0 / 44100.0).abs() < 1e-9);
        assert!((playback.default_high_latency - 1536.0 / 44100.0).abs() < 1e-9);
    }

    #[test]
    fn plugin_channel_maximum_is_capped() {
        let provider = SimProvider::new();
        provider.add_device(
            SimDeviceConfig::playback_only("default").with_channels(Direction::Playback, 1, 10000),
        );
        let info = probe(&opener(&provider), &HostConfig::default(), "default", true).unwrap();
        assert_eq!(info.max_channels(Direction::Playback), 128);
        assert!(info.capture.is_none());
    }

    #[test]
    fn missing_device_is_invalid() {
        let provider = SimProvider::new();
        let err = probe(&opener(&provider), &HostConfig::default(), "hw:9", false).unwrap_err();
        assert!(matches!(err, Error::InvalidDevice(_)));
    }
}
