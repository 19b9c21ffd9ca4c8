//! Hardware and software parameter negotiation for one or two components.
//!
//! Each component is first narrowed on its own (access, format, rate,
//! channels). When both directions are present a single period size is
//! then chosen from the overlap of their period ranges, and finally each
//! component commits buffer size, hardware and software parameters.

use tracing::{debug, warn};

use super::component::StreamComponent;
use super::latency::{buffer_candidate, buffered_latency, clamp_period, desired_period, intersect_periods};
use super::rate::set_approximate_rate;
use crate::error::{Error, Result};
use crate::hw::error_fmt::config_error_message;
use crate::hw::{Access, Direction, Frames, NativeError, SwConfig, Threshold};

/// Stream-wide inputs to negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationRequest {
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
    pub primed: bool,
    pub num_periods: u32,
    pub rate_tolerance: f64,
    pub capture_latency: f64,
    pub playback_latency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiated {
    pub sample_rate: f64,
    pub period_frames: Frames,
    pub input_latency: Option<f64>,
    pub output_latency: Option<f64>,
    pub linked: bool,
}

pub(crate) fn commit_error(direction: Direction, err: NativeError) -> Error {
    let message = config_error_message(direction, "hardware parameter commit", &err);
    if err.is_busy() {
        Error::DeviceUnavailable(message)
    } else if err.is_invalid() {
        Error::BadIODeviceCombination(message)
    } else {
        Error::host(err)
    }
}

/// Phase A: narrows access, format, rate and channels. Returns the
/// achieved sample rate.
pub fn initial_configure(
    component: &mut StreamComponent,
    sample_rate: f64,
    rate_tolerance: f64,
) -> Result<f64> {
    let direction = component.direction();
    let user_interleaved = component.user_interleaved();
    let host_format = component.host_format();
    let host_channels = component.host_channels();
    let pcm = component.pcm.as_mut();

    pcm.hw_any().map_err(Error::host)?;
    pcm.hw_set_periods_integer().map_err(Error::host)?;
    pcm.hw_set_periods_min(2).map_err(Error::host)?;

    let mut preferred = Access::mmap(user_interleaved);
    let mut alternate = Access::mmap(!user_interleaved);
    let can_mmap = pcm.hw_test_access(preferred) || pcm.hw_test_access(alternate);
    if !can_mmap {
        preferred = Access::rw(user_interleaved);
        alternate = Access::rw(!user_interleaved);
    }
    debug!(
        "{direction} '{}': memory-mapped access {}",
        pcm.name(),
        if can_mmap { "available" } else { "unavailable" }
    );

    let access = match pcm.hw_set_access(preferred) {
        Ok(()) => preferred,
        Err(first) => {
            pcm.hw_set_access(alternate).map_err(|err| {
                warn!("{}", config_error_message(direction, "access", &first));
                Error::host(err)
            })?;
            debug!("{direction} '{}': falling back to {alternate:?}", pcm.name());
            alternate
        }
    };

    pcm.hw_set_format(host_format).map_err(Error::host)?;
    let achieved = set_approximate_rate(pcm, sample_rate, rate_tolerance)?;
    pcm.hw_set_channels(host_channels)
        .map_err(|err| Error::InvalidChannelCount {
            requested: host_channels,
            reason: err.to_string(),
        })?;

    component.can_mmap = can_mmap;
    component.access = Some(access);
    component.host_interleaved = access.is_interleaved();
    component.sample_rate = achieved;
    Ok(achieved)
}

/// Picks the period size shared by the present components and narrows both
/// to it.
pub fn reconcile_period(
    capture: Option<&mut StreamComponent>,
    playback: Option<&mut StreamComponent>,
    desired: Frames,
) -> Result<Frames> {
    match (capture, playback) {
        (Some(capture), Some(playback)) => {
            let capture_range = capture.pcm.hw_period_size_range().map_err(Error::host)?;
            let playback_range = playback.pcm.hw_period_size_range().map_err(Error::host)?;
            let Some(shared) = intersect_periods(capture_range, playback_range) else {
                return Err(Error::BadIODeviceCombination(format!(
                    "no common period size: capture accepts {}..={}, playback {}..={}",
                    capture_range.0, capture_range.1, playback_range.0, playback_range.1
                )));
            };
            let target = clamp_period(desired, shared);
            let period = capture
                .pcm
                .hw_set_period_size_near(target)
                .map_err(Error::host)?;
            if let Err(err) = playback.pcm.hw_set_period_size(period) {
                return Err(Error::BadIODeviceCombination(config_error_message(
                    Direction::Playback,
                    &format!("shared period of {period} frames"),
                    err,
                )));
            }
            capture.period_frames = period;
            playback.period_frames = period;
            debug!("shared period {period} frames (wanted {desired}, overlap {}..={})", shared.0, shared.1);
            Ok(period)
        }
        (Some(only), None) | (None, Some(only)) => {
            let range = only.pcm.hw_period_size_range().map_err(Error::host)?;
            let period = only
                .pcm
                .hw_set_period_size_near(clamp_period(desired, range))
                .map_err(Error::host)?;
            only.period_frames = period;
            Ok(period)
        }
        (None, None) => Err(Error::BadIODeviceCombination(
            "stream has neither capture nor playback".into(),
        )),
    }
}

/// Phase B: buffer size, hardware commit, software thresholds. Returns the
/// achieved latency in seconds.
pub fn finish_configure(
    component: &mut StreamComponent,
    suggested_latency: f64,
    primed: bool,
) -> Result<f64> {
    let direction = component.direction();
    let rate = component.sample_rate;
    let candidate = buffer_candidate(suggested_latency, rate, component.period_frames);
    let pcm = component.pcm.as_mut();

    let requested_buffer = pcm.hw_set_buffer_size_near(candidate).map_err(Error::host)?;
    pcm.hw_commit().map_err(|err| commit_error(direction, err))?;
    let (period, buffer) = pcm.hw_committed_sizes().map_err(Error::host)?;
    if buffer < 2 * period {
        return Err(Error::BadIODeviceCombination(format!(
            "{direction} buffer of {buffer} frames holds fewer than two {period}-frame periods"
        )));
    }
    if buffer != requested_buffer {
        debug!("{direction}: device settled on {buffer} frames instead of {requested_buffer}");
    }

    let start_threshold = if primed || direction == Direction::Capture {
        Threshold::Boundary
    } else {
        Threshold::Frames(period)
    };
    pcm.sw_commit(&SwConfig {
        start_threshold,
        stop_threshold: Threshold::Frames(buffer),
        silence_threshold: 0,
        silence_size: Threshold::Boundary,
        avail_min: period,
        timestamps: true,
    })
    .map_err(Error::host)?;
    let poll_fds = pcm.poll_descriptors().map_err(Error::host)?;

    let latency = buffered_latency(buffer, period, rate);
    component.period_frames = period;
    component.buffer_frames = buffer;
    component.latency = latency;
    component.poll_fds = poll_fds;
    component.prepare_transfer_buffers()?;
    debug!(
        "{direction} '{}': period {period}, buffer {buffer}, latency {:.2} ms",
        component.device_name(),
        latency * 1000.0
    );
    Ok(latency)
}

/// Runs both phases and links a duplex pair when the devices allow it.
///
/// On error the components are left to the caller, who drops them.
pub fn negotiate(
    mut capture: Option<&mut StreamComponent>,
    mut playback: Option<&mut StreamComponent>,
    request: &NegotiationRequest,
) -> Result<Negotiated> {
    let mut rates = Vec::with_capacity(2);
    if let Some(c) = capture.as_deref_mut() {
        rates.push(initial_configure(c, request.sample_rate, request.rate_tolerance)?);
    }
    if let Some(p) = playback.as_deref_mut() {
        rates.push(initial_configure(p, request.sample_rate, request.rate_tolerance)?);
    }
    if let [a, b] = rates[..]
        && a != b
    {
        return Err(Error::BadIODeviceCombination(format!(
            "capture runs at {a} Hz but playback at {b} Hz"
        )));
    }
    let sample_rate = rates.first().copied().unwrap_or(request.sample_rate);

    let latency = match (&capture, &playback) {
        (Some(_), Some(_)) => request.capture_latency.max(request.playback_latency),
        (Some(_), None) => request.capture_latency,
        _ => request.playback_latency,
    };
    let desired = desired_period(
        request.frames_per_buffer,
        latency,
        sample_rate,
        request.num_periods,
    );
    let period = reconcile_period(capture.as_deref_mut(), playback.as_deref_mut(), desired)?;

    let input_latency = match capture.as_deref_mut() {
        Some(c) => Some(finish_configure(c, request.capture_latency, request.primed)?),
        None => None,
    };
    let output_latency = match playback.as_deref_mut() {
        Some(p) => Some(finish_configure(p, request.playback_latency, request.primed)?),
        None => None,
    };

    let linked = match (capture, playback) {
        (Some(c), Some(p)) => c.pcm.link(p.pcm.as_mut()).unwrap_or_else(|err| {
            debug!("linking capture and playback failed: {err}");
            false
        }),
        _ => false,
    };
    debug!("negotiated {sample_rate} Hz, period {period}, linked: {linked}");
    Ok(Negotiated {
        sample_rate,
        period_frames: period,
        input_latency,
        output_latency,
        linked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::hw::sim::{SimDeviceConfig, SimProvider, SimRates};
    use crate::hw::{DeviceOpener, RetryPolicy};
    use crate::stream::component::ComponentRequest;
    use std::time::Duration;

    fn component(provider: &SimProvider, name: &str, direction: Direction, interleaved: bool) -> StreamComponent {
        let opener = DeviceOpener::new(provider, RetryPolicy::new(0, Duration::ZERO));
        StreamComponent::initialize(
            &opener,
            &ComponentRequest {
                device_name: name,
                is_plug: false,
                device_min_channels: Some(1),
                channels: 2,
                format: SampleFormat::Int16,
                non_interleaved: !interleaved,
                direction,
                callback_mode: true,
            },
            false,
        )
        .unwrap()
    }

    fn request(latency: f64) -> NegotiationRequest {
        NegotiationRequest {
            sample_rate: 48000.0,
            frames_per_buffer: 0,
            primed: false,
            num_periods: 4,
            rate_tolerance: 0.01,
            capture_latency: latency,
            playback_latency: latency,
        }
    }

    #[test]
    fn rejected_access_flips_interleaving() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0").with_access(&[Access::MmapNonInterleaved]));
        let mut c = component(&provider, "hw:0", Direction::Playback, true);
        initial_configure(&mut c, 48000.0, 0.01).unwrap();
        assert!(c.can_mmap());
        assert_eq!(c.access(), Some(Access::MmapNonInterleaved));
        assert_ne!(c.host_interleaved(), c.user_interleaved());
    }

    #[test]
    fn without_mmap_falls_back_to_read_write() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0").with_access(&[Access::RwInterleaved]));
        let mut c = component(&provider, "hw:0", Direction::Capture, true);
        negotiate(Some(&mut c), None, &request(0.01)).unwrap();
        assert!(!c.can_mmap());
        assert_eq!(c.access(), Some(Access::RwInterleaved));
    }

    #[test]
    fn duplex_shares_one_period() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::capture_only("hw:in").with_period_range(64, 1024));
        provider.add_device(SimDeviceConfig::playback_only("hw:out").with_period_range(300, 4096));
        let mut c = component(&provider, "hw:in", Direction::Capture, true);
        let mut p = component(&provider, "hw:out", Direction::Playback, true);
        let negotiated = negotiate(Some(&mut c), Some(&mut p), &request(0.005)).unwrap();
        assert_eq!(negotiated.period_frames, 300);
        assert_eq!(c.period_frames(), p.period_frames());
    }

    #[test]
    fn disjoint_period_ranges_fail() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::capture_only("hw:in").with_period_range(32, 128));
        provider.add_device(SimDeviceConfig::playback_only("hw:out").with_period_range(256, 4096));
        let mut c = component(&provider, "hw:in", Direction::Capture, true);
        let mut p = component(&provider, "hw:out", Direction::Playback, true);
        let err = negotiate(Some(&mut c), Some(&mut p), &request(0.01)).unwrap_err();
        assert!(matches!(err, Error::BadIODeviceCombination(_)));
    }

    #[test]
    fn busy_commit_is_device_unavailable() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let mut c = component(&provider, "hw:0", Direction::Playback, true);
        device.set_commit_busy(true);
        let err = negotiate(None, Some(&mut c), &request(0.01)).unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
    }

    #[test]
    fn buffer_follows_latency_and_minimum_period() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0").with_period_range(256, 4096));
        let mut c = component(&provider, "hw:0", Direction::Playback, true);
        let negotiated = negotiate(None, Some(&mut c), &request(0.01)).unwrap();
        assert_eq!(c.period_frames(), 256);
        assert_eq!(c.buffer_frames(), 768);
        let latency = negotiated.output_latency.unwrap();
        assert!((latency - 512.0 / 48000.0).abs() < 1e-9);
    }

    #[test]
    fn mismatched_rates_are_a_bad_combination() {
        let provider = SimProvider::new();
        provider.add_device(
            SimDeviceConfig::capture_only("hw:in").with_rates(SimRates::List(vec![48000])),
        );
        provider.add_device(
            SimDeviceConfig::playback_only("hw:out").with_rates(SimRates::List(vec![48200])),
        );
        let mut c = component(&provider, "hw:in", Direction::Capture, true);
        let mut p = component(&provider, "hw:out", Direction::Playback, true);
        let err = negotiate(Some(&mut c), Some(&mut p), &request(0.01)).unwrap_err();
        assert!(matches!(err, Error::BadIODeviceCombination(_)));
    }
}
