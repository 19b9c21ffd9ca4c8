//! Stream scenarios against the in-process simulated devices.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use maolan_pcm_engine::hw::Access;
use maolan_pcm_engine::hw::sim::{SimDevice, SimDeviceConfig, SimProvider, SimRates};
use maolan_pcm_engine::stream::LoopPhase;
use maolan_pcm_engine::{
    CallbackFlags, CallbackIo, CallbackResult, CallbackTimeInfo, DeviceSpec, Direction, Error,
    HostApi, HostConfig, SampleFormat, StreamParameters, StreamRequest, StreamState,
};

fn config() -> HostConfig {
    HostConfig {
        busy_retries: 5,
        busy_retry_delay_ms: 1,
        join_timeout_ms: 2000,
        ..HostConfig::default()
    }
}

fn host_with(devices: Vec<SimDeviceConfig>) -> (HostApi, Vec<Arc<SimDevice>>) {
    host_with_config(devices, config())
}

fn host_with_config(
    devices: Vec<SimDeviceConfig>,
    config: HostConfig,
) -> (HostApi, Vec<Arc<SimDevice>>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let provider = Arc::new(SimProvider::new());
    let handles = devices
        .into_iter()
        .map(|d| provider.add_device(d))
        .collect::<Vec<_>>();
    let mut host = HostApi::with_provider(provider, config);
    for device in &handles {
        let name = device.config().name.clone();
        host.probe_device(&name, false).unwrap();
    }
    (host, handles)
}

fn params(index: usize, channels: u32, format: SampleFormat) -> StreamParameters {
    StreamParameters::new(DeviceSpec::Index(index), channels, format)
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}

#[test]
fn capture_overrun_is_recovered_and_counted_once() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::capture_only("hw:0").with_channels(Direction::Capture, 1, 2),
    ]);
    let request = StreamRequest::new(44100.0)
        .input(params(0, 2, SampleFormat::Int16).with_latency(0.02));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = host
        .open_callback_stream(
            &request,
            move |io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
                assert!(io.input.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
                CallbackResult::Continue
            },
        )
        .unwrap();
    let rate = stream.info().sample_rate;
    assert!((43659.0..=44541.0).contains(&rate));

    stream.start().unwrap();
    let monitor = stream.monitor();
    assert!(wait_until(Duration::from_secs(2), || monitor.phase()
        == LoopPhase::Running));

    devices[0].inject_xrun(Direction::Capture);
    assert!(wait_until(Duration::from_secs(2), || monitor
        .xrun_stats()
        .overruns
        == 1));
    let after = calls.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst)
        > after + 2));
    assert_eq!(stream.xrun_stats().overruns, 1);
    assert_eq!(stream.xrun_stats().underruns, 0);

    stream.stop().unwrap();
    stream.close().unwrap();
    assert_eq!(devices[0].open_handles(), 0);
}

#[test]
fn suggested_latency_respects_minimum_period() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::playback_only("hw:0").with_period_range(256, 8192),
    ]);
    let request = StreamRequest::new(48000.0)
        .output(params(0, 2, SampleFormat::Int16).with_latency(0.01));
    let stream = host.open_stream(&request).unwrap();
    let setup = devices[0].setup(Direction::Playback).unwrap();
    assert!(setup.period >= 256);
    assert!(setup.buffer >= 2 * 256);
    let latency = stream.info().output_latency.unwrap();
    assert!(latency >= (setup.buffer - setup.period) as f64 / 48000.0 - 1e-12);
}

#[test]
fn duplex_streams_share_one_period() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::capture_only("hw:0").with_period_range(64, 1024),
        SimDeviceConfig::playback_only("hw:1").with_period_range(300, 4096),
    ]);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16).with_latency(0.005))
        .output(params(1, 1, SampleFormat::Int16).with_latency(0.005));
    let stream = host.open_stream(&request).unwrap();
    let capture = devices[0].setup(Direction::Capture).unwrap();
    let playback = devices[1].setup(Direction::Playback).unwrap();
    assert_eq!(capture.period, playback.period);
    assert_eq!(stream.info().frames_per_buffer, playback.period as usize);
}

#[test]
fn non_interleaved_only_device_flips_access() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::playback_only("hw:0").with_access(&[Access::MmapNonInterleaved]),
    ]);
    let request = StreamRequest::new(48000.0).output(params(0, 2, SampleFormat::Float32));
    let mut stream = host.open_stream(&request).unwrap();
    assert_eq!(
        devices[0].setup(Direction::Playback).unwrap().access,
        Access::MmapNonInterleaved
    );

    stream.start().unwrap();
    let frames = 256;
    let buf = vec![0u8; frames * 2 * 4];
    stream.write(&buf, frames).unwrap();
    stream.stop().unwrap();
}

#[test]
fn failed_negotiation_releases_every_handle() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::capture_only("hw:0").with_rates(SimRates::List(vec![48000])),
        SimDeviceConfig::playback_only("hw:1").with_rates(SimRates::List(vec![48200])),
    ]);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16))
        .output(params(1, 1, SampleFormat::Int16));
    let err = host.open_stream(&request).unwrap_err();
    assert!(matches!(err, Error::BadIODeviceCombination(_)));
    assert_eq!(devices[0].open_handles(), 0);
    assert_eq!(devices[1].open_handles(), 0);
}

#[test]
fn busy_device_is_retried_then_reported() {
    let (host, devices) = host_with(vec![SimDeviceConfig::playback_only("hw:0")]);
    let request = StreamRequest::new(48000.0).output(params(0, 2, SampleFormat::Int16));

    let before = devices[0].open_calls();
    devices[0].set_busy_opens(3);
    let stream = host.open_stream(&request).unwrap();
    assert_eq!(devices[0].open_calls(), before + 4);
    drop(stream);

    devices[0].set_always_busy(true);
    let err = host.open_stream(&request).unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable(_)));
    assert_eq!(devices[0].open_handles(), 0);
}

#[test]
fn blocking_read_reports_recovered_overflow() {
    let (host, devices) = host_with(vec![SimDeviceConfig::capture_only("hw:0")]);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16).with_latency(0.02))
        .frames_per_buffer(240);
    let mut stream = host.open_stream(&request).unwrap();
    stream.start().unwrap();

    let mut buf = vec![0u8; 240 * 2];
    stream.read(&mut buf, 240).unwrap();
    assert!(stream.read_available().is_ok());

    devices[0].inject_xrun(Direction::Capture);
    assert!(matches!(
        stream.read(&mut buf, 240),
        Err(Error::InputOverflowed)
    ));
    assert_eq!(stream.xrun_stats().overruns, 1);
    stream.read(&mut buf, 240).unwrap();

    assert!(matches!(
        stream.write(&buf, 240),
        Err(Error::CanNotWriteToAnInputOnlyStream)
    ));
    stream.abort().unwrap();
    assert!(matches!(stream.read(&mut buf, 240), Err(Error::StreamIsStopped)));
}

#[test]
fn callback_completion_ends_the_stream() {
    let (host, devices) = host_with(vec![SimDeviceConfig::playback_only("hw:0")]);
    let request = StreamRequest::new(48000.0)
        .output(params(0, 2, SampleFormat::Float32).with_latency(0.01))
        .frames_per_buffer(128);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = host
        .open_callback_stream(
            &request,
            move |io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
                assert_eq!(io.frames, 128);
                if let Some(out) = io.output.as_deref_mut() {
                    out.fill(0);
                }
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    CallbackResult::Complete
                } else {
                    CallbackResult::Continue
                }
            },
        )
        .unwrap();
    stream.start().unwrap();
    assert!(stream.monitor().wait_finished(Duration::from_secs(3)));
    assert!(!stream.is_active());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    stream.stop().unwrap();
    assert!(stream.is_stopped());
    stream.start().unwrap();
    stream.abort().unwrap();
    stream.close().unwrap();
    assert_eq!(devices[0].open_handles(), 0);
}

#[test]
fn stopped_and_closed_streams_tolerate_repeats() {
    let (host, devices) = host_with(vec![SimDeviceConfig::duplex("hw:0")]);
    let request = StreamRequest::new(44100.0)
        .input(params(0, 2, SampleFormat::Int32))
        .output(params(0, 2, SampleFormat::Int32));
    let mut stream = host.open_stream(&request).unwrap();
    stream.stop().unwrap();
    stream.stop().unwrap();
    stream.close().unwrap();
    stream.close().unwrap();
    assert_eq!(devices[0].open_handles(), 0);
}

fn counting_capture(
    host: &HostApi,
    request: &StreamRequest,
    calls: Arc<AtomicUsize>,
) -> maolan_pcm_engine::Stream {
    host.open_callback_stream(
        request,
        move |_io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
            calls.fetch_add(1, Ordering::SeqCst);
            CallbackResult::Continue
        },
    )
    .unwrap()
}

#[test]
fn exhausted_recovery_surfaces_on_the_next_call() {
    let config = HostConfig {
        max_xrun_recoveries: 0,
        ..config()
    };
    let (host, devices) = host_with_config(vec![SimDeviceConfig::capture_only("hw:0")], config);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16).with_latency(0.02));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut stream = counting_capture(&host, &request, calls.clone());
    stream.start().unwrap();
    let monitor = stream.monitor();
    assert!(wait_until(Duration::from_secs(2), || monitor.phase()
        == LoopPhase::Running));

    devices[0].inject_xrun(Direction::Capture);
    assert!(monitor.wait_finished(Duration::from_secs(2)));
    assert!(!stream.is_active());
    assert!(stream.is_stopped());

    let err = stream.start().unwrap_err();
    assert!(matches!(err, Error::UnanticipatedHostError(_)));
    assert_eq!(stream.state(), StreamState::Configured);
    assert_eq!(host.last_host_error().map(|e| e.code), err.host_info().map(|e| e.code));

    stream.start().unwrap();
    assert!(stream.is_active());
    stream.abort().unwrap();
    stream.close().unwrap();
    assert_eq!(devices[0].open_handles(), 0);
}

#[test]
fn close_reports_a_loop_failure_after_releasing_devices() {
    let config = HostConfig {
        max_xrun_recoveries: 0,
        ..config()
    };
    let (host, devices) = host_with_config(vec![SimDeviceConfig::capture_only("hw:0")], config);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16).with_latency(0.02));
    let mut stream = counting_capture(&host, &request, Arc::new(AtomicUsize::new(0)));
    stream.start().unwrap();
    let monitor = stream.monitor();
    assert!(wait_until(Duration::from_secs(2), || monitor.phase()
        == LoopPhase::Running));
    devices[0].inject_xrun(Direction::Capture);
    assert!(monitor.wait_finished(Duration::from_secs(2)));

    assert!(matches!(
        stream.close(),
        Err(Error::UnanticipatedHostError(_))
    ));
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(devices[0].open_handles(), 0);
    stream.close().unwrap();
}

#[test]
fn duplex_xrun_restarts_both_sides() {
    let (host, devices) = host_with(vec![SimDeviceConfig::duplex("hw:0")]);
    let request = StreamRequest::new(48000.0)
        .input(params(0, 1, SampleFormat::Int16).with_latency(0.02))
        .output(params(0, 1, SampleFormat::Int16).with_latency(0.02));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut stream = host
        .open_callback_stream(
            &request,
            move |io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
                if let (Some(input), Some(out)) = (io.input, io.output.as_deref_mut()) {
                    let n = input.len().min(out.len());
                    out[..n].copy_from_slice(&input[..n]);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                CallbackResult::Continue
            },
        )
        .unwrap();
    stream.start().unwrap();
    let monitor = stream.monitor();
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst)
        > 2));

    devices[0].inject_xrun(Direction::Capture);
    assert!(wait_until(Duration::from_secs(2), || monitor
        .xrun_stats()
        .overruns
        == 1));
    let after = calls.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst)
        > after + 2));
    assert!(stream.is_active());
    assert_eq!(stream.xrun_stats().overruns, 1);

    stream.stop().unwrap();
    stream.close().unwrap();
    assert_eq!(devices[0].open_handles(), 0);
}

#[test]
fn starved_playback_reports_recovered_underflow() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::playback_only("hw:0").with_strict_xruns(true),
    ]);
    let request = StreamRequest::new(48000.0)
        .output(params(0, 1, SampleFormat::Int16).with_latency(0.01));
    let mut stream = host.open_stream(&request).unwrap();
    stream.start().unwrap();
    let frames = devices[0].setup(Direction::Playback).unwrap().buffer as usize;
    let buf = vec![0u8; frames * 2];
    stream.write(&buf, frames).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        stream.write(&buf, frames),
        Err(Error::OutputUnderflowed)
    ));
    assert_eq!(stream.xrun_stats().underruns, 1);
    assert!(stream.xrun_stats().underrun_seconds > 0.0);
    stream.abort().unwrap();
}

#[test]
fn buffer_is_capped_by_the_device() {
    let (host, devices) = host_with(vec![
        SimDeviceConfig::playback_only("hw:0").with_max_buffer(1024),
    ]);
    let request = StreamRequest::new(48000.0)
        .output(params(0, 2, SampleFormat::Int16).with_latency(0.5));
    let stream = host.open_stream(&request).unwrap();
    let setup = devices[0].setup(Direction::Playback).unwrap();
    assert!(setup.buffer <= 1024);
    assert!(setup.buffer >= 2 * setup.period);
    assert!(stream.info().output_latency.unwrap() <= 1024.0 / 48000.0);
}

#[cfg(target_os = "linux")]
#[test]
#[ignore = "requires an ALSA device named default"]
fn default_alsa_device_plays_silence() {
    let mut host = HostApi::new(HostConfig::default()).unwrap();
    let index = host.probe_device("default", true).unwrap();
    let request = StreamRequest::new(48000.0).output(params(index, 2, SampleFormat::Int16));
    let mut stream = host.open_stream(&request).unwrap();
    stream.start().unwrap();
    let frames = stream.info().frames_per_buffer;
    let buf = vec![0u8; frames * 4];
    for _ in 0..20 {
        stream.write(&buf, frames).unwrap();
    }
    stream.stop().unwrap();
    assert_eq!(stream.xrun_stats().underruns, 0);
}
