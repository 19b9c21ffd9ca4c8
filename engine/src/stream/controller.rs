//! Host API object and stream lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use super::blocking;
use super::component::{ComponentRequest, StreamComponent};
use super::cpu_load::monotonic_seconds;
use super::negotiate::{NegotiationRequest, commit_error, initial_configure, negotiate};
use super::processor::{ProcessorFactory, adapting_processor};
use super::realtime::{
    CallbackFlags, CallbackIo, CallbackResult, CallbackTimeInfo, LoopHandle, RealtimeLoop,
    Servicer, StreamCallback,
};
use super::state::{LoopPhase, SharedState, XrunStats};
use crate::config::HostConfig;
use crate::device::{self, DeviceInfo, DeviceSpec, StreamParameters};
use crate::error::{Error, HostErrorInfo, HostErrorSlot, Result};
use crate::hw::{self, DeviceOpener, Direction, Provider};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Fill the playback buffer with silence before the first start.
    pub prime_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub input: Option<StreamParameters>,
    pub output: Option<StreamParameters>,
    pub sample_rate: f64,
    /// Zero lets the host pick, which resolves to the period size.
    pub frames_per_buffer: u32,
    pub flags: StreamFlags,
}

impl StreamRequest {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            input: None,
            output: None,
            sample_rate,
            frames_per_buffer: 0,
            flags: StreamFlags::default(),
        }
    }

    pub fn input(mut self, params: StreamParameters) -> Self {
        self.input = Some(params);
        self
    }

    pub fn output(mut self, params: StreamParameters) -> Self {
        self.output = Some(params);
        self
    }

    pub fn frames_per_buffer(mut self, frames: u32) -> Self {
        self.frames_per_buffer = frames;
        self
    }

    pub fn prime_output(mut self) -> Self {
        self.flags.prime_output = true;
        self
    }
}

/// Where a stream direction's parameters point once validated.
#[derive(Debug)]
struct Target {
    name: String,
    is_plug: bool,
    min_channels: Option<u32>,
    latency: f64,
}

/// Entry point: one sound subsystem binding, its configuration and the
/// devices probed so far.
#[derive(Debug)]
pub struct HostApi {
    provider: Arc<dyn Provider>,
    config: HostConfig,
    devices: Vec<DeviceInfo>,
    errors: Arc<HostErrorSlot>,
    processor_factory: ProcessorFactory,
}

impl HostApi {
    /// Binds the sound library selected by `config`.
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let provider = hw::select_provider(&config)?;
        Ok(Self::with_provider(provider, config))
    }

    pub fn with_provider(provider: Arc<dyn Provider>, config: HostConfig) -> Self {
        debug!(
            "host api on {} {}",
            provider.label(),
            provider.version().unwrap_or_default()
        );
        Self {
            provider,
            config,
            devices: Vec::new(),
            errors: Arc::new(HostErrorSlot::new()),
            processor_factory: adapting_processor,
        }
    }

    pub fn with_processor_factory(mut self, factory: ProcessorFactory) -> Self {
        self.processor_factory = factory;
        self
    }

    pub fn provider_label(&self) -> &'static str {
        self.provider.label()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&DeviceInfo> {
        self.devices.get(index)
    }

    /// The device named `default` when it serves `direction`, otherwise the
    /// first one that does.
    pub fn default_device(&self, direction: Direction) -> Option<usize> {
        let serves = |d: &DeviceInfo| d.caps(direction).is_some();
        self.devices
            .iter()
            .position(|d| d.name == "default" && serves(d))
            .or_else(|| self.devices.iter().position(serves))
    }

    pub fn last_host_error(&self) -> Option<HostErrorInfo> {
        self.errors.last()
    }

    fn opener(&self) -> DeviceOpener<'_> {
        DeviceOpener::new(self.provider.as_ref(), self.config.retry_policy())
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.errors.record(err);
        }
        result
    }

    /// Probes `name` and adds it to the device list, replacing an earlier
    /// entry of the same name. Returns its index.
    pub fn probe_device(&mut self, name: &str, is_plug: bool) -> Result<usize> {
        let info = self.track(device::probe(&self.opener(), &self.config, name, is_plug))?;
        match self.devices.iter().position(|d| d.name == info.name) {
            Some(index) => {
                self.devices[index] = info;
                Ok(index)
            }
            None => {
                self.devices.push(info);
                Ok(self.devices.len() - 1)
            }
        }
    }

    fn target(
        &self,
        params: &StreamParameters,
        direction: Direction,
        sample_rate: f64,
    ) -> Result<Target> {
        if params.channel_count == 0 {
            return Err(Error::InvalidChannelCount {
                requested: 0,
                reason: "at least one channel is required".into(),
            });
        }
        let (name, is_plug, min_channels, default_latency) = match &params.device {
            DeviceSpec::Index(index) => {
                let info = self
                    .devices
                    .get(*index)
                    .ok_or_else(|| Error::InvalidDevice(format!("no device at index {index}")))?;
                let Some(caps) = info.caps(direction) else {
                    return Err(Error::InvalidChannelCount {
                        requested: params.channel_count,
                        reason: format!("'{}' has no {direction}", info.name),
                    });
                };
                if params.channel_count > caps.max_channels {
                    return Err(Error::InvalidChannelCount {
                        requested: params.channel_count,
                        reason: format!(
                            "'{}' offers at most {} {direction} channels",
                            info.name, caps.max_channels
                        ),
                    });
                }
                (
                    info.name.clone(),
                    info.is_plug,
                    Some(caps.min_channels),
                    caps.default_low_latency,
                )
            }
            DeviceSpec::HostSpecific(host) => {
                host.validate()?;
                (
                    host.device_string.clone(),
                    host.is_plug(),
                    None,
                    self.config.low_latency.seconds(sample_rate),
                )
            }
        };
        Ok(Target {
            name,
            is_plug,
            min_channels,
            latency: params.suggested_latency.unwrap_or(default_latency),
        })
    }

    fn component(
        &self,
        opener: &DeviceOpener<'_>,
        params: &StreamParameters,
        target: &Target,
        direction: Direction,
        callback_mode: bool,
    ) -> Result<StreamComponent> {
        StreamComponent::initialize(
            opener,
            &ComponentRequest {
                device_name: &target.name,
                is_plug: target.is_plug,
                device_min_channels: target.min_channels,
                channels: params.channel_count,
                format: params.sample_format,
                non_interleaved: params.non_interleaved,
                direction,
                callback_mode,
            },
            self.config.force_plug,
        )
    }

    /// Checks that the devices accept the parameters at `sample_rate`
    /// without keeping anything open.
    pub fn is_format_supported(
        &self,
        input: Option<&StreamParameters>,
        output: Option<&StreamParameters>,
        sample_rate: f64,
    ) -> Result<()> {
        self.track(self.check_format(input, output, sample_rate))
    }

    fn check_format(
        &self,
        input: Option<&StreamParameters>,
        output: Option<&StreamParameters>,
        sample_rate: f64,
    ) -> Result<()> {
        if input.is_none() && output.is_none() {
            return Err(Error::InvalidDevice("no input or output parameters".into()));
        }
        let opener = self.opener();
        for (params, direction) in [(input, Direction::Capture), (output, Direction::Playback)] {
            let Some(params) = params else {
                continue;
            };
            let target = self.target(params, direction, sample_rate)?;
            let mut component = self.component(&opener, params, &target, direction, true)?;
            initial_configure(&mut component, sample_rate, self.config.rate_tolerance())?;
            component
                .pcm_mut()
                .hw_commit()
                .map_err(|err| commit_error(direction, err))?;
        }
        Ok(())
    }

    /// Opens a stream serviced by blocking [`Stream::read`] and
    /// [`Stream::write`] calls.
    pub fn open_stream(&self, request: &StreamRequest) -> Result<Stream> {
        self.track(self.open(request, None))
    }

    /// Opens a stream whose `callback` is invoked once per user buffer on a
    /// dedicated thread.
    pub fn open_callback_stream<F>(&self, request: &StreamRequest, callback: F) -> Result<Stream>
    where
        F: FnMut(&mut CallbackIo<'_>, &CallbackTimeInfo, CallbackFlags) -> CallbackResult
            + Send
            + 'static,
    {
        self.track(self.open(request, Some(Box::new(callback))))
    }

    fn open(&self, request: &StreamRequest, callback: Option<StreamCallback>) -> Result<Stream> {
        if request.input.is_none() && request.output.is_none() {
            return Err(Error::InvalidDevice(
                "a stream needs an input, an output or both".into(),
            ));
        }
        let rate = request.sample_rate;
        let capture_target = request
            .input
            .as_ref()
            .map(|p| self.target(p, Direction::Capture, rate))
            .transpose()?;
        let playback_target = request
            .output
            .as_ref()
            .map(|p| self.target(p, Direction::Playback, rate))
            .transpose()?;

        let callback_mode = callback.is_some();
        let opener = self.opener();
        let mut capture = match (&request.input, &capture_target) {
            (Some(params), Some(target)) => Some(self.component(
                &opener,
                params,
                target,
                Direction::Capture,
                callback_mode,
            )?),
            _ => None,
        };
        let mut playback = match (&request.output, &playback_target) {
            (Some(params), Some(target)) => Some(self.component(
                &opener,
                params,
                target,
                Direction::Playback,
                callback_mode,
            )?),
            _ => None,
        };

        let primed = request.flags.prime_output || (capture.is_some() && playback.is_some());
        let negotiated = negotiate(
            capture.as_mut(),
            playback.as_mut(),
            &NegotiationRequest {
                sample_rate: rate,
                frames_per_buffer: request.frames_per_buffer,
                primed,
                num_periods: self.config.num_periods,
                rate_tolerance: self.config.rate_tolerance(),
                capture_latency: capture_target.as_ref().map_or(0.0, |t| t.latency),
                playback_latency: playback_target.as_ref().map_or(0.0, |t| t.latency),
            },
        )?;
        for component in capture.iter_mut().chain(playback.iter_mut()) {
            component.attach_processor((self.processor_factory)())?;
        }

        let frames_per_buffer = match request.frames_per_buffer {
            0 => negotiated.period_frames.max(1) as usize,
            fpb => fpb as usize,
        };
        let info = StreamInfo {
            sample_rate: negotiated.sample_rate,
            input_latency: negotiated.input_latency,
            output_latency: negotiated.output_latency,
            frames_per_buffer,
            linked: negotiated.linked,
        };
        let shared = Arc::new(SharedState::new());
        let servicer = Servicer::new(
            capture,
            playback,
            negotiated.linked,
            primed,
            self.config.max_xrun_recoveries,
            shared.clone(),
        );
        let driver = match callback {
            Some(callback) => Driver::Callback(RealtimeLoop::new(
                servicer,
                callback,
                frames_per_buffer,
                negotiated.sample_rate,
                self.config.realtime_priority,
                self.config.join_timeout(),
            )?),
            None => Driver::Blocking(servicer),
        };
        debug!("stream opened: {info:?}");
        Ok(Stream {
            driver,
            shared,
            state: StreamState::Configured,
            info,
            join_timeout: self.config.join_timeout(),
            errors: self.errors.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Configured,
    Active,
    Stopping,
    Aborting,
}

/// Parameters the devices actually settled on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamInfo {
    pub sample_rate: f64,
    /// Seconds.
    pub input_latency: Option<f64>,
    pub output_latency: Option<f64>,
    pub frames_per_buffer: usize,
    /// Capture and playback start and stop together in hardware.
    pub linked: bool,
}

#[derive(Debug)]
enum Driver {
    Blocking(Servicer),
    Callback(RealtimeLoop),
    Running(LoopHandle),
    Released,
}

/// Read-only view of a stream for other threads.
#[derive(Debug, Clone)]
pub struct StreamMonitor {
    shared: Arc<SharedState>,
}

impl StreamMonitor {
    pub fn is_active(&self) -> bool {
        self.shared.is_active() && !self.shared.callback_finished()
    }

    pub fn callback_finished(&self) -> bool {
        self.shared.callback_finished()
    }

    pub fn phase(&self) -> LoopPhase {
        self.shared.phase()
    }

    pub fn cpu_load(&self) -> f64 {
        self.shared.cpu_load()
    }

    pub fn xrun_stats(&self) -> XrunStats {
        self.shared.xrun_stats()
    }

    /// Blocks until the stream's loop exits or `timeout` passes.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.shared.wait_finished(timeout)
    }
}

/// An open stream. Dropping it aborts and closes.
#[derive(Debug)]
pub struct Stream {
    driver: Driver,
    shared: Arc<SharedState>,
    state: StreamState,
    info: StreamInfo,
    join_timeout: Duration,
    errors: Arc<HostErrorSlot>,
}

impl Stream {
    pub fn state(&self) -> StreamState {
        self.state
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.errors.record(err);
        }
        result
    }

    fn servicer(&self) -> Option<&Servicer> {
        match &self.driver {
            Driver::Blocking(servicer) => Some(servicer),
            Driver::Callback(rt) => Some(rt.servicer()),
            Driver::Running(_) | Driver::Released => None,
        }
    }

    /// Collects a callback loop that exited on its own, after completing
    /// or after an unrecoverable device error. The error is returned once
    /// and the stream is left Configured.
    fn reap(&mut self) -> Result<()> {
        if self.state != StreamState::Active
            || !self.shared.callback_finished()
            || !matches!(self.driver, Driver::Running(_))
        {
            return Ok(());
        }
        let joined = match std::mem::replace(&mut self.driver, Driver::Released) {
            Driver::Running(handle) => self.join(handle),
            other => {
                self.driver = other;
                Ok(())
            }
        };
        self.shared.set_inactive();
        self.state = StreamState::Configured;
        debug!("stream loop exited on its own");
        joined?;
        match self.shared.take_terminal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reaped(&mut self) -> Result<()> {
        let result = self.reap();
        self.track(result)
    }

    pub fn start(&mut self) -> Result<()> {
        let result = self.start_inner();
        self.track(result)
    }

    fn start_inner(&mut self) -> Result<()> {
        self.reap()?;
        match self.state {
            StreamState::Closed => return Err(Error::StreamIsClosed),
            StreamState::Active | StreamState::Stopping | StreamState::Aborting => {
                return Err(Error::StreamIsNotStopped);
            }
            StreamState::Configured => {}
        }
        if let Some(err) = self.shared.take_terminal() {
            debug!("discarding error of the previous run: {err}");
        }
        self.shared.arm();
        match std::mem::replace(&mut self.driver, Driver::Released) {
            Driver::Blocking(mut servicer) => {
                let started = servicer.start().map_err(Error::host);
                if started.is_err() {
                    servicer.drop_all();
                    self.shared.set_inactive();
                }
                self.driver = Driver::Blocking(servicer);
                started?;
            }
            Driver::Callback(rt) => match rt.spawn() {
                Ok(handle) => self.driver = Driver::Running(handle),
                Err(failure) => {
                    if let Some(rt) = failure.returned {
                        self.driver = Driver::Callback(rt);
                    }
                    self.shared.set_inactive();
                    return Err(failure.error);
                }
            },
            other => {
                self.driver = other;
                self.shared.set_inactive();
                return Err(Error::StreamIsClosed);
            }
        }
        self.state = StreamState::Active;
        debug!("stream started");
        Ok(())
    }

    /// Graceful stop: queued playback is played out first.
    pub fn stop(&mut self) -> Result<()> {
        let result = self.halt(false);
        self.track(result)
    }

    /// Immediate stop: queued frames are discarded.
    pub fn abort(&mut self) -> Result<()> {
        let result = self.halt(true);
        self.track(result)
    }

    fn halt(&mut self, abort: bool) -> Result<()> {
        self.reap()?;
        if self.state != StreamState::Active {
            return match self.shared.take_terminal() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        self.state = if abort {
            StreamState::Aborting
        } else {
            StreamState::Stopping
        };
        if abort {
            self.shared.request_abort();
        } else {
            self.shared.request_stop();
        }
        let joined = match std::mem::replace(&mut self.driver, Driver::Released) {
            Driver::Blocking(mut servicer) => {
                if abort {
                    servicer.drop_all();
                } else {
                    servicer.drain_all(self.join_timeout);
                }
                self.driver = Driver::Blocking(servicer);
                self.shared.finish(None);
                Ok(())
            }
            Driver::Running(handle) => self.join(handle),
            other => {
                self.driver = other;
                Ok(())
            }
        };
        self.shared.set_inactive();
        self.state = StreamState::Configured;
        debug!("stream {}", if abort { "aborted" } else { "stopped" });
        joined?;
        match self.shared.take_terminal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn join(&mut self, handle: LoopHandle) -> Result<()> {
        if !self.shared.wait_finished(self.join_timeout) {
            warn!("stream loop ignored the stop request, aborting");
            self.shared.request_abort();
            if !self.shared.wait_finished(self.join_timeout) {
                error!("stream loop did not exit, detaching it");
                return Err(Error::TimedOut("stream loop did not exit".into()));
            }
        }
        match handle.join() {
            Ok(Some(rt)) => {
                self.driver = Driver::Callback(rt);
                Ok(())
            }
            Ok(None) => Err(Error::StreamIsClosed),
            Err(_) => {
                error!("stream loop panicked");
                Err(Error::StreamIsClosed)
            }
        }
    }

    /// Releases the devices. Closing a closed stream is a no-op. An error
    /// left behind by a loop that exited on its own is returned after the
    /// devices are released.
    pub fn close(&mut self) -> Result<()> {
        let reaped = self.reaped();
        match self.state {
            StreamState::Closed => return Ok(()),
            StreamState::Active | StreamState::Stopping | StreamState::Aborting => {
                return self.track(Err(Error::StreamIsNotStopped));
            }
            StreamState::Configured => {}
        }
        let servicer = match std::mem::replace(&mut self.driver, Driver::Released) {
            Driver::Blocking(servicer) => Some(servicer),
            Driver::Callback(rt) => Some(rt.into_servicer()),
            Driver::Running(_) | Driver::Released => None,
        };
        if let Some(servicer) = servicer {
            drop(servicer.into_components());
        }
        self.state = StreamState::Closed;
        debug!("stream closed");
        reaped
    }

    /// Active and the callback has not finished.
    pub fn is_active(&self) -> bool {
        self.state == StreamState::Active && !self.shared.callback_finished()
    }

    /// Not started, stopped, or the loop has exited on its own.
    pub fn is_stopped(&self) -> bool {
        self.state != StreamState::Active || self.shared.callback_finished()
    }

    /// Stream clock in seconds.
    pub fn time(&self) -> f64 {
        monotonic_seconds()
    }

    pub fn cpu_load(&self) -> f64 {
        self.shared.cpu_load()
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    pub fn xrun_stats(&self) -> XrunStats {
        self.shared.xrun_stats()
    }

    pub fn monitor(&self) -> StreamMonitor {
        StreamMonitor {
            shared: self.shared.clone(),
        }
    }

    /// Device names serving capture and playback, when present.
    pub fn devices(&self) -> (Option<String>, Option<String>) {
        let Some(servicer) = self.servicer() else {
            return (None, None);
        };
        (
            servicer.capture.as_ref().map(|c| c.device_name().to_string()),
            servicer.playback.as_ref().map(|p| p.device_name().to_string()),
        )
    }

    fn blocking(&mut self, direction: Direction) -> Result<&mut Servicer> {
        let state = self.state;
        let servicer = match &mut self.driver {
            Driver::Blocking(servicer) => servicer,
            Driver::Callback(_) | Driver::Running(_) => {
                return Err(match direction {
                    Direction::Capture => Error::CanNotReadFromACallbackStream,
                    Direction::Playback => Error::CanNotWriteToACallbackStream,
                });
            }
            Driver::Released => return Err(Error::StreamIsClosed),
        };
        match (direction, servicer.capture.is_some(), servicer.playback.is_some()) {
            (Direction::Capture, false, _) => return Err(Error::CanNotReadFromAnOutputOnlyStream),
            (Direction::Playback, _, false) => return Err(Error::CanNotWriteToAnInputOnlyStream),
            _ => {}
        }
        if state != StreamState::Active {
            return Err(Error::StreamIsStopped);
        }
        Ok(servicer)
    }

    /// Drops back to Configured when blocking I/O hit an unrecoverable
    /// device error.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::UnanticipatedHostError(_) | Error::TimedOut(_)) = &result {
            if let Driver::Blocking(servicer) = &mut self.driver {
                servicer.drop_all();
            }
            self.shared.finish(None);
            self.shared.set_inactive();
            self.state = StreamState::Configured;
        }
        self.track(result)
    }

    /// Reads `frames` frames into `buf` (user layout). Blocks until done.
    pub fn read(&mut self, buf: &mut [u8], frames: usize) -> Result<()> {
        self.reaped()?;
        let stall = self.join_timeout;
        let result = self
            .blocking(Direction::Capture)
            .and_then(|servicer| blocking::read(servicer, buf, frames, stall));
        self.settle(result)
    }

    /// Writes `frames` frames from `buf` (user layout). Blocks until queued.
    pub fn write(&mut self, buf: &[u8], frames: usize) -> Result<()> {
        self.reaped()?;
        let stall = self.join_timeout;
        let result = self
            .blocking(Direction::Playback)
            .and_then(|servicer| blocking::write(servicer, buf, frames, stall));
        self.settle(result)
    }

    pub fn read_available(&mut self) -> Result<usize> {
        self.reaped()?;
        let result = self
            .blocking(Direction::Capture)
            .and_then(|servicer| blocking::available(servicer, Direction::Capture));
        self.settle(result)
    }

    pub fn write_available(&mut self) -> Result<usize> {
        self.reaped()?;
        let result = self
            .blocking(Direction::Playback)
            .and_then(|servicer| blocking::available(servicer, Direction::Playback));
        self.settle(result)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state == StreamState::Active
            && let Err(err) = self.abort()
        {
            debug!("abort on drop: {err}");
        }
        if let Err(err) = self.close() {
            debug!("close on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::hw::sim::{SimDeviceConfig, SimProvider};

    fn host(provider: Arc<SimProvider>) -> HostApi {
        let config = HostConfig {
            busy_retries: 2,
            busy_retry_delay_ms: 1,
            join_timeout_ms: 2000,
            ..HostConfig::default()
        };
        HostApi::with_provider(provider, config)
    }

    fn output(index: usize) -> StreamParameters {
        StreamParameters::new(DeviceSpec::Index(index), 2, SampleFormat::Int16).with_latency(0.02)
    }

    #[test]
    fn open_requires_a_direction() {
        let host = host(Arc::new(SimProvider::new()));
        let err = host.open_stream(&StreamRequest::new(48000.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidDevice(_)));
    }

    #[test]
    fn device_index_and_channel_count_are_validated() {
        let provider = Arc::new(SimProvider::new());
        provider.add_device(SimDeviceConfig::playback_only("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();

        let err = host
            .open_stream(&StreamRequest::new(48000.0).output(output(index + 1)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDevice(_)));

        let mut wide = output(index);
        wide.channel_count = 3;
        let err = host
            .open_stream(&StreamRequest::new(48000.0).output(wide))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelCount { requested: 3, .. }));

        let err = host
            .open_stream(&StreamRequest::new(48000.0).input(output(index)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelCount { .. }));
    }

    #[test]
    fn lifecycle_transitions_are_idempotent_where_allowed() {
        let provider = Arc::new(SimProvider::new());
        let device = provider.add_device(SimDeviceConfig::playback_only("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();
        let mut stream = host
            .open_stream(&StreamRequest::new(48000.0).output(output(index)))
            .unwrap();
        assert!(stream.is_stopped());
        stream.stop().unwrap();
        stream.abort().unwrap();

        stream.start().unwrap();
        assert!(stream.is_active());
        assert!(matches!(stream.start(), Err(Error::StreamIsNotStopped)));
        assert!(matches!(stream.close(), Err(Error::StreamIsNotStopped)));
        stream.abort().unwrap();
        assert!(stream.is_stopped());
        stream.stop().unwrap();

        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(stream.start(), Err(Error::StreamIsClosed)));
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn dropping_an_active_stream_releases_devices() {
        let provider = Arc::new(SimProvider::new());
        let device = provider.add_device(SimDeviceConfig::playback_only("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();
        let mut stream = host
            .open_callback_stream(
                &StreamRequest::new(48000.0).output(output(index)),
                |_io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
                    CallbackResult::Continue
                },
            )
            .unwrap();
        stream.start().unwrap();
        assert_eq!(device.open_handles(), 1);
        drop(stream);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn loop_that_gives_up_leaves_the_stream_stopped() {
        let provider = Arc::new(SimProvider::new());
        let device = provider.add_device(SimDeviceConfig::playback_only("hw:0"));
        let mut host = HostApi::with_provider(
            provider,
            HostConfig {
                max_xrun_recoveries: 0,
                join_timeout_ms: 2000,
                ..HostConfig::default()
            },
        );
        let index = host.probe_device("hw:0", false).unwrap();
        let mut stream = host
            .open_callback_stream(
                &StreamRequest::new(48000.0).output(output(index)),
                |_io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, _flags: CallbackFlags| {
                    CallbackResult::Continue
                },
            )
            .unwrap();
        stream.start().unwrap();
        let monitor = stream.monitor();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while monitor.phase() != LoopPhase::Running && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        device.inject_xrun(Direction::Playback);
        assert!(monitor.wait_finished(Duration::from_secs(2)));

        assert!(stream.is_stopped());
        assert!(!stream.is_active());
        assert_eq!(device.open_handles(), 1);
        assert!(matches!(stream.stop(), Err(Error::UnanticipatedHostError(_))));
        assert_eq!(stream.state(), StreamState::Configured);
        assert!(host.last_host_error().is_some());
        stream.stop().unwrap();
        stream.close().unwrap();
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn blocking_calls_check_mode_and_direction() {
        let provider = Arc::new(SimProvider::new());
        provider.add_device(SimDeviceConfig::playback_only("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();
        let mut stream = host
            .open_stream(&StreamRequest::new(48000.0).output(output(index)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            stream.read(&mut buf, 16),
            Err(Error::CanNotReadFromAnOutputOnlyStream)
        ));
        assert!(matches!(stream.write(&buf, 16), Err(Error::StreamIsStopped)));
        stream.start().unwrap();
        assert!(matches!(
            stream.write(&buf, 17),
            Err(Error::InvalidBuffer { needed: 68, got: 64 })
        ));
        stream.write(&buf, 16).unwrap();
        stream.abort().unwrap();
    }

    #[test]
    fn format_support_check_leaves_nothing_open() {
        let provider = Arc::new(SimProvider::new());
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();
        host.is_format_supported(None, Some(&output(index)), 48000.0)
            .unwrap();
        let err = host
            .is_format_supported(Some(&output(index)), None, 1.0e6)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSampleRate { .. }));
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn only_native_failures_are_remembered() {
        let provider = Arc::new(SimProvider::new());
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let mut host = host(provider);
        let index = host.probe_device("hw:0", false).unwrap();
        assert!(host.last_host_error().is_none());
        device.set_commit_busy(true);
        let err = host
            .open_stream(&StreamRequest::new(48000.0).output(output(index)))
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        let err = host
            .open_stream(
                &StreamRequest::new(48000.0).output(StreamParameters::new(
                    DeviceSpec::HostSpecific(crate::device::HostSpecificStreamInfo::new("hw:7")),
                    2,
                    SampleFormat::Int16,
                )),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadIODeviceCombination(_)));
        assert!(host.last_host_error().is_none());
    }
}
