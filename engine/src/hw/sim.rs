//! In-process PCM devices driven by the wall clock.
//!
//! Used by the test suite and by `--sim` dry runs of the CLI. The model
//! keeps hardware and application ring pointers like a real driver, wakes
//! its poll descriptor once per period while running, and lets callers
//! inject busy opens, failed commits and xruns.

use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::libc;

use super::area::{ChannelPlane, HostArea, fill_interleaved_planes, fill_planar_planes};
use super::{
    Access, Direction, Frames, NativeError, NativeResult, Pcm, PcmState, PollFd, Provider,
    RateFraction, Readiness, SwConfig, Threshold,
};
use crate::format::{SampleFormat, SampleFormatSet};

const BOUNDARY: Frames = 1 << 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimChannels {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimRates {
    Range { min: u32, max: u32 },
    List(Vec<u32>),
}

impl SimRates {
    fn nearest(&self, rate: u32) -> u32 {
        match self {
            Self::Range { min, max } => rate.clamp(*min, *max),
            Self::List(rates) => rates
                .iter()
                .copied()
                .min_by_key(|r| r.abs_diff(rate))
                .unwrap_or(rate),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    pub name: String,
    pub capture: Option<SimChannels>,
    pub playback: Option<SimChannels>,
    pub formats: SampleFormatSet,
    pub access: Vec<Access>,
    pub rates: SimRates,
    pub period_range: (Frames, Frames),
    pub max_buffer: Frames,
    /// When false, a starved playback pauses and a full capture drops its
    /// oldest frames instead of entering the XRUN state.
    pub strict_xruns: bool,
}

impl SimDeviceConfig {
    pub fn duplex(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capture: Some(SimChannels { min: 1, max: 2 }),
            playback: Some(SimChannels { min: 1, max: 2 }),
            formats: [SampleFormat::Int16, SampleFormat::Int32, SampleFormat::Float32]
                .into_iter()
                .collect(),
            access: vec![
                Access::MmapInterleaved,
                Access::MmapNonInterleaved,
                Access::RwInterleaved,
                Access::RwNonInterleaved,
            ],
            rates: SimRates::Range {
                min: 8000,
                max: 192_000,
            },
            period_range: (32, 8192),
            max_buffer: 65536,
            strict_xruns: false,
        }
    }

    pub fn capture_only(name: &str) -> Self {
        Self {
            playback: None,
            ..Self::duplex(name)
        }
    }

    pub fn playback_only(name: &str) -> Self {
        Self {
            capture: None,
            ..Self::duplex(name)
        }
    }

    pub fn with_channels(mut self, direction: Direction, min: u32, max: u32) -> Self {
        let caps = Some(SimChannels { min, max });
        match direction {
            Direction::Capture => self.capture = caps,
            Direction::Playback => self.playback = caps,
        }
        self
    }

    pub fn with_formats(mut self, formats: &[SampleFormat]) -> Self {
        self.formats = formats.iter().copied().collect();
        self
    }

    pub fn with_access(mut self, access: &[Access]) -> Self {
        self.access = access.to_vec();
        self
    }

    pub fn with_rates(mut self, rates: SimRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_period_range(mut self, min: Frames, max: Frames) -> Self {
        self.period_range = (min, max);
        self
    }

    pub fn with_max_buffer(mut self, frames: Frames) -> Self {
        self.max_buffer = frames;
        self
    }

    pub fn with_strict_xruns(mut self, strict: bool) -> Self {
        self.strict_xruns = strict;
        self
    }

    fn channels(&self, direction: Direction) -> Option<SimChannels> {
        match direction {
            Direction::Capture => self.capture,
            Direction::Playback => self.playback,
        }
    }
}

/// Committed hardware setup of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSetup {
    pub access: Access,
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub period: Frames,
    pub buffer: Frames,
}

#[derive(Debug)]
pub struct SimDevice {
    config: SimDeviceConfig,
    busy_opens: AtomicU32,
    always_busy: AtomicBool,
    commit_busy: AtomicBool,
    open_calls: AtomicU32,
    open_handles: AtomicU32,
    xrun_requests: [AtomicBool; 2],
    setups: Mutex<[Option<SimSetup>; 2]>,
}

fn slot(direction: Direction) -> usize {
    match direction {
        Direction::Capture => 0,
        Direction::Playback => 1,
    }
}

impl SimDevice {
    fn new(config: SimDeviceConfig) -> Self {
        Self {
            config,
            busy_opens: AtomicU32::new(0),
            always_busy: AtomicBool::new(false),
            commit_busy: AtomicBool::new(false),
            open_calls: AtomicU32::new(0),
            open_handles: AtomicU32::new(0),
            xrun_requests: [AtomicBool::new(false), AtomicBool::new(false)],
            setups: Mutex::new([None, None]),
        }
    }

    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    /// The next `count` opens report the device as busy.
    pub fn set_busy_opens(&self, count: u32) {
        self.busy_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_always_busy(&self, busy: bool) {
        self.always_busy.store(busy, Ordering::SeqCst);
    }

    /// Hardware parameter commits report the device as busy.
    pub fn set_commit_busy(&self, busy: bool) {
        self.commit_busy.store(busy, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> u32 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Forces the running endpoint into the XRUN state at its next update.
    pub fn inject_xrun(&self, direction: Direction) {
        self.xrun_requests[slot(direction)].store(true, Ordering::SeqCst);
    }

    pub fn setup(&self, direction: Direction) -> Option<SimSetup> {
        self.setups.lock().ok().and_then(|s| s[slot(direction)])
    }

    fn record_setup(&self, direction: Direction, setup: SimSetup) {
        if let Ok(mut setups) = self.setups.lock() {
            setups[slot(direction)] = Some(setup);
        }
    }

    fn take_xrun_request(&self, direction: Direction) -> bool {
        self.xrun_requests[slot(direction)].swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct SimProvider {
    devices: Mutex<HashMap<String, Arc<SimDevice>>>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, config: SimDeviceConfig) -> Arc<SimDevice> {
        let device = Arc::new(SimDevice::new(config));
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device.config.name.clone(), device.clone());
        }
        device
    }

    pub fn device(&self, name: &str) -> Option<Arc<SimDevice>> {
        let devices = self.devices.lock().ok()?;
        devices
            .get(name)
            .or_else(|| name.strip_prefix("plug").and_then(|n| devices.get(n)))
            .cloned()
    }
}

impl Provider for SimProvider {
    fn label(&self) -> &'static str {
        "sim"
    }

    fn version(&self) -> Option<String> {
        Some(env!("CARGO_PKG_VERSION").to_string())
    }

    fn open(&self, name: &str, direction: Direction, _nonblock: bool) -> NativeResult<Box<dyn Pcm>> {
        let device = self.device(name).ok_or_else(|| NativeError::errno(libc::ENOENT))?;
        device.open_calls.fetch_add(1, Ordering::SeqCst);
        if device.config.channels(direction).is_none() {
            return Err(NativeError::errno(libc::ENOENT));
        }
        if device.always_busy.load(Ordering::SeqCst) {
            return Err(NativeError::errno(libc::EBUSY));
        }
        let pending = device.busy_opens.load(Ordering::SeqCst);
        if pending > 0 {
            device.busy_opens.store(pending - 1, Ordering::SeqCst);
            return Err(NativeError::errno(libc::EBUSY));
        }
        let pcm = SimPcm::new(device.clone(), name, direction)?;
        device.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(pcm))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HwSpace {
    access: Option<Access>,
    format: Option<SampleFormat>,
    rate: Option<u32>,
    channels: Option<u32>,
    period: Option<Frames>,
    buffer: Option<Frames>,
    periods_min: u32,
    periods_integer: bool,
    resample: bool,
}

#[derive(Debug, Clone, Copy)]
struct SwState {
    start_threshold: Frames,
    avail_min: Frames,
}

#[derive(Debug)]
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SimPcm {
    device: Arc<SimDevice>,
    name: String,
    direction: Direction,
    space: HwSpace,
    setup: Option<SimSetup>,
    sw: SwState,
    state: PcmState,
    hw_ptr: Frames,
    appl_ptr: Frames,
    anchor: Option<(Instant, Frames)>,
    ring: Vec<u8>,
    planes: Vec<ChannelPlane>,
    wake_rx: UnixStream,
    wake_tx: Arc<UnixStream>,
    ticker: Option<Ticker>,
}

impl SimPcm {
    fn new(device: Arc<SimDevice>, name: &str, direction: Direction) -> NativeResult<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair().map_err(io_error)?;
        wake_rx.set_nonblocking(true).map_err(io_error)?;
        wake_tx.set_nonblocking(true).map_err(io_error)?;
        Ok(Self {
            device,
            name: name.to_string(),
            direction,
            space: HwSpace {
                periods_min: 1,
                ..HwSpace::default()
            },
            setup: None,
            sw: SwState {
                start_threshold: 1,
                avail_min: 1,
            },
            state: PcmState::Open,
            hw_ptr: 0,
            appl_ptr: 0,
            anchor: None,
            ring: Vec::new(),
            planes: Vec::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            ticker: None,
        })
    }

    fn caps(&self) -> SimChannels {
        self.device
            .config
            .channels(self.direction)
            .unwrap_or(SimChannels { min: 1, max: 1 })
    }

    fn period_range(&self) -> (Frames, Frames) {
        if let Some(period) = self.space.period {
            return (period, period);
        }
        let (min, max) = self.device.config.period_range;
        let by_buffer = self.device.config.max_buffer / Frames::from(self.space.periods_min.max(1));
        (min, max.min(by_buffer))
    }

    fn committed(&self) -> NativeResult<SimSetup> {
        self.setup.ok_or_else(|| NativeError::errno(libc::EBADFD))
    }

    fn frame_bytes(setup: &SimSetup) -> usize {
        setup.channels as usize * setup.format.bytes()
    }

    fn avail(&self, setup: &SimSetup) -> Frames {
        match self.direction {
            Direction::Playback => setup.buffer - (self.appl_ptr - self.hw_ptr),
            Direction::Capture => self.hw_ptr - self.appl_ptr,
        }
    }

    fn advance(&mut self) {
        let Some(setup) = self.setup else {
            return;
        };
        if self.state == PcmState::Running && self.device.take_xrun_request(self.direction) {
            self.enter_xrun();
            return;
        }
        if !matches!(self.state, PcmState::Running | PcmState::Draining) {
            return;
        }
        let Some((t0, h0)) = self.anchor else {
            return;
        };
        let mut hw = h0 + (t0.elapsed().as_secs_f64() * f64::from(setup.rate)) as Frames;
        match self.direction {
            Direction::Playback if hw > self.appl_ptr => {
                hw = self.appl_ptr;
                if self.state == PcmState::Draining {
                    self.state = PcmState::Setup;
                    self.stop_ticker();
                } else if self.device.config.strict_xruns {
                    self.hw_ptr = hw;
                    self.enter_xrun();
                    return;
                } else {
                    self.anchor = Some((Instant::now(), hw));
                }
            }
            Direction::Capture if hw - self.appl_ptr > setup.buffer => {
                if self.device.config.strict_xruns {
                    self.hw_ptr = self.appl_ptr + setup.buffer;
                    self.enter_xrun();
                    return;
                }
                self.appl_ptr = hw - setup.buffer;
            }
            _ => {}
        }
        self.hw_ptr = hw;
    }

    fn enter_xrun(&mut self) {
        self.state = PcmState::XRun;
        self.anchor = None;
        self.stop_ticker();
        self.refresh_wake();
    }

    fn readiness(&self) -> Readiness {
        let Some(setup) = self.setup else {
            return Readiness::default();
        };
        if self.state == PcmState::XRun {
            return Readiness {
                ready: true,
                error: true,
            };
        }
        let live = matches!(
            self.state,
            PcmState::Prepared | PcmState::Running | PcmState::Draining
        );
        Readiness {
            ready: live && self.avail(&setup) >= self.sw.avail_min,
            error: false,
        }
    }

    fn refresh_wake(&mut self) {
        self.drain_wake();
        if self.readiness().ready {
            let _ = (&*self.wake_tx).write(&[1]);
        }
    }

    fn drain_wake(&mut self) {
        let mut scratch = [0u8; 64];
        while matches!(self.wake_rx.read(&mut scratch), Ok(n) if n > 0) {}
    }

    fn start_ticker(&mut self, setup: &SimSetup) {
        if self.ticker.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(setup.period as f64 / f64::from(setup.rate));
        let tx = self.wake_tx.clone();
        let thread_stop = stop.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("sim-{}", self.direction.label()))
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    let _ = (&*tx).write(&[1]);
                }
            });
        if let Ok(handle) = spawned {
            self.ticker = Some(Ticker { stop, handle });
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop.store(true, Ordering::Release);
            let _ = ticker.handle.join();
        }
    }

    fn run(&mut self, setup: &SimSetup) {
        self.state = PcmState::Running;
        self.anchor = Some((Instant::now(), self.hw_ptr));
        self.start_ticker(setup);
    }

    fn commit_frames(&mut self, setup: &SimSetup, frames: Frames) {
        self.appl_ptr += frames;
        if self.direction == Direction::Playback
            && self.state == PcmState::Prepared
            && self.appl_ptr - self.hw_ptr >= self.sw.start_threshold
        {
            self.run(setup);
        }
        self.refresh_wake();
    }

    /// Hands out the next contiguous ring window and commits what `f` used.
    fn window(
        &mut self,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>) -> usize,
    ) -> NativeResult<Frames> {
        let setup = self.committed()?;
        self.advance();
        match self.state {
            PcmState::XRun => return Err(NativeError::errno(libc::EPIPE)),
            PcmState::Prepared | PcmState::Running | PcmState::Draining => {}
            _ => return Err(NativeError::errno(libc::EBADFD)),
        }
        let offset = self.appl_ptr.rem_euclid(setup.buffer);
        let count = frames.min(self.avail(&setup)).min(setup.buffer - offset);
        if count <= 0 {
            return Ok(0);
        }
        let sample_bytes = setup.format.bytes();
        let start = if setup.access.is_interleaved() {
            offset as usize * Self::frame_bytes(&setup)
        } else {
            offset as usize * sample_bytes
        };
        let used = {
            let Some(mut area) =
                HostArea::new(&mut self.ring[start..], &self.planes, sample_bytes, count as usize)
            else {
                return Err(NativeError::errno(libc::EFAULT));
            };
            f(&mut area).min(count as usize)
        };
        self.commit_frames(&setup, used as Frames);
        Ok(used as Frames)
    }

    fn rw_transfer(
        &mut self,
        access: Access,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>, usize),
    ) -> NativeResult<Frames> {
        let setup = self.committed()?;
        if setup.access != access {
            return Err(NativeError::errno(libc::EINVAL));
        }
        let mut done: Frames = 0;
        while done < frames {
            let moved = self.window(frames - done, &mut |area| {
                f(area, done as usize);
                area.frames()
            })?;
            if moved == 0 {
                break;
            }
            done += moved;
        }
        if done == 0 && frames > 0 {
            return Err(NativeError::errno(libc::EAGAIN));
        }
        Ok(done)
    }
}

impl Drop for SimPcm {
    fn drop(&mut self) {
        self.stop_ticker();
        self.device.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

fn io_error(err: std::io::Error) -> NativeError {
    NativeError::new(err.raw_os_error().unwrap_or(libc::EIO), err.to_string())
}

fn einval() -> NativeError {
    NativeError::errno(libc::EINVAL)
}

impl Pcm for SimPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_any(&mut self) -> NativeResult<()> {
        self.space = HwSpace {
            periods_min: 1,
            ..HwSpace::default()
        };
        Ok(())
    }

    fn hw_set_periods_integer(&mut self) -> NativeResult<()> {
        self.space.periods_integer = true;
        Ok(())
    }

    fn hw_set_periods_min(&mut self, periods: u32) -> NativeResult<()> {
        self.space.periods_min = periods.max(1);
        Ok(())
    }

    fn hw_test_access(&mut self, access: Access) -> bool {
        self.device.config.access.contains(&access) && self.space.access.is_none_or(|a| a == access)
    }

    fn hw_set_access(&mut self, access: Access) -> NativeResult<()> {
        if !self.hw_test_access(access) {
            return Err(einval());
        }
        self.space.access = Some(access);
        Ok(())
    }

    fn hw_test_format(&mut self, format: SampleFormat) -> bool {
        self.device.config.formats.contains(format) && self.space.format.is_none_or(|f| f == format)
    }

    fn hw_set_format(&mut self, format: SampleFormat) -> NativeResult<()> {
        if !self.hw_test_format(format) {
            return Err(einval());
        }
        self.space.format = Some(format);
        Ok(())
    }

    fn hw_set_rate_resample(&mut self, resample: bool) -> NativeResult<()> {
        self.space.resample = resample;
        Ok(())
    }

    fn hw_set_rate_near(&mut self, rate: u32) -> NativeResult<u32> {
        let achieved = self.device.config.rates.nearest(rate);
        self.space.rate = Some(achieved);
        Ok(achieved)
    }

    fn hw_rate_fraction(&mut self) -> NativeResult<RateFraction> {
        let rate = self.space.rate.ok_or_else(einval)?;
        Ok(RateFraction { num: rate, den: 1 })
    }

    fn hw_channels_range(&mut self) -> NativeResult<(u32, u32)> {
        if let Some(channels) = self.space.channels {
            return Ok((channels, channels));
        }
        let caps = self.caps();
        Ok((caps.min, caps.max))
    }

    fn hw_set_channels(&mut self, channels: u32) -> NativeResult<()> {
        let caps = self.caps();
        if channels < caps.min || channels > caps.max {
            return Err(einval());
        }
        self.space.channels = Some(channels);
        Ok(())
    }

    fn hw_period_size_range(&mut self) -> NativeResult<(Frames, Frames)> {
        let (min, max) = self.period_range();
        if min > max {
            return Err(einval());
        }
        Ok((min, max))
    }

    fn hw_set_period_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        let (min, max) = self.hw_period_size_range()?;
        let period = frames.clamp(min, max);
        self.space.period = Some(period);
        Ok(period)
    }

    fn hw_set_period_size(&mut self, frames: Frames) -> NativeResult<()> {
        let (min, max) = self.hw_period_size_range()?;
        if frames < min || frames > max {
            return Err(einval());
        }
        self.space.period = Some(frames);
        Ok(())
    }

    fn hw_set_buffer_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        let period = match self.space.period {
            Some(period) => period,
            None => self.hw_period_size_range()?.0,
        };
        let periods_min = Frames::from(self.space.periods_min.max(1));
        let max_buffer = self.device.config.max_buffer;
        let min_buffer = period * periods_min;
        if min_buffer > max_buffer {
            return Err(einval());
        }
        let mut buffer = frames.clamp(min_buffer, max_buffer);
        if self.space.periods_integer {
            buffer = ((buffer + period / 2) / period * period).clamp(min_buffer, max_buffer / period * period);
        }
        self.space.buffer = Some(buffer);
        Ok(buffer)
    }

    fn hw_commit(&mut self) -> NativeResult<()> {
        if self.device.commit_busy.load(Ordering::SeqCst) {
            return Err(NativeError::errno(libc::EBUSY));
        }
        let space = self.space;
        let (Some(access), Some(format), Some(rate), Some(channels)) =
            (space.access, space.format, space.rate, space.channels)
        else {
            return Err(einval());
        };
        let period = match space.period {
            Some(period) => period,
            None => self.hw_set_period_size_near(1024)?,
        };
        let buffer = match space.buffer {
            Some(buffer) => buffer,
            None => self.hw_set_buffer_size_near(period * 4)?,
        };
        let setup = SimSetup {
            access,
            format,
            channels,
            rate,
            period,
            buffer,
        };
        let sample_bytes = format.bytes();
        self.ring = vec![format.silence_byte(); buffer as usize * Self::frame_bytes(&setup)];
        if access.is_interleaved() {
            fill_interleaved_planes(&mut self.planes, channels as usize, sample_bytes);
        } else {
            fill_planar_planes(
                &mut self.planes,
                channels as usize,
                buffer as usize * sample_bytes,
                sample_bytes,
            );
        }
        self.stop_ticker();
        self.setup = Some(setup);
        self.sw = SwState {
            start_threshold: 1,
            avail_min: period,
        };
        self.state = PcmState::Prepared;
        self.hw_ptr = 0;
        self.appl_ptr = 0;
        self.anchor = None;
        self.device.record_setup(self.direction, setup);
        self.refresh_wake();
        Ok(())
    }

    fn hw_committed_sizes(&mut self) -> NativeResult<(Frames, Frames)> {
        let setup = self.committed()?;
        Ok((setup.period, setup.buffer))
    }

    fn sw_commit(&mut self, sw: &SwConfig) -> NativeResult<()> {
        self.committed()?;
        let resolve = |t: Threshold| match t {
            Threshold::Frames(frames) => frames,
            Threshold::Boundary => BOUNDARY,
        };
        self.sw = SwState {
            start_threshold: resolve(sw.start_threshold),
            avail_min: sw.avail_min.max(1),
        };
        self.refresh_wake();
        Ok(())
    }

    fn poll_descriptors(&mut self) -> NativeResult<Vec<PollFd>> {
        Ok(vec![PollFd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }])
    }

    fn poll_revents(&mut self, fds: &mut [PollFd]) -> NativeResult<Readiness> {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        self.advance();
        let readiness = self.readiness();
        self.refresh_wake();
        Ok(readiness)
    }

    fn state(&mut self) -> PcmState {
        self.advance();
        self.state
    }

    fn prepare(&mut self) -> NativeResult<()> {
        let setup = self.committed()?;
        self.stop_ticker();
        self.state = PcmState::Prepared;
        self.hw_ptr = 0;
        self.appl_ptr = 0;
        self.anchor = None;
        self.ring.fill(setup.format.silence_byte());
        self.refresh_wake();
        Ok(())
    }

    fn start(&mut self) -> NativeResult<()> {
        let setup = self.committed()?;
        if self.state != PcmState::Prepared {
            return Err(NativeError::errno(libc::EBADFD));
        }
        self.run(&setup);
        self.refresh_wake();
        Ok(())
    }

    fn drop_frames(&mut self) -> NativeResult<()> {
        self.committed()?;
        self.stop_ticker();
        self.state = PcmState::Setup;
        self.anchor = None;
        self.refresh_wake();
        Ok(())
    }

    fn drain(&mut self) -> NativeResult<()> {
        self.committed()?;
        self.advance();
        match (self.direction, self.state) {
            (Direction::Playback, PcmState::Running) => self.state = PcmState::Draining,
            (_, PcmState::XRun) => return Err(NativeError::errno(libc::EPIPE)),
            _ => {
                self.stop_ticker();
                self.state = PcmState::Setup;
            }
        }
        self.refresh_wake();
        Ok(())
    }

    fn resume(&mut self) -> NativeResult<()> {
        if self.state == PcmState::Suspended {
            self.state = PcmState::Prepared;
        }
        Ok(())
    }

    fn avail_update(&mut self) -> NativeResult<Frames> {
        let setup = self.committed()?;
        self.advance();
        if self.state == PcmState::XRun {
            return Err(NativeError::errno(libc::EPIPE));
        }
        Ok(self.avail(&setup).max(0))
    }

    fn delay(&mut self) -> NativeResult<Frames> {
        self.committed()?;
        self.advance();
        Ok(match self.direction {
            Direction::Playback => self.appl_ptr - self.hw_ptr,
            Direction::Capture => self.hw_ptr - self.appl_ptr,
        })
    }

    fn link(&mut self, _other: &mut dyn Pcm) -> NativeResult<bool> {
        Ok(false)
    }

    fn unlink(&mut self) -> NativeResult<()> {
        Ok(())
    }

    fn mmap_transfer(
        &mut self,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>) -> usize,
    ) -> NativeResult<Frames> {
        if !self.committed()?.access.is_mmap() {
            return Err(einval());
        }
        self.window(frames, f)
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: Frames) -> NativeResult<Frames> {
        self.rw_transfer(Access::RwInterleaved, frames, &mut |area, at| {
            let channels = area.channels();
            let sb = area.sample_bytes();
            for frame in 0..area.frames() {
                for c in 0..channels {
                    let dst = ((at + frame) * channels + c) * sb;
                    buf[dst..dst + sb].copy_from_slice(area.sample(c, frame));
                }
            }
        })
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: Frames) -> NativeResult<Frames> {
        self.rw_transfer(Access::RwInterleaved, frames, &mut |area, at| {
            let channels = area.channels();
            let sb = area.sample_bytes();
            for frame in 0..area.frames() {
                for c in 0..channels {
                    let src = ((at + frame) * channels + c) * sb;
                    area.sample_mut(c, frame).copy_from_slice(&buf[src..src + sb]);
                }
            }
        })
    }

    fn read_planar(&mut self, buf: &mut [u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames> {
        self.rw_transfer(Access::RwNonInterleaved, frames, &mut |area, at| {
            let sb = area.sample_bytes();
            for c in 0..area.channels() {
                for frame in 0..area.frames() {
                    let dst = c * plane_bytes + (at + frame) * sb;
                    buf[dst..dst + sb].copy_from_slice(area.sample(c, frame));
                }
            }
        })
    }

    fn write_planar(&mut self, buf: &[u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames> {
        self.rw_transfer(Access::RwNonInterleaved, frames, &mut |area, at| {
            let sb = area.sample_bytes();
            for c in 0..area.channels() {
                for frame in 0..area.frames() {
                    let src = c * plane_bytes + (at + frame) * sb;
                    area.sample_mut(c, frame).copy_from_slice(&buf[src..src + sb]);
                }
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(provider: &SimProvider, direction: Direction, access: Access) -> Box<dyn Pcm> {
        let mut pcm = provider.open("sim", direction, true).unwrap();
        pcm.hw_any().unwrap();
        pcm.hw_set_access(access).unwrap();
        pcm.hw_set_format(SampleFormat::Int16).unwrap();
        pcm.hw_set_rate_near(48000).unwrap();
        pcm.hw_set_channels(2).unwrap();
        pcm.hw_set_period_size_near(64).unwrap();
        pcm.hw_set_buffer_size_near(256).unwrap();
        pcm.hw_commit().unwrap();
        pcm
    }

    #[test]
    fn rate_list_picks_nearest() {
        let rates = SimRates::List(vec![44100, 48000]);
        assert_eq!(rates.nearest(47000), 48000);
        assert_eq!(rates.nearest(22050), 44100);
    }

    #[test]
    fn handles_are_counted() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("sim"));
        let pcm = provider.open("sim", Direction::Capture, true).unwrap();
        assert_eq!(device.open_handles(), 1);
        drop(pcm);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn capture_only_device_refuses_playback() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::capture_only("sim"));
        let err = provider.open("sim", Direction::Playback, true).unwrap_err();
        assert_eq!(err.code, -libc::ENOENT);
    }

    #[test]
    fn playback_write_auto_starts_at_threshold() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("sim"));
        let mut pcm = configured(&provider, Direction::Playback, Access::RwInterleaved);
        pcm.sw_commit(&SwConfig {
            start_threshold: Threshold::Frames(64),
            stop_threshold: Threshold::Frames(256),
            silence_threshold: 0,
            silence_size: Threshold::Boundary,
            avail_min: 64,
            timestamps: true,
        })
        .unwrap();
        assert_eq!(pcm.avail_update().unwrap(), 256);
        let data = vec![0u8; 64 * 4];
        assert_eq!(pcm.write_interleaved(&data, 64).unwrap(), 64);
        assert_eq!(pcm.state(), PcmState::Running);
        pcm.drop_frames().unwrap();
    }

    #[test]
    fn injected_xrun_reports_epipe() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("sim"));
        let mut pcm = configured(&provider, Direction::Capture, Access::MmapInterleaved);
        pcm.start().unwrap();
        device.inject_xrun(Direction::Capture);
        assert!(pcm.avail_update().unwrap_err().is_xrun());
        assert_eq!(pcm.state(), PcmState::XRun);
        pcm.prepare().unwrap();
        assert_eq!(pcm.state(), PcmState::Prepared);
    }

    #[test]
    fn mmap_window_wraps_at_ring_end() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("sim"));
        let mut pcm = configured(&provider, Direction::Playback, Access::MmapNonInterleaved);
        let first = pcm.mmap_transfer(200, &mut |area| area.frames()).unwrap();
        assert_eq!(first, 200);
        let second = pcm.mmap_transfer(200, &mut |area| area.frames()).unwrap();
        assert_eq!(second, 56);
    }

    #[test]
    fn busy_commit_is_reported() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("sim"));
        device.set_commit_busy(true);
        let mut pcm = provider.open("sim", Direction::Playback, true).unwrap();
        pcm.hw_set_access(Access::MmapInterleaved).unwrap();
        pcm.hw_set_format(SampleFormat::Int16).unwrap();
        pcm.hw_set_rate_near(48000).unwrap();
        pcm.hw_set_channels(2).unwrap();
        assert!(pcm.hw_commit().unwrap_err().is_busy());
    }
}
