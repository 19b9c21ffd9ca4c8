//! Poll-driven servicing of a stream's devices.
//!
//! [`Servicer`] owns the components while a stream runs and implements the
//! wait, transfer and xrun recovery steps. The callback loop runs it on a
//! dedicated thread; blocking reads and writes run it on the caller's.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::libc;
use tracing::{debug, error, warn};

use super::component::StreamComponent;
use super::cpu_load::{CpuLoadMeter, monotonic_seconds};
use super::processor::{ChannelLayout, UserArea, UserAreaMut};
use super::state::{LoopPhase, SharedState};
use crate::error::{Error, Result};
use crate::hw::{ChannelPlane, Direction, NativeError, NativeResult, PcmState, PollFd};

const RT_THREAD_NAME: &str = "maolan-pcm-rt";
#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;
const MIN_POLL_MS: i32 = 10;
const MAX_POLL_MS: i32 = 500;
const RESUME_ATTEMPTS: u32 = 100;

/// Outcome of waiting for the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Every waited-on device can move at least this many frames.
    Frames(usize),
    Xrun(Direction),
    /// The poll timed out.
    Idle,
}

#[derive(Debug)]
pub struct Servicer {
    pub(super) capture: Option<StreamComponent>,
    pub(super) playback: Option<StreamComponent>,
    linked: bool,
    primed: bool,
    max_recoveries: u32,
    shared: Arc<SharedState>,
    fds: Vec<PollFd>,
    poll_ms: i32,
    last_transfer: Instant,
}

fn poll_timeout_ms(component: Option<&StreamComponent>) -> i32 {
    let Some(c) = component else {
        return MAX_POLL_MS;
    };
    if c.sample_rate() <= 0.0 {
        return MAX_POLL_MS;
    }
    let ms = 2.0 * c.period_frames() as f64 * 1000.0 / c.sample_rate();
    (ms.ceil() as i32).clamp(MIN_POLL_MS, MAX_POLL_MS)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

impl Servicer {
    pub fn new(
        capture: Option<StreamComponent>,
        playback: Option<StreamComponent>,
        linked: bool,
        primed: bool,
        max_recoveries: u32,
        shared: Arc<SharedState>,
    ) -> Self {
        let poll_ms = poll_timeout_ms(playback.as_ref().or(capture.as_ref()));
        let fd_count = capture.as_ref().map_or(0, |c| c.poll_fds().len())
            + playback.as_ref().map_or(0, |p| p.poll_fds().len());
        Self {
            capture,
            playback,
            linked,
            primed,
            max_recoveries,
            shared,
            fds: Vec::with_capacity(fd_count),
            poll_ms,
            last_transfer: Instant::now(),
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_ms as u64)
    }

    /// Releases the components, unlinking a linked pair first.
    pub fn into_components(mut self) -> (Option<StreamComponent>, Option<StreamComponent>) {
        if self.linked
            && let Some(c) = self.capture.as_mut()
            && let Err(err) = c.pcm_mut().unlink()
        {
            debug!("unlinking capture failed: {err}");
        }
        (self.capture.take(), self.playback.take())
    }

    fn components_mut(&mut self) -> impl Iterator<Item = &mut StreamComponent> {
        self.capture.iter_mut().chain(self.playback.iter_mut())
    }

    /// Brings every device back to the prepared state.
    pub fn prepare_all(&mut self) -> NativeResult<()> {
        for c in self.components_mut() {
            if c.pcm_mut().state() != PcmState::Prepared {
                c.pcm_mut().prepare()?;
            }
        }
        Ok(())
    }

    /// Starts the prepared devices, priming playback with silence first when
    /// `prime` is set. Unprimed playback starts itself once a period is
    /// queued.
    pub fn start_devices(&mut self, prime: bool) -> NativeResult<()> {
        let mut playback_started = false;
        if let Some(p) = self.playback.as_mut()
            && prime
        {
            p.prime_with_silence()?;
            if p.pcm_mut().state() == PcmState::Prepared {
                p.pcm_mut().start()?;
            }
            playback_started = true;
        }
        if let Some(c) = self.capture.as_mut()
            && !(self.linked && playback_started)
            && c.pcm_mut().state() == PcmState::Prepared
        {
            c.pcm_mut().start()?;
        }
        self.last_transfer = Instant::now();
        Ok(())
    }

    pub fn start(&mut self) -> NativeResult<()> {
        self.prepare_all()?;
        self.start_devices(self.primed)
    }

    /// Stops immediately, discarding queued frames.
    pub fn drop_all(&mut self) {
        for c in self.components_mut() {
            if let Err(err) = c.pcm_mut().drop_frames() {
                debug!("{} drop failed: {err}", c.direction());
            }
        }
    }

    /// Lets queued playback finish, bounded by `timeout`, then stops all.
    pub fn drain_all(&mut self, timeout: Duration) {
        if let Some(p) = self.playback.as_mut() {
            match p.pcm_mut().drain() {
                Ok(()) => {
                    let deadline = Instant::now() + timeout;
                    while matches!(
                        p.pcm_mut().state(),
                        PcmState::Draining | PcmState::Running
                    ) {
                        if Instant::now() >= deadline {
                            warn!("playback drain of '{}' timed out", p.device_name());
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(MIN_POLL_MS as u64));
                    }
                }
                Err(err) => debug!("playback drain failed: {err}"),
            }
        }
        self.drop_all();
    }

    /// Waits until every device in `need_capture`/`need_playback` has at
    /// least a period available, an xrun shows up, or the poll times out.
    pub fn wait(&mut self, need_capture: bool, need_playback: bool) -> NativeResult<Wait> {
        let deadline = Instant::now() + self.poll_timeout();
        let mut pending = [
            need_capture && self.capture.is_some(),
            need_playback && self.playback.is_some(),
        ];
        let mut avail = [usize::MAX; 2];
        loop {
            for (slot, component) in [self.capture.as_mut(), self.playback.as_mut()]
                .into_iter()
                .enumerate()
            {
                let Some(c) = component else {
                    continue;
                };
                if !pending[slot] {
                    continue;
                }
                let period = c.period_frames().max(1) as usize;
                match c.pcm_mut().avail_update() {
                    Ok(frames) => {
                        let frames = frames.max(0) as usize;
                        if frames >= period {
                            pending[slot] = false;
                            avail[slot] = frames;
                        }
                    }
                    Err(err) if err.is_xrun() || err.is_suspended() => {
                        return Ok(Wait::Xrun(c.direction()));
                    }
                    Err(err) => return Err(err),
                }
            }
            if pending == [false, false] {
                let frames = avail.into_iter().min().unwrap_or(0);
                return Ok(Wait::Frames(if frames == usize::MAX { 0 } else { frames }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Wait::Idle);
            }
            let mut ranges = [0..0, 0..0];
            self.fds.clear();
            for (slot, component) in [self.capture.as_ref(), self.playback.as_ref()]
                .into_iter()
                .enumerate()
            {
                if let Some(c) = component
                    && pending[slot]
                {
                    let start = self.fds.len();
                    self.fds.extend_from_slice(c.poll_fds());
                    ranges[slot] = start..self.fds.len();
                }
            }
            let remaining = deadline.saturating_duration_since(now).as_millis().max(1);
            let timeout = i32::try_from(remaining).unwrap_or(MAX_POLL_MS);
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if rc < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(NativeError::errno(errno));
            }
            if rc == 0 {
                return Ok(Wait::Idle);
            }
            for (slot, component) in [self.capture.as_mut(), self.playback.as_mut()]
                .into_iter()
                .enumerate()
            {
                let Some(c) = component else {
                    continue;
                };
                if !pending[slot] {
                    continue;
                }
                let readiness = c.pcm_mut().poll_revents(&mut self.fds[ranges[slot].clone()])?;
                if readiness.error {
                    return Ok(Wait::Xrun(c.direction()));
                }
            }
        }
    }

    pub fn note_transfer(&mut self) {
        self.last_transfer = Instant::now();
    }

    /// Restarts the devices after an xrun reported on `reported`.
    ///
    /// Counts one overrun or underrun per direction found in the XRUN
    /// state and adds the time since the last transfer to the totals.
    pub fn recover_xrun(&mut self, reported: Direction) -> Result<[bool; 2]> {
        let lost = self.last_transfer.elapsed();
        let mut hit = [reported == Direction::Capture, reported == Direction::Playback];
        if let Some(c) = self.capture.as_mut() {
            hit[0] |= c.pcm_mut().state() == PcmState::XRun;
        }
        if let Some(p) = self.playback.as_mut() {
            hit[1] |= p.pcm_mut().state() == PcmState::XRun;
        }

        let mut last = NativeError::errno(libc::EPIPE);
        for attempt in 1..=self.max_recoveries {
            match self.restart() {
                Ok(()) => {
                    if hit[0] {
                        self.shared.record_xrun(Direction::Capture, lost);
                        warn!("capture overrun recovered after {:.1} ms", lost.as_secs_f64() * 1000.0);
                    }
                    if hit[1] {
                        self.shared.record_xrun(Direction::Playback, lost);
                        warn!("playback underrun recovered after {:.1} ms", lost.as_secs_f64() * 1000.0);
                    }
                    return Ok(hit);
                }
                Err(err) => {
                    warn!("xrun recovery attempt {attempt} failed: {err}");
                    last = err;
                }
            }
        }
        error!("{reported} xrun not recovered: {last}");
        Err(Error::host(last))
    }

    fn restart(&mut self) -> NativeResult<()> {
        for c in self.components_mut() {
            if c.pcm_mut().state() == PcmState::Suspended {
                resume(c)?;
            }
        }
        self.drop_all();
        for c in self.components_mut() {
            c.pcm_mut().prepare()?;
        }
        self.start_devices(self.playback.is_some())
    }
}

fn resume(component: &mut StreamComponent) -> NativeResult<()> {
    for _ in 0..RESUME_ATTEMPTS {
        match component.pcm_mut().resume() {
            Err(err) if err.is_again() => std::thread::sleep(Duration::from_millis(10)),
            other => return other,
        }
    }
    Err(NativeError::errno(libc::EAGAIN))
}

/// Buffers handed to the stream callback. Sizes are in the user layout.
#[derive(Debug)]
pub struct CallbackIo<'a> {
    pub frames: usize,
    pub input: Option<&'a [u8]>,
    pub output: Option<&'a mut [u8]>,
    pub input_layout: Option<ChannelLayout>,
    pub output_layout: Option<ChannelLayout>,
}

/// Stream clock values in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallbackTimeInfo {
    pub current_time: f64,
    pub input_adc_time: f64,
    pub output_dac_time: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackFlags {
    pub input_overflow: bool,
    pub output_underflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    /// Play what was produced so far, then stop.
    Complete,
    /// Stop now and discard queued output.
    Abort,
}

pub type StreamCallback =
    Box<dyn FnMut(&mut CallbackIo<'_>, &CallbackTimeInfo, CallbackFlags) -> CallbackResult + Send>;

fn configure_rt_thread(name: &str, priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({name}, prio {priority}) failed with errno {rc}"
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (name, priority);
        Err("realtime thread priority is not supported on this platform".to_string())
    }
}

/// The callback-mode servicing loop. Runs on its own thread between
/// `start` and `stop`/`abort` and comes back through the join handle.
#[derive(Debug)]
pub(super) struct RealtimeLoop {
    servicer: Servicer,
    callback: CallbackSlot,
    frames_per_buffer: usize,
    sample_rate: f64,
    input: Vec<u8>,
    input_planes: Vec<ChannelPlane>,
    output: Vec<u8>,
    output_planes: Vec<ChannelPlane>,
    cpu: CpuLoadMeter,
    realtime_priority: Option<i32>,
    drain_timeout: Duration,
}

struct CallbackSlot(StreamCallback);

impl std::fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamCallback")
    }
}

pub(super) type LoopHandle = JoinHandle<Option<RealtimeLoop>>;

#[derive(Debug)]
pub(super) struct SpawnFailure {
    pub(super) error: Error,
    pub(super) returned: Option<RealtimeLoop>,
}

fn user_buffer(
    component: Option<&StreamComponent>,
    frames: usize,
    planes: &mut Vec<ChannelPlane>,
) -> Result<Vec<u8>> {
    let Some(c) = component else {
        return Ok(Vec::new());
    };
    let layout = c.user_layout();
    layout.fill_planes(planes, frames);
    let bytes = layout.buffer_bytes(frames);
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|_| Error::InsufficientMemory)?;
    buf.resize(bytes, layout.format.silence_byte());
    Ok(buf)
}

impl RealtimeLoop {
    pub(super) fn new(
        servicer: Servicer,
        callback: StreamCallback,
        frames_per_buffer: usize,
        sample_rate: f64,
        realtime_priority: Option<i32>,
        drain_timeout: Duration,
    ) -> Result<Self> {
        let mut input_planes = Vec::new();
        let mut output_planes = Vec::new();
        let input = user_buffer(servicer.capture.as_ref(), frames_per_buffer, &mut input_planes)?;
        let output = user_buffer(servicer.playback.as_ref(), frames_per_buffer, &mut output_planes)?;
        Ok(Self {
            servicer,
            callback: CallbackSlot(callback),
            frames_per_buffer,
            sample_rate,
            input,
            input_planes,
            output,
            output_planes,
            cpu: CpuLoadMeter::new(),
            realtime_priority,
            drain_timeout,
        })
    }

    /// Moves the loop onto its own thread. If the thread cannot be
    /// created the servicer and callback come back with the error.
    pub(super) fn spawn(self) -> std::result::Result<LoopHandle, SpawnFailure> {
        let parts = Arc::new(Mutex::new(Some(self)));
        let thread_parts = parts.clone();
        let spawned = std::thread::Builder::new()
            .name(RT_THREAD_NAME.to_string())
            .spawn(move || {
                let taken = thread_parts.lock().ok().and_then(|mut slot| slot.take());
                taken.map(RealtimeLoop::run)
            });
        spawned.map_err(|err| {
            let code = err.raw_os_error().unwrap_or(libc::EAGAIN);
            let returned = parts.lock().ok().and_then(|mut slot| slot.take());
            SpawnFailure {
                error: Error::host(NativeError::new(-code, err.to_string())),
                returned,
            }
        })
    }

    pub(super) fn servicer(&self) -> &Servicer {
        &self.servicer
    }

    pub(super) fn into_servicer(self) -> Servicer {
        self.servicer
    }

    fn run(mut self) -> Self {
        if let Some(priority) = self.realtime_priority
            && let Err(err) = configure_rt_thread(RT_THREAD_NAME, priority)
        {
            warn!("realtime priority not enabled: {err}");
        }
        let shared = self.servicer.shared.clone();
        let outcome = self.service();
        if let Err(err) = &outcome {
            error!("stream loop stopped: {err}");
            self.servicer.drop_all();
        }
        shared.finish(outcome.err());
        self
    }

    fn service(&mut self) -> Result<()> {
        let shared = self.servicer.shared.clone();
        shared.set_phase(if self.servicer.primed {
            LoopPhase::Priming
        } else {
            LoopPhase::Running
        });
        if let Some(p) = self.servicer.playback.as_ref() {
            self.output.fill(p.user_layout().format.silence_byte());
        }
        self.servicer.start().map_err(Error::host)?;
        shared.set_phase(LoopPhase::Running);

        let fpb = self.frames_per_buffer.max(1);
        let mut cursor = 0;
        let mut flags = CallbackFlags::default();
        let mut completing = false;
        let mut idle_since: Option<Instant> = None;
        loop {
            if shared.abort_requested() {
                shared.set_phase(LoopPhase::Aborting);
                self.servicer.drop_all();
                return Ok(());
            }
            if shared.stop_requested() {
                shared.set_phase(LoopPhase::Draining);
                self.servicer.drain_all(self.drain_timeout);
                return Ok(());
            }

            let need_capture = !completing;
            let frames = match self.servicer.wait(need_capture, true).map_err(Error::host)? {
                Wait::Frames(frames) => frames,
                Wait::Xrun(direction) => {
                    let hit = self.servicer.recover_xrun(direction)?;
                    flags.input_overflow |= hit[0];
                    flags.output_underflow |= hit[1];
                    continue;
                }
                Wait::Idle => {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > self.drain_timeout {
                        return Err(Error::TimedOut("devices stopped delivering frames".into()));
                    }
                    continue;
                }
            };
            idle_since = None;

            let moved = match self.transfer(cursor, frames.min(fpb - cursor), need_capture) {
                Ok(moved) => moved,
                Err(err) if err.is_xrun() || err.is_suspended() => {
                    let reported = if self.servicer.playback.is_some() {
                        Direction::Playback
                    } else {
                        Direction::Capture
                    };
                    let hit = self.servicer.recover_xrun(reported)?;
                    flags.input_overflow |= hit[0];
                    flags.output_underflow |= hit[1];
                    continue;
                }
                Err(err) => return Err(Error::host(err)),
            };
            if moved == 0 {
                continue;
            }
            self.servicer.note_transfer();
            cursor += moved;
            if cursor < fpb {
                continue;
            }
            cursor = 0;

            if completing {
                shared.set_phase(LoopPhase::Draining);
                self.servicer.drain_all(self.drain_timeout);
                return Ok(());
            }
            match self.invoke(flags) {
                CallbackResult::Continue => {}
                CallbackResult::Complete if self.servicer.playback.is_some() => {
                    debug!("callback completed, playing out the last buffer");
                    completing = true;
                }
                CallbackResult::Complete => {
                    shared.set_phase(LoopPhase::Draining);
                    self.servicer.drain_all(self.drain_timeout);
                    return Ok(());
                }
                CallbackResult::Abort => {
                    shared.set_phase(LoopPhase::Aborting);
                    self.servicer.drop_all();
                    return Ok(());
                }
            }
            flags = CallbackFlags::default();
        }
    }

    /// Moves `frames` frames at `cursor` between the user buffers and the
    /// devices. Duplex playback follows whatever capture delivered.
    fn transfer(&mut self, cursor: usize, frames: usize, capture: bool) -> NativeResult<usize> {
        let Self {
            servicer,
            input,
            input_planes,
            output,
            output_planes,
            frames_per_buffer,
            ..
        } = self;
        let mut moved = frames;
        if capture && let Some(c) = servicer.capture.as_mut() {
            let sample_bytes = c.user_layout().format.bytes();
            let mut user = UserAreaMut::new(input, input_planes, sample_bytes, *frames_per_buffer)
                .ok_or_else(|| NativeError::errno(libc::EFAULT))?;
            moved = c.capture_into(&mut user, cursor, frames)?;
        }
        if let Some(p) = servicer.playback.as_mut()
            && moved > 0
        {
            let sample_bytes = p.user_layout().format.bytes();
            let user = UserArea::new(output, output_planes, sample_bytes, *frames_per_buffer)
                .ok_or_else(|| NativeError::errno(libc::EFAULT))?;
            let sent = p.playback_from(&user, cursor, moved)?;
            if servicer.capture.is_none() || !capture {
                moved = sent;
            }
        }
        Ok(moved)
    }

    fn time_info(&mut self) -> CallbackTimeInfo {
        let now = monotonic_seconds();
        let rate = self.sample_rate;
        let delay = |component: Option<&mut StreamComponent>| {
            component
                .and_then(|c| c.pcm_mut().delay().ok())
                .map_or(0.0, |frames| frames.max(0) as f64 / rate)
        };
        let input_delay = delay(self.servicer.capture.as_mut());
        let output_delay = delay(self.servicer.playback.as_mut());
        CallbackTimeInfo {
            current_time: now,
            input_adc_time: now - input_delay,
            output_dac_time: now + output_delay,
        }
    }

    fn invoke(&mut self, flags: CallbackFlags) -> CallbackResult {
        let time = self.time_info();
        let input_layout = self.servicer.capture.as_ref().map(|c| c.user_layout());
        let output_layout = self.servicer.playback.as_ref().map(|p| p.user_layout());
        let mut io = CallbackIo {
            frames: self.frames_per_buffer,
            input: input_layout.map(|_| &self.input[..]),
            output: output_layout.map(|_| &mut self.output[..]),
            input_layout,
            output_layout,
        };
        self.cpu.begin();
        let result = (self.callback.0)(&mut io, &time, flags);
        let load = self.cpu.end(self.frames_per_buffer, self.sample_rate);
        self.servicer.shared.set_cpu_load(load);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::hw::sim::{SimDeviceConfig, SimProvider};
    use crate::hw::{DeviceOpener, RetryPolicy};
    use crate::stream::component::ComponentRequest;
    use crate::stream::negotiate::{NegotiationRequest, negotiate};
    use crate::stream::processor::adapting_processor;

    fn capture_servicer(provider: &SimProvider) -> Servicer {
        let opener = DeviceOpener::new(provider, RetryPolicy::new(0, Duration::ZERO));
        let mut capture = StreamComponent::initialize(
            &opener,
            &ComponentRequest {
                device_name: "hw:0",
                is_plug: false,
                device_min_channels: Some(1),
                channels: 2,
                format: SampleFormat::Int16,
                non_interleaved: false,
                direction: Direction::Capture,
                callback_mode: false,
            },
            false,
        )
        .unwrap();
        negotiate(
            Some(&mut capture),
            None,
            &NegotiationRequest {
                sample_rate: 48000.0,
                frames_per_buffer: 240,
                primed: false,
                num_periods: 4,
                rate_tolerance: 0.01,
                capture_latency: 0.02,
                playback_latency: 0.02,
            },
        )
        .unwrap();
        capture.attach_processor(adapting_processor()).unwrap();
        Servicer::new(Some(capture), None, false, false, 3, Arc::new(SharedState::new()))
    }

    #[test]
    fn poll_timeout_is_two_periods_within_bounds() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let servicer = capture_servicer(&provider);
        assert_eq!(servicer.poll_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn capture_wait_reports_a_period() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let mut servicer = capture_servicer(&provider);
        servicer.start().unwrap();
        let mut frames = 0;
        for _ in 0..50 {
            if let Wait::Frames(n) = servicer.wait(true, false).unwrap() {
                frames = n;
                break;
            }
        }
        assert!(frames >= 240);
        servicer.drop_all();
    }

    #[test]
    fn injected_overrun_is_recovered_and_counted_once() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let mut servicer = capture_servicer(&provider);
        servicer.start().unwrap();
        device.inject_xrun(Direction::Capture);
        let reported = servicer.wait(true, false).unwrap();
        assert_eq!(reported, Wait::Xrun(Direction::Capture));
        let hit = servicer.recover_xrun(Direction::Capture).unwrap();
        assert_eq!(hit, [true, false]);
        let stats = servicer.shared().xrun_stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.underruns, 0);
        let capture = servicer.capture.as_mut().unwrap();
        assert_eq!(capture.pcm_mut().state(), PcmState::Running);
        servicer.drop_all();
    }

    #[test]
    fn recovery_budget_of_zero_fails() {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("hw:0"));
        let servicer = capture_servicer(&provider);
        let (capture, _) = servicer.into_components();
        let mut servicer =
            Servicer::new(capture, None, false, false, 0, Arc::new(SharedState::new()));
        let err = servicer.recover_xrun(Direction::Capture).unwrap_err();
        assert!(matches!(err, Error::UnanticipatedHostError(_)));
        assert_eq!(servicer.shared().xrun_stats().overruns, 0);
    }
}
