//! Statically linked binding through the `alsa` crate.
//!
//! `HwParams` borrows its `PCM`, so the pending hardware configuration is
//! kept as a list of narrowing steps and replayed onto a fresh parameter
//! space whenever it is queried or committed. The crate's mmap window is
//! interleaved-only, so this binding offers interleaved access modes only.

use std::any::Any;

use alsa::pcm::{Access as AlsaAccess, Format, HwParams, PCM, State};
use alsa::poll::{Descriptors, Flags};
use alsa::{Direction as AlsaDirection, ValueOr};
use nix::libc;
use tracing::debug;

use super::area::{ChannelPlane, HostArea, fill_interleaved_planes};
use super::{
    Access, Direction, Frames, NativeError, NativeResult, Pcm, PcmState, PollFd, Provider,
    RateFraction, Readiness, SwConfig, Threshold,
};
use crate::format::SampleFormat;

#[derive(Debug, Default)]
pub struct AlsaProvider;

impl AlsaProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for AlsaProvider {
    fn label(&self) -> &'static str {
        "ALSA"
    }

    fn open(&self, name: &str, direction: Direction, nonblock: bool) -> NativeResult<Box<dyn Pcm>> {
        let dir = match direction {
            Direction::Capture => AlsaDirection::Capture,
            Direction::Playback => AlsaDirection::Playback,
        };
        let pcm = PCM::new(name, dir, nonblock).map_err(native)?;
        Ok(Box::new(AlsaPcm {
            pcm,
            name: name.to_string(),
            direction,
            steps: Vec::new(),
            periods_min: 1,
            periods_integer: false,
            format: None,
            layout: None,
            planes: Vec::new(),
        }))
    }
}

fn native(err: alsa::Error) -> NativeError {
    NativeError::new(err.errno() as i32, err.to_string())
}

fn alsa_access(access: Access) -> AlsaAccess {
    match access {
        Access::MmapInterleaved => AlsaAccess::MMapInterleaved,
        Access::MmapNonInterleaved => AlsaAccess::MMapNonInterleaved,
        Access::RwInterleaved => AlsaAccess::RWInterleaved,
        Access::RwNonInterleaved => AlsaAccess::RWNonInterleaved,
    }
}

fn alsa_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::Float32 => Format::float(),
        SampleFormat::Int32 => Format::s32(),
        #[cfg(target_endian = "little")]
        SampleFormat::Int24 => Format::S243LE,
        #[cfg(target_endian = "big")]
        SampleFormat::Int24 => Format::S243BE,
        SampleFormat::Int16 => Format::s16(),
        SampleFormat::Int8 => Format::S8,
        SampleFormat::UInt8 => Format::U8,
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Access(Access),
    Format(SampleFormat),
    Resample(bool),
    RateNear(u32),
    Channels(u32),
    PeriodNear(Frames),
    Period(Frames),
    BufferNear(Frames),
}

pub struct AlsaPcm {
    pcm: PCM,
    name: String,
    direction: Direction,
    steps: Vec<Step>,
    periods_min: u32,
    periods_integer: bool,
    format: Option<SampleFormat>,
    layout: Option<(usize, usize)>,
    planes: Vec<ChannelPlane>,
}

impl std::fmt::Debug for AlsaPcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlsaPcm")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("steps", &self.steps)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

// SAFETY: the PCM handle is only ever used by the thread currently owning
// the component; it moves between threads but is never shared.
unsafe impl Send for AlsaPcm {}

impl AlsaPcm {
    fn apply(&self, hwp: &HwParams<'_>, step: Step) -> alsa::Result<()> {
        match step {
            Step::Access(access) => hwp.set_access(alsa_access(access)),
            Step::Format(format) => hwp.set_format(alsa_format(format)),
            Step::Resample(resample) => hwp.set_rate_resample(resample),
            Step::RateNear(rate) => hwp.set_rate_near(rate, ValueOr::Nearest).map(drop),
            Step::Channels(channels) => hwp.set_channels(channels),
            Step::PeriodNear(frames) => hwp.set_period_size_near(frames, ValueOr::Nearest).map(drop),
            Step::Period(frames) => hwp.set_period_size(frames, ValueOr::Nearest),
            Step::BufferNear(frames) => {
                let frames = match hwp.get_period_size() {
                    Ok(period) if period > 0 && self.periods_integer => {
                        let periods = ((frames + period - 1) / period).max(Frames::from(self.periods_min));
                        periods * period
                    }
                    _ => frames,
                };
                hwp.set_buffer_size_near(frames).map(drop)
            }
        }
    }

    fn replay(&self) -> alsa::Result<HwParams<'_>> {
        let hwp = HwParams::any(&self.pcm)?;
        for step in &self.steps {
            self.apply(&hwp, *step)?;
        }
        Ok(hwp)
    }

    fn narrow<T>(
        &mut self,
        step: Step,
        read: impl FnOnce(&HwParams<'_>) -> alsa::Result<T>,
    ) -> NativeResult<T> {
        let value = {
            let hwp = self.replay().map_err(native)?;
            self.apply(&hwp, step).map_err(native)?;
            read(&hwp).map_err(native)?
        };
        self.steps.push(step);
        Ok(value)
    }

    fn probe(&self, step: Step) -> bool {
        self.replay().and_then(|hwp| self.apply(&hwp, step)).is_ok()
    }

    fn query<T>(&self, read: impl FnOnce(&HwParams<'_>) -> alsa::Result<T>) -> NativeResult<T> {
        let hwp = self.replay().map_err(native)?;
        read(&hwp).map_err(native)
    }

    fn frame_bytes(&self) -> NativeResult<usize> {
        self.layout
            .map(|(channels, sample_bytes)| channels * sample_bytes)
            .ok_or_else(|| NativeError::errno(libc::EBADFD))
    }
}

impl Pcm for AlsaPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_any(&mut self) -> NativeResult<()> {
        self.steps.clear();
        self.periods_min = 1;
        self.periods_integer = false;
        HwParams::any(&self.pcm).map(drop).map_err(native)
    }

    fn hw_set_periods_integer(&mut self) -> NativeResult<()> {
        self.periods_integer = true;
        Ok(())
    }

    fn hw_set_periods_min(&mut self, periods: u32) -> NativeResult<()> {
        self.periods_min = periods.max(1);
        Ok(())
    }

    fn hw_test_access(&mut self, access: Access) -> bool {
        access.is_interleaved() && self.probe(Step::Access(access))
    }

    fn hw_set_access(&mut self, access: Access) -> NativeResult<()> {
        if !access.is_interleaved() {
            return Err(NativeError::errno(libc::EINVAL));
        }
        self.narrow(Step::Access(access), |_| Ok(()))
    }

    fn hw_test_format(&mut self, format: SampleFormat) -> bool {
        self.probe(Step::Format(format))
    }

    fn hw_set_format(&mut self, format: SampleFormat) -> NativeResult<()> {
        self.narrow(Step::Format(format), |_| Ok(()))?;
        self.format = Some(format);
        Ok(())
    }

    fn hw_set_rate_resample(&mut self, resample: bool) -> NativeResult<()> {
        self.narrow(Step::Resample(resample), |_| Ok(()))
    }

    fn hw_set_rate_near(&mut self, rate: u32) -> NativeResult<u32> {
        self.narrow(Step::RateNear(rate), |hwp| hwp.get_rate())
    }

    fn hw_rate_fraction(&mut self) -> NativeResult<RateFraction> {
        // The crate exposes only the integral rate.
        self.query(|hwp| hwp.get_rate())
            .map(|num| RateFraction { num, den: 1 })
    }

    fn hw_channels_range(&mut self) -> NativeResult<(u32, u32)> {
        self.query(|hwp| Ok((hwp.get_channels_min()?, hwp.get_channels_max()?)))
    }

    fn hw_set_channels(&mut self, channels: u32) -> NativeResult<()> {
        self.narrow(Step::Channels(channels), |_| Ok(()))
    }

    fn hw_period_size_range(&mut self) -> NativeResult<(Frames, Frames)> {
        self.query(|hwp| Ok((hwp.get_period_size_min()?, hwp.get_period_size_max()?)))
    }

    fn hw_set_period_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        self.narrow(Step::PeriodNear(frames), |hwp| hwp.get_period_size())
    }

    fn hw_set_period_size(&mut self, frames: Frames) -> NativeResult<()> {
        self.narrow(Step::Period(frames), |_| Ok(()))
    }

    fn hw_set_buffer_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        self.narrow(Step::BufferNear(frames), |hwp| hwp.get_buffer_size())
    }

    fn hw_commit(&mut self) -> NativeResult<()> {
        {
            let hwp = self.replay().map_err(native)?;
            self.pcm.hw_params(&hwp).map_err(native)?;
        }
        let channels = self
            .pcm
            .hw_params_current()
            .and_then(|hwp| hwp.get_channels())
            .map_err(native)? as usize;
        let sample_bytes = self.format.map(SampleFormat::bytes).unwrap_or(0);
        self.layout = Some((channels, sample_bytes));
        fill_interleaved_planes(&mut self.planes, channels, sample_bytes);
        Ok(())
    }

    fn hw_committed_sizes(&mut self) -> NativeResult<(Frames, Frames)> {
        let hwp = self.pcm.hw_params_current().map_err(native)?;
        Ok((
            hwp.get_period_size().map_err(native)?,
            hwp.get_buffer_size().map_err(native)?,
        ))
    }

    fn sw_commit(&mut self, sw: &SwConfig) -> NativeResult<()> {
        let swp = self.pcm.sw_params_current().map_err(native)?;
        let boundary = swp.get_boundary().map_err(native)?;
        let resolve = |t: Threshold| match t {
            Threshold::Frames(frames) => frames,
            Threshold::Boundary => boundary,
        };
        swp.set_start_threshold(resolve(sw.start_threshold))
            .map_err(native)?;
        swp.set_stop_threshold(resolve(sw.stop_threshold))
            .map_err(native)?;
        swp.set_avail_min(sw.avail_min).map_err(native)?;
        swp.set_tstamp_mode(sw.timestamps).map_err(native)?;
        debug!(
            "{} '{}': silence fill left at driver default (threshold {}, size {:?})",
            self.direction, self.name, sw.silence_threshold, sw.silence_size
        );
        self.pcm.sw_params(&swp).map_err(native)
    }

    fn poll_descriptors(&mut self) -> NativeResult<Vec<PollFd>> {
        let count = Descriptors::count(&self.pcm);
        let mut fds = vec![
            PollFd {
                fd: -1,
                events: 0,
                revents: 0,
            };
            count
        ];
        let filled = Descriptors::fill(&self.pcm, &mut fds).map_err(native)?;
        fds.truncate(filled);
        Ok(fds)
    }

    fn poll_revents(&mut self, fds: &mut [PollFd]) -> NativeResult<Readiness> {
        let flags = Descriptors::revents(&self.pcm, fds).map_err(native)?;
        Ok(Readiness {
            ready: flags.intersects(Flags::IN | Flags::OUT),
            error: flags.contains(Flags::ERR),
        })
    }

    fn state(&mut self) -> PcmState {
        match self.pcm.state() {
            State::Open => PcmState::Open,
            State::Setup => PcmState::Setup,
            State::Prepared => PcmState::Prepared,
            State::Running => PcmState::Running,
            State::XRun => PcmState::XRun,
            State::Draining => PcmState::Draining,
            State::Paused => PcmState::Paused,
            State::Suspended => PcmState::Suspended,
            #[allow(unreachable_patterns)]
            _ => PcmState::Disconnected,
        }
    }

    fn prepare(&mut self) -> NativeResult<()> {
        self.pcm.prepare().map_err(native)
    }

    fn start(&mut self) -> NativeResult<()> {
        self.pcm.start().map_err(native)
    }

    fn drop_frames(&mut self) -> NativeResult<()> {
        self.pcm.drop().map_err(native)
    }

    fn drain(&mut self) -> NativeResult<()> {
        match self.pcm.drain().map_err(native) {
            Err(err) if err.is_again() => Ok(()),
            other => other,
        }
    }

    fn resume(&mut self) -> NativeResult<()> {
        self.pcm.resume().map_err(native)
    }

    fn avail_update(&mut self) -> NativeResult<Frames> {
        self.pcm.avail_update().map_err(native)
    }

    fn delay(&mut self) -> NativeResult<Frames> {
        self.pcm.delay().map_err(native)
    }

    fn link(&mut self, other: &mut dyn Pcm) -> NativeResult<bool> {
        let Some(other) = other.as_any().downcast_ref::<AlsaPcm>() else {
            return Ok(false);
        };
        match self.pcm.link(&other.pcm) {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("linking '{}' with '{}' failed: {err}", self.name, other.name);
                Ok(false)
            }
        }
    }

    fn unlink(&mut self) -> NativeResult<()> {
        self.pcm.unlink().map_err(native)
    }

    fn mmap_transfer(
        &mut self,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>) -> usize,
    ) -> NativeResult<Frames> {
        let frame_bytes = self.frame_bytes()?;
        let sample_bytes = self.layout.map(|(_, sb)| sb).unwrap_or(1);
        let planes = &self.planes;
        let io = self.pcm.io_bytes();
        let moved = io
            .mmap(frames.max(0) as usize, |buf: &mut [u8]| {
                let count = buf.len() / frame_bytes;
                match HostArea::new(buf, planes, sample_bytes, count) {
                    Some(mut area) => f(&mut area).min(count),
                    None => 0,
                }
            })
            .map_err(native)?;
        Ok(moved as Frames)
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: Frames) -> NativeResult<Frames> {
        let len = frames.max(0) as usize * self.frame_bytes()?;
        let io = self.pcm.io_bytes();
        io.readi(&mut buf[..len]).map(|n| n as Frames).map_err(native)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: Frames) -> NativeResult<Frames> {
        let len = frames.max(0) as usize * self.frame_bytes()?;
        let io = self.pcm.io_bytes();
        io.writei(&buf[..len]).map(|n| n as Frames).map_err(native)
    }

    fn read_planar(&mut self, _buf: &mut [u8], _plane_bytes: usize, _frames: Frames) -> NativeResult<Frames> {
        Err(NativeError::errno(libc::EINVAL))
    }

    fn write_planar(&mut self, _buf: &[u8], _plane_bytes: usize, _frames: Frames) -> NativeResult<Frames> {
        Err(NativeError::errno(libc::EINVAL))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
