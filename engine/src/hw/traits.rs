use std::any::Any;
use std::fmt;

use nix::libc;

use super::area::HostArea;
use crate::format::SampleFormat;

pub type Frames = i64;
pub type PollFd = libc::pollfd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Capture,
    Playback,
}

impl Direction {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Playback => "playback",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    MmapInterleaved,
    MmapNonInterleaved,
    RwInterleaved,
    RwNonInterleaved,
}

impl Access {
    pub const fn mmap(interleaved: bool) -> Self {
        if interleaved {
            Self::MmapInterleaved
        } else {
            Self::MmapNonInterleaved
        }
    }

    pub const fn rw(interleaved: bool) -> Self {
        if interleaved {
            Self::RwInterleaved
        } else {
            Self::RwNonInterleaved
        }
    }

    pub const fn is_mmap(self) -> bool {
        matches!(self, Self::MmapInterleaved | Self::MmapNonInterleaved)
    }

    pub const fn is_interleaved(self) -> bool {
        matches!(self, Self::MmapInterleaved | Self::RwInterleaved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    XRun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// Negative errno plus the subsystem's description of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: -code.abs(),
            message: message.into(),
        }
    }

    pub fn errno(errno: i32) -> Self {
        Self::new(errno, nix::errno::Errno::from_raw(errno.abs()).desc())
    }

    pub fn is_busy(&self) -> bool {
        self.code == -libc::EBUSY
    }

    pub fn is_xrun(&self) -> bool {
        self.code == -libc::EPIPE
    }

    pub fn is_suspended(&self) -> bool {
        self.code == -libc::ESTRPIPE
    }

    pub fn is_again(&self) -> bool {
        self.code == -libc::EAGAIN
    }

    pub fn is_invalid(&self) -> bool {
        self.code == -libc::EINVAL
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for NativeError {}

pub type NativeResult<T> = Result<T, NativeError>;

/// Exact hardware rate as a fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateFraction {
    pub num: u32,
    pub den: u32,
}

impl RateFraction {
    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        f64::from(self.num) / f64::from(self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Frames(Frames),
    /// The ring pointer boundary; a start threshold this large never triggers.
    Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwConfig {
    pub start_threshold: Threshold,
    pub stop_threshold: Threshold,
    pub silence_threshold: Frames,
    pub silence_size: Threshold,
    pub avail_min: Frames,
    pub timestamps: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub error: bool,
}

/// A sound subsystem able to open PCM endpoints.
pub trait Provider: Send + Sync + fmt::Debug {
    fn label(&self) -> &'static str;

    fn version(&self) -> Option<String> {
        None
    }

    fn open(&self, name: &str, direction: Direction, nonblock: bool) -> NativeResult<Box<dyn Pcm>>;
}

/// One opened PCM endpoint. Dropping it closes the device.
///
/// The `hw_*` calls narrow a pending hardware configuration which only
/// reaches the device on [`Pcm::hw_commit`].
pub trait Pcm: Send + fmt::Debug {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;

    fn hw_any(&mut self) -> NativeResult<()>;
    fn hw_set_periods_integer(&mut self) -> NativeResult<()>;
    fn hw_set_periods_min(&mut self, periods: u32) -> NativeResult<()>;
    fn hw_test_access(&mut self, access: Access) -> bool;
    fn hw_set_access(&mut self, access: Access) -> NativeResult<()>;
    fn hw_test_format(&mut self, format: SampleFormat) -> bool;
    fn hw_set_format(&mut self, format: SampleFormat) -> NativeResult<()>;
    fn hw_set_rate_resample(&mut self, resample: bool) -> NativeResult<()>;
    fn hw_set_rate_near(&mut self, rate: u32) -> NativeResult<u32>;
    fn hw_rate_fraction(&mut self) -> NativeResult<RateFraction>;
    fn hw_channels_range(&mut self) -> NativeResult<(u32, u32)>;
    fn hw_set_channels(&mut self, channels: u32) -> NativeResult<()>;
    fn hw_period_size_range(&mut self) -> NativeResult<(Frames, Frames)>;
    fn hw_set_period_size_near(&mut self, frames: Frames) -> NativeResult<Frames>;
    fn hw_set_period_size(&mut self, frames: Frames) -> NativeResult<()>;
    fn hw_set_buffer_size_near(&mut self, frames: Frames) -> NativeResult<Frames>;
    fn hw_commit(&mut self) -> NativeResult<()>;
    /// Period and buffer size of the committed configuration.
    fn hw_committed_sizes(&mut self) -> NativeResult<(Frames, Frames)>;

    fn sw_commit(&mut self, sw: &SwConfig) -> NativeResult<()>;

    fn poll_descriptors(&mut self) -> NativeResult<Vec<PollFd>>;
    fn poll_revents(&mut self, fds: &mut [PollFd]) -> NativeResult<Readiness>;

    fn state(&mut self) -> PcmState;
    fn prepare(&mut self) -> NativeResult<()>;
    fn start(&mut self) -> NativeResult<()>;
    /// Stops immediately, discarding pending frames.
    fn drop_frames(&mut self) -> NativeResult<()>;
    fn drain(&mut self) -> NativeResult<()>;
    fn resume(&mut self) -> NativeResult<()>;
    fn avail_update(&mut self) -> NativeResult<Frames>;
    fn delay(&mut self) -> NativeResult<Frames>;

    /// Links two endpoints so they start and stop together. `Ok(false)`
    /// means linking is not available and the caller must sync by hand.
    fn link(&mut self, other: &mut dyn Pcm) -> NativeResult<bool>;
    fn unlink(&mut self) -> NativeResult<()>;

    /// Runs `f` over the next contiguous mmap window of at most `frames`
    /// frames and commits the count it returns.
    fn mmap_transfer(
        &mut self,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>) -> usize,
    ) -> NativeResult<Frames>;

    fn read_interleaved(&mut self, buf: &mut [u8], frames: Frames) -> NativeResult<Frames>;
    fn write_interleaved(&mut self, buf: &[u8], frames: Frames) -> NativeResult<Frames>;
    /// Channel `c` occupies `buf[c * plane_bytes..]`.
    fn read_planar(&mut self, buf: &mut [u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames>;
    fn write_planar(&mut self, buf: &[u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
