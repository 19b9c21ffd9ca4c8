//! Runtime-resolved binding: `libasound` is opened with `dlopen` and every
//! entry point is looked up once into a symbol table.

use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_int, c_long, c_uint, c_ulong, c_ushort, c_void};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use libloading::{Library, Symbol};
use nix::libc;
use tracing::debug;

use super::area::{ChannelPlane, HostArea};
use super::{
    Access, Direction, Frames, NativeError, NativeResult, Pcm, PcmState, PollFd, Provider,
    RateFraction, Readiness, SwConfig, Threshold,
};
use crate::error::{Error, Result};
use crate::format::SampleFormat;

pub const DEFAULT_LIBRARY: &str = "libasound.so.2";

#[repr(C)]
struct RawPcm {
    _private: [u8; 0],
}

#[repr(C)]
struct RawHwParams {
    _private: [u8; 0],
}

#[repr(C)]
struct RawSwParams {
    _private: [u8; 0],
}

#[repr(C)]
struct RawChannelArea {
    addr: *mut c_void,
    first: c_uint,
    step: c_uint,
}

type Uframes = c_ulong;
type Sframes = c_long;
type PcmFn = unsafe extern "C" fn(*mut RawPcm) -> c_int;
type HwFn = unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams) -> c_int;
type HwSetIntFn = unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, c_int) -> c_int;
type HwSetUintFn = unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, c_uint) -> c_int;
type HwNearUintFn = unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, *mut c_uint, *mut c_int) -> c_int;
type HwGetUintFn = unsafe extern "C" fn(*const RawHwParams, *mut c_uint) -> c_int;
type HwGetFramesDirFn = unsafe extern "C" fn(*const RawHwParams, *mut Uframes, *mut c_int) -> c_int;
type SwSetFn = unsafe extern "C" fn(*mut RawPcm, *mut RawSwParams, Uframes) -> c_int;
type TransferFn = unsafe extern "C" fn(*mut RawPcm, *mut c_void, Uframes) -> Sframes;
type PlanarFn = unsafe extern "C" fn(*mut RawPcm, *mut *mut c_void, Uframes) -> Sframes;

const STREAM_PLAYBACK: c_int = 0;
const STREAM_CAPTURE: c_int = 1;
const OPEN_NONBLOCK: c_int = 1;
const TSTAMP_NONE: c_int = 0;
const TSTAMP_ENABLE: c_int = 1;

struct Symbols {
    open: unsafe extern "C" fn(*mut *mut RawPcm, *const c_char, c_int, c_int) -> c_int,
    close: PcmFn,
    strerror: unsafe extern "C" fn(c_int) -> *const c_char,
    version: unsafe extern "C" fn() -> *const c_char,
    hw_malloc: unsafe extern "C" fn(*mut *mut RawHwParams) -> c_int,
    hw_free: unsafe extern "C" fn(*mut RawHwParams),
    hw_any: HwFn,
    hw_set_periods_integer: HwFn,
    hw_set_periods_min: HwNearUintFn,
    hw_test_access: HwSetIntFn,
    hw_set_access: HwSetIntFn,
    hw_test_format: HwSetIntFn,
    hw_set_format: HwSetIntFn,
    hw_set_rate_resample: HwSetUintFn,
    hw_set_rate_near: HwNearUintFn,
    hw_get_rate_numden: unsafe extern "C" fn(*const RawHwParams, *mut c_uint, *mut c_uint) -> c_int,
    hw_get_channels_min: HwGetUintFn,
    hw_get_channels_max: HwGetUintFn,
    hw_set_channels: HwSetUintFn,
    hw_get_period_size_min: HwGetFramesDirFn,
    hw_get_period_size_max: HwGetFramesDirFn,
    hw_set_period_size_near:
        unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, *mut Uframes, *mut c_int) -> c_int,
    hw_set_period_size: unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, Uframes, c_int) -> c_int,
    hw_set_buffer_size_near: unsafe extern "C" fn(*mut RawPcm, *mut RawHwParams, *mut Uframes) -> c_int,
    hw_params: HwFn,
    hw_params_current: HwFn,
    hw_get_period_size: HwGetFramesDirFn,
    hw_get_buffer_size: unsafe extern "C" fn(*const RawHwParams, *mut Uframes) -> c_int,
    sw_malloc: unsafe extern "C" fn(*mut *mut RawSwParams) -> c_int,
    sw_free: unsafe extern "C" fn(*mut RawSwParams),
    sw_current: unsafe extern "C" fn(*mut RawPcm, *mut RawSwParams) -> c_int,
    sw_get_boundary: unsafe extern "C" fn(*const RawSwParams, *mut Uframes) -> c_int,
    sw_set_start_threshold: SwSetFn,
    sw_set_stop_threshold: SwSetFn,
    sw_set_silence_threshold: SwSetFn,
    sw_set_silence_size: SwSetFn,
    sw_set_avail_min: SwSetFn,
    sw_set_tstamp_mode: unsafe extern "C" fn(*mut RawPcm, *mut RawSwParams, c_int) -> c_int,
    sw_params: unsafe extern "C" fn(*mut RawPcm, *mut RawSwParams) -> c_int,
    poll_count: PcmFn,
    poll_fill: unsafe extern "C" fn(*mut RawPcm, *mut PollFd, c_uint) -> c_int,
    poll_revents: unsafe extern "C" fn(*mut RawPcm, *mut PollFd, c_uint, *mut c_ushort) -> c_int,
    state: PcmFn,
    prepare: PcmFn,
    start: PcmFn,
    drop: PcmFn,
    drain: PcmFn,
    resume: PcmFn,
    avail_update: unsafe extern "C" fn(*mut RawPcm) -> Sframes,
    delay: unsafe extern "C" fn(*mut RawPcm, *mut Sframes) -> c_int,
    link: unsafe extern "C" fn(*mut RawPcm, *mut RawPcm) -> c_int,
    unlink: PcmFn,
    mmap_begin: unsafe extern "C" fn(
        *mut RawPcm,
        *mut *const RawChannelArea,
        *mut Uframes,
        *mut Uframes,
    ) -> c_int,
    mmap_commit: unsafe extern "C" fn(*mut RawPcm, Uframes, Uframes) -> Sframes,
    readi: TransferFn,
    writei: TransferFn,
    readn: PlanarFn,
    writen: PlanarFn,
}

/// # Safety
///
/// `T` must be the exact function pointer type of the exported symbol.
unsafe fn resolve<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let symbol_name = format!("{name}\0");
    // SAFETY: forwarded to the caller.
    let symbol: Symbol<T> = unsafe { lib.get(symbol_name.as_bytes()) }
        .map_err(|e| Error::HostApiNotFound(format!("missing symbol {name}: {e}")))?;
    Ok(*symbol)
}

macro_rules! symbols {
    ($lib:expr, { $($field:ident => $name:literal),* $(,)? }) => {
        Symbols {
            // SAFETY: field types mirror the alsa-lib prototypes.
            $($field: unsafe { resolve($lib, $name)? },)*
        }
    };
}

struct AlsaLib {
    symbols: Symbols,
    _library: Library,
}

impl AlsaLib {
    fn error(&self, rc: c_int) -> NativeError {
        // SAFETY: snd_strerror returns a static string for any code.
        let message = unsafe { CStr::from_ptr((self.symbols.strerror)(rc)) };
        NativeError::new(rc, message.to_string_lossy())
    }

    fn check(&self, rc: c_int) -> NativeResult<c_int> {
        if rc < 0 { Err(self.error(rc)) } else { Ok(rc) }
    }

    fn check_frames(&self, frames: Sframes) -> NativeResult<Frames> {
        if frames < 0 {
            Err(self.error(frames as c_int))
        } else {
            Ok(frames as Frames)
        }
    }
}

pub struct DynamicProvider {
    lib: Arc<AlsaLib>,
    path: String,
}

impl std::fmt::Debug for DynamicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicProvider")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DynamicProvider {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DEFAULT_LIBRARY.to_string());
        // SAFETY: loading alsa-lib runs no initialisers with preconditions.
        let library = unsafe { Library::new(&path) }
            .map_err(|e| Error::HostApiNotFound(format!("{path}: {e}")))?;
        let symbols = symbols!(&library, {
            open => "snd_pcm_open",
            close => "snd_pcm_close",
            strerror => "snd_strerror",
            version => "snd_asoundlib_version",
            hw_malloc => "snd_pcm_hw_params_malloc",
            hw_free => "snd_pcm_hw_params_free",
            hw_any => "snd_pcm_hw_params_any",
            hw_set_periods_integer => "snd_pcm_hw_params_set_periods_integer",
            hw_set_periods_min => "snd_pcm_hw_params_set_periods_min",
            hw_test_access => "snd_pcm_hw_params_test_access",
            hw_set_access => "snd_pcm_hw_params_set_access",
            hw_test_format => "snd_pcm_hw_params_test_format",
            hw_set_format => "snd_pcm_hw_params_set_format",
            hw_set_rate_resample => "snd_pcm_hw_params_set_rate_resample",
            hw_set_rate_near => "snd_pcm_hw_params_set_rate_near",
            hw_get_rate_numden => "snd_pcm_hw_params_get_rate_numden",
            hw_get_channels_min => "snd_pcm_hw_params_get_channels_min",
            hw_get_channels_max => "snd_pcm_hw_params_get_channels_max",
            hw_set_channels => "snd_pcm_hw_params_set_channels",
            hw_get_period_size_min => "snd_pcm_hw_params_get_period_size_min",
            hw_get_period_size_max => "snd_pcm_hw_params_get_period_size_max",
            hw_set_period_size_near => "snd_pcm_hw_params_set_period_size_near",
            hw_set_period_size => "snd_pcm_hw_params_set_period_size",
            hw_set_buffer_size_near => "snd_pcm_hw_params_set_buffer_size_near",
            hw_params => "snd_pcm_hw_params",
            hw_params_current => "snd_pcm_hw_params_current",
            hw_get_period_size => "snd_pcm_hw_params_get_period_size",
            hw_get_buffer_size => "snd_pcm_hw_params_get_buffer_size",
            sw_malloc => "snd_pcm_sw_params_malloc",
            sw_free => "snd_pcm_sw_params_free",
            sw_current => "snd_pcm_sw_params_current",
            sw_get_boundary => "snd_pcm_sw_params_get_boundary",
            sw_set_start_threshold => "snd_pcm_sw_params_set_start_threshold",
            sw_set_stop_threshold => "snd_pcm_sw_params_set_stop_threshold",
            sw_set_silence_threshold => "snd_pcm_sw_params_set_silence_threshold",
            sw_set_silence_size => "snd_pcm_sw_params_set_silence_size",
            sw_set_avail_min => "snd_pcm_sw_params_set_avail_min",
            sw_set_tstamp_mode => "snd_pcm_sw_params_set_tstamp_mode",
            sw_params => "snd_pcm_sw_params",
            poll_count => "snd_pcm_poll_descriptors_count",
            poll_fill => "snd_pcm_poll_descriptors",
            poll_revents => "snd_pcm_poll_descriptors_revents",
            state => "snd_pcm_state",
            prepare => "snd_pcm_prepare",
            start => "snd_pcm_start",
            drop => "snd_pcm_drop",
            drain => "snd_pcm_drain",
            resume => "snd_pcm_resume",
            avail_update => "snd_pcm_avail_update",
            delay => "snd_pcm_delay",
            link => "snd_pcm_link",
            unlink => "snd_pcm_unlink",
            mmap_begin => "snd_pcm_mmap_begin",
            mmap_commit => "snd_pcm_mmap_commit",
            readi => "snd_pcm_readi",
            writei => "snd_pcm_writei",
            readn => "snd_pcm_readn",
            writen => "snd_pcm_writen",
        });
        debug!("resolved alsa-lib entry points from {path}");
        Ok(Self {
            lib: Arc::new(AlsaLib {
                symbols,
                _library: library,
            }),
            path,
        })
    }
}

impl Provider for DynamicProvider {
    fn label(&self) -> &'static str {
        "ALSA (dynamic)"
    }

    fn version(&self) -> Option<String> {
        // SAFETY: returns a pointer to a static version string.
        let version = unsafe { (self.lib.symbols.version)() };
        if version.is_null() {
            return None;
        }
        // SAFETY: non-null, NUL-terminated, static.
        Some(unsafe { CStr::from_ptr(version) }.to_string_lossy().into_owned())
    }

    fn open(&self, name: &str, direction: Direction, nonblock: bool) -> NativeResult<Box<dyn Pcm>> {
        let c_name = CString::new(name).map_err(|_| NativeError::errno(libc::EINVAL))?;
        let stream = match direction {
            Direction::Capture => STREAM_CAPTURE,
            Direction::Playback => STREAM_PLAYBACK,
        };
        let mode = if nonblock { OPEN_NONBLOCK } else { 0 };
        let sym = &self.lib.symbols;
        let mut pcm = ptr::null_mut();
        // SAFETY: valid out-pointer and NUL-terminated name.
        self.lib
            .check(unsafe { (sym.open)(&mut pcm, c_name.as_ptr(), stream, mode) })?;
        let mut raw = DynPcm {
            lib: self.lib.clone(),
            pcm,
            hw: ptr::null_mut(),
            sw: ptr::null_mut(),
            name: name.to_string(),
            direction,
            format: None,
            access: None,
            layout: None,
            planes: Vec::new(),
            channel_ptrs: Vec::new(),
        };
        // SAFETY: out-pointers are valid; `raw` frees them on drop.
        raw.lib.check(unsafe { (sym.hw_malloc)(&mut raw.hw) })?;
        raw.lib.check(unsafe { (sym.sw_malloc)(&mut raw.sw) })?;
        Ok(Box::new(raw))
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    channels: usize,
    sample_bytes: usize,
    access: Access,
}

pub struct DynPcm {
    lib: Arc<AlsaLib>,
    pcm: *mut RawPcm,
    hw: *mut RawHwParams,
    sw: *mut RawSwParams,
    name: String,
    direction: Direction,
    format: Option<SampleFormat>,
    access: Option<Access>,
    layout: Option<Layout>,
    planes: Vec<ChannelPlane>,
    channel_ptrs: Vec<*mut c_void>,
}

impl std::fmt::Debug for DynPcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynPcm")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

// SAFETY: the handle and parameter blocks are owned exclusively by this value.
unsafe impl Send for DynPcm {}

impl Drop for DynPcm {
    fn drop(&mut self) {
        let sym = &self.lib.symbols;
        // SAFETY: each pointer was allocated by alsa-lib and is released once.
        unsafe {
            if !self.sw.is_null() {
                (sym.sw_free)(self.sw);
            }
            if !self.hw.is_null() {
                (sym.hw_free)(self.hw);
            }
            if !self.pcm.is_null() {
                (sym.close)(self.pcm);
            }
        }
    }
}

fn access_code(access: Access) -> c_int {
    match access {
        Access::MmapInterleaved => 0,
        Access::MmapNonInterleaved => 1,
        Access::RwInterleaved => 3,
        Access::RwNonInterleaved => 4,
    }
}

fn format_code(format: SampleFormat) -> c_int {
    let little = cfg!(target_endian = "little");
    match format {
        SampleFormat::Int8 => 0,
        SampleFormat::UInt8 => 1,
        SampleFormat::Int16 => if little { 2 } else { 3 },
        SampleFormat::Int32 => if little { 10 } else { 11 },
        SampleFormat::Float32 => if little { 14 } else { 15 },
        SampleFormat::Int24 => if little { 32 } else { 33 },
    }
}

fn state_from_code(code: c_int) -> PcmState {
    match code {
        0 => PcmState::Open,
        1 => PcmState::Setup,
        2 => PcmState::Prepared,
        3 => PcmState::Running,
        4 => PcmState::XRun,
        5 => PcmState::Draining,
        6 => PcmState::Paused,
        7 => PcmState::Suspended,
        _ => PcmState::Disconnected,
    }
}

impl DynPcm {
    fn sym(&self) -> &Symbols {
        &self.lib.symbols
    }

    fn call(&self, rc: c_int) -> NativeResult<()> {
        self.lib.check(rc).map(drop)
    }

    fn layout(&self) -> NativeResult<Layout> {
        self.layout.ok_or_else(|| NativeError::errno(libc::EBADFD))
    }

    fn require_access(&self, access: Access) -> NativeResult<Layout> {
        let layout = self.layout()?;
        if layout.access != access {
            return Err(NativeError::errno(libc::EINVAL));
        }
        Ok(layout)
    }

    fn stage_planes(&mut self, base: *mut u8, plane_bytes: usize, len: usize, frames: Frames) -> NativeResult<()> {
        let layout = self.layout()?;
        if layout.channels * plane_bytes > len || frames.max(0) as usize * layout.sample_bytes > plane_bytes {
            return Err(NativeError::errno(libc::EINVAL));
        }
        self.channel_ptrs.clear();
        self.channel_ptrs
            .extend((0..layout.channels).map(|c| base.wrapping_add(c * plane_bytes) as *mut c_void));
        Ok(())
    }
}

impl Pcm for DynPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn hw_any(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` and `hw` are live for the lifetime of `self`.
        self.call(unsafe { (self.sym().hw_any)(self.pcm, self.hw) })
    }

    fn hw_set_periods_integer(&mut self) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_periods_integer)(self.pcm, self.hw) })
    }

    fn hw_set_periods_min(&mut self, periods: u32) -> NativeResult<()> {
        let mut value = periods;
        let mut dir = 0;
        // SAFETY: as above, with valid out-pointers.
        self.call(unsafe { (self.sym().hw_set_periods_min)(self.pcm, self.hw, &mut value, &mut dir) })
    }

    fn hw_test_access(&mut self, access: Access) -> bool {
        // SAFETY: as above.
        unsafe { (self.sym().hw_test_access)(self.pcm, self.hw, access_code(access)) == 0 }
    }

    fn hw_set_access(&mut self, access: Access) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_access)(self.pcm, self.hw, access_code(access)) })?;
        self.access = Some(access);
        Ok(())
    }

    fn hw_test_format(&mut self, format: SampleFormat) -> bool {
        // SAFETY: as above.
        unsafe { (self.sym().hw_test_format)(self.pcm, self.hw, format_code(format)) == 0 }
    }

    fn hw_set_format(&mut self, format: SampleFormat) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_format)(self.pcm, self.hw, format_code(format)) })?;
        self.format = Some(format);
        Ok(())
    }

    fn hw_set_rate_resample(&mut self, resample: bool) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_rate_resample)(self.pcm, self.hw, c_uint::from(resample)) })
    }

    fn hw_set_rate_near(&mut self, rate: u32) -> NativeResult<u32> {
        let mut value = rate;
        let mut dir = 0;
        // SAFETY: as above, with valid out-pointers.
        self.call(unsafe { (self.sym().hw_set_rate_near)(self.pcm, self.hw, &mut value, &mut dir) })?;
        Ok(value)
    }

    fn hw_rate_fraction(&mut self) -> NativeResult<RateFraction> {
        let (mut num, mut den) = (0, 0);
        // SAFETY: as above, with valid out-pointers.
        self.call(unsafe { (self.sym().hw_get_rate_numden)(self.hw, &mut num, &mut den) })?;
        Ok(RateFraction { num, den })
    }

    fn hw_channels_range(&mut self) -> NativeResult<(u32, u32)> {
        let (mut min, mut max) = (0, 0);
        // SAFETY: as above, with valid out-pointers.
        unsafe {
            self.call((self.sym().hw_get_channels_min)(self.hw, &mut min))?;
            self.call((self.sym().hw_get_channels_max)(self.hw, &mut max))?;
        }
        Ok((min, max))
    }

    fn hw_set_channels(&mut self, channels: u32) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_channels)(self.pcm, self.hw, channels) })
    }

    fn hw_period_size_range(&mut self) -> NativeResult<(Frames, Frames)> {
        let (mut min, mut max): (Uframes, Uframes) = (0, 0);
        let mut dir = 0;
        // SAFETY: as above, with valid out-pointers.
        unsafe {
            self.call((self.sym().hw_get_period_size_min)(self.hw, &mut min, &mut dir))?;
            self.call((self.sym().hw_get_period_size_max)(self.hw, &mut max, &mut dir))?;
        }
        Ok((min as Frames, max.min(Frames::MAX as Uframes) as Frames))
    }

    fn hw_set_period_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        let mut value = frames.max(0) as Uframes;
        let mut dir = 0;
        // SAFETY: as above, with valid out-pointers.
        self.call(unsafe { (self.sym().hw_set_period_size_near)(self.pcm, self.hw, &mut value, &mut dir) })?;
        Ok(value as Frames)
    }

    fn hw_set_period_size(&mut self, frames: Frames) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_set_period_size)(self.pcm, self.hw, frames.max(0) as Uframes, 0) })
    }

    fn hw_set_buffer_size_near(&mut self, frames: Frames) -> NativeResult<Frames> {
        let mut value = frames.max(0) as Uframes;
        // SAFETY: as above, with a valid out-pointer.
        self.call(unsafe { (self.sym().hw_set_buffer_size_near)(self.pcm, self.hw, &mut value) })?;
        Ok(value as Frames)
    }

    fn hw_commit(&mut self) -> NativeResult<()> {
        // SAFETY: as above.
        self.call(unsafe { (self.sym().hw_params)(self.pcm, self.hw) })?;
        let mut channels = 0;
        // SAFETY: `hw` now holds the installed configuration.
        self.call(unsafe { (self.sym().hw_get_channels_min)(self.hw, &mut channels) })?;
        let access = self.access.ok_or_else(|| NativeError::errno(libc::EBADFD))?;
        let sample_bytes = self
            .format
            .map(SampleFormat::bytes)
            .ok_or_else(|| NativeError::errno(libc::EBADFD))?;
        self.layout = Some(Layout {
            channels: channels as usize,
            sample_bytes,
            access,
        });
        debug!("{} '{}' committed {access:?} x{channels}", self.direction, self.name);
        Ok(())
    }

    fn hw_committed_sizes(&mut self) -> NativeResult<(Frames, Frames)> {
        let (mut period, mut buffer): (Uframes, Uframes) = (0, 0);
        let mut dir = 0;
        // SAFETY: `hw` is refreshed from the device before reading.
        unsafe {
            self.call((self.sym().hw_params_current)(self.pcm, self.hw))?;
            self.call((self.sym().hw_get_period_size)(self.hw, &mut period, &mut dir))?;
            self.call((self.sym().hw_get_buffer_size)(self.hw, &mut buffer))?;
        }
        Ok((period as Frames, buffer as Frames))
    }

    fn sw_commit(&mut self, sw: &SwConfig) -> NativeResult<()> {
        let sym = &self.lib.symbols;
        let (pcm, swp) = (self.pcm, self.sw);
        let mut boundary: Uframes = 0;
        // SAFETY: `pcm` and `sw` are live; out-pointer is valid.
        unsafe {
            self.call((sym.sw_current)(pcm, swp))?;
            self.call((sym.sw_get_boundary)(swp, &mut boundary))?;
        }
        let resolve = |t: Threshold| match t {
            Threshold::Frames(frames) => frames.max(0) as Uframes,
            Threshold::Boundary => boundary,
        };
        let tstamp = if sw.timestamps { TSTAMP_ENABLE } else { TSTAMP_NONE };
        // SAFETY: as above.
        unsafe {
            self.call((sym.sw_set_start_threshold)(pcm, swp, resolve(sw.start_threshold)))?;
            self.call((sym.sw_set_stop_threshold)(pcm, swp, resolve(sw.stop_threshold)))?;
            self.call((sym.sw_set_silence_threshold)(pcm, swp, sw.silence_threshold.max(0) as Uframes))?;
            self.call((sym.sw_set_silence_size)(pcm, swp, resolve(sw.silence_size)))?;
            self.call((sym.sw_set_avail_min)(pcm, swp, sw.avail_min.max(1) as Uframes))?;
            self.call((sym.sw_set_tstamp_mode)(pcm, swp, tstamp))?;
            self.call((sym.sw_params)(pcm, swp))
        }
    }

    fn poll_descriptors(&mut self) -> NativeResult<Vec<PollFd>> {
        // SAFETY: `pcm` is live.
        let count = self.lib.check(unsafe { (self.sym().poll_count)(self.pcm) })? as usize;
        let mut fds = vec![
            PollFd {
                fd: -1,
                events: 0,
                revents: 0,
            };
            count
        ];
        // SAFETY: `fds` has room for `count` entries.
        let filled = self
            .lib
            .check(unsafe { (self.sym().poll_fill)(self.pcm, fds.as_mut_ptr(), count as c_uint) })?;
        fds.truncate(filled as usize);
        Ok(fds)
    }

    fn poll_revents(&mut self, fds: &mut [PollFd]) -> NativeResult<Readiness> {
        let mut revents: c_ushort = 0;
        // SAFETY: `fds` is a valid array of `fds.len()` entries.
        self.call(unsafe {
            (self.sym().poll_revents)(self.pcm, fds.as_mut_ptr(), fds.len() as c_uint, &mut revents)
        })?;
        let revents = revents as i16;
        Ok(Readiness {
            ready: revents & (libc::POLLIN | libc::POLLOUT) != 0,
            error: revents & libc::POLLERR != 0,
        })
    }

    fn state(&mut self) -> PcmState {
        // SAFETY: `pcm` is live.
        state_from_code(unsafe { (self.sym().state)(self.pcm) })
    }

    fn prepare(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        self.call(unsafe { (self.sym().prepare)(self.pcm) })
    }

    fn start(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        self.call(unsafe { (self.sym().start)(self.pcm) })
    }

    fn drop_frames(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        self.call(unsafe { (self.sym().drop)(self.pcm) })
    }

    fn drain(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        match self.call(unsafe { (self.sym().drain)(self.pcm) }) {
            Err(err) if err.is_again() => Ok(()),
            other => other,
        }
    }

    fn resume(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        self.call(unsafe { (self.sym().resume)(self.pcm) })
    }

    fn avail_update(&mut self) -> NativeResult<Frames> {
        // SAFETY: `pcm` is live.
        let frames = unsafe { (self.sym().avail_update)(self.pcm) };
        self.lib.check_frames(frames)
    }

    fn delay(&mut self) -> NativeResult<Frames> {
        let mut frames: Sframes = 0;
        // SAFETY: `pcm` is live; out-pointer is valid.
        self.call(unsafe { (self.sym().delay)(self.pcm, &mut frames) })?;
        Ok(frames as Frames)
    }

    fn link(&mut self, other: &mut dyn Pcm) -> NativeResult<bool> {
        let Some(other) = other.as_any().downcast_ref::<DynPcm>() else {
            return Ok(false);
        };
        // SAFETY: both handles are live.
        let rc = unsafe { (self.sym().link)(self.pcm, other.pcm) };
        if rc < 0 {
            debug!("linking '{}' with '{}' failed: {}", self.name, other.name, self.lib.error(rc));
            return Ok(false);
        }
        Ok(true)
    }

    fn unlink(&mut self) -> NativeResult<()> {
        // SAFETY: `pcm` is live.
        self.call(unsafe { (self.sym().unlink)(self.pcm) })
    }

    fn mmap_transfer(
        &mut self,
        frames: Frames,
        f: &mut dyn FnMut(&mut HostArea<'_>) -> usize,
    ) -> NativeResult<Frames> {
        let layout = self.layout()?;
        if !layout.access.is_mmap() {
            return Err(NativeError::errno(libc::EINVAL));
        }
        let mut areas: *const RawChannelArea = ptr::null();
        let mut offset: Uframes = 0;
        let mut count = frames.max(0) as Uframes;
        // SAFETY: out-pointers are valid; `pcm` is live.
        self.call(unsafe { (self.sym().mmap_begin)(self.pcm, &mut areas, &mut offset, &mut count) })?;
        if count == 0 || areas.is_null() {
            // SAFETY: closes the empty window opened above.
            let committed = unsafe { (self.sym().mmap_commit)(self.pcm, offset, 0) };
            return self.lib.check_frames(committed);
        }
        // SAFETY: alsa-lib hands out one area per channel.
        let areas = unsafe { std::slice::from_raw_parts(areas, layout.channels) };
        let first_byte = |a: &RawChannelArea| {
            a.addr as usize + (a.first as usize + offset as usize * a.step as usize) / 8
        };
        let base = areas.iter().map(first_byte).min().unwrap_or(0);
        self.planes.clear();
        self.planes.extend(areas.iter().map(|a| ChannelPlane {
            offset: first_byte(a) - base,
            step: a.step as usize / 8,
        }));
        let used = {
            // SAFETY: every plane addresses `count` frames inside the mmap
            // window that stays valid until the commit below.
            let mut area = unsafe {
                HostArea::from_raw(base as *mut u8, &self.planes, layout.sample_bytes, count as usize)
            };
            f(&mut area).min(count as usize)
        };
        // SAFETY: commits the window opened above.
        let committed = unsafe { (self.sym().mmap_commit)(self.pcm, offset, used as Uframes) };
        self.lib.check_frames(committed)
    }

    fn read_interleaved(&mut self, buf: &mut [u8], frames: Frames) -> NativeResult<Frames> {
        let layout = self.require_access(Access::RwInterleaved)?;
        let frames = frames.clamp(0, (buf.len() / (layout.channels * layout.sample_bytes)) as Frames);
        // SAFETY: `buf` holds at least `frames` frames.
        let moved = unsafe { (self.sym().readi)(self.pcm, buf.as_mut_ptr().cast(), frames as Uframes) };
        self.lib.check_frames(moved)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: Frames) -> NativeResult<Frames> {
        let layout = self.require_access(Access::RwInterleaved)?;
        let frames = frames.clamp(0, (buf.len() / (layout.channels * layout.sample_bytes)) as Frames);
        // SAFETY: alsa-lib only reads from the buffer.
        let moved = unsafe { (self.sym().writei)(self.pcm, buf.as_ptr() as *mut c_void, frames as Uframes) };
        self.lib.check_frames(moved)
    }

    fn read_planar(&mut self, buf: &mut [u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames> {
        self.require_access(Access::RwNonInterleaved)?;
        self.stage_planes(buf.as_mut_ptr(), plane_bytes, buf.len(), frames)?;
        // SAFETY: each staged pointer addresses `frames` samples inside `buf`.
        let moved = unsafe { (self.sym().readn)(self.pcm, self.channel_ptrs.as_mut_ptr(), frames as Uframes) };
        self.lib.check_frames(moved)
    }

    fn write_planar(&mut self, buf: &[u8], plane_bytes: usize, frames: Frames) -> NativeResult<Frames> {
        self.require_access(Access::RwNonInterleaved)?;
        self.stage_planes(buf.as_ptr() as *mut u8, plane_bytes, buf.len(), frames)?;
        // SAFETY: alsa-lib only reads through the staged pointers.
        let moved = unsafe { (self.sym().writen)(self.pcm, self.channel_ptrs.as_mut_ptr(), frames as Uframes) };
        self.lib.check_frames(moved)
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

    #[test]
    fn missing_library_is_reported() {
        let err = DynamicProvider::load(Some(Path::new("/nonexistent/libasound.so.2"))).unwrap_err();
        assert!(matches!(err, Error::HostApiNotFound(_)));
    }

    #[test]
    fn codes_match_alsa_lib_enums() {
        assert_eq!(access_code(Access::RwInterleaved), 3);
        assert_eq!(state_from_code(4), PcmState::XRun);
        assert_eq!(format_code(SampleFormat::UInt8), 1);
    }
}
