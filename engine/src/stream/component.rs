use nix::libc;
use tracing::{debug, warn};

use super::processor::{BufferProcessor, ChannelLayout, UserArea, UserAreaMut};
use crate::device::plug_name;
use crate::error::{Error, Result};
use crate::format::{SampleFormat, SampleFormatSet};
use crate::hw::{
    Access, ChannelPlane, DeviceOpener, Direction, Frames, HostArea, NativeError, NativeResult,
    Pcm, PollFd,
};

/// What one direction of a stream asks of its device.
#[derive(Debug, Clone, Copy)]
pub struct ComponentRequest<'a> {
    pub device_name: &'a str,
    pub is_plug: bool,
    /// Device minimum for the direction, unknown for host-specific devices.
    pub device_min_channels: Option<u32>,
    pub channels: u32,
    pub format: SampleFormat,
    pub non_interleaved: bool,
    pub direction: Direction,
    pub callback_mode: bool,
}

/// One direction of a stream and the device endpoint serving it.
///
/// The device handle is owned exclusively and closed when the component is
/// dropped, on every path.
#[derive(Debug)]
pub struct StreamComponent {
    pub(super) pcm: Box<dyn Pcm>,
    direction: Direction,
    device_name: String,
    device_is_plug: bool,
    available_formats: SampleFormatSet,
    user_channels: u32,
    host_channels: u32,
    user_format: SampleFormat,
    host_format: SampleFormat,
    user_interleaved: bool,
    pub(super) host_interleaved: bool,
    pub(super) can_mmap: bool,
    pub(super) access: Option<Access>,
    pub(super) period_frames: Frames,
    pub(super) buffer_frames: Frames,
    pub(super) sample_rate: f64,
    pub(super) latency: f64,
    pub(super) poll_fds: Vec<PollFd>,
    staging: Vec<ChannelPlane>,
    rw_buffer: Vec<u8>,
    rw_planes: Vec<ChannelPlane>,
    processor: Option<Box<dyn BufferProcessor>>,
}

fn available_formats(pcm: &mut dyn Pcm) -> Result<SampleFormatSet> {
    pcm.hw_any().map_err(Error::host)?;
    Ok(SampleFormat::ALL
        .into_iter()
        .filter(|format| pcm.hw_test_format(*format))
        .collect())
}

fn no_processor() -> NativeError {
    NativeError::errno(libc::EBADFD)
}

impl StreamComponent {
    pub fn initialize(
        opener: &DeviceOpener<'_>,
        request: &ComponentRequest<'_>,
        force_plug: bool,
    ) -> Result<Self> {
        let name = if force_plug {
            plug_name(request.device_name)
        } else {
            request.device_name.to_string()
        };
        let host_channels = match request.device_min_channels {
            Some(min) => request.channels.max(min),
            None => request.channels,
        };
        debug!(
            "{} '{name}': {} user channels on {host_channels} host channels",
            request.direction, request.channels
        );

        let mut pcm = opener.open(&name, request.direction, true, true)?;
        let available = available_formats(pcm.as_mut())?;
        let Some(host_format) = available.closest(request.format) else {
            warn!(
                "{} '{name}' has no usable sample format, supported: {available}",
                request.direction
            );
            return Err(Error::SampleFormatNotSupported(format!(
                "{} on '{name}', device offers {available}",
                request.format
            )));
        };

        let mut staging = Vec::new();
        if !request.callback_mode && request.non_interleaved {
            staging
                .try_reserve_exact(request.channels as usize)
                .map_err(|_| Error::InsufficientMemory)?;
        }
        let interleaved = !request.non_interleaved;
        Ok(Self {
            pcm,
            direction: request.direction,
            device_is_plug: force_plug || request.is_plug,
            device_name: name,
            available_formats: available,
            user_channels: request.channels,
            host_channels,
            user_format: request.format,
            host_format,
            user_interleaved: interleaved,
            host_interleaved: interleaved,
            can_mmap: false,
            access: None,
            period_frames: 0,
            buffer_frames: 0,
            sample_rate: 0.0,
            latency: 0.0,
            poll_fds: Vec::new(),
            staging,
            rw_buffer: Vec::new(),
            rw_planes: Vec::new(),
            processor: None,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_plug(&self) -> bool {
        self.device_is_plug
    }

    pub fn available_formats(&self) -> SampleFormatSet {
        self.available_formats
    }

    pub fn user_layout(&self) -> ChannelLayout {
        ChannelLayout::new(
            self.user_channels as usize,
            self.user_format,
            self.user_interleaved,
        )
    }

    pub fn host_layout(&self) -> ChannelLayout {
        ChannelLayout::new(
            self.host_channels as usize,
            self.host_format,
            self.host_interleaved,
        )
    }

    pub fn host_channels(&self) -> u32 {
        self.host_channels
    }

    pub fn host_format(&self) -> SampleFormat {
        self.host_format
    }

    pub fn user_interleaved(&self) -> bool {
        self.user_interleaved
    }

    pub fn host_interleaved(&self) -> bool {
        self.host_interleaved
    }

    pub fn can_mmap(&self) -> bool {
        self.can_mmap
    }

    pub fn access(&self) -> Option<Access> {
        self.access
    }

    pub fn period_frames(&self) -> Frames {
        self.period_frames
    }

    pub fn buffer_frames(&self) -> Frames {
        self.buffer_frames
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn poll_fds(&self) -> &[PollFd] {
        &self.poll_fds
    }

    pub(crate) fn pcm_mut(&mut self) -> &mut dyn Pcm {
        self.pcm.as_mut()
    }

    /// Allocates the period-sized staging buffer used when the device does
    /// not offer memory-mapped access.
    pub(super) fn prepare_transfer_buffers(&mut self) -> Result<()> {
        self.rw_buffer.clear();
        self.rw_planes.clear();
        if self.access.is_none_or(Access::is_mmap) {
            return Ok(());
        }
        let layout = self.host_layout();
        let frames = self.period_frames.max(1) as usize;
        let bytes = layout.buffer_bytes(frames);
        self.rw_buffer
            .try_reserve_exact(bytes)
            .map_err(|_| Error::InsufficientMemory)?;
        self.rw_buffer.resize(bytes, self.host_format.silence_byte());
        layout.fill_planes(&mut self.rw_planes, frames);
        Ok(())
    }

    pub fn attach_processor(&mut self, mut processor: Box<dyn BufferProcessor>) -> Result<()> {
        let (user, host) = (self.user_layout(), self.host_layout());
        if !processor.configure(user, host) {
            return Err(Error::SampleFormatNotSupported(format!(
                "{} cannot adapt {} x{} to {} x{}",
                self.direction, user.format, user.channels, host.format, host.channels
            )));
        }
        self.processor = Some(processor);
        Ok(())
    }

    /// Fills `planes` with the user layout of a `frames`-long buffer, using
    /// the staging storage reserved for planar blocking transfers.
    pub(crate) fn take_staging(&mut self, frames: usize) -> Vec<ChannelPlane> {
        let mut planes = std::mem::take(&mut self.staging);
        self.user_layout().fill_planes(&mut planes, frames);
        planes
    }

    pub(crate) fn restore_staging(&mut self, planes: Vec<ChannelPlane>) {
        self.staging = planes;
    }

    /// Moves up to `frames` captured frames into `user` at `user_frame`.
    pub(crate) fn capture_into(
        &mut self,
        user: &mut UserAreaMut<'_>,
        user_frame: usize,
        frames: usize,
    ) -> NativeResult<usize> {
        let sample_bytes = self.host_format.bytes();
        let plane_bytes = self.period_frames.max(1) as usize * sample_bytes;
        let mmap = self.access.is_some_and(Access::is_mmap);
        let interleaved = self.host_interleaved;
        let Self {
            pcm,
            processor,
            rw_buffer,
            rw_planes,
            period_frames,
            ..
        } = self;
        let processor = processor.as_deref_mut().ok_or_else(no_processor)?;
        let mut done = 0;
        while done < frames {
            let moved = if mmap {
                pcm.mmap_transfer((frames - done) as Frames, &mut |area| {
                    let n = area.frames();
                    processor.from_host(area, 0, user, user_frame + done, n);
                    n
                })?
            } else {
                let n = (frames - done).min(*period_frames as usize) as Frames;
                let read = if interleaved {
                    pcm.read_interleaved(rw_buffer, n)
                } else {
                    pcm.read_planar(rw_buffer, plane_bytes, n)
                };
                let got = match read {
                    Err(err) if err.is_again() => 0,
                    other => other?,
                };
                if got > 0 {
                    let area = HostArea::new(rw_buffer, rw_planes, sample_bytes, got as usize)
                        .ok_or_else(|| NativeError::errno(libc::EFAULT))?;
                    processor.from_host(&area, 0, user, user_frame + done, got as usize);
                }
                got
            };
            if moved <= 0 {
                break;
            }
            done += moved as usize;
        }
        Ok(done)
    }

    /// Moves up to `frames` frames from `user` at `user_frame` to the device.
    pub(crate) fn playback_from(
        &mut self,
        user: &UserArea<'_>,
        user_frame: usize,
        frames: usize,
    ) -> NativeResult<usize> {
        let sample_bytes = self.host_format.bytes();
        let plane_bytes = self.period_frames.max(1) as usize * sample_bytes;
        let mmap = self.access.is_some_and(Access::is_mmap);
        let interleaved = self.host_interleaved;
        let Self {
            pcm,
            processor,
            rw_buffer,
            rw_planes,
            period_frames,
            ..
        } = self;
        let processor = processor.as_deref_mut().ok_or_else(no_processor)?;
        let mut done = 0;
        while done < frames {
            let moved = if mmap {
                pcm.mmap_transfer((frames - done) as Frames, &mut |area| {
                    let n = area.frames();
                    processor.to_host(user, user_frame + done, area, 0, n);
                    n
                })?
            } else {
                let n = (frames - done).min(*period_frames as usize);
                {
                    let mut area = HostArea::new(rw_buffer, rw_planes, sample_bytes, n)
                        .ok_or_else(|| NativeError::errno(libc::EFAULT))?;
                    processor.to_host(user, user_frame + done, &mut area, 0, n);
                }
                let written = if interleaved {
                    pcm.write_interleaved(rw_buffer, n as Frames)
                } else {
                    pcm.write_planar(rw_buffer, plane_bytes, n as Frames)
                };
                match written {
                    Err(err) if err.is_again() => 0,
                    other => other?,
                }
            };
            if moved <= 0 {
                break;
            }
            done += moved as usize;
        }
        Ok(done)
    }

    /// Writes up to `frames` frames of silence to a playback device.
    pub(crate) fn write_silence(&mut self, frames: usize) -> NativeResult<usize> {
        let silence = self.host_format.silence_byte();
        let plane_bytes = self.period_frames.max(1) as usize * self.host_format.bytes();
        let mmap = self.access.is_some_and(Access::is_mmap);
        let mut done = 0;
        if !mmap {
            self.rw_buffer.fill(silence);
        }
        while done < frames {
            let moved = if mmap {
                self.pcm.mmap_transfer((frames - done) as Frames, &mut |area| {
                    let n = area.frames();
                    area.fill(0, n, silence);
                    n
                })?
            } else {
                let n = (frames - done).min(self.period_frames.max(1) as usize) as Frames;
                let written = if self.host_interleaved {
                    self.pcm.write_interleaved(&self.rw_buffer, n)
                } else {
                    self.pcm.write_planar(&self.rw_buffer, plane_bytes, n)
                };
                match written {
                    Err(err) if err.is_again() => 0,
                    other => other?,
                }
            };
            if moved <= 0 {
                break;
            }
            done += moved as usize;
        }
        Ok(done)
    }

    /// Fills whatever room the playback ring has with silence.
    pub(crate) fn prime_with_silence(&mut self) -> NativeResult<usize> {
        let room = self.pcm.avail_update()?.max(0) as usize;
        let written = self.write_silence(room)?;
        debug!("{} '{}' primed with {written} silent frames", self.direction, self.device_name);
        Ok(written)
    }
}
