//! Moves frames between user buffers and host areas.
//!
//! User buffers are single byte slices. Interleaved buffers hold whole
//! frames back to back; non-interleaved buffers hold one block per channel,
//! channel `c` starting at `c * frames * sample_bytes`.

use std::fmt;

use crate::format::SampleFormat;
use crate::hw::{ChannelPlane, HostArea};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub channels: usize,
    pub format: SampleFormat,
    pub interleaved: bool,
}

impl ChannelLayout {
    pub const fn new(channels: usize, format: SampleFormat, interleaved: bool) -> Self {
        Self {
            channels,
            format,
            interleaved,
        }
    }

    pub const fn frame_bytes(&self) -> usize {
        self.channels * self.format.bytes()
    }

    pub const fn buffer_bytes(&self, frames: usize) -> usize {
        self.frame_bytes() * frames
    }

    /// Fills `planes` with the channel placement of a `frames`-long buffer.
    pub fn fill_planes(&self, planes: &mut Vec<ChannelPlane>, frames: usize) {
        let sample_bytes = self.format.bytes();
        planes.clear();
        planes.extend((0..self.channels).map(|c| {
            if self.interleaved {
                ChannelPlane::interleaved(c, self.channels, sample_bytes)
            } else {
                ChannelPlane::planar(c, frames * sample_bytes, sample_bytes)
            }
        }));
    }
}

fn fits(len: usize, planes: &[ChannelPlane], sample_bytes: usize, frames: usize) -> bool {
    frames == 0
        || planes
            .iter()
            .all(|p| p.offset + (frames - 1) * p.step + sample_bytes <= len)
}

/// Read-only view of a user buffer.
#[derive(Debug, Clone, Copy)]
pub struct UserArea<'a> {
    buf: &'a [u8],
    planes: &'a [ChannelPlane],
    sample_bytes: usize,
    frames: usize,
}

impl<'a> UserArea<'a> {
    pub fn new(
        buf: &'a [u8],
        planes: &'a [ChannelPlane],
        sample_bytes: usize,
        frames: usize,
    ) -> Option<Self> {
        fits(buf.len(), planes, sample_bytes, frames).then_some(Self {
            buf,
            planes,
            sample_bytes,
            frames,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn sample(&self, channel: usize, frame: usize) -> &[u8] {
        let at = self.planes[channel].offset + frame * self.planes[channel].step;
        &self.buf[at..at + self.sample_bytes]
    }
}

/// Writable view of a user buffer.
#[derive(Debug)]
pub struct UserAreaMut<'a> {
    buf: &'a mut [u8],
    planes: &'a [ChannelPlane],
    sample_bytes: usize,
    frames: usize,
}

impl<'a> UserAreaMut<'a> {
    pub fn new(
        buf: &'a mut [u8],
        planes: &'a [ChannelPlane],
        sample_bytes: usize,
        frames: usize,
    ) -> Option<Self> {
        fits(buf.len(), planes, sample_bytes, frames).then_some(Self {
            buf,
            planes,
            sample_bytes,
            frames,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn sample_mut(&mut self, channel: usize, frame: usize) -> &mut [u8] {
        let at = self.planes[channel].offset + frame * self.planes[channel].step;
        &mut self.buf[at..at + self.sample_bytes]
    }
}

/// Copies frames between the user layout and the host layout of one
/// direction. Sample conversion, if any, belongs to the implementation.
pub trait BufferProcessor: Send + fmt::Debug {
    /// Called once after negotiation. Returning false rejects the pairing.
    fn configure(&mut self, user: ChannelLayout, host: ChannelLayout) -> bool;

    fn from_host(
        &mut self,
        host: &HostArea<'_>,
        host_frame: usize,
        user: &mut UserAreaMut<'_>,
        user_frame: usize,
        frames: usize,
    );

    fn to_host(
        &mut self,
        user: &UserArea<'_>,
        user_frame: usize,
        host: &mut HostArea<'_>,
        host_frame: usize,
        frames: usize,
    );
}

pub type ProcessorFactory = fn() -> Box<dyn BufferProcessor>;

pub fn adapting_processor() -> Box<dyn BufferProcessor> {
    Box::new(AdaptingProcessor::default())
}

/// Channel-count and interleave adaptation between identical sample formats.
///
/// Surplus host capture channels are skipped; surplus host playback channels
/// are written with silence.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptingProcessor {
    user_channels: usize,
    silence: u8,
}

impl BufferProcessor for AdaptingProcessor {
    fn configure(&mut self, user: ChannelLayout, host: ChannelLayout) -> bool {
        if user.format != host.format || user.channels == 0 || user.channels > host.channels {
            return false;
        }
        self.user_channels = user.channels;
        self.silence = host.format.silence_byte();
        true
    }

    fn from_host(
        &mut self,
        host: &HostArea<'_>,
        host_frame: usize,
        user: &mut UserAreaMut<'_>,
        user_frame: usize,
        frames: usize,
    ) {
        let channels = self.user_channels.min(user.channels());
        for frame in 0..frames {
            for c in 0..channels {
                user.sample_mut(c, user_frame + frame)
                    .copy_from_slice(host.sample(c, host_frame + frame));
            }
        }
    }

    fn to_host(
        &mut self,
        user: &UserArea<'_>,
        user_frame: usize,
        host: &mut HostArea<'_>,
        host_frame: usize,
        frames: usize,
    ) {
        let channels = self.user_channels.min(user.channels());
        for frame in 0..frames {
            for c in 0..host.channels() {
                let dst = host.sample_mut(c, host_frame + frame);
                if c < channels {
                    dst.copy_from_slice(user.sample(c, user_frame + frame));
                } else {
                    dst.fill(self.silence);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::area::fill_interleaved_planes;

    fn layout(channels: usize, interleaved: bool) -> ChannelLayout {
        ChannelLayout::new(channels, SampleFormat::Int16, interleaved)
    }

    #[test]
    fn refuses_format_conversion_and_channel_upmix() {
        let mut p = AdaptingProcessor::default();
        assert!(!p.configure(
            layout(2, true),
            ChannelLayout::new(2, SampleFormat::Int32, true)
        ));
        assert!(!p.configure(layout(3, true), layout(2, true)));
        assert!(p.configure(layout(1, false), layout(2, true)));
    }

    #[test]
    fn planar_user_to_interleaved_host_pads_extra_channels() {
        let mut p = AdaptingProcessor::default();
        assert!(p.configure(layout(1, false), layout(2, true)));

        let user_layout = layout(1, false);
        let mut user_planes = Vec::new();
        user_layout.fill_planes(&mut user_planes, 2);
        let user_buf = [1u8, 2, 3, 4];
        let user = UserArea::new(&user_buf, &user_planes, 2, 2).unwrap();

        let mut host_planes = Vec::new();
        fill_interleaved_planes(&mut host_planes, 2, 2);
        let mut host_buf = [0xffu8; 8];
        let mut host = HostArea::new(&mut host_buf, &host_planes, 2, 2).unwrap();
        p.to_host(&user, 0, &mut host, 0, 2);
        assert_eq!(host_buf, [1, 2, 0, 0, 3, 4, 0, 0]);
    }

    #[test]
    fn interleaved_host_to_planar_user_drops_extra_channels() {
        let mut p = AdaptingProcessor::default();
        assert!(p.configure(layout(1, false), layout(2, true)));

        let mut host_planes = Vec::new();
        fill_interleaved_planes(&mut host_planes, 2, 2);
        let mut host_buf = [1u8, 2, 9, 9, 3, 4, 9, 9];
        let host = HostArea::new(&mut host_buf, &host_planes, 2, 2).unwrap();

        let mut user_planes = Vec::new();
        layout(1, false).fill_planes(&mut user_planes, 4);
        let mut user_buf = [0u8; 8];
        let mut user = UserAreaMut::new(&mut user_buf, &user_planes, 2, 4).unwrap();
        p.from_host(&host, 0, &mut user, 2, 2);
        assert_eq!(user_buf, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn short_user_buffer_is_rejected() {
        let mut planes = Vec::new();
        layout(2, true).fill_planes(&mut planes, 4);
        assert!(UserArea::new(&[0u8; 15], &planes, 2, 4).is_none());
        assert!(UserArea::new(&[0u8; 16], &planes, 2, 4).is_some());
    }
}
