use std::marker::PhantomData;

/// Where one channel lives inside a host buffer, relative to its base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPlane {
    pub offset: usize,
    pub step: usize,
}

impl ChannelPlane {
    pub fn interleaved(channel: usize, channels: usize, sample_bytes: usize) -> Self {
        Self {
            offset: channel * sample_bytes,
            step: channels * sample_bytes,
        }
    }

    pub fn planar(channel: usize, plane_bytes: usize, sample_bytes: usize) -> Self {
        Self {
            offset: channel * plane_bytes,
            step: sample_bytes,
        }
    }

    fn byte(&self, frame: usize) -> usize {
        self.offset + frame * self.step
    }
}

pub fn fill_interleaved_planes(planes: &mut Vec<ChannelPlane>, channels: usize, sample_bytes: usize) {
    planes.clear();
    planes.extend((0..channels).map(|c| ChannelPlane::interleaved(c, channels, sample_bytes)));
}

pub fn fill_planar_planes(
    planes: &mut Vec<ChannelPlane>,
    channels: usize,
    plane_bytes: usize,
    sample_bytes: usize,
) {
    planes.clear();
    planes.extend((0..channels).map(|c| ChannelPlane::planar(c, plane_bytes, sample_bytes)));
}

/// A window of host audio memory: an mmap region of the device or the
/// component's own read/write staging buffer.
#[derive(Debug)]
pub struct HostArea<'a> {
    base: *mut u8,
    planes: &'a [ChannelPlane],
    sample_bytes: usize,
    frames: usize,
    _buf: PhantomData<&'a mut [u8]>,
}

impl<'a> HostArea<'a> {
    /// Returns `None` when a plane would reach outside `buf`.
    pub fn new(
        buf: &'a mut [u8],
        planes: &'a [ChannelPlane],
        sample_bytes: usize,
        frames: usize,
    ) -> Option<Self> {
        let fits = planes.iter().all(|plane| {
            frames == 0 || plane.byte(frames - 1) + sample_bytes <= buf.len()
        });
        if !fits {
            return None;
        }
        Some(Self {
            base: buf.as_mut_ptr(),
            planes,
            sample_bytes,
            frames,
            _buf: PhantomData,
        })
    }

    /// # Safety
    ///
    /// For every plane and every frame below `frames`, `base + offset +
    /// frame * step` must address `sample_bytes` writable bytes that stay
    /// valid and unaliased for `'a`.
    pub unsafe fn from_raw(
        base: *mut u8,
        planes: &'a [ChannelPlane],
        sample_bytes: usize,
        frames: usize,
    ) -> Self {
        Self {
            base,
            planes,
            sample_bytes,
            frames,
            _buf: PhantomData,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.planes.len()
    }

    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    /// True when all channels sit frame by frame in one contiguous run.
    pub fn is_packed_interleaved(&self) -> bool {
        let channels = self.planes.len();
        self.planes
            .iter()
            .enumerate()
            .all(|(c, plane)| *plane == ChannelPlane::interleaved(c, channels, self.sample_bytes))
    }

    pub fn sample(&self, channel: usize, frame: usize) -> &[u8] {
        assert!(frame < self.frames, "frame {frame} outside area of {}", self.frames);
        let at = self.planes[channel].byte(frame);
        // SAFETY: bounds were validated at construction for frames < self.frames.
        unsafe { std::slice::from_raw_parts(self.base.wrapping_add(at), self.sample_bytes) }
    }

    pub fn sample_mut(&mut self, channel: usize, frame: usize) -> &mut [u8] {
        assert!(frame < self.frames, "frame {frame} outside area of {}", self.frames);
        let at = self.planes[channel].byte(frame);
        // SAFETY: see `sample`; `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base.wrapping_add(at), self.sample_bytes) }
    }

    /// Contiguous bytes of `frames` packed interleaved frames starting at `frame`.
    pub fn packed_frames_mut(&mut self, frame: usize, frames: usize) -> Option<&mut [u8]> {
        if !self.is_packed_interleaved() || frame + frames > self.frames {
            return None;
        }
        let frame_bytes = self.planes.len() * self.sample_bytes;
        // SAFETY: packed layout means frames are adjacent and validated in bounds.
        Some(unsafe {
            std::slice::from_raw_parts_mut(
                self.base.wrapping_add(frame * frame_bytes),
                frames * frame_bytes,
            )
        })
    }

    pub fn fill(&mut self, frame: usize, frames: usize, byte: u8) {
        let end = (frame + frames).min(self.frames);
        for channel in 0..self.planes.len() {
            for f in frame..end {
                self.sample_mut(channel, f).fill(byte);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_layout_addresses_samples() {
        let mut buf: Vec<u8> = (0..12).collect();
        let mut planes = Vec::new();
        fill_interleaved_planes(&mut planes, 2, 2);
        let area = HostArea::new(&mut buf, &planes, 2, 3).unwrap();
        assert!(area.is_packed_interleaved());
        assert_eq!(area.sample(1, 0), &[2, 3]);
        assert_eq!(area.sample(0, 2), &[8, 9]);
    }

    #[test]
    fn planar_layout_addresses_samples() {
        let mut buf: Vec<u8> = (0..8).collect();
        let mut planes = Vec::new();
        fill_planar_planes(&mut planes, 2, 4, 2);
        let mut area = HostArea::new(&mut buf, &planes, 2, 2).unwrap();
        assert!(!area.is_packed_interleaved());
        assert_eq!(area.sample(1, 1), &[6, 7]);
        area.fill(0, 2, 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_out_of_bounds_layout() {
        let mut buf = vec![0u8; 6];
        let mut planes = Vec::new();
        fill_interleaved_planes(&mut planes, 2, 2);
        assert!(HostArea::new(&mut buf, &planes, 2, 2).is_none());
    }
}
