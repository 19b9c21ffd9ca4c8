use crate::hw::Frames;

/// Seconds of audio queued ahead of the period being transferred.
pub fn buffered_latency(buffer_frames: Frames, period_frames: Frames, sample_rate: f64) -> f64 {
    if sample_rate <= 0.0 {
        return 0.0;
    }
    buffer_frames.saturating_sub(period_frames).max(0) as f64 / sample_rate
}

/// Period size to aim for before it is clamped to what the devices accept.
pub fn desired_period(
    frames_per_buffer: u32,
    suggested_latency: f64,
    sample_rate: f64,
    num_periods: u32,
) -> Frames {
    if frames_per_buffer > 0 {
        return Frames::from(frames_per_buffer);
    }
    let frames = suggested_latency.max(0.0) * sample_rate / f64::from(num_periods.max(1));
    (frames.round() as Frames).max(1)
}

/// Buffer size to request: the latency in frames plus one period, rounded
/// up to whole periods and never below two of them.
pub fn buffer_candidate(suggested_latency: f64, sample_rate: f64, period_frames: Frames) -> Frames {
    let period = period_frames.max(1);
    let wanted = (suggested_latency.max(0.0) * sample_rate).ceil() as Frames + period;
    let periods = wanted.saturating_add(period - 1) / period;
    periods.max(2).saturating_mul(period)
}

pub fn clamp_period(desired: Frames, range: (Frames, Frames)) -> Frames {
    desired.clamp(range.0, range.1.max(range.0))
}

/// Overlap of two period ranges, `None` when they are disjoint.
pub fn intersect_periods(a: (Frames, Frames), b: (Frames, Frames)) -> Option<(Frames, Frames)> {
    let min = a.0.max(b.0);
    let max = a.1.min(b.1);
    (min <= max).then_some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_rounds_up_to_whole_periods() {
        assert_eq!(buffer_candidate(0.01, 48000.0, 256), 768);
        assert_eq!(buffer_candidate(0.0, 48000.0, 256), 512);
        assert_eq!(buffer_candidate(0.02, 44100.0, 441), 1323);
    }

    #[test]
    fn latency_excludes_the_live_period() {
        let latency = buffered_latency(768, 256, 48000.0);
        assert!((latency - 512.0 / 48000.0).abs() < 1e-12);
        assert_eq!(buffered_latency(256, 256, 0.0), 0.0);
    }

    #[test]
    fn explicit_buffer_size_overrides_latency() {
        assert_eq!(desired_period(300, 1.0, 48000.0, 4), 300);
        assert_eq!(desired_period(0, 0.01, 48000.0, 4), 120);
        assert_eq!(desired_period(0, 0.0, 48000.0, 4), 1);
    }

    #[test]
    fn disjoint_ranges_do_not_intersect() {
        assert_eq!(intersect_periods((32, 512), (256, 4096)), Some((256, 512)));
        assert_eq!(intersect_periods((32, 128), (256, 4096)), None);
        assert_eq!(clamp_period(120, (256, 512)), 256);
    }
}
