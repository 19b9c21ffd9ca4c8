use nix::libc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hw::{NativeError, Pcm};

/// Whether `achieved` is within `tolerance` (a fraction) of `requested`.
pub fn within_tolerance(requested: f64, achieved: f64, tolerance: f64) -> bool {
    requested > 0.0 && ((achieved - requested) / requested).abs() <= tolerance
}

/// Reads the configured rate back as an exact fraction.
pub fn exact_rate(pcm: &mut dyn Pcm) -> Result<f64> {
    let fraction = pcm.hw_rate_fraction().map_err(Error::host)?;
    if fraction.den == 0 {
        return Err(Error::host(NativeError::errno(libc::EINVAL)));
    }
    Ok(fraction.as_f64())
}

/// Narrows the pending configuration to the rate nearest `requested` and
/// returns the achieved rate.
pub fn set_approximate_rate(pcm: &mut dyn Pcm, requested: f64, tolerance: f64) -> Result<f64> {
    if !requested.is_finite() || requested < 1.0 || requested > f64::from(u32::MAX) {
        return Err(Error::InvalidSampleRate {
            requested,
            achieved: 0.0,
        });
    }
    pcm.hw_set_rate_near(requested.round() as u32)
        .map_err(Error::host)?;
    let achieved = exact_rate(pcm)?;
    if !within_tolerance(requested, achieved, tolerance) {
        debug!(
            "{} '{}': wanted {requested:.3} Hz, closest is {achieved:.3} Hz",
            pcm.direction(),
            pcm.name()
        );
        return Err(Error::InvalidSampleRate {
            requested,
            achieved,
        });
    }
    Ok(achieved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimDeviceConfig, SimProvider, SimRates};
    use crate::hw::{Direction, Provider};

    fn open(rates: SimRates) -> Box<dyn Pcm> {
        let provider = SimProvider::new();
        provider.add_device(SimDeviceConfig::duplex("sim").with_rates(rates));
        let mut pcm = provider.open("sim", Direction::Capture, true).unwrap();
        pcm.hw_any().unwrap();
        pcm
    }

    #[test]
    fn one_percent_window() {
        assert!(within_tolerance(44100.0, 44541.0, 0.01));
        assert!(within_tolerance(44100.0, 43659.0, 0.01));
        assert!(!within_tolerance(44100.0, 48000.0, 0.01));
        assert!(!within_tolerance(0.0, 0.0, 0.01));
    }

    #[test]
    fn rates_inside_the_device_range_are_met() {
        let mut pcm = open(SimRates::Range {
            min: 8000,
            max: 96000,
        });
        for requested in [8000.0, 22050.0, 44100.0, 48000.0, 96000.0] {
            pcm.hw_any().unwrap();
            let achieved = set_approximate_rate(pcm.as_mut(), requested, 0.01).unwrap();
            assert!((achieved - requested).abs() <= requested / 100.0);
        }
    }

    #[test]
    fn distant_rate_is_rejected_with_the_achieved_value() {
        let mut pcm = open(SimRates::List(vec![48000]));
        let err = set_approximate_rate(pcm.as_mut(), 44100.0, 0.01).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidSampleRate {
                requested: 44100.0,
                achieved: 48000.0
            }
        );
    }

    #[test]
    fn nonsense_rate_never_reaches_the_device() {
        let mut pcm = open(SimRates::List(vec![48000]));
        assert!(matches!(
            set_approximate_rate(pcm.as_mut(), f64::NAN, 0.01),
            Err(Error::InvalidSampleRate { .. })
        ));
    }
}
