use std::time::Duration;

use tracing::{debug, warn};

use super::error_fmt::open_error_message;
use super::{Direction, Pcm, Provider};
use crate::error::{Error, HostErrorInfo, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_busy_retries: u32,
    retry_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_busy_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_busy_retries,
            retry_delay,
        }
    }

    pub const fn max_busy_retries(&self) -> u32 {
        self.max_busy_retries
    }

    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(10))
    }
}

/// Opens endpoints, waiting out devices that are momentarily held by
/// someone else.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOpener<'a> {
    provider: &'a dyn Provider,
    policy: RetryPolicy,
}

impl<'a> DeviceOpener<'a> {
    pub fn new(provider: &'a dyn Provider, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn open(
        &self,
        name: &str,
        direction: Direction,
        nonblock: bool,
        wait_on_busy: bool,
    ) -> Result<Box<dyn Pcm>> {
        let mut retries = 0;
        loop {
            match self.provider.open(name, direction, nonblock) {
                Ok(pcm) => {
                    if retries > 0 {
                        debug!("{direction} '{name}' opened after {retries} busy retries");
                    }
                    return Ok(pcm);
                }
                Err(err) if err.is_busy() => {
                    if !wait_on_busy || retries >= self.policy.max_busy_retries {
                        warn!("{direction} '{name}' still busy after {retries} retries");
                        return Err(Error::DeviceUnavailable(open_error_message(
                            self.provider.label(),
                            direction,
                            name,
                            &err,
                        )));
                    }
                    retries += 1;
                    std::thread::sleep(self.policy.retry_delay);
                }
                Err(err) => {
                    debug!("{}", open_error_message(self.provider.label(), direction, name, &err));
                    return Err(Error::BadIODeviceCombination(
                        HostErrorInfo::from(err).to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{SimDeviceConfig, SimProvider};

    fn quick() -> RetryPolicy {
        RetryPolicy::new(5, Duration::ZERO)
    }

    #[test]
    fn busy_then_free_takes_k_plus_one_attempts() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0,0"));
        device.set_busy_opens(3);
        let pcm = DeviceOpener::new(&provider, quick())
            .open("hw:0,0", Direction::Playback, true, true)
            .unwrap();
        assert_eq!(pcm.name(), "hw:0,0");
        assert_eq!(device.open_calls(), 4);
    }

    #[test]
    fn always_busy_exhausts_budget() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0,0"));
        device.set_always_busy(true);
        let err = DeviceOpener::new(&provider, quick())
            .open("hw:0,0", Direction::Capture, true, true)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert_eq!(device.open_calls(), 6);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn no_wait_fails_on_first_busy() {
        let provider = SimProvider::new();
        let device = provider.add_device(SimDeviceConfig::duplex("hw:0,0"));
        device.set_busy_opens(1);
        let err = DeviceOpener::new(&provider, quick())
            .open("hw:0,0", Direction::Capture, true, false)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert_eq!(device.open_calls(), 1);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let provider = SimProvider::new();
        let err = DeviceOpener::new(&provider, quick())
            .open("hw:9,9", Direction::Capture, true, true)
            .unwrap_err();
        assert!(matches!(err, Error::BadIODeviceCombination(_)));
    }
}
