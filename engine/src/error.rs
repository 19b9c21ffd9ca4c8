use std::fmt;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use crate::hw::NativeError;

/// Native failure code and message as reported by the sound subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostErrorInfo {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for HostErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl From<NativeError> for HostErrorInfo {
    fn from(err: NativeError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The device stayed busy for the whole retry budget.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("invalid sample rate: requested {requested} Hz, device offers {achieved:.3} Hz")]
    InvalidSampleRate { requested: f64, achieved: f64 },
    #[error("invalid channel count {requested}: {reason}")]
    InvalidChannelCount { requested: u32, reason: String },
    /// Capture and playback endpoints cannot agree, or the device rejected
    /// a parameter combination outright.
    #[error("bad device combination: {0}")]
    BadIODeviceCombination(String),
    #[error("insufficient memory")]
    InsufficientMemory,
    #[error("unanticipated host error: {0}")]
    UnanticipatedHostError(HostErrorInfo),
    #[error("sample format not supported: {0}")]
    SampleFormatNotSupported(String),
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    #[error("stream is not stopped")]
    StreamIsNotStopped,
    #[error("stream is stopped")]
    StreamIsStopped,
    #[error("stream is closed")]
    StreamIsClosed,
    #[error("buffer holds {got} bytes, {needed} needed")]
    InvalidBuffer { needed: usize, got: usize },
    #[error("cannot read from a playback-only stream")]
    CanNotReadFromAnOutputOnlyStream,
    #[error("cannot write to a capture-only stream")]
    CanNotWriteToAnInputOnlyStream,
    #[error("cannot read from a callback stream")]
    CanNotReadFromACallbackStream,
    #[error("cannot write to a callback stream")]
    CanNotWriteToACallbackStream,
    #[error("input overflowed")]
    InputOverflowed,
    #[error("output underflowed")]
    OutputUnderflowed,
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("host library not available: {0}")]
    HostApiNotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn host(err: NativeError) -> Self {
        Self::UnanticipatedHostError(err.into())
    }

    pub fn host_info(&self) -> Option<&HostErrorInfo> {
        match self {
            Self::UnanticipatedHostError(info) => Some(info),
            _ => None,
        }
    }
}

/// Remembers the last native error, but only for failures raised on the
/// thread that owns the host API object.
#[derive(Debug)]
pub struct HostErrorSlot {
    owner: ThreadId,
    last: Mutex<Option<HostErrorInfo>>,
}

impl HostErrorSlot {
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            last: Mutex::new(None),
        }
    }

    pub fn record(&self, err: &Error) {
        if thread::current().id() != self.owner {
            return;
        }
        if let Some(info) = err.host_info()
            && let Ok(mut last) = self.last.lock()
        {
            *last = Some(info.clone());
        }
    }

    pub fn last(&self) -> Option<HostErrorInfo> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl Default for HostErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ignores_foreign_threads() {
        let slot = std::sync::Arc::new(HostErrorSlot::new());
        let err = Error::host(NativeError::new(-5, "io"));
        let remote = slot.clone();
        let remote_err = err.clone();
        std::thread::spawn(move || remote.record(&remote_err))
            .join()
            .unwrap();
        assert!(slot.last().is_none());
        slot.record(&err);
        assert_eq!(slot.last().map(|i| i.code), Some(-5));
    }

    #[test]
    fn only_host_errors_are_recorded() {
        let slot = HostErrorSlot::new();
        slot.record(&Error::InsufficientMemory);
        assert!(slot.last().is_none());
    }
}
