#[cfg(not(unix))]
compile_error!("maolan-pcm-engine drives ALSA PCM devices and only builds on unix targets");

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod hw;
pub mod stream;

pub use config::{HostConfig, LatencyHint};
pub use device::{DeviceInfo, DeviceSpec, DirectionCaps, HostSpecificStreamInfo, StreamParameters};
pub use error::{Error, HostErrorInfo, Result};
pub use format::SampleFormat;
pub use hw::Direction;
pub use stream::{
    CallbackFlags, CallbackIo, CallbackResult, CallbackTimeInfo, HostApi, Stream, StreamFlags,
    StreamInfo, StreamMonitor, StreamRequest, StreamState, XrunStats,
};
