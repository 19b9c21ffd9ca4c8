#[cfg(all(target_os = "linux", feature = "static-alsa"))]
pub mod alsa;
pub mod area;
pub mod dynamic;
pub mod error_fmt;
pub mod opener;
pub mod sim;
pub mod traits;

use std::sync::Arc;

use tracing::debug;

pub use area::{ChannelPlane, HostArea};
pub use opener::{DeviceOpener, RetryPolicy};
pub use traits::{
    Access, Direction, Frames, NativeError, NativeResult, Pcm, PcmState, PollFd, Provider,
    RateFraction, Readiness, SwConfig, Threshold,
};

use crate::config::HostConfig;
use crate::error::Result;

/// Picks the sound subsystem binding once, at host start.
///
/// A configured library path always means runtime loading. Otherwise the
/// statically linked binding is used when compiled in.
pub fn select_provider(config: &HostConfig) -> Result<Arc<dyn Provider>> {
    if let Some(path) = &config.library_path {
        debug!("loading sound library from {}", path.display());
        return Ok(Arc::new(dynamic::DynamicProvider::load(Some(path))?));
    }
    #[cfg(all(target_os = "linux", feature = "static-alsa"))]
    {
        Ok(Arc::new(alsa::AlsaProvider::new()))
    }
    #[cfg(not(all(target_os = "linux", feature = "static-alsa")))]
    {
        tracing::warn!("no statically linked sound library, resolving it at runtime");
        Ok(Arc::new(dynamic::DynamicProvider::load(None)?))
    }
}
