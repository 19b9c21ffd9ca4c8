mod blocking;
pub mod component;
mod controller;
pub mod cpu_load;
pub mod latency;
pub mod negotiate;
pub mod processor;
pub mod rate;
mod realtime;
pub mod state;

pub use controller::{
    HostApi, Stream, StreamFlags, StreamInfo, StreamMonitor, StreamRequest, StreamState,
};
pub use processor::{
    BufferProcessor, ChannelLayout, ProcessorFactory, UserArea, UserAreaMut, adapting_processor,
};
pub use realtime::{
    CallbackFlags, CallbackIo, CallbackResult, CallbackTimeInfo, StreamCallback,
};
pub use state::{LoopPhase, XrunStats};
