use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use maolan_pcm_engine::hw::sim::{SimDeviceConfig, SimProvider};
use maolan_pcm_engine::{
    CallbackFlags, CallbackIo, CallbackResult, CallbackTimeInfo, DeviceSpec, Direction, Error,
    HostApi, HostConfig, SampleFormat, Stream, StreamParameters, StreamRequest,
};
use serde::Serialize;
use tracing::{info, warn};
use wavers::Wav;

fn to_io(err: Error) -> io::Error {
    io::Error::other(err.to_string())
}

pub fn host(config: Option<&Path>, sim: bool) -> io::Result<HostApi> {
    let config = match config {
        Some(path) => HostConfig::load(path),
        None => Ok(HostConfig::default()),
    }
    .and_then(HostConfig::with_env_overrides)
    .map_err(to_io)?;
    if !sim {
        return HostApi::new(config).map_err(to_io);
    }
    let provider = Arc::new(SimProvider::new());
    provider.add_device(SimDeviceConfig::duplex("default"));
    provider.add_device(SimDeviceConfig::duplex("hw:0,0"));
    Ok(HostApi::with_provider(provider, config))
}

fn probe_named(host: &mut HostApi, device: &str) -> io::Result<usize> {
    host.probe_device(device, !device.starts_with("hw:"))
        .map_err(to_io)
}

#[derive(Args)]
pub struct ProbeArgs {
    /// Device names to probe
    #[arg(default_values_t = ["default".to_string()])]
    devices: Vec<String>,
}

#[derive(Serialize)]
struct ProbeReport<'a> {
    provider: &'static str,
    devices: &'a [maolan_pcm_engine::DeviceInfo],
    failed: Vec<(String, String)>,
}

pub fn probe(mut host: HostApi, args: ProbeArgs) -> io::Result<()> {
    let mut failed = Vec::new();
    for name in &args.devices {
        if let Err(err) = probe_named(&mut host, name) {
            warn!("{name}: {err}");
            failed.push((name.clone(), err.to_string()));
        }
    }
    let report = ProbeReport {
        provider: host.provider_label(),
        devices: host.devices(),
        failed,
    };
    let json = serde_json::to_string_pretty(&report).map_err(io::Error::other)?;
    println!("{json}");
    Ok(())
}

#[derive(Args)]
pub struct PlayArgs {
    /// WAV file to play
    input: PathBuf,

    #[arg(short, long, default_value = "default")]
    device: String,

    /// Suggested output latency in milliseconds
    #[arg(long)]
    latency_ms: Option<f64>,

    /// Frames per user buffer; 0 follows the device period
    #[arg(long, default_value_t = 0)]
    frames: u32,

    /// Drive playback from the realtime callback instead of blocking writes
    #[arg(long)]
    callback: bool,
}

fn parameters(index: usize, channels: u32, latency_ms: Option<f64>) -> StreamParameters {
    let params = StreamParameters::new(DeviceSpec::Index(index), channels, SampleFormat::Float32);
    match latency_ms {
        Some(ms) => params.with_latency(ms / 1000.0),
        None => params,
    }
}

fn report(stream: &Stream) {
    let stats = stream.xrun_stats();
    info!(
        "finished: {} overruns, {} underruns, cpu load {:.3}",
        stats.overruns,
        stats.underruns,
        stream.cpu_load()
    );
}

fn as_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

pub fn play(mut host: HostApi, args: PlayArgs) -> io::Result<()> {
    let mut wav = Wav::<f32>::from_path(&args.input).map_err(|e| {
        io::Error::other(format!("Failed to open WAV '{}': {e}", args.input.display()))
    })?;
    let channels = wav.n_channels().max(1) as usize;
    let rate = wav.sample_rate();
    let samples: wavers::Samples<f32> = wav.read().map_err(|e| {
        io::Error::other(format!("WAV read error '{}': {e}", args.input.display()))
    })?;
    let index = probe_named(&mut host, &args.device)?;
    let request = StreamRequest::new(f64::from(rate))
        .output(parameters(index, channels as u32, args.latency_ms))
        .frames_per_buffer(args.frames);

    let bytes = as_bytes(&samples);
    let frame_bytes = channels * SampleFormat::Float32.bytes();
    let total = bytes.len() / frame_bytes;
    info!("playing {total} frames of {channels} channels at {rate} Hz");

    if args.callback {
        let mut cursor = 0;
        let mut stream = host
            .open_callback_stream(
                &request,
                move |io: &mut CallbackIo<'_>, _time: &CallbackTimeInfo, flags: CallbackFlags| {
                    if flags.output_underflow {
                        warn!("output underflow");
                    }
                    let Some(out) = io.output.as_deref_mut() else {
                        return CallbackResult::Abort;
                    };
                    let take = (bytes.len() - cursor).min(out.len());
                    out[..take].copy_from_slice(&bytes[cursor..cursor + take]);
                    out[take..].fill(0);
                    cursor += take;
                    if cursor >= bytes.len() {
                        CallbackResult::Complete
                    } else {
                        CallbackResult::Continue
                    }
                },
            )
            .map_err(to_io)?;
        stream.start().map_err(to_io)?;
        let monitor = stream.monitor();
        let length = Duration::from_secs_f64(total as f64 / f64::from(rate));
        monitor.wait_finished(length + Duration::from_secs(5));
        stream.stop().map_err(to_io)?;
        report(&stream);
        return stream.close().map_err(to_io);
    }

    let mut stream = host.open_stream(&request).map_err(to_io)?;
    let chunk = stream.info().frames_per_buffer.max(1);
    stream.start().map_err(to_io)?;
    for block in bytes.chunks(chunk * frame_bytes) {
        match stream.write(block, block.len() / frame_bytes) {
            Ok(()) => {}
            Err(Error::OutputUnderflowed) => warn!("output underflow"),
            Err(err) => return Err(to_io(err)),
        }
    }
    stream.stop().map_err(to_io)?;
    report(&stream);
    stream.close().map_err(to_io)
}

#[derive(Args)]
pub struct RecordArgs {
    /// WAV file to write
    output: PathBuf,

    #[arg(short, long, default_value = "default")]
    device: String,

    #[arg(short, long, default_value_t = 2)]
    channels: u32,

    #[arg(short, long, default_value_t = 48000)]
    rate: u32,

    #[arg(short, long, default_value_t = 5.0)]
    seconds: f64,

    /// Suggested input latency in milliseconds
    #[arg(long)]
    latency_ms: Option<f64>,
}

pub fn record(mut host: HostApi, args: RecordArgs) -> io::Result<()> {
    let index = probe_named(&mut host, &args.device)?;
    if host
        .device(index)
        .and_then(|d| d.caps(Direction::Capture))
        .is_none()
    {
        return Err(io::Error::other(format!("'{}' cannot capture", args.device)));
    }
    let request = StreamRequest::new(f64::from(args.rate)).input(parameters(
        index,
        args.channels,
        args.latency_ms,
    ));
    let mut stream = host.open_stream(&request).map_err(to_io)?;
    let channels = args.channels as usize;
    let frame_bytes = channels * SampleFormat::Float32.bytes();
    let chunk = stream.info().frames_per_buffer.max(1);
    let wanted = (args.seconds.max(0.0) * f64::from(args.rate)) as usize;
    let mut buf = vec![0u8; chunk * frame_bytes];
    let mut samples = Vec::with_capacity(wanted * channels);

    stream.start().map_err(to_io)?;
    let mut recorded = 0;
    while recorded < wanted {
        let frames = chunk.min(wanted - recorded);
        let bytes = &mut buf[..frames * frame_bytes];
        match stream.read(bytes, frames) {
            Ok(()) => {}
            Err(Error::InputOverflowed) => warn!("input overflow"),
            Err(err) => return Err(to_io(err)),
        }
        samples.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        recorded += frames;
    }
    stream.abort().map_err(to_io)?;
    report(&stream);
    stream.close().map_err(to_io)?;

    wavers::write::<f32, _>(&args.output, &samples, args.rate as i32, args.channels as u16)
        .map_err(|e| {
            io::Error::other(format!(
                "Failed to write recording {}: {e}",
                args.output.display()
            ))
        })?;
    info!("wrote {recorded} frames to {}", args.output.display());
    Ok(())
}
