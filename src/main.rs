//! maolan-pcm: probe, play and record over ALSA PCM devices.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maolan-pcm")]
#[command(author, version, about = "ALSA PCM probe, playback and capture", long_about = None)]
struct Cli {
    /// TOML file with host tunables; MAOLAN_PCM_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated in-process devices instead of the sound library
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe devices and print their capabilities as JSON
    Probe(commands::ProbeArgs),

    /// Play a WAV file
    Play(commands::PlayArgs),

    /// Record into a WAV file
    Record(commands::RecordArgs),
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let host = commands::host(cli.config.as_deref(), cli.sim)?;
    match cli.command {
        Commands::Probe(args) => commands::probe(host, args),
        Commands::Play(args) => commands::play(host, args),
        Commands::Record(args) => commands::record(host, args),
    }
}
