use std::path::PathBuf;

use clap::Parser;
use vod::{Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "rtsp-vod-server",
    about = "RTSP server streaming local media through an external transcoder"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Directory media paths resolve against
    #[arg(long, default_value = ".")]
    media_root: PathBuf,

    /// Transcoder executable
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Probe executable
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut server = Server::new(ServerConfig {
        bind_addr: args.bind,
        media_root: args.media_root,
        ffmpeg: args.ffmpeg,
        ffprobe: args.ffprobe,
        ..ServerConfig::default()
    });

    if let Err(error) = server.bind() {
        eprintln!("Failed to start server: {}", error);
        std::process::exit(1);
    }
    if let Err(error) = server.run() {
        eprintln!("Server error: {}", error);
        std::process::exit(1);
    }
}
