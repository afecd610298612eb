mod source;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camserver::{CaptureSink, CodecParams, MediaKind, Server, ServerConfig, TrackConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use source::ElementaryStream;

#[derive(Parser)]
#[command(
    name = "camserver",
    about = "Live RTSP server looping an H.265 elementary stream"
)]
struct Args {
    /// H.265 Annex-B elementary stream file
    file: PathBuf,

    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Server RTP port for video; RTCP is received on the next port
    #[arg(long, default_value_t = 5004)]
    video_port: u16,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Seconds without RTCP before a UDP client is dropped
    #[arg(long, default_value_t = 10)]
    rtcp_ttl: u64,

    /// Host advertised in the SDP origin line
    #[arg(long)]
    public_host: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let data = match fs::read(&args.file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {}: {}", args.file.display(), e);
            return;
        }
    };
    let Some(stream) = ElementaryStream::parse(&data) else {
        eprintln!(
            "{} is not an H.265 Annex-B stream with VPS/SPS/PPS",
            args.file.display()
        );
        return;
    };
    tracing::info!(frames = stream.len(), "loaded elementary stream");

    let config = ServerConfig {
        bind_addr: args.bind.clone(),
        tracks: vec![TrackConfig::new(MediaKind::Video, args.video_port)],
        public_host: args.public_host.clone(),
        rtcp_ttl: Duration::from_secs(args.rtcp_ttl),
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config));

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }
    server.set_on_terminated(|| tracing::info!("server terminated"));

    let params = CodecParams::H265 {
        parameter_sets: stream.parameter_sets().to_vec(),
    };
    if let Err(e) = server.on_media_prepared(&params, MediaKind::Video) {
        eprintln!("Failed to prepare video track: {}", e);
        stop(&server);
        return;
    }

    let running = Arc::new(AtomicBool::new(true));
    let feeder = match source::spawn_feeder(server.clone(), stream, args.fps, running.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start feeder: {}", e);
            stop(&server);
            return;
        }
    };

    let addr = server
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or(args.bind);
    println!("Streaming rtsp://{}/live, press Enter to stop", addr);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed, stopping");
    }

    running.store(false, Ordering::SeqCst);
    if feeder.join().is_err() {
        tracing::warn!("feeder thread panicked");
    }

    stop(&server);
    if !server.wait_terminated(Duration::from_secs(5)) {
        tracing::warn!("timed out waiting for sessions to close");
    }
}

fn stop(server: &Server) {
    if let Err(e) = server.stop() {
        tracing::warn!(error = %e, "stop failed");
    }
}
