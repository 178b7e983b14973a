use clap::{Parser, Subcommand};
use log::warn;
use std::path::PathBuf;

use peer_vision::config::{self, BackendMode};

#[derive(Parser, Debug)]
#[command(name = "peer-vision")]
#[command(author = "Peer Vision Team")]
#[command(version = "0.1.0")]
#[command(about = "Manual-signaling WebRTC video link with object detection", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "peer-vision.toml")]
    pub config: PathBuf,

    /// Inference backend (local or remote)
    #[arg(long)]
    pub mode: Option<String>,

    /// ONNX model for the local backend
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Remote detection service URL
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Serve the status API on this port
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a video file: print an offer, then read the answer from stdin
    Offer {
        /// VP8/VP9 IVF file streamed as the local video
        #[arg(long)]
        media: PathBuf,

        /// Playback rate of the IVF file
        #[arg(long, default_value = "30")]
        fps: u32,
    },

    /// Receive video: read an offer (argument or stdin), print the answer and run
    /// detection on the received video
    Answer {
        /// Offer as SDP, JSON or token; read from stdin when omitted
        #[arg(long)]
        offer: Option<String>,
    },

    /// Run detection over an image directory
    Detect {
        /// Directory of PNG/JPEG frames, sampled in name order
        #[arg(long)]
        frames: PathBuf,

        /// Run one benchmark window and print its JSON export
        #[arg(long, action)]
        benchmark: bool,

        /// Run time when not benchmarking
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        Ok(config::Config::load(&self.config)?)
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref mode) = self.mode {
            match BackendMode::parse(mode) {
                Some(mode) => config.inference.mode = mode,
                None => warn!("Invalid backend mode: {}, keeping {}", mode, config.inference.mode),
            }
        }
        if let Some(ref model) = self.model {
            config.inference.model_path = model.clone();
        }
        if let Some(ref endpoint) = self.endpoint {
            config.inference.remote_endpoint = endpoint.clone();
        }
        if let Some(port) = self.http_port {
            config.http.enabled = true;
            config.http.port = port;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
