//! peer-vision - Main entry point
//!
//! Connects two peers over WebRTC with copy/paste signaling and runs object detection on
//! video frames, locally or through a remote detection service.

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{error, info, warn};
use peer_vision::capture::ImageSequenceSource;
use peer_vision::config::Config;
use peer_vision::inference::DetectionSet;
use peer_vision::web;
use peer_vision::webrtc::{default_decoders, ConnectionDescriptor, IvfFileMedia, LinkEvent, MediaProvider, Role};
use peer_vision::Controller;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("PEER_VISION_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_srtp", log::LevelFilter::Error)
        .init();

    info!("peer-vision v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let (role, media) = match &args.command {
        Command::Offer { media, fps } => {
            let provider: Arc<dyn MediaProvider> = Arc::new(IvfFileMedia::new(media, *fps));
            (Role::Sender, Some(provider))
        }
        Command::Answer { .. } | Command::Detect { .. } => (Role::Receiver, None),
    };
    info!("Inference backend: {}", config.inference.mode);

    let controller = Arc::new(Controller::from_config(config.clone(), role, media)?);

    let http_handle = if config.http.enabled {
        let controller = controller.clone();
        let host = config.http.host.clone();
        let port = config.http.port;
        Some(tokio::spawn(async move {
            if let Err(e) = web::run_http_server(&host, port, controller).await {
                error!("Status API failed: {}", e);
            }
        }))
    } else {
        None
    };

    let result = match args.command {
        Command::Offer { .. } => run_offer(&controller).await,
        Command::Answer { offer } => run_answer(&controller, offer).await,
        Command::Detect {
            frames,
            benchmark,
            seconds,
        } => run_detect(&controller, frames, benchmark, seconds).await,
    };

    controller.dispose().await;
    if let Some(handle) = http_handle {
        handle.abort();
    }

    if let Err(ref e) = result {
        error!("{}", e);
    }
    info!("Shutdown complete");
    result
}

async fn run_offer(controller: &Arc<Controller>) -> Result<(), Box<dyn std::error::Error>> {
    let negotiator = controller.negotiator();
    let events = spawn_event_log(controller);

    negotiator.start_local_media().await?;
    let offer = negotiator.create_offer().await?;
    print_descriptor(&offer)?;

    eprintln!("Paste the answer (SDP, JSON or token), then an empty line:");
    let answer = read_descriptor().await?;
    let outcome = negotiator.set_remote_answer(&answer).await?;
    info!("Remote answer: {:?}", outcome);

    wait_for_link_end(controller).await;
    events.abort();
    Ok(())
}

async fn run_answer(controller: &Arc<Controller>, offer: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let negotiator = controller.negotiator();
    let events = spawn_event_log(controller);
    let detections = controller
        .attach_remote_video(default_decoders())
        .ok_or("controller already disposed")?;
    let log_handle = spawn_detection_log(detections);

    let offer = match offer {
        Some(text) => text,
        None => {
            eprintln!("Paste the offer (SDP, JSON or token), then an empty line:");
            read_descriptor().await?
        }
    };
    negotiator.set_remote_offer(&offer).await?;
    let answer = negotiator.create_answer().await?;
    print_descriptor(&answer)?;

    wait_for_link_end(controller).await;
    events.abort();
    log_handle.abort();
    Ok(())
}

async fn run_detect(
    controller: &Arc<Controller>,
    frames: std::path::PathBuf,
    benchmark: bool,
    seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = ImageSequenceSource::from_dir(&frames)?;
    let detections = controller
        .attach_source(Box::new(source))
        .ok_or("controller already disposed")?;
    let log_handle = spawn_detection_log(detections);

    let run_for = if benchmark {
        controller.start_benchmark();
        // Let the deadline timer close the window first
        Duration::from_millis(controller.config().benchmark.window_ms + 100)
    } else {
        Duration::from_secs(seconds)
    };

    tokio::select! {
        _ = tokio::time::sleep(run_for) => {}
        _ = signal::ctrl_c() => info!("Interrupted"),
    }
    log_handle.abort();

    if benchmark {
        let report = match controller.stop_benchmark() {
            Some(report) => Some(report),
            None => controller.benchmark_report(),
        };
        if let Some(report) = report {
            println!("{}", report.to_json());
        }
    }

    let counters = controller.scheduler_counters();
    info!(
        "Captured {}, dispatched {}, dropped {}, completed {}",
        counters.captured, counters.dispatched, counters.dropped, counters.completed
    );
    Ok(())
}

fn print_descriptor(descriptor: &ConnectionDescriptor) -> Result<(), Box<dyn std::error::Error>> {
    println!("----- {} (SDP) -----", descriptor.kind());
    println!("{}", descriptor.sdp().trim_end());
    println!("----- {} (token) -----", descriptor.kind());
    println!("{}", descriptor.to_token()?);
    Ok(())
}

/// Read one pasted descriptor: a single JSON/token line, or SDP lines up to a blank line
async fn read_descriptor() -> Result<String, Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut text = String::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            if text.is_empty() {
                continue;
            }
            break;
        }
        text.push_str(line);
        text.push('\n');
        if !text.starts_with("v=") {
            break;
        }
    }
    if text.is_empty() {
        return Err("no descriptor on stdin".into());
    }
    Ok(text)
}

/// Block until the link fails or closes, or until Ctrl-C
async fn wait_for_link_end(controller: &Controller) {
    let mut state = controller.negotiator().watch_state();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                return;
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_terminal() {
                    return;
                }
            }
        }
    }
}

fn spawn_event_log(controller: &Controller) -> JoinHandle<()> {
    let mut events = controller.negotiator().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                LinkEvent::SignalingError { message, .. } | LinkEvent::MediaAccessError { message, .. } => {
                    warn!("{}", message)
                }
                LinkEvent::RemoteTrack { kind, stream_id, .. } => {
                    info!("Receiving remote {} on stream {}", kind, stream_id)
                }
                _ => {}
            }
            if let Ok(json) = serde_json::to_string(&event) {
                log::debug!("{}", json);
            }
        }
    })
}

fn spawn_detection_log(mut detections: watch::Receiver<DetectionSet>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while detections.changed().await.is_ok() {
            let set = detections.borrow_and_update().clone();
            let labels: Vec<String> = set
                .detections
                .iter()
                .map(|d| format!("{} {:.2}", d.label, d.score))
                .collect();
            info!("Frame {}: [{}]", set.frame_id, labels.join(", "));
        }
    })
}
