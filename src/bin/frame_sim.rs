//! frame_sim - synthetic frame producer for exercising live_view_proxy
//!
//! Binds a producer endpoint and publishes two-part frames (JSON header,
//! random payload) at a fixed rate. `frame_num` wraps to 0 every
//! `--frames-per-acquisition` frames, which the proxy sees as a new
//! acquisition.

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::RngCore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_view_proxy::{parse_endpoint, FrameHeader, FramePublisher, TcpFramePublisher};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish synthetic live-view frames")]
struct Args {
    /// Endpoint to bind and publish on.
    #[arg(long, env = "FRAME_SIM_ENDPOINT", default_value = "tcp://127.0.0.1:5010")]
    endpoint: String,

    /// Frames per second.
    #[arg(long, default_value_t = 10.0)]
    fps: f64,

    /// Number of frames to publish; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    frames: u64,

    /// Frames per acquisition before frame_num wraps to 0; 0 never wraps.
    #[arg(long, default_value_t = 0)]
    frames_per_acquisition: u64,

    /// Payload size in bytes.
    #[arg(long, default_value_t = 4096)]
    payload_bytes: usize,

    /// Wait for at least one consumer before publishing.
    #[arg(long)]
    wait_for_consumer: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !(args.fps.is_finite() && args.fps > 0.0) {
        return Err(anyhow!("--fps must be a positive number"));
    }

    let endpoint = parse_endpoint(&args.endpoint)?;
    let mut publisher = TcpFramePublisher::bind(&endpoint)?;
    log::info!("frame_sim publishing on {}", publisher.endpoint());

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    if args.wait_for_consumer {
        log::info!("waiting for a consumer...");
        while publisher.subscriber_count() == 0 && !shutdown.load(Ordering::SeqCst) {
            publisher.accept_pending()?;
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    let period = Duration::from_secs_f64(1.0 / args.fps);
    let mut rng = rand::thread_rng();
    let mut payload = vec![0u8; args.payload_bytes];
    let mut frame_num = 0u64;
    let mut acquisition_id = 0u64;
    let mut sent = 0u64;
    let mut next_tick = Instant::now();

    while !shutdown.load(Ordering::SeqCst) && (args.frames == 0 || sent < args.frames) {
        if args.frames_per_acquisition > 0 && frame_num >= args.frames_per_acquisition {
            frame_num = 0;
            acquisition_id += 1;
            log::info!("starting acquisition {}", acquisition_id);
        }

        rng.fill_bytes(&mut payload);
        let header = FrameHeader::from_value(json!({
            "frame_num": frame_num,
            "acquisition_id": acquisition_id,
            "dtype": "uint8",
            "shape": [args.payload_bytes],
        }))?;
        if let Err(err) = publisher.publish(&header, &payload) {
            log::warn!("frame {} not delivered: {}", frame_num, err);
        }
        log::debug!("sent frame {} to {} consumer(s)", frame_num, publisher.subscriber_count());

        frame_num += 1;
        sent += 1;
        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    log::info!("frame_sim done, sent {} frame(s)", sent);
    Ok(())
}
