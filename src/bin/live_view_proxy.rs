//! live_view_proxy - combine upstream frame streams into one live-view stream
//!
//! This daemon:
//! 1. Subscribes to every configured producer endpoint
//! 2. Orders frames by (acquisition, frame) in a bounded queue
//! 3. Publishes the oldest queued frame on the destination endpoint
//! 4. Serves stats and reset on the control API

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use live_view_proxy::api::{ApiConfig, ApiServer};
use live_view_proxy::{
    Combiner, ControlSurface, ProxyConfig, ProxyLoop, SharedPublisher, SourceId,
    SourceSubscriber, SubscriberConfig, TcpFramePublisher,
};

const INBOUND_CHANNEL_DEPTH: usize = 1024;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Combine live-view frame streams from several producers")]
struct Args {
    /// Path to a JSON or TOML config file. Environment variables override it.
    #[arg(long, env = "LIVE_VIEW_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ProxyConfig::load_from(args.config.as_deref()).context("loading config")?;

    let publisher = TcpFramePublisher::bind(&config.destination)?;
    log::info!("publishing live view on {}", publisher.endpoint());
    let publisher = SharedPublisher::new(publisher);
    let combiner = Combiner::new(config.combiner_settings(), &config.sources, publisher)?;
    let combiner = Arc::new(Mutex::new(combiner));

    let (tx, rx) = sync_channel(INBOUND_CHANNEL_DEPTH);
    let mut subscribers = Vec::with_capacity(config.sources.len());
    for (index, source) in config.sources.iter().enumerate() {
        let sub_config = SubscriberConfig::new(SourceId(index), &source.name, source.endpoint.clone());
        subscribers.push(SourceSubscriber::spawn(sub_config, tx.clone())?);
        log::info!("subscribed to source {} at {}", source.name, source.endpoint);
    }
    drop(tx);

    let control: Arc<dyn ControlSurface> = combiner.clone();
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, control).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "live_view_proxy running. queue_length={}, drop_warn_cutoff={}",
        config.queue_length,
        config.drop_warn_cutoff
    );
    ProxyLoop::new(combiner, rx, config.drain_interval)
        .with_health_log(HEALTH_LOG_INTERVAL)
        .run(&shutdown)?;

    log::info!("shutting down, stopping subscribers and control api...");
    for subscriber in subscribers {
        subscriber.stop()?;
    }
    api_handle.stop()?;
    Ok(())
}
