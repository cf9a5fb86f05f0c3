//! Aggregator Bot

mod config;

use anyhow::{Context, Result}; // alias std::result::Result with dynamic error type
use futures::channel::oneshot;
use futures::future::{self, Either};
use prometheus::{Encoder, TextEncoder};
use std::cell::Cell;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use aggregator_prometheus::collector::Aggregator;
use aggregator_prometheus::debug::DEBUG;
use aggregator_prometheus::error::debug_error_enabled;

use crate::config::Config;

/// The program's main entry point.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let (send_shutdown, recv_shutdown) = oneshot::channel::<()>();

    // When we receive a SIGINT (or SIGTERM) signal, begin exiting.
    let signal_once = Cell::new(Some(send_shutdown));
    ctrlc::set_handler(move || {
        // The first time we receive the signal, shutdown gracefully
        if let Some(sender) = signal_once.take() {
            sender.send(()).ok();
        }
        // The second time we receive the signal, shutdown immediately
        else {
            std::process::exit(1);
        }
    })?;

    // Start the main event loop
    async_std::task::block_on(run(recv_shutdown))
}

/// The main thread's event loop
async fn run(shutdown: oneshot::Receiver<()>) -> Result<()> {
    // Load configuration from arguments and environment variables
    let config = Config::load()?;
    debug_error_enabled(config.debug);

    let aggregator = Aggregator::new(config.targets()).with_options(config.aggregator_options());
    let aggregator = Arc::new(aggregator);
    for target in aggregator.targets() {
        tracing::info!("Target: {}", target.name);
    }

    // Every debug interval, log debug information
    let debug_interval = match config.debug_interval {
        Some(duration) => Some(async_std::task::spawn(async move {
            loop {
                async_std::task::sleep(duration).await;
                DEBUG.publish();
            }
        })),
        None => None,
    };

    // Serve the aggregated metrics on every request to the metrics path
    let mut app = tide::with_state(Arc::clone(&aggregator));
    app.at(&config.metrics_path).get(serve_metrics);
    tracing::info!(
        "Serving metrics on http://{}{}",
        config.listen_addr,
        config.metrics_path
    );
    let server = async_std::task::spawn(app.listen(config.listen_addr.clone()));

    // Shutdown when the process is killed, or if the server stops
    let result = match future::select(server, shutdown).await {
        Either::Left((result, _)) => result.context("metrics server stopped"),
        Either::Right((_, server)) => {
            tracing::info!("Shutting down...");
            server.cancel().await;
            Ok(())
        }
    };
    if let Some(debug_interval) = debug_interval {
        debug_interval.cancel().await;
    }

    result
}

async fn serve_metrics(req: tide::Request<Arc<Aggregator>>) -> tide::Result {
    let mut families = req.state().collect().await;
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    encoder.encode(&families, &mut body)?;

    Ok(tide::Response::builder(200)
        .header("Content-Type", encoder.format_type())
        .body(body)
        .build())
}
