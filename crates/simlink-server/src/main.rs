//! Simlink server binary.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration (`simlink-server.yaml`, `SIMLINK_*`, port argument)
//! 3. Open the timing record file when enabled
//! 4. Bind the listener and serve until `Ctrl-C`
//! 5. Flush the timing record file

use std::sync::Arc;

use simlink_engine::DistanceGradientFactory;
use simlink_server::{Server, ServerConfig};
use simlink_timing::{CsvFileSink, SampleSink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application entry point for the simlink server.
///
/// # Errors
///
/// Returns an error if configuration, the timing file, or the listener
/// cannot be set up.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("simlink-server starting");

    let mut config = ServerConfig::load()?;
    config.apply_cli_args(std::env::args().skip(1))?;
    info!(
        host = config.listen.host,
        port = config.listen.port,
        max_line_bytes = config.protocol.max_line_bytes,
        max_nodes = config.engine.max_nodes,
        timings = config.timings.enabled,
        "Configuration loaded"
    );

    let sink = if config.timings.enabled {
        let sink = CsvFileSink::with_shutdown_timeout(
            &config.timings.path,
            config.timings.flush_every,
            config.timings.shutdown_timeout(),
        )?;
        info!(path = %config.timings.path.display(), "Recording step timings");
        Some(Arc::new(sink))
    } else {
        None
    };

    let factory = Arc::new(DistanceGradientFactory::new(config.engine.max_nodes));
    let mut server = Server::bind(&config, factory).await?;
    if let Some(sink) = &sink {
        server = server.with_sink(Arc::clone(sink) as Arc<dyn SampleSink>);
    }

    server
        .serve_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    warn!(error = %e, "Cannot listen for Ctrl-C, serving until killed");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    if let Some(sink) = sink {
        let finished = sink.shutdown();
        if !finished {
            warn!(dropped = sink.dropped(), "Timing writer did not finish in time");
        }
    }

    info!("simlink-server exiting");
    Ok(())
}
