//! Frame-driven load probe for a simlink server.
//!
//! Mimics a rendering client: every frame it moves each node a little,
//! asks for one round, and polls the inbox. At the end it prints the
//! client-side latency summaries and the final gradient.
//!
//! # Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load [`ProbeConfig`] from the environment
//! 3. Connect, create the simulation, mark the sources
//! 4. Run the frames
//! 5. Wait briefly for outstanding answers, then report

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use simlink_client::{ProbeConfig, SimClient, StateUpdate};
use simlink_timing::{CsvFileSink, DEFAULT_FLUSH_EVERY, SampleSink};
use simlink_types::{NodeId, Position};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long to keep polling for answers after the last frame.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = ProbeConfig::from_env().context("loading probe configuration")?;
    info!(
        host = config.client.host,
        port = config.client.port,
        node_count = config.node_count,
        rounds = config.rounds,
        "simlink-probe starting"
    );

    let sink = config
        .timings_path
        .as_ref()
        .map(|path| {
            CsvFileSink::create(path, DEFAULT_FLUSH_EVERY)
                .map(Arc::new)
                .with_context(|| format!("opening {}", path.display()))
        })
        .transpose()?;

    let mut client = sink
        .as_ref()
        .map_or_else(
            || SimClient::connect(&config.client),
            |sink| {
                SimClient::connect_with_sink(
                    &config.client,
                    Arc::clone(sink) as Arc<dyn SampleSink>,
                )
            },
        )
        .with_context(|| format!("connecting to {}:{}", config.client.host, config.client.port))?;

    let latest: Arc<Mutex<Option<StateUpdate>>> = Arc::new(Mutex::new(None));
    let updates = Arc::clone(&latest);
    client.on_state(move |update| {
        if let Ok(mut slot) = updates.lock() {
            *slot = Some(update);
        }
    });
    client.on_error(|error| warn!(%error, "Server reported a problem"));

    client.create(config.node_count, config.max_distance)?;
    for &source in &config.sources {
        client.set_source(source)?;
    }

    for frame in 0..config.rounds {
        for node in 0..config.node_count {
            client.new_position(NodeId(node), layout(node, frame, config.spacing))?;
        }
        client.step(1)?;
        client.poll(config.max_messages);
        thread::sleep(config.frame);
    }

    let deadline = Instant::now().checked_add(DRAIN_WINDOW);
    while client.pending_len() > 0 && deadline.is_some_and(|d| Instant::now() < d) {
        client.poll(config.max_messages);
        thread::sleep(Duration::from_millis(5));
    }
    if client.pending_len() > 0 {
        warn!(pending = client.pending_len(), "Some steps were never answered");
    }

    for (label, summary) in client.summaries() {
        info!(%label, %summary, "Latency");
    }
    let final_state = latest.lock().ok().and_then(|slot| slot.clone());
    if let Some(update) = final_state {
        let reachable = update.nodes.iter().filter(|n| n.is_reachable()).count();
        info!(
            rid = ?update.rid,
            nodes = update.nodes.len(),
            reachable,
            "Final state"
        );
    }

    client.shutdown();
    if let Some(sink) = sink {
        let finished = sink.shutdown();
        if !finished {
            warn!(dropped = sink.dropped(), "Timing writer did not finish in time");
        }
    }
    Ok(())
}

/// Node positions on a gently swaying line.
fn layout(node: u32, frame: u32, spacing: f64) -> Position {
    let phase = f64::from(frame).mul_add(0.1, f64::from(node));
    Position::new(f64::from(node) * spacing, phase.sin() * spacing * 0.25, 0.0)
}
