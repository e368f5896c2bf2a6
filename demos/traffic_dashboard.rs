//! Example: a terminal traffic dashboard
//!
//! Watches vehicle counts for the given roads, prints every snapshot
//! change, and asks the assistant one question once the chat opens.
//!
//! Run with: cargo run --example traffic_dashboard -- "Road 1" "Road 2"
//!
//! Addresses come from STREAM_WS_BASE (default ws://localhost:8000),
//! STREAM_API_PREFIX and STREAM_TOKEN.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_stream_mux::{
    ChannelConfig, ChatRequest, Endpoints, ManagerConfig, MultiplexedStreamManager,
    SingleChannelClient, StreamConfig, VehicleCountUpdate, WsConnector,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut roads: Vec<String> = std::env::args().skip(1).collect();
    if roads.is_empty() {
        roads = vec!["Road 1".to_string(), "Road 2".to_string()];
    }

    let endpoints = Endpoints::from_env()?;
    info!("Watching {} roads", roads.len());

    let config = ManagerConfig::builder()
        .stream(StreamConfig::traffic_info())
        .build()?;

    let info_endpoints = endpoints.clone();
    let mut manager: MultiplexedStreamManager<VehicleCountUpdate> =
        MultiplexedStreamManager::new(config, WsConnector::new(), move |road| {
            info_endpoints.info_address(road)
        });

    let mut chat: SingleChannelClient = SingleChannelClient::connect(
        endpoints.chat_address(),
        ChannelConfig::default(),
        WsConnector::new(),
    )?;
    let mut chat_state = chat.subscribe();
    let mut asked = false;
    let mut chat_live = true;
    let mut replies_seen = 0;
    let mut last_chat_error = None;

    let mut snapshots = manager.observe(roads);

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let mut roads: Vec<_> = snapshot.states.iter().collect();
                roads.sort_by(|a, b| a.0.cmp(b.0));

                println!(
                    "--- revision {} (any connected: {}, all connected: {})",
                    snapshot.revision, snapshot.any_connected, snapshot.all_connected
                );
                for (road, state) in roads {
                    match snapshot.payload(road.as_str()) {
                        Some(update) => println!(
                            "{:<12} {:<10} cars {:>4} ({:>5.1} km/h)  motorbikes {:>4} ({:>5.1} km/h)",
                            road, state, update.count_car, update.speed_car,
                            update.count_motor, update.speed_motor
                        ),
                        None => println!("{:<12} {:<10} waiting for data", road, state),
                    }
                }
            }
            changed = chat_state.changed(), if chat_live => {
                if changed.is_err() {
                    chat_live = false;
                    continue;
                }
                let state = chat_state.borrow_and_update().clone();
                if state.is_connected() && !asked {
                    asked = chat.send(&ChatRequest::new("Which road is busiest right now?"));
                }
                if state.received > replies_seen {
                    replies_seen = state.received;
                    if let Some(reply) = state.latest {
                        println!("assistant: {}", reply.message);
                    }
                }
                if state.last_error != last_chat_error {
                    if let Some(error) = &state.last_error {
                        warn!("chat: {}", error.message);
                    }
                    last_chat_error = state.last_error;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    chat.shutdown().await;
    manager.teardown().await;

    let metrics = manager.metrics().snapshot();
    info!(
        "Connections: {}, payloads: {}, duplicates absorbed: {}, decode failures: {}",
        metrics.connections_total,
        metrics.payloads_delivered_total,
        metrics.duplicates_suppressed_total,
        metrics.decode_failures_total
    );

    Ok(())
}
