//! USM Bridge Agent
//!
//! Connects the local module to the remote administrative service over AMQP:
//! starts the reply consumer and dispatch loop, then registers the
//! application descriptor through the bootstrap initializer.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `USM_BROKER_URL` | - | AMQP broker URI (required) |
//! | `USM_REQUEST_QUEUE` | `USMEvent` | Queue for outbound requests |
//! | `USM_REPLY_QUEUE` | `USM4UVMS` | Queue for inbound replies |
//! | `USM_DESCRIPTOR_PATH` | - | Deployment descriptor JSON file (required) |
//! | `USM_REDEPLOY` | `false` | Redeploy even when already registered |
//! | `USM_BOOTSTRAP_PERIOD_SECS` | `60` | Bootstrap tick period |
//! | `USM_HEALTH_PORT` | `8088` | Health endpoint port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use axum::Json;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use usm_bootstrap::{FileDescriptorSource, InitializerConfig, InitializerState, ModuleInitializer};
use usm_bridge::transport::amqp::AmqpTransport;
use usm_bridge::{MessageBridge, MessageTransport};
use usm_service::UsmClient;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting USM Bridge Agent");

    let broker_url = env_required("USM_BROKER_URL")?;
    let request_queue = env_or("USM_REQUEST_QUEUE", "USMEvent");
    let reply_queue = env_or("USM_REPLY_QUEUE", "USM4UVMS");
    let descriptor_path = env_required("USM_DESCRIPTOR_PATH")?;
    let redeploy: bool = env_or_parse("USM_REDEPLOY", false);
    let period_secs: u64 = env_or_parse("USM_BOOTSTRAP_PERIOD_SECS", 60);
    let health_port: u16 = env_or_parse("USM_HEALTH_PORT", 8088);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Transport and destinations
    let transport = Arc::new(AmqpTransport::connect(&broker_url).await?);
    let request_destination = transport.lookup(&request_queue).await?;
    let reply_destination = transport.lookup(&reply_queue).await?;
    info!(request = %request_destination, reply = %reply_destination, "queues resolved");

    // Inbound replies flow: broker -> consumer -> dispatcher -> registry
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let consumer_handle = transport
        .consume_replies(&reply_destination, inbound_tx, shutdown_tx.subscribe())
        .await?;

    let bridge = Arc::new(MessageBridge::new(transport.clone(), request_destination));
    let dispatcher_handle = bridge.spawn_reply_dispatcher(inbound_rx, shutdown_tx.subscribe());
    let registry = bridge.registry();

    let client = Arc::new(UsmClient::new(bridge));

    // Bootstrap: register the deployment descriptor with bounded retries
    let initializer = ModuleInitializer::new(
        client,
        Arc::new(FileDescriptorSource::new(&descriptor_path)),
        InitializerConfig {
            period: Duration::from_secs(period_secs),
            redeploy_existing: redeploy,
            ..Default::default()
        },
    );
    let bootstrap_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if initializer.run(shutdown_rx).await == InitializerState::Failed {
                error!("bootstrap deployment failed, module is not registered");
            }
        })
    };

    // Health server
    let health_addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let health_app = axum::Router::new()
        .route(
            "/health",
            get(move || {
                let registry = registry.clone();
                async move {
                    Json(serde_json::json!({
                        "status": "UP",
                        "pending_replies": registry.pending_count(),
                        "version": env!("CARGO_PKG_VERSION"),
                    }))
                }
            }),
        )
        .route("/ready", get(ready_handler));

    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    info!("Health server listening on http://{}/health", health_addr);
    let health_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(health_listener, health_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("USM Bridge Agent started");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = bootstrap_handle.await;
        let _ = dispatcher_handle.await;
        let _ = consumer_handle.await;
        let _ = health_handle.await;
    })
    .await;

    info!("USM Bridge Agent shutdown complete");
    Ok(())
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "READY" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
