//! facegridd — process wiring for every facegrid role.
//!
//! The binary in `main.rs` only parses the command line; everything that
//! assembles services lives here so it can be exercised from tests.
//!
//! | Mode | Backends | Runs |
//! |---|---|---|
//! | `gateway` | S3 + SQS | HTTP router, response drainer |
//! | `worker` | S3 + SQS | one worker loop |
//! | `autoscaler` | SQS + EC2 | scaling tick loop |
//! | `standalone` | in-memory | all of the above, workers as local tasks |

pub mod roles;
pub mod standalone;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use facegrid_core::QueueService;
use facegrid_gateway::{GatewayState, ResponseDrainer, build_router};

/// Resolve once Ctrl-C is received, then broadcast shutdown.
pub async fn shutdown_on_ctrl_c(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// Serve the gateway router with its response drainer until `shutdown`
/// flips, then wait for the drainer to stop.
pub async fn serve_gateway(
    state: GatewayState,
    responses: Arc<dyn QueueService>,
    listen: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let drainer = ResponseDrainer::new(responses, state.results.clone(), &state.settings);
    let drainer_shutdown = shutdown.clone();
    let drainer_handle = tokio::spawn(async move {
        drainer.run(drainer_shutdown).await;
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");

    let mut server_shutdown = shutdown;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    let _ = drainer_handle.await;
    info!("gateway stopped");
    Ok(())
}
