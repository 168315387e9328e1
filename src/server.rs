//! Server mode: publish the configured workload behind `GET /run`.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::report::ServerReport;
use crate::runner::Work;

pub async fn run(port: u16, work: Work) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, target = %work.template.url, "load server listening");
    axum::serve(listener, router(work))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("load server stopped");
    Ok(())
}

/// The `/run` route; split out so tests can serve it on a loopback port.
pub fn router(work: Work) -> Router {
    Router::new()
        .route("/run", get(run_workload))
        .with_state(Arc::new(work))
}

/// One engine run per request. A SIGINT while the run is in flight cancels
/// it; the drained partial report is still returned.
async fn run_workload(State(work): State<Arc<Work>>) -> Result<Json<ServerReport>, StatusCode> {
    info!(target = %work.template.url, "starting load run");
    let engine = work.engine();
    let cancel = engine.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = engine.run().await;
    interrupt.abort();

    match result {
        Ok(report) => {
            info!(
                results = report.lats.len(),
                errors = report.errors.values().sum::<u64>(),
                "load run finished"
            );
            Ok(Json(report))
        }
        Err(err) => {
            error!(%err, "load run failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
