//! HTTP request handlers: metrics, landing page, health.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use tracing::error;

use nsd_exporter_core::exposition::CONTENT_TYPE;

use crate::state::AppState;

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

/// Runs one scrape on the blocking pool; the control channel is synchronous.
pub(crate) async fn handle_metrics(State(state): State<AppState>) -> Response {
    let exporter = Arc::clone(&state.exporter);
    match tokio::task::spawn_blocking(move || exporter.render()).await {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "scrape task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "scrape failed\n").into_response()
        }
    }
}

pub(crate) async fn handle_landing(State(state): State<AppState>) -> Html<String> {
    let path = &state.metric_path;
    Html(format!(
        "<html>\n\
         <head><title>{kind} exporter</title></head>\n\
         <body>\n\
         <h1>{kind} exporter</h1>\n\
         <p>Version {version}</p>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        kind = state.kind,
        version = nsd_exporter_core::VERSION,
    ))
}
