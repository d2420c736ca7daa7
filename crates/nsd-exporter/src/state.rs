//! Shared application state.

use std::sync::Arc;

use nsd_exporter_core::collector::ControlTransport;
use nsd_exporter_core::control::DaemonKind;
use nsd_exporter_core::exposition::Exporter;

pub(crate) type SharedExporter = Arc<Exporter<Box<dyn ControlTransport>>>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub exporter: SharedExporter,
    pub kind: DaemonKind,
    pub metric_path: Arc<str>,
}

impl AppState {
    pub(crate) fn new(
        exporter: Exporter<Box<dyn ControlTransport>>,
        kind: DaemonKind,
        metric_path: &str,
    ) -> Self {
        Self {
            exporter: Arc::new(exporter),
            kind,
            metric_path: Arc::from(metric_path),
        }
    }
}
