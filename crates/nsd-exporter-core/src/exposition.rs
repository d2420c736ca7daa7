//! Prometheus text exposition of scrapes, plus the exporter's own metrics.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::collector::{ControlTransport, Sample, Scrape, StatsCollector};
use crate::config::{is_valid_label_name, is_valid_metric_name};
use crate::resolve::{MetricDescriptor, fq_name};

/// Content type of the text exposition format, version 0.0.4.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders a scrape: one `# HELP`/`# TYPE` block per metric name, families
/// in first-seen order, the health metric first.
///
/// Daemon samples that would make the output unparseable are dropped with a
/// warning: invalid names, names the exporter emits itself, a name already
/// used with another type or label set, and series already written.
pub fn render_scrape(scrape: &Scrape, namespace: &str) -> String {
    let own_prefix = fq_name(namespace, "exporter_");
    let health = scrape.health.descriptor.name.as_str();

    let mut order: Vec<(&Sample, Vec<&Sample>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut series: HashSet<(&str, &[String])> = HashSet::new();
    for (i, sample) in scrape.iter().enumerate() {
        let d = &sample.descriptor;
        let rejection = if i == 0 {
            None
        } else if d.name == health || d.name.starts_with(&own_prefix) {
            Some("name is reserved for the exporter")
        } else {
            invalid_names(d)
        };
        let rejection = rejection.or_else(|| {
            let first = &order[*index.get(d.name.as_str())?].0.descriptor;
            (first.kind != d.kind || first.label_names != d.label_names)
                .then_some("name already exported with another type or label set")
        });
        let rejection = rejection.or_else(|| {
            (!series.insert((d.name.as_str(), d.label_values.as_slice())))
                .then_some("series already exported")
        });
        if let Some(reason) = rejection {
            warn!(metric = %d.name, source = ?d.source, reason, "dropping sample");
            continue;
        }

        match index.get(d.name.as_str()) {
            Some(&f) => order[f].1.push(sample),
            None => {
                index.insert(&d.name, order.len());
                order.push((sample, vec![sample]));
            }
        }
    }

    let mut output = String::new();
    for (first, samples) in order {
        let d = &first.descriptor;
        let _ = writeln!(output, "# HELP {} {}", d.name, escape_help(&d.help));
        let _ = writeln!(output, "# TYPE {} {}", d.name, d.kind);
        for sample in samples {
            output.push_str(&d.name);
            write_labels(&mut output, sample);
            let _ = writeln!(output, " {}", format_value(sample.value));
        }
    }
    output
}

fn invalid_names(d: &MetricDescriptor) -> Option<&'static str> {
    if !is_valid_metric_name(&d.name) {
        return Some("invalid metric name");
    }
    if !d.label_names.iter().all(|l| is_valid_label_name(l)) {
        return Some("invalid label name");
    }
    let duplicate = d
        .label_names
        .iter()
        .enumerate()
        .any(|(i, l)| d.label_names[..i].contains(l));
    duplicate.then_some("duplicate label name")
}

fn write_labels(output: &mut String, sample: &Sample) {
    let mut labels = sample.descriptor.labels().peekable();
    if labels.peek().is_none() {
        return;
    }
    output.push('{');
    for (i, (name, value)) in labels.enumerate() {
        if i > 0 {
            output.push(',');
        }
        let _ = write!(output, "{name}=\"{}\"", escape_label_value(value));
    }
    output.push('}');
}

fn escape_help(help: &str) -> String {
    help.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// Metrics about the exporter itself, kept in a private registry so they
/// never collide with the process-wide default one.
pub struct ScrapeMetrics {
    registry: Registry,
    duration: Histogram,
    scrapes: IntCounterVec,
    skipped: IntCounterVec,
    cached: IntGauge,
}

impl ScrapeMetrics {
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let duration = Histogram::with_opts(HistogramOpts::new(
            fq_name(namespace, "exporter_scrape_duration_seconds"),
            "Time spent collecting statistics from the daemon.",
        ))?;
        registry.register(Box::new(duration.clone()))?;

        let scrapes = IntCounterVec::new(
            Opts::new(
                fq_name(namespace, "exporter_scrapes_total"),
                "Scrapes of the daemon by result.",
            ),
            &["result"],
        )?;
        registry.register(Box::new(scrapes.clone()))?;

        let skipped = IntCounterVec::new(
            Opts::new(
                fq_name(namespace, "exporter_skipped_lines_total"),
                "Stats lines dropped while scraping, by reason.",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(skipped.clone()))?;

        let cached = IntGauge::with_opts(Opts::new(
            fq_name(namespace, "exporter_cached_descriptors"),
            "Stats keys with a cached metric descriptor.",
        ))?;
        registry.register(Box::new(cached.clone()))?;

        // Expose every series from the first scrape on.
        for result in ["success", "failure"] {
            scrapes.with_label_values(&[result]);
        }
        for reason in ["malformed", "invalid_value", "unresolved"] {
            skipped.with_label_values(&[reason]);
        }

        Ok(Self {
            registry,
            duration,
            scrapes,
            skipped,
            cached,
        })
    }

    pub fn observe(&self, scrape: &Scrape, cached_descriptors: usize) {
        self.duration.observe(scrape.duration.as_secs_f64());
        let result = if scrape.is_up() { "success" } else { "failure" };
        self.scrapes.with_label_values(&[result]).inc();

        let skipped = &scrape.skipped;
        for (reason, count) in [
            ("malformed", skipped.malformed),
            ("invalid_value", skipped.invalid_value),
            ("unresolved", skipped.unresolved),
        ] {
            self.skipped
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
        self.cached.set(cached_descriptors as i64);
    }

    /// Text exposition of the exporter metrics.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// A collector paired with its self-metrics; one `render` per HTTP scrape.
pub struct Exporter<T: ControlTransport> {
    collector: StatsCollector<T>,
    metrics: ScrapeMetrics,
}

impl<T: ControlTransport> Exporter<T> {
    pub fn new(collector: StatsCollector<T>) -> Result<Self, prometheus::Error> {
        let metrics = ScrapeMetrics::new(collector.namespace())?;
        Ok(Self { collector, metrics })
    }

    pub fn collector(&self) -> &StatsCollector<T> {
        &self.collector
    }

    /// Scrapes the daemon and renders daemon and exporter metrics.
    pub fn render(&self) -> String {
        let scrape = self.collector.collect_once();
        self.metrics.observe(&scrape, self.collector.cache().len());

        let mut output = render_scrape(&scrape, self.collector.namespace());
        match self.metrics.encode() {
            Ok(own) => output.push_str(&own),
            Err(e) => warn!(error = %e, "failed to encode exporter metrics"),
        }
        output
    }
}
