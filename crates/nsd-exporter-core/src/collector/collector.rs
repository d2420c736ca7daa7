//! Scrape orchestration: control command, line parsing, cache, samples.
//!
//! A `StatsCollector` is only constructed after one successful stats fetch
//! has warmed its descriptor cache. From then on `collect_once` may be called
//! any number of times, from several threads at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::collector::cache::{CacheLookup, DescriptorCache};
use crate::collector::parser::{LineError, StatLine, parse_line, parse_value};
use crate::collector::transport::{ControlTransport, TransportError};
use crate::config::ValueKind;
use crate::resolve::{MetricDescriptor, Resolver, fq_name};

/// Control command that returns statistics without resetting the counters.
pub const STATS_COMMAND: &str = "stats_noreset";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("initial stats fetch failed: {0}")]
    InitialFetch(#[source] TransportError),
}

/// One value for one descriptor, valid for a single scrape.
#[derive(Debug, Clone)]
pub struct Sample {
    pub descriptor: Arc<MetricDescriptor>,
    pub value: f64,
}

/// Lines dropped during one scrape, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    /// No separator or empty key.
    pub malformed: usize,
    /// Value is not a number.
    pub invalid_value: usize,
    /// Key matches no configured metric.
    pub unresolved: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.malformed + self.invalid_value + self.unresolved
    }
}

/// Everything produced by one `collect_once` call.
#[derive(Debug, Clone)]
pub struct Scrape {
    /// The `<namespace>_up` sample: 1 when the stats command succeeded.
    pub health: Sample,
    /// Daemon samples, in response order. Empty when the scrape failed.
    pub samples: Vec<Sample>,
    pub skipped: SkipCounts,
    pub duration: Duration,
}

impl Scrape {
    pub fn is_up(&self) -> bool {
        self.health.value > 0.0
    }

    /// Health sample first, then the daemon samples.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        std::iter::once(&self.health).chain(self.samples.iter())
    }
}

/// Collector for the statistics of one daemon.
pub struct StatsCollector<T: ControlTransport> {
    transport: T,
    resolver: Resolver,
    cache: DescriptorCache,
    up: Arc<MetricDescriptor>,
}

impl<T: ControlTransport> StatsCollector<T> {
    /// Creates a collector and warms its cache from one stats response.
    ///
    /// Fails when the daemon cannot be reached, so a collector is never
    /// handed out with a cache that was not initialized.
    pub fn new(transport: T, resolver: Resolver) -> Result<Self, CollectorError> {
        let namespace = resolver.namespace().to_string();
        let collector = Self {
            transport,
            resolver,
            cache: DescriptorCache::new(),
            up: Arc::new(MetricDescriptor::plain(
                fq_name(&namespace, "up"),
                format!("Whether scraping {namespace}'s metrics was successful."),
                ValueKind::Gauge,
            )),
        };
        collector.populate()?;
        Ok(collector)
    }

    fn populate(&self) -> Result<(), CollectorError> {
        let response = self
            .transport
            .command(STATS_COMMAND)
            .map_err(CollectorError::InitialFetch)?;

        let mut skipped = SkipCounts::default();
        for line in response.lines() {
            match parse_line(line) {
                Ok(Some(stat)) => {
                    if self.lookup(&stat).is_none() {
                        skipped.unresolved += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "skipping malformed stats line");
                    skipped.malformed += 1;
                }
            }
        }
        debug!(
            descriptors = self.cache.len(),
            unresolved = skipped.unresolved,
            malformed = skipped.malformed,
            "descriptor cache initialized"
        );
        Ok(())
    }

    /// Runs one scrape.
    ///
    /// A transport failure yields only the health sample, with value 0.
    /// Problems with individual lines drop those lines and nothing else.
    pub fn collect_once(&self) -> Scrape {
        let start = Instant::now();

        let response = match self.transport.command(STATS_COMMAND) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "stats command failed");
                return Scrape {
                    health: self.health(0.0),
                    samples: Vec::new(),
                    skipped: SkipCounts::default(),
                    duration: start.elapsed(),
                };
            }
        };

        let mut samples = Vec::new();
        let mut skipped = SkipCounts::default();
        for line in response.lines() {
            match self.sample_for(line) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(LineSkip::Malformed(e)) => {
                    warn!(error = %e, "skipping malformed stats line");
                    skipped.malformed += 1;
                }
                Err(LineSkip::InvalidValue(e)) => {
                    warn!(error = %e, "skipping stats line");
                    skipped.invalid_value += 1;
                }
                Err(LineSkip::Unresolved) => skipped.unresolved += 1,
            }
        }

        let duration = start.elapsed();
        trace!(samples = samples.len(), skipped = skipped.total(), ?duration, "scrape done");
        Scrape {
            health: self.health(1.0),
            samples,
            skipped,
            duration,
        }
    }

    fn sample_for(&self, line: &str) -> Result<Option<Sample>, LineSkip> {
        let Some(stat) = parse_line(line).map_err(LineSkip::Malformed)? else {
            return Ok(None);
        };
        let descriptor = self.lookup(&stat).ok_or(LineSkip::Unresolved)?;
        let value = parse_value(&stat).map_err(LineSkip::InvalidValue)?;
        Ok(Some(Sample { descriptor, value }))
    }

    fn lookup(&self, stat: &StatLine<'_>) -> Option<Arc<MetricDescriptor>> {
        match self
            .cache
            .get_or_resolve(stat.key, |key| self.resolver.resolve(key))
        {
            CacheLookup::Hit(descriptor) => Some(descriptor),
            CacheLookup::Inserted(descriptor) => {
                debug!(key = stat.key, metric = %descriptor.name, "new stats key discovered");
                Some(descriptor)
            }
            CacheLookup::Unresolved => {
                debug!(key = stat.key, "stats key not configured, skipping");
                None
            }
        }
    }

    fn health(&self, value: f64) -> Sample {
        Sample {
            descriptor: Arc::clone(&self.up),
            value,
        }
    }

    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    pub fn namespace(&self) -> &str {
        self.resolver.namespace()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

enum LineSkip {
    Malformed(LineError),
    InvalidValue(LineError),
    Unresolved,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockTransport;
    use crate::config::MetricConfig;
    use crate::resolve::DefinitionSource;

    const CONFIG: &str = r#"
metrics:
  num.queries:
    help: "Queries"
    type: counter
  time.elapsed:
    help: "Elapsed"
    type: gauge
label_metrics:
  '^num\.type\.(.+)$':
    name: query_type_total
    help: "Query types"
    type: counter
    labels: [type]
  '^num\.(.+)$':
    name: num_other
    help: "Catch-all"
    type: untyped
    labels: [what]
"#;

    fn collector(mock: MockTransport) -> StatsCollector<MockTransport> {
        let config = Arc::new(MetricConfig::from_yaml(CONFIG).unwrap());
        StatsCollector::new(mock, Resolver::new(config, "nsd")).unwrap()
    }

    fn find<'a>(scrape: &'a Scrape, name: &str) -> Vec<&'a Sample> {
        scrape
            .samples
            .iter()
            .filter(|s| s.descriptor.name == name)
            .collect()
    }

    #[test]
    fn exact_match_produces_one_sample_and_up() {
        let c = collector(MockTransport::responding("num.queries=42\n"));
        let scrape = c.collect_once();

        assert!(scrape.is_up());
        assert_eq!(scrape.health.descriptor.name, "nsd_up");
        assert_eq!(scrape.health.value, 1.0);
        assert_eq!(scrape.samples.len(), 1);

        let sample = &scrape.samples[0];
        assert_eq!(sample.descriptor.name, "nsd_num_queries");
        assert_eq!(sample.descriptor.kind, ValueKind::Counter);
        assert_eq!(sample.value, 42.0);
        assert_eq!(sample.descriptor.labels().count(), 0);
        assert_eq!(scrape.iter().count(), 2);
    }

    #[test]
    fn pattern_match_carries_captured_label() {
        let c = collector(MockTransport::responding("num.type.A=10\n"));
        let scrape = c.collect_once();

        let samples = find(&scrape, "nsd_query_type_total");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 10.0);
        assert_eq!(
            samples[0].descriptor.labels().collect::<Vec<_>>(),
            [("type", "A")]
        );
    }

    #[test]
    fn first_declared_pattern_is_used() {
        let c = collector(MockTransport::responding("num.type.MX=3\nnum.udp=9\n"));
        let scrape = c.collect_once();

        let mx = find(&scrape, "nsd_query_type_total");
        assert_eq!(mx.len(), 1);
        assert_eq!(mx[0].descriptor.source, DefinitionSource::Pattern(0));

        let udp = find(&scrape, "nsd_num_other");
        assert_eq!(udp.len(), 1);
        assert_eq!(udp[0].descriptor.label_values, ["udp"]);
        assert_eq!(udp[0].descriptor.kind, ValueKind::Untyped);
    }

    #[test]
    fn descriptors_are_resolved_once_and_reused() {
        let body = "num.queries=1\nnum.type.A=2\nnum.type.AAAA=3\n";
        let c = collector(MockTransport::responding(body));
        // Construction already resolved every key.
        assert_eq!(c.cache().stats().resolutions, 3);

        let first = c.collect_once();
        let second = c.collect_once();
        assert_eq!(c.cache().stats().resolutions, 3);
        assert_eq!(c.cache().len(), 3);

        for (a, b) in first.samples.iter().zip(&second.samples) {
            assert!(Arc::ptr_eq(&a.descriptor, &b.descriptor));
        }
    }

    #[test]
    fn keys_appearing_later_are_discovered() {
        let mock = MockTransport::responding("num.queries=1\nnum.type.TXT=5\n");
        mock.push_response("num.queries=1\n");
        let c = collector(mock);
        assert_eq!(c.cache().len(), 1);

        let scrape = c.collect_once();
        assert_eq!(scrape.samples.len(), 2);
        assert!(c.cache().get("num.type.TXT").is_some());
    }

    #[test]
    fn unresolved_key_is_skipped_every_cycle() {
        let body = "mystery.key=1\nnum.queries=5\n";
        let c = collector(MockTransport::responding(body));
        let after_init = c.cache().stats().resolutions;

        for cycle in 1..=3u64 {
            let scrape = c.collect_once();
            assert_eq!(scrape.skipped.unresolved, 1);
            assert_eq!(scrape.samples.len(), 1);
            assert_eq!(scrape.samples[0].descriptor.name, "nsd_num_queries");
            // Only the unknown key is looked up again.
            assert_eq!(c.cache().stats().resolutions, after_init + cycle);
        }
        assert!(c.cache().get("mystery.key").is_none());
    }

    #[test]
    fn transport_failure_yields_only_down_sample() {
        let mock = MockTransport::responding("num.queries=1\n");
        let c = collector(mock);
        // Queue a failure for the next command.
        c.transport().push_failure("connection refused");

        let scrape = c.collect_once();
        assert!(!scrape.is_up());
        assert_eq!(scrape.health.value, 0.0);
        assert!(scrape.samples.is_empty());
        assert_eq!(scrape.iter().count(), 1);

        // Next scrape recovers.
        assert!(c.collect_once().is_up());
    }

    #[test]
    fn non_numeric_value_skips_only_that_line() {
        let body = "num.queries=notanumber\ntime.elapsed=1.5\nnum.type.A=7\n";
        let c = collector(MockTransport::responding(body));
        let scrape = c.collect_once();

        assert!(scrape.is_up());
        assert_eq!(scrape.skipped.invalid_value, 1);
        assert!(find(&scrape, "nsd_num_queries").is_empty());
        assert_eq!(find(&scrape, "nsd_time_elapsed")[0].value, 1.5);
        assert_eq!(find(&scrape, "nsd_query_type_total")[0].value, 7.0);
    }

    #[test]
    fn malformed_lines_are_counted_and_skipped() {
        let body = "garbage line\n=3\n\nnum.queries=4\n";
        let c = collector(MockTransport::responding(body));
        let scrape = c.collect_once();

        assert_eq!(scrape.skipped.malformed, 2);
        assert_eq!(scrape.samples.len(), 1);
        assert_eq!(scrape.samples[0].value, 4.0);
    }

    #[test]
    fn value_containing_separator_splits_at_first() {
        let c = collector(MockTransport::responding("num.queries=1=2\n"));
        let scrape = c.collect_once();
        assert_eq!(scrape.skipped.invalid_value, 1);
        assert!(scrape.samples.is_empty());
    }

    #[test]
    fn construction_fails_when_daemon_unreachable() {
        let config = Arc::new(MetricConfig::from_yaml(CONFIG).unwrap());
        let result = StatsCollector::new(
            MockTransport::failing("refused"),
            Resolver::new(config, "nsd"),
        );
        assert!(matches!(result, Err(CollectorError::InitialFetch(_))));
    }

    #[test]
    fn uses_non_resetting_stats_command() {
        let c = collector(MockTransport::responding("num.queries=1\n"));
        c.collect_once();
        assert_eq!(c.transport().commands(), [STATS_COMMAND, STATS_COMMAND]);
    }

    #[test]
    fn concurrent_scrapes_share_descriptors() {
        let warm = collector(MockTransport::responding("num.queries=1\n"));
        // Start from an empty cache so every thread races to resolve the same keys.
        let c = StatsCollector {
            transport: MockTransport::responding("num.type.A=1\nnum.type.NS=2\nnum.tcp=3\n"),
            resolver: warm.resolver.clone(),
            cache: DescriptorCache::new(),
            up: Arc::clone(&warm.up),
        };

        let scrapes: Vec<Scrape> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| c.collect_once())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(c.cache().len(), 3);
        assert_eq!(c.cache().stats().resolutions, 3);
        for scrape in &scrapes {
            assert_eq!(scrape.samples.len(), 3);
            for sample in &scrape.samples {
                let key = match sample.descriptor.name.as_str() {
                    "nsd_query_type_total" if sample.value == 1.0 => "num.type.A",
                    "nsd_query_type_total" => "num.type.NS",
                    _ => "num.tcp",
                };
                let cached = c.cache().get(key).unwrap();
                assert!(Arc::ptr_eq(&cached, &sample.descriptor));
            }
        }
    }
}
