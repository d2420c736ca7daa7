//! Metric mapping configuration.
//!
//! The mapping file has two sections:
//!
//! ```yaml
//! metrics:
//!   num.queries:
//!     help: "Number of queries received"
//!     type: counter
//! label_metrics:
//!   '^num\.type\.(.+)$':
//!     name: query_type_total
//!     help: "Number of queries with this query type"
//!     type: counter
//!     labels: [type]
//! ```
//!
//! `metrics` entries are looked up by exact stats key. `label_metrics` entries
//! are regular expressions tried in the order they are written; their capture
//! groups become label values. The whole file is validated at load time, and a
//! bad pattern fails the load so that a half-built mapping is never used.

mod value_kind;

pub use value_kind::{UnknownValueKind, ValueKind};

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use thiserror::Error;
use tracing::debug;

use crate::resolve::sanitize;

/// Mapping shipped with the exporter, targeting NSD 4.x.
pub const BUILTIN_CONFIG: &str = include_str!("../../config/config.yaml");

/// Errors raised while loading the metric mapping. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read metric config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid metric config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("pattern '{pattern}' has {groups} capture group(s) but {labels} label name(s)")]
    LabelMismatch {
        pattern: String,
        groups: usize,
        labels: usize,
    },
    #[error("invalid {what} name '{name}' in entry '{entry}'")]
    InvalidName {
        what: &'static str,
        name: String,
        entry: String,
    },
    #[error("label '{label}' appears twice in entry '{entry}'")]
    DuplicateLabel { label: String, entry: String },
    #[error("metric name '{name}' of entry '{entry}' is reserved for the exporter")]
    ReservedName { name: String, entry: String },
    #[error("entries '{first}' and '{second}' both export '{name}' with a different shape")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`, without the `__` prefix kept for internal labels.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    !name.starts_with("__")
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names, before namespacing, that the exporter emits itself.
pub fn is_reserved_name(name: &str) -> bool {
    name == "up" || name.starts_with("exporter_")
}

fn check_metric_name(name: &str, entry: &str) -> Result<(), ConfigError> {
    if !is_valid_metric_name(name) {
        return Err(ConfigError::InvalidName {
            what: "metric",
            name: name.to_string(),
            entry: entry.to_string(),
        });
    }
    if is_reserved_name(name) {
        return Err(ConfigError::ReservedName {
            name: name.to_string(),
            entry: entry.to_string(),
        });
    }
    Ok(())
}

fn check_label_names(labels: &[String], entry: &str) -> Result<(), ConfigError> {
    for (i, label) in labels.iter().enumerate() {
        if !is_valid_label_name(label) {
            return Err(ConfigError::InvalidName {
                what: "label",
                name: label.clone(),
                entry: entry.to_string(),
            });
        }
        if labels[..i].contains(label) {
            return Err(ConfigError::DuplicateLabel {
                label: label.clone(),
                entry: entry.to_string(),
            });
        }
    }
    Ok(())
}

/// Exact-key metric definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMetricDef {
    pub help: String,
    pub kind: ValueKind,
}

/// Pattern metric definition: one template for a family of stats keys.
#[derive(Debug, Clone)]
pub struct PatternMetricDef {
    pattern: String,
    regex: Regex,
    /// Output name override; when `None` the sanitized stats key is used.
    pub name: Option<String>,
    pub help: String,
    pub kind: ValueKind,
    /// One label name per capture group, in group order.
    pub labels: Vec<String>,
}

impl PatternMetricDef {
    /// Compiles a definition, checking that every capture group has a label
    /// and that the override and label names can be exported.
    pub fn new(
        pattern: impl Into<String>,
        name: Option<String>,
        help: impl Into<String>,
        kind: ValueKind,
        labels: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        let invalid = |source: regex::Error| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            source: Box::new(source),
        };

        // Validate the pattern as written before anchoring it: wrapping can turn
        // an unbalanced pattern into a valid one.
        let groups = Regex::new(&pattern).map_err(invalid)?.captures_len() - 1;
        if groups != labels.len() {
            return Err(ConfigError::LabelMismatch {
                pattern,
                groups,
                labels: labels.len(),
            });
        }
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(invalid)?;

        let name = name.filter(|n| !n.is_empty());
        if let Some(name) = &name {
            check_metric_name(name, &pattern)?;
        }
        check_label_names(&labels, &pattern)?;

        Ok(Self {
            pattern,
            regex,
            name,
            help: help.into(),
            kind,
            labels,
        })
    }

    /// The pattern as written in the configuration.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Matches the whole key and returns the captured label values.
    ///
    /// A group that did not take part in the match yields an empty value.
    pub fn captures(&self, raw_key: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(raw_key)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect(),
        )
    }
}

/// The loaded mapping. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct MetricConfig {
    metrics: HashMap<String, StaticMetricDef>,
    label_metrics: Vec<PatternMetricDef>,
}

impl MetricConfig {
    /// Builds a mapping from already-validated parts.
    pub fn new(
        metrics: HashMap<String, StaticMetricDef>,
        label_metrics: Vec<PatternMetricDef>,
    ) -> Self {
        Self {
            metrics,
            label_metrics,
        }
    }

    /// Loads the mapping file at `path`, or the built-in mapping when `path`
    /// is empty.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if path.is_empty() {
            debug!("using built-in metric config");
            return Self::builtin();
        }
        Self::from_path(Path::new(path))
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_CONFIG)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_reader(file)?;
        debug!(
            path = %path.display(),
            metrics = config.metrics.len(),
            label_metrics = config.label_metrics.len(),
            "metric config loaded"
        );
        Ok(config)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        Self::from_raw(serde_yaml::from_reader(reader)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Self::from_raw(serde_yaml::from_str(text)?)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let metrics = raw
            .metrics
            .unwrap_or_default()
            .into_iter()
            .map(|(key, m)| {
                check_metric_name(&sanitize(&key), &key)?;
                let kind = ValueKind::from_config(m.kind.as_deref(), &key);
                Ok((key, StaticMetricDef { help: m.help, kind }))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        let label_metrics = raw
            .label_metrics
            .map(|o| o.0)
            .unwrap_or_default()
            .into_iter()
            .map(|(pattern, m)| {
                let kind = ValueKind::from_config(m.kind.as_deref(), &pattern);
                PatternMetricDef::new(pattern, m.name, m.help, kind, m.labels)
            })
            .collect::<Result<Vec<_>, _>>()?;

        check_collisions(&metrics, &label_metrics)?;
        Ok(Self::new(metrics, label_metrics))
    }

    /// Exact-key definition for `raw_key`, if any.
    pub fn static_metric(&self, raw_key: &str) -> Option<&StaticMetricDef> {
        self.metrics.get(raw_key)
    }

    /// Pattern definitions in declaration order.
    pub fn pattern_metrics(&self) -> &[PatternMetricDef] {
        &self.label_metrics
    }

    pub fn static_metric_count(&self) -> usize {
        self.metrics.len()
    }
}

/// Rejects entries that would export the same metric name with a different
/// kind or label set, or the same label-free series twice.
///
/// Pattern entries without a name override are named after each key, so
/// they are checked when rendering instead.
fn check_collisions(
    metrics: &HashMap<String, StaticMetricDef>,
    label_metrics: &[PatternMetricDef],
) -> Result<(), ConfigError> {
    struct Family<'a> {
        entry: &'a str,
        kind: ValueKind,
        labels: &'a [String],
    }

    let mut statics: Vec<_> = metrics.iter().collect();
    statics.sort_by(|a, b| a.0.cmp(b.0));
    let no_labels: &[String] = &[];

    let entries = statics
        .into_iter()
        .map(|(key, def)| (sanitize(key), key.as_str(), def.kind, no_labels))
        .chain(label_metrics.iter().filter_map(|def| {
            let name = def.name.clone()?;
            Some((name, def.pattern(), def.kind, def.labels.as_slice()))
        }));

    let mut families: HashMap<String, Family<'_>> = HashMap::new();
    for (name, entry, kind, labels) in entries {
        if let Some(first) = families.get(&name) {
            // Label-free families hold a single series.
            if first.kind != kind || first.labels != labels || labels.is_empty() {
                return Err(ConfigError::NameCollision {
                    name,
                    first: first.entry.to_string(),
                    second: entry.to_string(),
                });
            }
            continue;
        }
        families.insert(
            name,
            Family {
                entry,
                kind,
                labels,
            },
        );
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    metrics: Option<HashMap<String, RawMetric>>,
    label_metrics: Option<Ordered<RawLabelMetric>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMetric {
    help: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLabelMetric {
    name: Option<String>,
    help: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    labels: Vec<String>,
}

/// A YAML mapping read as a list of entries in document order.
#[derive(Debug)]
struct Ordered<T>(Vec<(String, T)>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of pattern to metric definition")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate pattern '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}
