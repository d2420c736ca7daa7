//! Turns stats keys into metric descriptors.
//!
//! Resolution is a pure function of the key and the loaded [`MetricConfig`]:
//! exact entries are consulted first, then pattern entries in declaration
//! order, first match wins. Caching is left to the caller.

use std::sync::Arc;

use crate::config::{MetricConfig, ValueKind};

/// Where a descriptor's definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionSource {
    /// Exact-key entry from the `metrics` section.
    Static,
    /// Pattern entry from `label_metrics`, by declaration index.
    Pattern(usize),
}

/// Fully resolved identity of one stats key.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    /// Fully-qualified output name, namespace included.
    pub name: String,
    pub help: String,
    pub kind: ValueKind,
    pub label_names: Vec<String>,
    /// Captured values for this particular key, parallel to `label_names`.
    pub label_values: Vec<String>,
    pub source: DefinitionSource,
}

impl MetricDescriptor {
    /// Label-free descriptor, used for exact matches and the health metric.
    pub fn plain(name: impl Into<String>, help: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: Vec::new(),
            label_values: Vec::new(),
            source: DefinitionSource::Static,
        }
    }

    /// Iterates `(name, value)` label pairs in declaration order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.label_names
            .iter()
            .map(String::as_str)
            .zip(self.label_values.iter().map(String::as_str))
    }
}

/// Outcome of resolving a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(MetricDescriptor),
    Unresolved,
}

/// Replaces every `.` of a stats key so it can be used in a metric name.
pub fn sanitize(raw_key: &str) -> String {
    raw_key.replace('.', "_")
}

/// Joins namespace and name with `_`, skipping an empty namespace.
pub fn fq_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}_{name}")
    }
}

/// Resolves keys against a configuration within one metric namespace.
#[derive(Debug, Clone)]
pub struct Resolver {
    config: Arc<MetricConfig>,
    namespace: String,
}

impl Resolver {
    pub fn new(config: Arc<MetricConfig>, namespace: impl Into<String>) -> Self {
        Self {
            config,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    pub fn resolve(&self, raw_key: &str) -> Resolution {
        if let Some(def) = self.config.static_metric(raw_key) {
            return Resolution::Resolved(MetricDescriptor::plain(
                fq_name(&self.namespace, &sanitize(raw_key)),
                def.help.clone(),
                def.kind,
            ));
        }

        for (index, def) in self.config.pattern_metrics().iter().enumerate() {
            let Some(label_values) = def.captures(raw_key) else {
                continue;
            };
            let name = def.name.clone().unwrap_or_else(|| sanitize(raw_key));
            return Resolution::Resolved(MetricDescriptor {
                name: fq_name(&self.namespace, &name),
                help: def.help.clone(),
                kind: def.kind,
                label_names: def.labels.clone(),
                label_values,
                source: DefinitionSource::Pattern(index),
            });
        }

        Resolution::Unresolved
    }
}
