//! Numeric semantics of an exported metric.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

/// Kind of value a metric carries, as written to the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueKind {
    /// Monotonically increasing value.
    Counter,
    /// Arbitrary value that can go up and down.
    #[default]
    Gauge,
    /// Value with unknown semantics.
    Untyped,
}

/// Returned by [`ValueKind::from_str`] for names that are not a known kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric type '{0}'")]
pub struct UnknownValueKind(pub String);

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Counter => "counter",
            ValueKind::Gauge => "gauge",
            ValueKind::Untyped => "untyped",
        }
    }

    /// Converts the `type` field of a configuration entry.
    ///
    /// A missing field means gauge. Anything unrecognized is also treated as a
    /// gauge, with a warning, so that newer configuration files keep loading.
    pub fn from_config(raw: Option<&str>, key: &str) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return ValueKind::Gauge;
        };
        raw.parse().unwrap_or_else(|e: UnknownValueKind| {
            warn!(key, error = %e, "assuming gauge");
            ValueKind::Gauge
        })
    }
}

impl FromStr for ValueKind {
    type Err = UnknownValueKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(ValueKind::Counter),
            "gauge" => Ok(ValueKind::Gauge),
            "untyped" => Ok(ValueKind::Untyped),
            _ => Err(UnknownValueKind(s.to_string())),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
