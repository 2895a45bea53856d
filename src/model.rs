//! Shared data-model types for the statistics engine.
//!
//! Services exchange these plain structs across the public entry points; no
//! store-specific row types leak out of the service layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The two persisted bucket granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketTable {
    ShortTerm,
    LongTerm,
}

impl BucketTable {
    pub fn name(self) -> &'static str {
        match self {
            Self::ShortTerm => "statistics_short_term",
            Self::LongTerm => "statistics",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::ShortTerm => Duration::minutes(5),
            Self::LongTerm => Duration::hours(1),
        }
    }
}

/// Requested bucket granularity for range queries. Day and month are derived
/// from stored hourly rows at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    FiveMinute,
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "5minute" => Some(Self::FiveMinute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    pub fn table(self) -> BucketTable {
        match self {
            Self::FiveMinute => BucketTable::ShortTerm,
            Self::Hour | Self::Day | Self::Month => BucketTable::LongTerm,
        }
    }
}

/// Descriptor half of a series' metadata. The surrogate id is assigned by the
/// metadata registry and handed around separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    pub series_id: String,
    pub source: String,
    pub unit: Option<String>,
    pub has_mean: bool,
    pub has_sum: bool,
    pub display_name: Option<String>,
}

/// Metadata lookup result: surrogate id plus descriptor, keyed by series id.
pub type MetadataMap = HashMap<String, (i64, SeriesDescriptor)>;

/// One bucket's worth of statistics, granularity-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatValues {
    pub start: DateTime<Utc>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_reset: Option<DateTime<Utc>>,
    pub state: Option<f64>,
    pub sum: Option<f64>,
}

impl StatValues {
    pub fn empty(start: DateTime<Utc>) -> Self {
        Self {
            start,
            mean: None,
            min: None,
            max: None,
            last_reset: None,
            state: None,
            sum: None,
        }
    }
}

/// A compiled sample paired with the descriptor of the series it belongs to.
#[derive(Debug, Clone)]
pub struct CompiledSeries {
    pub descriptor: SeriesDescriptor,
    pub stat: StatValues,
}

/// Everything one producer returns for a compilation window.
#[derive(Debug, Clone, Default)]
pub struct CompiledStatistics {
    pub stats: Vec<CompiledSeries>,
    /// Metadata the producer already resolved, so the compiler can skip
    /// re-reading it inside the persist transaction.
    pub metadata: MetadataMap,
}

impl CompiledStatistics {
    pub fn merge(&mut self, other: CompiledStatistics) {
        self.stats.extend(other.stats);
        self.metadata.extend(other.metadata);
    }
}

/// One row of a range-query response, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticPoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_reset: Option<DateTime<Utc>>,
    pub state: Option<f64>,
    pub sum: Option<f64>,
}

/// Split a `<namespace>:<slug>` series id into its namespace and slug.
pub fn split_series_id(series_id: &str) -> Option<(&str, &str)> {
    series_id.split_once(':')
}

/// Series ids are `<namespace>:<slug>` where both halves are lowercase slugs:
/// `[0-9a-z_]`, no leading/trailing underscore, no doubled underscore.
pub fn valid_series_id(series_id: &str) -> bool {
    match split_series_id(series_id) {
        Some((namespace, slug)) => valid_slug(namespace) && valid_slug(slug),
        None => false,
    }
}

fn valid_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| matches!(ch, '0'..='9' | 'a'..='z' | '_'))
        && !value.starts_with('_')
        && !value.ends_with('_')
        && !value.contains("__")
}
