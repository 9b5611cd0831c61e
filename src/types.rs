//! Core data types used throughout the cache

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A single sample in a time-series
///
/// Serialized as a two element array `[timestamp_ms, value]`, the layout
/// KairosDB uses for `values`. Aggregators such as `gaps` emit `null`
/// values, which are kept as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(i64, Option<f64>)", into = "(i64, Option<f64>)")]
pub struct DataPoint {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Float value, `None` for a gap
    pub value: Option<f64>,
}

impl DataPoint {
    /// Create a new data point
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value: Some(value),
        }
    }

    /// A sample without a value
    pub fn gap(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }
}

impl From<(i64, Option<f64>)> for DataPoint {
    fn from((timestamp, value): (i64, Option<f64>)) -> Self {
        Self { timestamp, value }
    }
}

impl From<DataPoint> for (i64, Option<f64>) {
    fn from(point: DataPoint) -> Self {
        (point.timestamp, point.value)
    }
}

/// Units accepted by relative time specifications and sampling windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Length of one unit in milliseconds. Months are 30 days, years 365.
    pub fn as_millis(&self) -> i64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
            TimeUnit::Weeks => 7 * 86_400_000,
            TimeUnit::Months => 30 * 86_400_000,
            TimeUnit::Years => 365 * 86_400_000,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        };
        f.write_str(s)
    }
}

/// An amount of time, e.g. `{"value": 5, "unit": "minutes"}`
///
/// Clients send `value` both as a number and as a string; both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativeTime {
    #[serde(deserialize_with = "lenient_u64")]
    pub value: u64,
    pub unit: TimeUnit,
}

impl RelativeTime {
    /// Create a new relative time
    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    /// Length of this span
    pub fn as_duration(&self) -> Duration {
        let millis = i64::try_from(self.value)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.unit.as_millis());
        Duration::from_millis(millis.max(0) as u64)
    }
}

/// Requested time range, KairosDB style
///
/// A start is required (absolute wins over relative). Without an end the
/// range is open and runs until now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_absolute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_relative: Option<RelativeTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_absolute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_relative: Option<RelativeTime>,
}

impl TimeRange {
    /// Closed absolute range in milliseconds
    pub fn absolute(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_absolute: Some(start_ms),
            end_absolute: Some(end_ms),
            ..Default::default()
        }
    }

    /// Open range starting `value unit` ago
    pub fn relative_start(value: u64, unit: TimeUnit) -> Self {
        Self {
            start_relative: Some(RelativeTime::new(value, unit)),
            ..Default::default()
        }
    }

    /// Resolve against `now` into absolute bounds
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
        let start = match (self.start_absolute, self.start_relative) {
            (Some(ms), _) => from_millis(ms)?,
            (None, Some(rel)) => before(now, rel)?,
            (None, None) => {
                return Err(Error::InvalidQuery(
                    "query must specify start_absolute or start_relative".to_string(),
                ))
            }
        };

        let end = match (self.end_absolute, self.end_relative) {
            (Some(ms), _) => Some(from_millis(ms)?),
            (None, Some(rel)) => Some(before(now, rel)?),
            (None, None) => None,
        };

        if let Some(end) = end {
            if end < start {
                return Err(Error::InvalidQuery(format!(
                    "end {} is before start {}",
                    end, start
                )));
            }
        }

        Ok((start, end))
    }
}

/// Convert unix milliseconds to a UTC datetime
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::InvalidQuery(format!("timestamp out of range: {}", ms)))
}

/// Convert unix seconds to a UTC datetime
pub fn from_secs(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::InvalidQuery(format!("timestamp out of range: {}", secs)))
}

/// `now` minus a relative time, rejecting spans that leave chrono's range
fn before(now: DateTime<Utc>, rel: RelativeTime) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(rel.as_duration())
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| {
            Error::InvalidQuery(format!(
                "relative time out of range: {} {}",
                rel.value, rel.unit
            ))
        })
}

/// Sampling window of an aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sampling {
    #[serde(deserialize_with = "lenient_u64")]
    pub value: u64,
    pub unit: TimeUnit,
}

impl Sampling {
    /// Width of one sampling window
    pub fn window(&self) -> Duration {
        RelativeTime::new(self.value, self.unit).as_duration()
    }
}

/// Aggregator attached to a metric query (and echoed on results)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Sampling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align_sampling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align_start_time: Option<bool>,
    /// Aggregator specific parameters (percentile, divisor, ...)
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl Aggregator {
    /// Create an aggregator without sampling
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sampling: None,
            align_sampling: None,
            align_start_time: None,
            params: BTreeMap::new(),
        }
    }

    /// Attach a sampling window
    pub fn with_sampling(mut self, value: u64, unit: TimeUnit) -> Self {
        self.sampling = Some(Sampling { value, unit });
        self
    }
}

/// Group-by clause, e.g. `{"name": "tag", "tags": ["host"]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBy {
    pub name: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

/// Tag map as used in queries and results
pub type Tags = BTreeMap<String, Vec<String>>;

/// Accept `{"host": "a"}` as well as `{"host": ["a"]}`
pub fn tags_one_or_many<'de, D>(deserializer: D) -> std::result::Result<Tags, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw: Option<BTreeMap<String, OneOrMany>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| match v {
            OneOrMany::One(s) => (k, vec![s]),
            OneOrMany::Many(list) => (k, list),
        })
        .collect())
}

fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_point_wire_format() {
        let point = DataPoint::new(1000, 1.5);
        assert_eq!(serde_json::to_string(&point).unwrap(), "[1000,1.5]");

        let parsed: Vec<DataPoint> = serde_json::from_str("[[1000, 1], [2000, 2.5]]").unwrap();
        assert_eq!(parsed, vec![DataPoint::new(1000, 1.0), DataPoint::new(2000, 2.5)]);
    }

    #[test]
    fn test_data_point_null_value() {
        let parsed: Vec<DataPoint> = serde_json::from_str("[[1000, null], [2000, 2]]").unwrap();
        assert_eq!(parsed, vec![DataPoint::gap(1000), DataPoint::new(2000, 2.0)]);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "[[1000,null],[2000,2.0]]");
    }

    #[test]
    fn test_relative_value_as_string() {
        let rel: RelativeTime = serde_json::from_str(r#"{"value": "15", "unit": "minutes"}"#).unwrap();
        assert_eq!(rel, RelativeTime::new(15, TimeUnit::Minutes));
        assert_eq!(rel.as_duration(), Duration::from_secs(900));
    }

    #[test]
    fn test_resolve_relative_open_range() {
        let now = from_secs(1_700_000_000).unwrap();
        let range = TimeRange::relative_start(2, TimeUnit::Hours);

        let (start, end) = range.resolve(now).unwrap();
        assert_eq!(start.timestamp(), 1_700_000_000 - 7200);
        assert!(end.is_none());
    }

    #[test]
    fn test_resolve_absolute_wins() {
        let now = from_secs(1_700_000_000).unwrap();
        let range = TimeRange {
            start_absolute: Some(1_600_000_000_000),
            start_relative: Some(RelativeTime::new(1, TimeUnit::Hours)),
            end_relative: Some(RelativeTime::new(10, TimeUnit::Minutes)),
            ..Default::default()
        };

        let (start, end) = range.resolve(now).unwrap();
        assert_eq!(start.timestamp(), 1_600_000_000);
        assert_eq!(end.unwrap().timestamp(), 1_700_000_000 - 600);
    }

    #[test]
    fn test_resolve_rejects_missing_start_and_inverted_range() {
        let now = Utc::now();
        assert!(TimeRange::default().resolve(now).is_err());
        assert!(TimeRange::absolute(5_000, 1_000).resolve(now).is_err());
    }

    #[test]
    fn test_resolve_rejects_huge_relative_time() {
        let now = Utc::now();
        let range = TimeRange::relative_start(300_000, TimeUnit::Years);
        assert!(matches!(range.resolve(now), Err(Error::InvalidQuery(_))));

        let range = TimeRange {
            start_absolute: Some(0),
            end_relative: Some(RelativeTime::new(u64::MAX, TimeUnit::Years)),
            ..Default::default()
        };
        assert!(matches!(range.resolve(now), Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn test_tags_one_or_many() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default, deserialize_with = "tags_one_or_many")]
            tags: Tags,
        }

        let w: Wrapper =
            serde_json::from_str(r#"{"tags": {"host": "a", "dc": ["east", "west"]}}"#).unwrap();
        assert_eq!(w.tags["host"], vec!["a".to_string()]);
        assert_eq!(w.tags["dc"].len(), 2);

        let w: Wrapper = serde_json::from_str("{}").unwrap();
        assert!(w.tags.is_empty());
    }

    #[test]
    fn test_aggregator_keeps_unknown_params() {
        let raw = r#"{"name": "percentile", "percentile": 0.95, "sampling": {"value": 1, "unit": "minutes"}, "align_sampling": true}"#;
        let agg: Aggregator = serde_json::from_str(raw).unwrap();
        assert_eq!(agg.sampling.unwrap().window(), Duration::from_secs(60));
        assert_eq!(agg.align_sampling, Some(true));
        assert_eq!(agg.params["percentile"], serde_json::json!(0.95));
    }
}
