//! Slicing cached samples down to a requested window
//!
//! Two strategies with the same contract:
//!
//! - [`robust_trim`] scans every sample. Always correct.
//! - [`efficient_trim`] derives both slice bounds arithmetically from the
//!   last timestamp and an assumed fixed resolution. O(1) index computation,
//!   but the window drifts when the samples have gaps or another resolution.
//!
//! Bounds are inclusive and compared at whole-second granularity.

use chrono::{DateTime, Utc};

use crate::types::DataPoint;

/// Requested window plus the resolution assumed by the fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimWindow {
    pub start: DateTime<Utc>,
    /// `None` means "until now"
    pub end: Option<DateTime<Utc>>,
    pub resolution_secs: i64,
}

impl TrimWindow {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>, resolution_secs: i64) -> Self {
        Self {
            start,
            end,
            resolution_secs,
        }
    }
}

/// Samples with `start <= ts <= end`, by linear scan
///
/// Lazy; call again to restart.
pub fn robust_trim<'a>(
    values: &'a [DataPoint],
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> impl Iterator<Item = &'a DataPoint> + Clone + 'a {
    let start = start.timestamp();
    let end = end.map(|e| e.timestamp());
    values.iter().filter(move |p| {
        let secs = p.timestamp.div_euclid(1000);
        secs >= start && end.map_or(true, |end| secs <= end)
    })
}

/// Samples with `start <= ts <= end`, by index arithmetic
///
/// Assumes `values` is contiguous at `resolution_secs`. Indices are clamped,
/// so irregular input yields a wrong window rather than a panic.
pub fn efficient_trim(
    values: &[DataPoint],
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    resolution_secs: i64,
) -> &[DataPoint] {
    let Some(last) = values.last().map(|p| p.timestamp) else {
        return values;
    };

    let len = values.len() as i64;
    let resolution_ms = resolution_secs.max(1) * 1000;

    let samples_after_start = (last - start.timestamp() * 1000).div_euclid(resolution_ms);
    let lo = (len - samples_after_start - 1).clamp(0, len);

    let hi = match end {
        None => len,
        Some(end) => {
            // Everything within the end second is still inside the window
            let end_ms = end.timestamp() * 1000 + 999;
            let samples_after_end = ceil_div(last - end_ms, resolution_ms);
            (len - samples_after_end).clamp(0, len)
        }
    };

    if lo >= hi {
        return &values[..0];
    }
    &values[lo as usize..hi as usize]
}

/// Cheap check that `values` looks contiguous at `resolution_secs`
///
/// Looks at the first, middle and last sample only.
pub fn is_uniform(values: &[DataPoint], resolution_secs: i64) -> bool {
    let (Some(first), Some(last)) = (values.first(), values.last()) else {
        return true;
    };

    let resolution_ms = resolution_secs.max(1) * 1000;
    let mid = values.len() / 2;
    let expected = |index: usize| first.timestamp + index as i64 * resolution_ms;

    last.timestamp == expected(values.len() - 1) && values[mid].timestamp == expected(mid)
}

fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    -(-numerator).div_euclid(denominator)
}
