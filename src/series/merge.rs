//! Splicing of fresh samples onto cached samples
//!
//! Both directions scan at most `cutoff` positions for a splice point. When
//! the overlap is deeper than that the merge is abandoned and the existing
//! samples are left untouched; a later full refetch repairs the entry.

use crate::types::DataPoint;

/// What a merge did to the existing samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming samples were strictly newer and appended wholesale
    Appended,
    /// Incoming samples were strictly older and prepended wholesale
    Prepended,
    /// Overlapping samples were dropped at the splice point
    Spliced { discarded: usize },
    /// Existing samples were too short to splice and were replaced
    Replaced,
    /// No splice point within the cutoff; existing samples unchanged
    Aborted,
    /// Nothing to merge
    Empty,
}

impl MergeOutcome {
    /// True when the existing samples changed
    pub fn modified(&self) -> bool {
        !matches!(self, MergeOutcome::Aborted | MergeOutcome::Empty)
    }
}

/// Extend `existing` with newer `incoming` samples
///
/// Scans backward from the end for the last sample strictly older than the
/// first incoming one, truncates after it and appends.
pub fn merge_at_end(
    existing: &mut Vec<DataPoint>,
    incoming: Vec<DataPoint>,
    cutoff: usize,
) -> MergeOutcome {
    let Some(first_new) = incoming.first().map(|p| p.timestamp) else {
        return MergeOutcome::Empty;
    };

    let len = existing.len();
    let mut offset = 0;
    loop {
        if offset + 1 > len {
            *existing = incoming;
            return MergeOutcome::Replaced;
        }
        if existing[len - 1 - offset].timestamp < first_new {
            break;
        }
        if offset >= cutoff {
            return MergeOutcome::Aborted;
        }
        offset += 1;
    }

    if offset == 0 {
        existing.extend(incoming);
        MergeOutcome::Appended
    } else {
        existing.truncate(len - offset);
        existing.extend(incoming);
        MergeOutcome::Spliced { discarded: offset }
    }
}

/// Prepend older samples before `existing`
///
/// Mirror image of [`merge_at_end`]: scans forward from the start for the
/// first sample strictly newer than the last older one.
pub fn merge_at_beginning(
    existing: &mut Vec<DataPoint>,
    older: Vec<DataPoint>,
    cutoff: usize,
) -> MergeOutcome {
    let Some(last_old) = older.last().map(|p| p.timestamp) else {
        return MergeOutcome::Empty;
    };

    let len = existing.len();
    let mut offset = 0;
    loop {
        if offset >= len {
            *existing = older;
            return MergeOutcome::Replaced;
        }
        if existing[offset].timestamp > last_old {
            break;
        }
        if offset >= cutoff {
            return MergeOutcome::Aborted;
        }
        offset += 1;
    }

    existing.splice(..offset, older);
    if offset == 0 {
        MergeOutcome::Prepended
    } else {
        MergeOutcome::Spliced { discarded: offset }
    }
}
