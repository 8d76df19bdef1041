use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// A contiguous batch of header timestamps.
///
/// Indices are global to the job: the first header ever seen is `0`, and a
/// batch covers the half-open range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTimeBatch {
    pub start: u64,
    pub end: u64,
    /// Stringified index → RFC3339 timestamp with nanoseconds.
    pub header_times: BTreeMap<String, String>,
}

impl HeaderTimeBatch {
    /// Build a batch whose first timestamp gets index `start`.
    pub fn new(start: u64, times: Vec<String>) -> Self {
        let end = start + times.len() as u64;
        let header_times = (start..end)
            .zip(times)
            .map(|(idx, ts)| (idx.to_string(), ts))
            .collect();
        Self {
            start,
            end,
            header_times,
        }
    }

    #[inline]
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.header_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header_times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_continue_from_start() {
        let batch = HeaderTimeBatch::new(
            4,
            vec!["2024-01-01T00:00:00.1Z".into(), "2024-01-01T00:00:00.2Z".into()],
        );
        assert_eq!(batch.range(), 4..6);
        assert_eq!(
            batch.header_times.get("5").map(String::as_str),
            Some("2024-01-01T00:00:00.2Z")
        );
        assert!(!batch.header_times.contains_key("6"));
    }

    #[test]
    fn empty_batch_has_empty_range() {
        let batch = HeaderTimeBatch::new(7, Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.range(), 7..7);
    }
}
